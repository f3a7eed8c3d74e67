//! OpenAI-compatible chat completions client
//!
//! Works with any endpoint speaking the `/chat/completions` wire format and
//! accepting `image_url` parts with base64 data URIs.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};

use super::{ModelCallError, ModelClient, ModelRequest};
use crate::config::ModelConfig;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
    detail: &'static str,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    content: Option<String>,
}

/// Client for an OpenAI-compatible vision model
#[derive(Clone, Debug)]
pub struct OpenAiClient {
    client: ReqwestClient,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    json_mode: bool,
}

impl OpenAiClient {
    pub fn new(config: &ModelConfig) -> Result<Self, ModelCallError> {
        let client = ReqwestClient::builder()
            .build()
            .map_err(|e| ModelCallError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            json_mode: config.json_mode,
        })
    }

    fn build_body<'a>(&'a self, request: &'a ModelRequest<'_>) -> ChatRequest<'a> {
        let user = if request.images.is_empty() {
            MessageContent::Text(&request.user)
        } else {
            let mut parts = vec![ContentPart::Text {
                text: &request.user,
            }];
            parts.extend(request.images.iter().map(|png| ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/png;base64,{}", STANDARD.encode(png)),
                    detail: "high",
                },
            }));
            MessageContent::Parts(parts)
        };

        ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: vec![
                Message {
                    role: "system",
                    content: MessageContent::Text(request.system),
                },
                Message {
                    role: "user",
                    content: user,
                },
            ],
            response_format: (self.json_mode && request.purpose.expects_json()).then_some(ResponseFormat {
                kind: "json_object",
            }),
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ModelRequest<'_>) -> Result<String, ModelCallError> {
        let body = self.build_body(request);

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ModelCallError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelCallError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelCallError::MalformedResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ModelCallError::EmptyResponse)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
