use crate::config::Config;
use crate::document::MediaType;
use crate::error::ServiceError;
use crate::model::openai::OpenAiClient;
use crate::model::ModelClient;
use crate::pipeline::{Completed, Orchestrator, Payload, Upload};
use crate::render::Rasterizer;
use crate::schema::{SchemaCatalog, TargetSchema};
use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub catalog: Arc<SchemaCatalog>,
    pub config: Arc<Config>,
    pub model_name: Arc<str>,
    pub rasterizer: Rasterizer,
}

impl AppState {
    /// Wire the pipeline, prompt override and schema catalog from `config`
    pub fn build(config: Config, client: Arc<dyn ModelClient>) -> anyhow::Result<Self> {
        let model_name: Arc<str> = Arc::from(client.name());
        let mut orchestrator = Orchestrator::new(client, &config);

        if let Some(path) = &config.extraction_prompt_file {
            let prompt = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read extraction prompt {}", path.display()))?;
            if prompt.trim().is_empty() {
                anyhow::bail!("Extraction prompt file {} is empty", path.display());
            }
            let version = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|stem| format!("custom:{}", stem))
                .unwrap_or_else(|| "custom".to_string());
            tracing::info!("Using extraction prompt from {} ({})", path.display(), version);
            orchestrator = orchestrator.with_extraction_prompt(prompt, version);
        }

        let catalog = match &config.schema_dir {
            Some(dir) => {
                let catalog = SchemaCatalog::load_dir(dir)?;
                match &config.default_schema {
                    Some(name) => catalog.with_default(name)?,
                    None => catalog,
                }
            }
            None => SchemaCatalog::default(),
        };

        let rasterizer = Rasterizer::detect(config.render.pdfium_library.as_deref());
        tracing::info!("PDF renderer: {}", rasterizer.as_str());

        Ok(Self {
            orchestrator,
            catalog: Arc::new(catalog),
            config: Arc::new(config),
            model_name,
            rasterizer,
        })
    }
}

/// Successful extraction response
#[derive(Serialize)]
pub struct ExtractResponse {
    pub status: &'static str,
    /// "extraction" when no schema applied, "converted" after conversion,
    /// "markdown" for transcriptions
    pub result_type: &'static str,
    pub media_type: &'static str,
    pub page_count: usize,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction: Option<Value>,
    /// What each page produced, for documents with more than one page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_results: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
    pub processing_time_ms: u64,
    pub prompt_version: String,
}

impl ExtractResponse {
    fn from_completed(completed: Completed, orchestrator: &Orchestrator) -> Self {
        let page_results = (completed.page_count > 1).then(|| match &completed.payload {
            Payload::Markdown(markdown) => markdown
                .pages()
                .iter()
                .map(|page| Value::String(page.clone()))
                .collect(),
            Payload::Extraction(extraction) | Payload::Converted { extraction, .. } => {
                extraction.pages().to_vec()
            }
        });
        let prompt_version = match &completed.payload {
            Payload::Markdown(_) => orchestrator.markdown_prompt_version(),
            _ => orchestrator.prompt_version(),
        };

        let (result_type, result, extraction, schema_name, missing_fields) = match &completed.payload {
            Payload::Extraction(extraction) => ("extraction", extraction.to_value(), None, None, Vec::new()),
            Payload::Markdown(markdown) => ("markdown", Value::String(markdown.text()), None, None, Vec::new()),
            Payload::Converted {
                converted,
                extraction,
            } => (
                "converted",
                converted.to_value(),
                Some(extraction.to_value()),
                converted.schema_name().map(str::to_string),
                converted
                    .missing_fields()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            ),
        };

        Self {
            status: "completed",
            result_type,
            media_type: completed.media_type.mime(),
            page_count: completed.page_count,
            result,
            extraction,
            page_results,
            schema_name,
            missing_fields,
            processing_time_ms: completed.elapsed.as_millis() as u64,
            prompt_version: prompt_version.to_string(),
        }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Server info response
#[derive(Serialize)]
pub struct InfoResponse {
    pub version: String,
    pub supported_media_types: Vec<&'static str>,
    pub model: String,
    pub prompt_version: String,
    pub max_file_size_bytes: usize,
    pub render_dpi: u32,
    pub pdf_renderer: Rasterizer,
    pub max_attempts: u32,
    pub schemas: Vec<String>,
    pub default_schema: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let max_file_size = state.config.max_file_size;

    Router::new()
        .route("/extract", post(handle_extract))
        .route("/health", get(handle_health))
        .route("/info", get(handle_info))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Leave room for multipart framing around the file itself
                .layer(DefaultBodyLimit::max(max_file_size.saturating_add(64 * 1024))),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(config: Config) -> anyhow::Result<()> {
    let client = OpenAiClient::new(&config.model)?;
    if config.model.api_key.is_none() {
        tracing::warn!("No API key configured; model calls will be sent unauthenticated");
    }
    tracing::info!("Model: {}", config.model.model);

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::build(config, Arc::new(client))?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Shape of a successful result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum OutputFormat {
    #[default]
    Json,
    Markdown,
}

impl OutputFormat {
    fn parse(text: &str) -> Result<Self, ServiceError> {
        match text.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            other => Err(ServiceError::InvalidRequest(format!(
                "format must be json or markdown, got '{}'",
                other
            ))),
        }
    }
}

/// Fields of an extraction request
#[derive(Default)]
struct ExtractRequest {
    file: Option<Bytes>,
    content_type: Option<String>,
    file_name: Option<String>,
    schema: Option<String>,
    schema_name: Option<String>,
    raw: bool,
    format: OutputFormat,
}

async fn read_request(
    multipart: &mut Multipart,
    max_file_size: usize,
) -> Result<ExtractRequest, ServiceError> {
    let mut request = ExtractRequest::default();

    let multipart_error = |e: MultipartError, what: &str| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServiceError::UploadTooLarge { max: max_file_size }
        } else {
            ServiceError::InvalidRequest(format!("Failed to {}: {}", what, e))
        }
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, "parse multipart"))?
    {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "file" => {
                request.content_type = field.content_type().map(|s| s.to_string());
                request.file_name = field.file_name().map(|s| s.to_string());
                request.file = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| multipart_error(e, "read file data"))?,
                );
            }
            "schema" | "schema_name" | "raw" | "format" => {
                let text = field.text().await.map_err(|e| {
                    ServiceError::InvalidRequest(format!("Invalid {} field: {}", name, e))
                })?;
                let text = text.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                match name.as_str() {
                    "schema" => request.schema = Some(text),
                    "schema_name" => request.schema_name = Some(text),
                    "format" => request.format = OutputFormat::parse(&text)?,
                    _ => request.raw = parse_flag(&text)?,
                }
            }
            other => {
                tracing::debug!("Ignoring unknown form field '{}'", other);
            }
        }
    }

    Ok(request)
}

fn parse_flag(text: &str) -> Result<bool, ServiceError> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ServiceError::InvalidRequest(format!(
            "raw must be true or false, got '{}'",
            other
        ))),
    }
}

/// Pick the schema for a request: `raw` disables conversion, an inline schema
/// wins over a named one, and the deployment default applies last.
/// Markdown requests never convert and may not name a schema.
fn resolve_schema(
    catalog: &SchemaCatalog,
    request: &ExtractRequest,
) -> Result<Option<TargetSchema>, ServiceError> {
    if request.format == OutputFormat::Markdown {
        if request.schema.is_some() || request.schema_name.is_some() {
            return Err(ServiceError::InvalidRequest(
                "a schema cannot be applied to markdown output".to_string(),
            ));
        }
        return Ok(None);
    }
    if request.raw {
        return Ok(None);
    }
    if let Some(inline) = &request.schema {
        return TargetSchema::parse(inline)
            .map(Some)
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()));
    }
    if let Some(name) = &request.schema_name {
        return catalog
            .get(name)
            .cloned()
            .map(Some)
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()));
    }
    Ok(catalog.default_schema().cloned())
}

/// Handle extraction requests
async fn handle_extract(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ExtractResponse>, ServiceError> {
    let request = read_request(&mut multipart, state.config.max_file_size).await?;

    let schema = resolve_schema(&state.catalog, &request)?;
    let data = request.file.ok_or(ServiceError::MissingFile)?;

    if data.len() > state.config.max_file_size {
        return Err(ServiceError::FileTooLarge {
            size: data.len(),
            max: state.config.max_file_size,
        });
    }

    tracing::info!(
        "Extraction request: {} bytes, type {}, format {:?}, schema {}",
        data.len(),
        request.content_type.as_deref().unwrap_or("unknown"),
        request.format,
        schema
            .as_ref()
            .map(|s| s.name().unwrap_or("inline"))
            .unwrap_or("none")
    );

    let mut upload = Upload::new(data.to_vec());
    upload.declared_type = request.content_type;
    upload.file_name = request.file_name;

    let outcome = match request.format {
        OutputFormat::Json => state.orchestrator.run(upload, schema.as_ref()).await,
        OutputFormat::Markdown => state.orchestrator.transcribe(upload).await,
    };
    let completed = outcome.map_err(|failure| ServiceError::Pipeline {
            stage: failure.stage,
            error: failure.error,
        })?;

    tracing::info!(
        "Extraction completed in {}ms ({} page(s))",
        completed.elapsed.as_millis(),
        completed.page_count
    );

    Ok(Json(ExtractResponse::from_completed(
        completed,
        &state.orchestrator,
    )))
}

/// Handle health check requests
async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Handle info requests
async fn handle_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        supported_media_types: MediaType::ALL.iter().map(MediaType::mime).collect(),
        model: state.model_name.to_string(),
        prompt_version: state.orchestrator.prompt_version().to_string(),
        max_file_size_bytes: state.config.max_file_size,
        render_dpi: state.config.render.dpi,
        pdf_renderer: state.rasterizer,
        max_attempts: state.config.model.max_attempts,
        schemas: state.catalog.names().into_iter().map(str::to_string).collect(),
        default_schema: state.catalog.default_name().map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::scripted::ScriptedModel;
    use crate::model::CallPurpose;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "docjson-test-boundary";

    fn png_bytes() -> Vec<u8> {
        let image = image::DynamicImage::ImageRgb8(image::RgbImage::new(8, 8));
        let mut buf = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn multipart_body(file: Option<(&str, &str, &[u8])>, fields: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some((name, mime, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                    BOUNDARY, name, mime
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn state(model: ScriptedModel, catalog: SchemaCatalog) -> AppState {
        let mut config = Config::default();
        config.model.retry_backoff_ms = 0;
        config.model.timeout = Duration::from_millis(200);
        let client: Arc<dyn ModelClient> = Arc::new(model);
        AppState {
            orchestrator: Orchestrator::new(client, &config),
            catalog: Arc::new(catalog),
            config: Arc::new(config),
            model_name: Arc::from("scripted"),
            rasterizer: Rasterizer::Builtin,
        }
    }

    fn state_with_limit(model: ScriptedModel, max_file_size: usize) -> AppState {
        let mut state = state(model, SchemaCatalog::default());
        let mut config = (*state.config).clone();
        config.max_file_size = max_file_size;
        state.config = Arc::new(config);
        state
    }

    async fn post_extract(state: AppState, body: Vec<u8>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/extract")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn receipt_model() -> ScriptedModel {
        ScriptedModel::new()
            .reply(
                CallPurpose::Extract,
                r#"{"restaurant": "Nick the Greek", "amount_due": 42.50}"#,
            )
            .reply(
                CallPurpose::Convert,
                r#"{"merchant": "Nick the Greek", "total": 42.50}"#,
            )
    }

    #[tokio::test]
    async fn extraction_without_schema() {
        let png = png_bytes();
        let body = multipart_body(Some(("receipt.png", "image/png", &png[..])), &[]);
        let (status, json) = post_extract(state(receipt_model(), SchemaCatalog::default()), body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result_type"], "extraction");
        assert_eq!(json["page_count"], 1);
        assert_eq!(json["result"]["restaurant"], "Nick the Greek");
        assert!(json.get("extraction").is_none());
    }

    #[tokio::test]
    async fn inline_schema_converts() {
        let png = png_bytes();
        let body = multipart_body(
            Some(("receipt.png", "image/png", &png[..])),
            &[("schema", r#"{"merchant": "string", "total": "number"}"#)],
        );
        let (status, json) = post_extract(state(receipt_model(), SchemaCatalog::default()), body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result_type"], "converted");
        assert_eq!(json["result"], json!({"merchant": "Nick the Greek", "total": 42.50}));
        assert_eq!(json["extraction"]["amount_due"], 42.50);
    }

    #[tokio::test]
    async fn default_schema_applies_unless_raw() {
        let mut catalog = SchemaCatalog::default();
        catalog.insert(
            "receipt",
            TargetSchema::parse(r#"{"merchant": "string", "total": "number"}"#).unwrap(),
        );
        let catalog = catalog.with_default("receipt").unwrap();
        let png = png_bytes();

        let body = multipart_body(Some(("r.png", "image/png", &png[..])), &[]);
        let (_, json) = post_extract(state(receipt_model(), catalog), body).await;
        assert_eq!(json["result_type"], "converted");
        assert_eq!(json["schema_name"], "receipt");

        let mut catalog = SchemaCatalog::default();
        catalog.insert(
            "receipt",
            TargetSchema::parse(r#"{"merchant": "string"}"#).unwrap(),
        );
        let catalog = catalog.with_default("receipt").unwrap();
        let body = multipart_body(Some(("r.png", "image/png", &png[..])), &[("raw", "true")]);
        let (_, json) = post_extract(state(receipt_model(), catalog), body).await;
        assert_eq!(json["result_type"], "extraction");
    }

    #[tokio::test]
    async fn unknown_schema_name_is_bad_request() {
        let png = png_bytes();
        let body = multipart_body(
            Some(("r.png", "image/png", &png[..])),
            &[("schema_name", "invoice")],
        );
        let (status, json) = post_extract(state(receipt_model(), SchemaCatalog::default()), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn missing_file_is_bad_request() {
        let body = multipart_body(None, &[("raw", "true")]);
        let (status, json) = post_extract(state(receipt_model(), SchemaCatalog::default()), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "MISSING_FILE");
    }

    #[tokio::test]
    async fn video_upload_fails_before_any_model_call() {
        let mut mp4 = vec![0, 0, 0, 0x18];
        mp4.extend_from_slice(b"ftypmp42\0\0\0\0mp42isom");
        let body = multipart_body(Some(("clip.mp4", "video/mp4", &mp4[..])), &[]);
        let (status, json) = post_extract(state(ScriptedModel::new(), SchemaCatalog::default()), body).await;

        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "received");
        assert_eq!(json["kind"], "UnsupportedMediaType");
    }

    #[tokio::test]
    async fn info_lists_deployment() {
        let request = Request::builder().uri("/info").body(Body::empty()).unwrap();
        let response = router(state(ScriptedModel::new(), SchemaCatalog::default()))
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["model"], "scripted");
        assert_eq!(json["prompt_version"], crate::prompts::EXTRACTION_PROMPT_VERSION);
        assert_eq!(json["pdf_renderer"], "builtin");
        assert!(json["supported_media_types"]
            .as_array()
            .unwrap()
            .contains(&json!("application/pdf")));
    }

    #[tokio::test]
    async fn file_over_limit_is_rejected() {
        let png = png_bytes();
        assert!(png.len() > 16);
        let body = multipart_body(Some(("r.png", "image/png", &png[..])), &[]);
        let model = receipt_model();
        let (status, json) = post_extract(state_with_limit(model, 16), body).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json["code"], "FILE_TOO_LARGE");
    }

    #[tokio::test]
    async fn body_over_limit_is_rejected_while_streaming() {
        let oversized = vec![0u8; 200 * 1024];
        let body = multipart_body(Some(("big.png", "image/png", &oversized[..])), &[]);
        let (status, json) = post_extract(state_with_limit(ScriptedModel::new(), 1024), body).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json["code"], "FILE_TOO_LARGE");
    }

    #[tokio::test]
    async fn markdown_format_returns_text() {
        let model = ScriptedModel::new().reply(CallPurpose::Transcribe, "# Nick the Greek\n\nTotal: $42.50");
        let png = png_bytes();
        let body = multipart_body(
            Some(("receipt.png", "image/png", &png[..])),
            &[("format", "markdown")],
        );
        let (status, json) = post_extract(state(model, SchemaCatalog::default()), body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result_type"], "markdown");
        assert_eq!(json["result"], "# Nick the Greek\n\nTotal: $42.50");
        assert_eq!(json["prompt_version"], crate::prompts::MARKDOWN_PROMPT_VERSION);
        assert!(json.get("page_results").is_none());
    }

    #[tokio::test]
    async fn markdown_format_ignores_default_schema() {
        let mut catalog = SchemaCatalog::default();
        catalog.insert(
            "receipt",
            TargetSchema::parse(r#"{"merchant": "string"}"#).unwrap(),
        );
        let catalog = catalog.with_default("receipt").unwrap();
        let model = ScriptedModel::new().reply(CallPurpose::Transcribe, "Nick the Greek");
        let png = png_bytes();
        let body = multipart_body(Some(("r.png", "image/png", &png[..])), &[("format", "md")]);
        let (status, json) = post_extract(state(model, catalog), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result_type"], "markdown");
        assert!(json.get("schema_name").is_none());
    }

    #[tokio::test]
    async fn markdown_format_with_schema_is_bad_request() {
        let png = png_bytes();
        let body = multipart_body(
            Some(("r.png", "image/png", &png[..])),
            &[("format", "markdown"), ("schema", r#"{"merchant": "string"}"#)],
        );
        let (status, json) = post_extract(state(receipt_model(), SchemaCatalog::default()), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn multi_page_response_lists_page_results() {
        let model = ScriptedModel::from_fn(|req| {
            let page = if req.user.starts_with("Page 1") { "A" } else { "B" };
            crate::model::scripted::ScriptedReply::Text(json!({ "items": [page] }).to_string())
        });
        let pdf = crate::render::fixtures::solid_color_pdf(&[[255, 255, 255], [0, 0, 0]]);
        let body = multipart_body(Some(("two.pdf", "application/pdf", &pdf[..])), &[]);
        let (status, json) = post_extract(state(model, SchemaCatalog::default()), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["page_count"], 2);
        assert_eq!(json["result"]["items"], json!(["A", "B"]));
        assert_eq!(json["page_results"], json!([{"items": ["A"]}, {"items": ["B"]}]));
    }

    #[test]
    fn format_parsing() {
        assert_eq!(OutputFormat::parse("Markdown").unwrap(), OutputFormat::Markdown);
        assert_eq!(OutputFormat::parse("json").unwrap(), OutputFormat::Json);
        assert!(OutputFormat::parse("xml").is_err());
    }

    #[test]
    fn raw_flag_parsing() {
        assert!(parse_flag("TRUE").unwrap());
        assert!(!parse_flag("0").unwrap());
        assert!(parse_flag("maybe").is_err());
    }
}
