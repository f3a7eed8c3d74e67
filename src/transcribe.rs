//! Markdown transcription of page images.
//!
//! The counterpart of [`crate::extract`] for callers who want the document as
//! text: every page is read into Markdown and nothing is parsed as JSON.

use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::document::PageImage;
use crate::error::PipelineError;
use crate::model::{request_text, CallPurpose, ModelClient, ModelRequest, RetryPolicy};
use crate::prompts::{self, MARKDOWN_PROMPT_VERSION, MARKDOWN_SYSTEM_PROMPT};

/// Placed between pages in [`MarkdownResult::text`]
const PAGE_BREAK: &str = "\n\n---\n\n";

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?[ \t]*\n(.*)\n```\s*$").unwrap());

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Markdown for each page, in page order
#[derive(Debug, Clone, PartialEq)]
pub struct MarkdownResult {
    pages: Vec<String>,
}

impl MarkdownResult {
    pub fn pages(&self) -> &[String] {
        &self.pages
    }

    /// The whole document, pages separated by a horizontal rule
    pub fn text(&self) -> String {
        self.pages.join(PAGE_BREAK)
    }
}

#[derive(Clone)]
pub struct MarkdownTranscriber {
    client: Arc<dyn ModelClient>,
    policy: RetryPolicy,
    concurrency: usize,
}

impl MarkdownTranscriber {
    pub fn new(client: Arc<dyn ModelClient>, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn prompt_version(&self) -> &'static str {
        MARKDOWN_PROMPT_VERSION
    }

    pub async fn transcribe_page(
        &self,
        page: &PageImage,
        total_pages: usize,
    ) -> Result<String, PipelineError> {
        let request = ModelRequest {
            purpose: CallPurpose::Transcribe,
            system: MARKDOWN_SYSTEM_PROMPT,
            user: prompts::markdown_user_prompt(
                page.index + 1,
                total_pages,
                page.text_layer.as_deref(),
            ),
            images: vec![page.png.as_slice()],
        };

        tracing::info!("Transcribing page {} of {}", page.index + 1, total_pages);
        let text = request_text(self.client.as_ref(), &request, &self.policy).await?;
        Ok(clean_markdown(&text))
    }

    /// Transcribe every page; one failed page fails the document
    pub async fn transcribe(&self, pages: &[PageImage]) -> Result<MarkdownResult, PipelineError> {
        if pages.is_empty() {
            return Err(PipelineError::CorruptDocument(
                "document produced no pages".to_string(),
            ));
        }

        let total = pages.len();
        let calls: Vec<_> = pages
            .iter()
            .map(|page| Box::pin(self.transcribe_page(page, total)))
            .collect();
        let outcomes: Vec<Result<String, PipelineError>> = stream::iter(calls)
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut texts = Vec::with_capacity(total);
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(text) => texts.push(text),
                Err(e) => {
                    tracing::error!("Page {} of {} failed: {}", index + 1, total, e);
                    return Err(e);
                }
            }
        }

        Ok(MarkdownResult { pages: texts })
    }
}

/// Tidy model Markdown: drop a wrapping code fence, use LF line endings,
/// strip trailing spaces and squeeze runs of blank lines
fn clean_markdown(raw: &str) -> String {
    let trimmed = raw.trim();
    let unfenced = match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps.get(1).map_or(trimmed, |m| m.as_str()),
        None => trimmed,
    };
    let lines = unfenced
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    RE_BLANK_LINES.replace_all(&lines, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::scripted::{ScriptedModel, ScriptedReply};
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            backoff_ms: 0,
            timeout: Duration::from_millis(200),
        }
    }

    fn page(index: usize, text_layer: Option<&str>) -> PageImage {
        PageImage {
            index,
            width: 1,
            height: 1,
            png: vec![index as u8],
            text_layer: text_layer.map(str::to_string),
        }
    }

    #[test]
    fn wrapping_fence_is_removed() {
        assert_eq!(
            clean_markdown("```markdown\n# Receipt\r\n\r\n\r\n\r\n| a | b |   \n```\n"),
            "# Receipt\n\n| a | b |"
        );
    }

    #[test]
    fn inner_code_blocks_survive() {
        let text = "Intro\n\n```\ncode\n```\n\nOutro";
        assert_eq!(clean_markdown(text), text);
    }

    #[tokio::test]
    async fn pages_are_transcribed_in_order() {
        let model = Arc::new(ScriptedModel::from_fn(|req| {
            assert_eq!(req.purpose, CallPurpose::Transcribe);
            let number = if req.user.starts_with("Page 1 of 2") { 1 } else { 2 };
            ScriptedReply::Text(format!("# Page {}\n", number))
        }));
        let transcriber = MarkdownTranscriber::new(model.clone(), policy()).with_concurrency(2);
        let result = transcriber
            .transcribe(&[page(0, Some("TOTAL 42.50")), page(1, None)])
            .await
            .unwrap();
        assert_eq!(result.pages(), ["# Page 1".to_string(), "# Page 2".to_string()]);
        assert_eq!(result.text(), "# Page 1\n\n---\n\n# Page 2");

        let calls = model.calls();
        let first = calls.iter().find(|c| c.user.starts_with("Page 1")).unwrap();
        assert!(first.user.contains("TOTAL 42.50"));
        assert_eq!(first.system, MARKDOWN_SYSTEM_PROMPT);
        assert_eq!(first.images.len(), 1);
    }

    #[test]
    fn transcription_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let transcriber = MarkdownTranscriber::new(Arc::new(ScriptedModel::new()), policy());
        let pages = vec![page(0, None)];
        let future = transcriber.transcribe(&pages);
        assert_send(&future);
    }

    #[tokio::test]
    async fn prose_answers_are_not_rejected() {
        let model = Arc::new(
            ScriptedModel::new().reply(CallPurpose::Transcribe, "Thank you for dining with us!"),
        );
        let transcriber = MarkdownTranscriber::new(model.clone(), policy());
        let result = transcriber.transcribe(&[page(0, None)]).await.unwrap();
        assert_eq!(result.text(), "Thank you for dining with us!");
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn failed_page_fails_transcription() {
        let model = Arc::new(
            ScriptedModel::new().push(CallPurpose::Transcribe, ScriptedReply::Fail("503".into())),
        );
        let transcriber = MarkdownTranscriber::new(model.clone(), policy());
        let err = transcriber.transcribe(&[page(0, None)]).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ExternalModelError);
        assert_eq!(model.call_count(), 2);
    }
}
