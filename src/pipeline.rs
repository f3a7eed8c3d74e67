//! Request orchestration
//!
//! One [`Orchestrator::run`] call takes an upload through
//! `Received -> Loaded -> Extracted -> [Converted] -> Completed`. Any failure
//! stops the run and reports the last stage reached together with the error.
//! [`Orchestrator::transcribe`] walks the same stages without conversion,
//! producing Markdown instead of JSON.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::Config;
use crate::convert::{ConvertedResult, SchemaConverter};
use crate::document::{Document, DocumentLoader, MediaType, PageImage};
use crate::error::PipelineError;
use crate::extract::{ExtractionClient, ExtractionResult};
use crate::model::{ModelClient, RetryPolicy};
use crate::schema::TargetSchema;
use crate::transcribe::{MarkdownResult, MarkdownTranscriber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Loaded,
    Extracted,
    Converted,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Loaded => "loaded",
            Self::Extracted => "extracted",
            Self::Converted => "converted",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_advance_to(&self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Received, Loaded) | (Loaded, Extracted) => true,
            (Extracted, Converted) | (Extracted, Completed) => true,
            (Converted, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded file as received at the service boundary
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub declared_type: Option<String>,
    pub file_name: Option<String>,
}

impl Upload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            declared_type: None,
            file_name: None,
        }
    }

    pub fn with_declared_type(mut self, declared_type: impl Into<String>) -> Self {
        self.declared_type = Some(declared_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Extraction(ExtractionResult),
    /// The extraction is kept untouched next to its conversion
    Converted {
        converted: ConvertedResult,
        extraction: ExtractionResult,
    },
    Markdown(MarkdownResult),
}

impl Payload {
    pub fn extraction(&self) -> Option<&ExtractionResult> {
        match self {
            Self::Extraction(extraction) | Self::Converted { extraction, .. } => Some(extraction),
            Self::Markdown(_) => None,
        }
    }

    pub fn converted(&self) -> Option<&ConvertedResult> {
        match self {
            Self::Converted { converted, .. } => Some(converted),
            _ => None,
        }
    }

    pub fn markdown(&self) -> Option<&MarkdownResult> {
        match self {
            Self::Markdown(markdown) => Some(markdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completed {
    pub payload: Payload,
    pub media_type: MediaType,
    pub page_count: usize,
    pub transitions: Vec<Stage>,
    pub elapsed: Duration,
}

#[derive(Error, Debug, Clone)]
#[error("{error} (last stage: {stage})")]
pub struct Failure {
    /// Last stage reached before the error
    pub stage: Stage,
    pub error: PipelineError,
    pub transitions: Vec<Stage>,
}

/// Tracks and logs stage transitions for one run
struct Run {
    id: u64,
    stage: Stage,
    transitions: Vec<Stage>,
    started: Instant,
}

impl Run {
    fn start(id: u64) -> Self {
        tracing::info!("[run {}] {}", id, Stage::Received);
        Self {
            id,
            stage: Stage::Received,
            transitions: vec![Stage::Received],
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal transition {} -> {}",
            self.stage,
            next
        );
        tracing::info!(
            "[run {}] {} -> {} ({:?})",
            self.id,
            self.stage,
            next,
            self.started.elapsed()
        );
        self.stage = next;
        self.transitions.push(next);
    }

    fn fail(mut self, error: PipelineError) -> Failure {
        let stage = self.stage;
        tracing::warn!(
            "[run {}] {} -> {}: {} ({})",
            self.id,
            stage,
            Stage::Failed,
            error,
            error.kind().as_str()
        );
        self.transitions.push(Stage::Failed);
        Failure {
            stage,
            error,
            transitions: self.transitions,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    loader: DocumentLoader,
    extractor: ExtractionClient,
    converter: SchemaConverter,
    transcriber: MarkdownTranscriber,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn ModelClient>, config: &Config) -> Self {
        let policy = RetryPolicy::from(&config.model);
        Self {
            loader: DocumentLoader::new(config.render.clone()),
            extractor: ExtractionClient::new(client.clone(), policy)
                .with_concurrency(config.page_concurrency),
            converter: SchemaConverter::new(client.clone(), policy),
            transcriber: MarkdownTranscriber::new(client, policy)
                .with_concurrency(config.page_concurrency),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        }
    }

    /// Use a custom extraction system prompt
    pub fn with_extraction_prompt(
        mut self,
        prompt: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.extractor = self.extractor.with_system_prompt(prompt, version);
        self
    }

    pub fn prompt_version(&self) -> &str {
        self.extractor.prompt_version()
    }

    pub fn markdown_prompt_version(&self) -> &str {
        self.transcriber.prompt_version()
    }

    fn start_run(&self) -> Run {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Run::start(id)
    }

    /// Run the whole pipeline for one upload.
    ///
    /// Conversion only happens when `schema` is given. No partial result is
    /// ever returned: the run either completes or fails.
    pub async fn run(
        &self,
        upload: Upload,
        schema: Option<&TargetSchema>,
    ) -> Result<Completed, Failure> {
        let mut run = self.start_run();

        let (media_type, pages) = match self.load(upload).await {
            Ok(loaded) => loaded,
            Err(e) => return Err(run.fail(e)),
        };
        let page_count = pages.len();
        tracing::info!(
            "[run {}] loaded {} as {} page(s)",
            run.id,
            media_type.mime(),
            page_count
        );
        run.advance(Stage::Loaded);

        let extraction = match self.extractor.extract(&pages).await {
            Ok(extraction) => extraction,
            Err(e) => return Err(run.fail(e)),
        };
        drop(pages);
        run.advance(Stage::Extracted);

        let payload = match schema {
            Some(schema) => match self.converter.convert(&extraction, schema).await {
                Ok(converted) => {
                    run.advance(Stage::Converted);
                    Payload::Converted {
                        converted,
                        extraction,
                    }
                }
                Err(e) => return Err(run.fail(e)),
            },
            None => Payload::Extraction(extraction),
        };
        run.advance(Stage::Completed);

        Ok(Completed {
            page_count,
            payload,
            media_type,
            elapsed: run.started.elapsed(),
            transitions: run.transitions,
        })
    }

    /// Transcribe an upload into Markdown, one model call per page
    pub async fn transcribe(&self, upload: Upload) -> Result<Completed, Failure> {
        let mut run = self.start_run();

        let (media_type, pages) = match self.load(upload).await {
            Ok(loaded) => loaded,
            Err(e) => return Err(run.fail(e)),
        };
        let page_count = pages.len();
        tracing::info!(
            "[run {}] loaded {} as {} page(s) for transcription",
            run.id,
            media_type.mime(),
            page_count
        );
        run.advance(Stage::Loaded);

        let markdown = match self.transcriber.transcribe(&pages).await {
            Ok(markdown) => markdown,
            Err(e) => return Err(run.fail(e)),
        };
        drop(pages);
        run.advance(Stage::Extracted);
        run.advance(Stage::Completed);

        Ok(Completed {
            page_count,
            payload: Payload::Markdown(markdown),
            media_type,
            elapsed: run.started.elapsed(),
            transitions: run.transitions,
        })
    }

    /// Decode and render off the async runtime
    async fn load(&self, upload: Upload) -> Result<(MediaType, Vec<PageImage>), PipelineError> {
        let loader = self.loader.clone();
        let task = tokio::task::spawn_blocking(move || -> Result<_, PipelineError> {
            let document = Document::new(
                upload.bytes,
                upload.declared_type.as_deref(),
                upload.file_name.as_deref(),
            )?;
            tracing::debug!(
                "Decoded {} with {} page(s)",
                document.media_type().mime(),
                document.page_count()
            );
            let pages = loader.load(&document)?;
            Ok((document.media_type(), pages))
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::CorruptDocument(format!(
                "document loading aborted: {}",
                e
            ))),
        }
    }
}
