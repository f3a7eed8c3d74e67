//! Extraction client: free-form, schema-agnostic reading of page images.

use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::document::PageImage;
use crate::error::PipelineError;
use crate::model::{request_json, CallPurpose, ModelClient, ModelRequest, RetryPolicy};
use crate::prompts::{self, DEFAULT_EXTRACTION_SYSTEM_PROMPT, EXTRACTION_PROMPT_VERSION};

/// Key used when a page answers with something other than an object
const WRAPPED_CONTENT_KEY: &str = "content";

/// Everything the model read from one document, under its own field names
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    fields: Map<String, Value>,
    pages: Vec<Value>,
}

impl ExtractionResult {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Per-page results as returned by the model, in page order
    pub fn pages(&self) -> &[Value] {
        &self.pages
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Location of a field inside nested objects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    fn child(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(key.to_string());
        Self(segments)
    }

    /// Value at this path, looking through objects only
    pub fn get<'a>(&self, map: &'a Map<String, Value>) -> Option<&'a Value> {
        let (last, parents) = self.0.split_last()?;
        let mut current = map;
        for key in parents {
            current = current.get(key)?.as_object()?;
        }
        current.get(last)
    }

    /// Store `value` at this path when every parent is an object
    pub fn set(&self, map: &mut Map<String, Value>, value: Value) -> bool {
        let Some((last, parents)) = self.0.split_last() else {
            return false;
        };
        let mut current = map;
        for key in parents {
            match current.get_mut(key).and_then(Value::as_object_mut) {
                Some(inner) => current = inner,
                None => return false,
            }
        }
        current.insert(last.clone(), value);
        true
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Outcome of folding page results together
#[derive(Debug, Default, PartialEq)]
pub struct MergedPages {
    pub fields: Map<String, Value>,
    /// Paths where pages disagreed on a single value
    pub conflicts: Vec<FieldPath>,
}

#[derive(Clone)]
pub struct ExtractionClient {
    client: Arc<dyn ModelClient>,
    policy: RetryPolicy,
    system_prompt: Arc<str>,
    prompt_version: Arc<str>,
    concurrency: usize,
}

impl ExtractionClient {
    pub fn new(client: Arc<dyn ModelClient>, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            system_prompt: Arc::from(DEFAULT_EXTRACTION_SYSTEM_PROMPT),
            prompt_version: Arc::from(EXTRACTION_PROMPT_VERSION),
            concurrency: 4,
        }
    }

    /// Replace the extraction system prompt; `version` is reported to callers
    pub fn with_system_prompt(mut self, prompt: impl Into<String>, version: impl Into<String>) -> Self {
        self.system_prompt = Arc::from(prompt.into());
        self.prompt_version = Arc::from(version.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn prompt_version(&self) -> &str {
        &self.prompt_version
    }

    /// Extract one page. The result is always a JSON object.
    pub async fn extract_page(
        &self,
        page: &PageImage,
        total_pages: usize,
    ) -> Result<Value, PipelineError> {
        let request = ModelRequest {
            purpose: CallPurpose::Extract,
            system: &self.system_prompt,
            user: prompts::extraction_user_prompt(
                page.index + 1,
                total_pages,
                page.text_layer.as_deref(),
            ),
            images: vec![page.png.as_slice()],
        };

        tracing::info!("Extracting page {} of {}", page.index + 1, total_pages);
        let value = request_json(self.client.as_ref(), &request, &self.policy).await?;
        Ok(as_object(value))
    }

    /// Extract every page, then merge into one result.
    ///
    /// Page calls run concurrently up to the configured limit. All of them
    /// finish before merging starts, and a single failed page fails the whole
    /// document.
    pub async fn extract(&self, pages: &[PageImage]) -> Result<ExtractionResult, PipelineError> {
        if pages.is_empty() {
            return Err(PipelineError::CorruptDocument(
                "document produced no pages".to_string(),
            ));
        }

        let total = pages.len();
        let calls: Vec<_> = pages
            .iter()
            .map(|page| Box::pin(self.extract_page(page, total)))
            .collect();
        let outcomes: Vec<Result<Value, PipelineError>> = stream::iter(calls)
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut page_results = Vec::with_capacity(total);
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(value) => page_results.push(value),
                Err(e) => {
                    tracing::error!("Page {} of {} failed: {}", index + 1, total, e);
                    return Err(e);
                }
            }
        }

        let merged = merge_pages(&page_results);
        let fields = if merged.conflicts.is_empty() {
            merged.fields
        } else {
            let paths: Vec<String> = merged.conflicts.iter().map(ToString::to_string).collect();
            tracing::info!(
                "Pages disagree on {} field(s): {}; consolidating",
                paths.len(),
                paths.join(", ")
            );
            let resolved = self.consolidate(&page_results, &paths).await?;
            apply_resolution(merged, resolved)
        };

        Ok(ExtractionResult {
            fields,
            pages: page_results,
        })
    }

    async fn consolidate(
        &self,
        page_results: &[Value],
        conflicts: &[String],
    ) -> Result<Map<String, Value>, PipelineError> {
        let request = ModelRequest {
            purpose: CallPurpose::Consolidate,
            system: prompts::CONSOLIDATION_SYSTEM_PROMPT,
            user: prompts::consolidation_user_prompt(page_results, conflicts),
            images: Vec::new(),
        };
        let value = request_json(self.client.as_ref(), &request, &self.policy).await?;
        match as_object(value) {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }
}

/// Lay the consolidation answer over the merge.
///
/// Conflicting paths take the answer's value when it has a non-null one.
/// Keys the merge lacks are added; nothing the merge holds is dropped.
pub fn apply_resolution(merged: MergedPages, resolved: Map<String, Value>) -> Map<String, Value> {
    let MergedPages {
        mut fields,
        conflicts,
    } = merged;
    for path in &conflicts {
        match path.get(&resolved) {
            Some(value) if !value.is_null() => {
                if !path.set(&mut fields, value.clone()) {
                    tracing::warn!("Resolved value for {} has no place in the merge", path);
                }
            }
            _ => tracing::warn!("Consolidation left {} unresolved; keeping first page value", path),
        }
    }
    add_missing(&mut fields, resolved);
    fields
}

fn add_missing(into: &mut Map<String, Value>, from: Map<String, Value>) {
    for (key, value) in from {
        match into.get_mut(&key) {
            None => {
                into.insert(key, value);
            }
            Some(Value::Object(existing)) => {
                if let Value::Object(inner) = value {
                    add_missing(existing, inner);
                }
            }
            Some(_) => {}
        }
    }
}

fn as_object(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => {
            let mut map = Map::new();
            map.insert(WRAPPED_CONTENT_KEY.to_string(), other);
            Value::Object(map)
        }
    }
}

/// Fold per-page objects together in page order.
///
/// Objects merge key by key and arrays concatenate. A null gives way to any
/// value and equal values collapse. A single value meeting an array joins it.
/// Anything else is a conflict: the first page's value is kept and the path
/// is reported.
pub fn merge_pages(pages: &[Value]) -> MergedPages {
    let mut merged = MergedPages::default();
    for page in pages {
        if let Value::Object(map) = as_object(page.clone()) {
            merge_map(&mut merged.fields, map, &FieldPath::default(), &mut merged.conflicts);
        }
    }
    merged
}

fn merge_map(
    into: &mut Map<String, Value>,
    from: Map<String, Value>,
    prefix: &FieldPath,
    conflicts: &mut Vec<FieldPath>,
) {
    for (key, incoming) in from {
        let path = prefix.child(&key);
        match into.get_mut(&key) {
            Some(existing) => merge_value(existing, incoming, &path, conflicts),
            None => {
                into.insert(key, incoming);
            }
        }
    }
}

fn merge_value(
    existing: &mut Value,
    incoming: Value,
    path: &FieldPath,
    conflicts: &mut Vec<FieldPath>,
) {
    match (existing, incoming) {
        (_, Value::Null) => {}
        (slot, value) if slot.is_null() => *slot = value,
        (Value::Object(a), Value::Object(b)) => merge_map(a, b, path, conflicts),
        (Value::Array(a), Value::Array(b)) => a.extend(b),
        (Value::Array(a), value) => a.push(value),
        (slot, Value::Array(b)) => {
            let first = slot.take();
            let mut items = Vec::with_capacity(b.len() + 1);
            items.push(first);
            items.extend(b);
            *slot = Value::Array(items);
        }
        (slot, value) => {
            if *slot != value && !conflicts.contains(path) {
                conflicts.push(path.clone());
            }
        }
    }
}
