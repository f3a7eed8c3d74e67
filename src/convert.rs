//! Schema converter: re-expresses an extraction under caller-chosen labels.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::extract::ExtractionResult;
use crate::model::{request_json, CallPurpose, ModelClient, ModelRequest, RetryPolicy};
use crate::prompts::{self, CONVERSION_SYSTEM_PROMPT};
use crate::schema::TargetSchema;

/// Schema-conformant output. Keys are exactly the schema's fields, in
/// declaration order; `null` marks a field the document did not supply.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedResult {
    schema_name: Option<String>,
    fields: Map<String, Value>,
}

impl ConvertedResult {
    pub fn schema_name(&self) -> Option<&str> {
        self.schema_name.as_deref()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Fields the document had nothing for
    pub fn missing_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, value)| value.is_null())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

#[derive(Clone)]
pub struct SchemaConverter {
    client: Arc<dyn ModelClient>,
    policy: RetryPolicy,
}

impl SchemaConverter {
    pub fn new(client: Arc<dyn ModelClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Map an extraction onto `schema` with one model call.
    ///
    /// Transport failures and unparsable answers are retried under the retry
    /// policy. A parsed answer that cannot be made to fit the schema fails
    /// with `SchemaMismatch` and is not retried.
    pub async fn convert(
        &self,
        extraction: &ExtractionResult,
        schema: &TargetSchema,
    ) -> Result<ConvertedResult, PipelineError> {
        let request = ModelRequest {
            purpose: CallPurpose::Convert,
            system: CONVERSION_SYSTEM_PROMPT,
            user: prompts::conversion_user_prompt(&extraction.to_value(), schema),
            images: Vec::new(),
        };

        tracing::info!(
            "Converting extraction ({} top-level fields) to schema {} ({} fields)",
            extraction.fields().len(),
            schema.name().unwrap_or("<inline>"),
            schema.fields().len()
        );

        let answer = request_json(self.client.as_ref(), &request, &self.policy).await?;
        let fields = schema.conform(&answer)?;

        let result = ConvertedResult {
            schema_name: schema.name().map(str::to_string),
            fields,
        };
        let missing = result.missing_fields();
        if !missing.is_empty() {
            tracing::debug!("Fields without a value: {}", missing.join(", "));
        }
        Ok(result)
    }
}
