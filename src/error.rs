use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::Stage;

/// Failure kinds a pipeline run can end with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    UnsupportedMediaType,
    CorruptDocument,
    ExternalModelError,
    UnparsableOutput,
    SchemaMismatch,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedMediaType => "UnsupportedMediaType",
            Self::CorruptDocument => "CorruptDocument",
            Self::ExternalModelError => "ExternalModelError",
            Self::UnparsableOutput => "UnparsableOutput",
            Self::SchemaMismatch => "SchemaMismatch",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Corrupt document: {0}")]
    CorruptDocument(String),

    #[error("External model error: {0}")]
    ExternalModel(String),

    #[error("Unparsable model output: {0}")]
    UnparsableOutput(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedMediaType(_) => ErrorKind::UnsupportedMediaType,
            Self::CorruptDocument(_) => ErrorKind::CorruptDocument,
            Self::ExternalModel(_) => ErrorKind::ExternalModelError,
            Self::UnparsableOutput(_) => ErrorKind::UnparsableOutput,
            Self::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
        }
    }

    /// Only transient model-call failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalModel(_) | Self::UnparsableOutput(_))
    }
}

/// Errors surfaced by the HTTP layer
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Missing file in request")]
    MissingFile,

    #[error("File too large: {size} bytes (max: {max} bytes)")]
    FileTooLarge { size: usize, max: usize },

    #[error("Upload exceeds the {max} byte limit")]
    UploadTooLarge { max: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{error}")]
    Pipeline { stage: Stage, error: PipelineError },
}

#[derive(Serialize)]
pub struct ErrorResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub error: String,
    pub code: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ServiceError::MissingFile => (StatusCode::BAD_REQUEST, "MISSING_FILE"),
            ServiceError::FileTooLarge { .. } | ServiceError::UploadTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, "FILE_TOO_LARGE")
            }
            ServiceError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ServiceError::Pipeline { error, .. } => match error.kind() {
                ErrorKind::UnsupportedMediaType => {
                    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_MEDIA_TYPE")
                }
                ErrorKind::CorruptDocument => (StatusCode::UNPROCESSABLE_ENTITY, "CORRUPT_DOCUMENT"),
                ErrorKind::ExternalModelError => (StatusCode::BAD_GATEWAY, "EXTERNAL_MODEL_ERROR"),
                ErrorKind::UnparsableOutput => (StatusCode::BAD_GATEWAY, "UNPARSABLE_OUTPUT"),
                ErrorKind::SchemaMismatch => (StatusCode::UNPROCESSABLE_ENTITY, "SCHEMA_MISMATCH"),
            },
        };

        let body = match &self {
            ServiceError::Pipeline { stage, error } => ErrorResponse {
                status: Some("failed"),
                stage: Some(*stage),
                kind: Some(error.kind()),
                error: error.to_string(),
                code: code.to_string(),
            },
            _ => ErrorResponse {
                status: None,
                stage: None,
                kind: None,
                error: self.to_string(),
                code: code.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}
