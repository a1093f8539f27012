//! Failure taxonomy surfaced by ingestion.

use thiserror::Error;

use crate::{
    detector::DetectError, enums::SourceFormat, extractor::ExtractError, renderer::RenderError,
    repository::StoreError, storage::StorageError,
};

/// Machine-distinguishable reason attached to every [`IngestError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Decode,
    DegenerateShape,
    Storage,
    Persistence,
    Internal,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field: file")]
    MissingFile,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("{entity} {id} does not exist")]
    DanglingReference { entity: &'static str, id: i64 },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Could not decode {format} payload: {reason}")]
    Decode { format: SourceFormat, reason: String },

    #[error("Unusable {format} sample shape {shape:?}")]
    DegenerateShape { format: SourceFormat, shape: Vec<usize> },

    #[error("{attempted} uploads scheduled, aborted on first failure: {source}")]
    Storage {
        attempted: usize,
        #[source]
        source: StorageError,
    },

    #[error("Record graph could not be committed: {0}")]
    Persistence(#[source] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Validation(_) => ErrorKind::Validation,
            IngestError::Decode { .. } => ErrorKind::Decode,
            IngestError::DegenerateShape { .. } => ErrorKind::DegenerateShape,
            IngestError::Storage { .. } => ErrorKind::Storage,
            IngestError::Persistence(_) => ErrorKind::Persistence,
            IngestError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<DetectError> for IngestError {
    fn from(e: DetectError) -> Self {
        IngestError::Decode {
            format: e.format,
            reason: e.reason,
        }
    }
}

impl From<ExtractError> for IngestError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Decode { format, reason } => IngestError::Decode { format, reason },
            ExtractError::DegenerateShape { format, shape } => {
                IngestError::DegenerateShape { format, shape }
            }
        }
    }
}

impl From<RenderError> for IngestError {
    fn from(e: RenderError) -> Self {
        IngestError::Internal(e.to_string())
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(e: tokio::task::JoinError) -> Self {
        IngestError::Internal(format!("worker task failed: {e}"))
    }
}
