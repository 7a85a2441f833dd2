use thiserror::Error;

use crate::infra::error::InfraError;

/// Failures surfaced by the export pipeline.
///
/// Individual job and fetch failures never appear here: they are logged and
/// dropped at their own stage. Only pre-flight problems and the "nothing
/// survived" condition reach the caller.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("an export is already running for subject `{subject_id}`")]
    AlreadyRunning { subject_id: String },
    #[error("invalid export request: {reason}")]
    InvalidRequest { reason: String },
    #[error("no artifacts could be produced")]
    NothingToDeliver,
    #[error("failed to assemble archive")]
    Archive(#[from] zip::result::ZipError),
    #[error("failed to buffer archive payload")]
    Io(#[from] std::io::Error),
}

impl ExportError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

/// Top-level application error for the CLI front.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
