use thiserror::Error;

/// Failures raised by infrastructure adapters during bootstrap or delivery.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("telemetry bootstrap failed: {0}")]
    Telemetry(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
