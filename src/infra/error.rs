use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("failed to listen for the shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl InfraError {
    pub fn signal(source: std::io::Error) -> Self {
        Self::Signal(source)
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
