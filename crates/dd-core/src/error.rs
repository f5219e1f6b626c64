use dd_capture::CaptureError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
