use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job with key '{0}' is already active")]
    DuplicateKey(String),

    #[error("Queue is full ({size}/{max})")]
    QueueFull { size: usize, max: usize },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out waiting for a worker slot after {0:?}")]
    PoolTimeout(Duration),

    #[error("Processing timeout after {0:?}")]
    ProcessingTimeout(Duration),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Service is shutting down")]
    ShuttingDown,
}

impl RenderError {
    /// Execution-side errors feed the retry loop; caller errors never do.
    /// Every render failure counts as transient up to the configured
    /// attempt limit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenderError::PoolTimeout(_)
                | RenderError::ProcessingTimeout(_)
                | RenderError::RenderFailed(_)
                | RenderError::BrowserLaunchFailed(_)
                | RenderError::Io(_)
        )
    }

    /// HTTP-equivalent status for the transport layer sitting above this crate.
    pub fn status_code(&self) -> u16 {
        match self {
            RenderError::Validation(_) => 400,
            RenderError::DuplicateKey(_) => 409,
            RenderError::QueueFull { .. } => 503,
            RenderError::NotFound(_) => 404,
            RenderError::InvalidState(_) => 409,
            RenderError::ShuttingDown => 503,
            _ => 500,
        }
    }
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::Validation(err.to_string())
    }
}
