use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmaError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Caller-facing API misuse: empty inputs, non-text content, and so on.
    /// Thrown synchronously; never converted to a run event.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// A single-use continuation was launched twice.
    #[error("Invalid state usage: {0}")]
    State(String),

    /// Stable signature for an API that is declared but not yet built.
    #[error("Not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EmaError>;
