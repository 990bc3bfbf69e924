use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsafe cliPath rejected: {0}")]
    UnsafeCommand(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("event stream error: {0}")]
    Events(String),

    #[error("runtime is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;
