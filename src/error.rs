use thiserror::Error;

/// Raised while building an appender. Construction fails fast so that a
/// misconfigured appender never reaches the logging hot path.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required attribute: {0}")]
    Missing(&'static str),
    #[error("Invalid address in {field}: {message}")]
    InvalidAddress { field: &'static str, message: String },
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
    #[cfg(feature = "config-file")]
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("SendGrid rejected the request: {status} - {body}")]
    Rejected { status: u16, body: String },
}
