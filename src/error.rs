use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Socket connection failed")]
    NotConnected,

    #[error("Acknowledgment timeout")]
    AckTimeout,

    #[error("Connection timeout")]
    ConnectTimeout,

    #[error("Local request timed out")]
    RequestTimeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::WebSocket(Box::new(err))
    }
}

impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        RelayError::InvalidUrl(err.to_string())
    }
}

impl RelayError {
    /// Whether a failed local call may succeed if tried again
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Io(_)
            | RelayError::WebSocket(_)
            | RelayError::NotConnected
            | RelayError::ConnectTimeout
            | RelayError::RequestTimeout => true,
            RelayError::Http(e) => !e.is_builder() && !e.is_redirect(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
