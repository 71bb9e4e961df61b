use thiserror::Error;

/// Errors surfaced by exchange adapters
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Rate limited; the message may carry "banned until <unix-ms>"
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Insufficient margin: {0}")]
    InsufficientMargin(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Deserialization failed: {0}")]
    DeserializeFailed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<ExchangeError>,
    },

    /// A retry wait was cut short by shutdown
    #[error("{0} abandoned on shutdown")]
    Cancelled(String),

    #[error("{operation} is not supported by {exchange}")]
    Unsupported { exchange: String, operation: String },
}

pub type Result<T> = std::result::Result<T, ExchangeError>;

impl ExchangeError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ExchangeError::RateLimited(_))
    }

    pub fn is_margin(&self) -> bool {
        matches!(self, ExchangeError::InsufficientMargin(_))
    }

    pub fn is_order_not_found(&self) -> bool {
        matches!(self, ExchangeError::OrderNotFound(_))
    }

    /// Worth retrying: rate limits, timeouts and transport failures
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::RateLimited(_) | ExchangeError::Timeout(_) => true,
            ExchangeError::RequestFailed(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ExchangeError::Api { code, .. } => *code >= 500 || *code == -1001 || *code == -1007,
            _ => false,
        }
    }
}
