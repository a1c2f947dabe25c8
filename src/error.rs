use hyper::StatusCode;
use thiserror::Error;

use crate::dialer::DialError;
use crate::rules::RuleCompileError;

/// Unified error type for the Tracksocks proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    // Remote configuration
    #[error("Failed to fetch {url}: {reason}")]
    ConfigFetch { url: String, reason: String },

    #[error("Rule compile error: {0}")]
    RuleCompile(#[from] RuleCompileError),

    // Upstream errors
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    #[error("Transport error: {0}")]
    Transport(String),

    // TLS errors
    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    // Listener errors
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 413 Payload Too Large
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            // 502 Bad Gateway
            ProxyError::Dial(_) | ProxyError::Transport(_) | ProxyError::Tls(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 503 Service Unavailable
            ProxyError::ConfigFetch { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            ProxyError::RuleCompile(_)
            | ProxyError::Certificate(_)
            | ProxyError::Listen { .. }
            | ProxyError::InvalidConfig(_)
            | ProxyError::Io(_)
            | ProxyError::Http(_)
            | ProxyError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

impl From<http::Error> for ProxyError {
    fn from(err: http::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::InvalidRequest(err.to_string())
    }
}

impl From<rcgen::Error> for ProxyError {
    fn from(err: rcgen::Error) -> Self {
        ProxyError::Certificate(err.to_string())
    }
}
