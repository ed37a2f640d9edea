//! Error types for the offline interception proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error types that can occur in the proxy
///
/// The enum is `Clone` so that a single failed operation (for example a codec
/// load shared by several waiters) can hand the same error to every caller.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Corrupt cache entry: {0}")]
    CorruptEntry(String),

    #[error("IO error: {0}")]
    IoError(String),

    /// The live network could not be reached (offline, DNS, connection reset).
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Multipart error: {0}")]
    MultipartError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<multer::Error> for ProxyError {
    fn from(err: multer::Error) -> Self {
        ProxyError::MultipartError(err.to_string())
    }
}

impl From<bincode::Error> for ProxyError {
    fn from(err: bincode::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            ProxyError::InvalidRequest(err.to_string())
        } else {
            ProxyError::NetworkError(err.to_string())
        }
    }
}

impl ProxyError {
    /// Whether this error means the network was unreachable.
    ///
    /// Network-first falls back to the cache only for these errors.
    pub fn is_network_failure(&self) -> bool {
        matches!(self, ProxyError::NetworkError(_))
    }

    /// Convert error to the HTTP status the interception server answers with
    ///
    /// A failed live fetch surfaces to the requester as a failed network
    /// request (502); malformed requests are the client's fault.
    pub fn to_http_status(&self) -> u16 {
        match self {
            ProxyError::NetworkError(_) => 502,
            ProxyError::HttpError(_) => 502,
            ProxyError::InvalidRequest(_) => 400,
            ProxyError::MultipartError(_) => 400,
            ProxyError::InvalidTransition { .. } => 503,
            ProxyError::ConfigError(_)
            | ProxyError::CacheError(_)
            | ProxyError::CorruptEntry(_)
            | ProxyError::IoError(_)
            | ProxyError::CodecError(_)
            | ProxyError::SerializationError(_)
            | ProxyError::InternalError(_) => 500,
        }
    }

    /// Human-readable message safe to show to a user.
    ///
    /// Never includes partition names, file paths or classifier details.
    pub fn user_message(&self) -> &'static str {
        match self {
            ProxyError::NetworkError(_) | ProxyError::HttpError(_) => {
                "The converter could not be downloaded. Check your internet connection and try again."
            }
            ProxyError::CodecError(_) => {
                "Something went wrong during the conversion. Please try again."
            }
            ProxyError::InvalidRequest(_) | ProxyError::MultipartError(_) => {
                "The shared file could not be read."
            }
            _ => "An unexpected error occurred. Please try again.",
        }
    }
}
