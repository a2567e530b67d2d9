//! Registry error taxonomy

use thiserror::Error;

/// Errors that can occur when talking to an image registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// HTTP request failed below the protocol level
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Request timed out
    #[error("Registry request timed out")]
    Timeout,

    /// Credentials rejected or missing
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Repository does not exist
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Tag does not exist in an existing repository
    #[error("Tag not found: {0}")]
    TagNotFound(String),

    /// Registry throttled the request
    #[error("Rate limited, retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Response body did not match the expected shape
    #[error("Invalid registry response: {0}")]
    InvalidResponse(String),

    /// Server-side failure (5xx)
    #[error("Registry error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),
}

impl RegistryError {
    /// Stable error code for user-visible surfaces
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::ConnectionFailed(_) => "CONNECTION_FAILED",
            RegistryError::Timeout => "REGISTRY_TIMEOUT",
            RegistryError::Unauthorized(_) => "UNAUTHORIZED",
            RegistryError::ImageNotFound(_) => "IMAGE_NOT_FOUND",
            RegistryError::TagNotFound(_) => "TAG_NOT_FOUND",
            RegistryError::RateLimited { .. } => "RATE_LIMIT",
            RegistryError::InvalidResponse(_) => "INVALID_RESPONSE",
            RegistryError::Server { .. } => "INVALID_RESPONSE",
            RegistryError::InvalidReference(_) => "INVALID_RESPONSE",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::ConnectionFailed(_) => true,
            RegistryError::Timeout => true,
            RegistryError::RateLimited { .. } => true,
            RegistryError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Get the HTTP status code if one applies
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RegistryError::Unauthorized(_) => Some(401),
            RegistryError::ImageNotFound(_) | RegistryError::TagNotFound(_) => Some(404),
            RegistryError::RateLimited { .. } => Some(429),
            RegistryError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RegistryError::Timeout
        } else if e.is_connect() {
            RegistryError::ConnectionFailed(e.to_string())
        } else {
            RegistryError::InvalidResponse(e.to_string())
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::InvalidResponse(e.to_string())
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
