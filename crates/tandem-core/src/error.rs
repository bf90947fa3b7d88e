//! Error types for tandem-core

use thiserror::Error;

/// Result type alias using tandem-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tandem-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity not found (locally or on the server)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport or realtime channel failure
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response from the remote API
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Replicated document error
    #[error("Document error: {0}")]
    Document(String),

    /// Operation exceeded its time budget
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Whether the error means the target entity does not exist (anymore).
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Api { status: 404, .. })
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::Io(_) => true,
            Self::Http(error) => error.is_connect() || error.is_timeout() || error.is_request(),
            Self::Api { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Whether the failure is caused by the item itself and will not heal on retry.
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::Serialization(_) | Self::Api { status: 400 | 422, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_404_counts_as_not_found() {
        let error = Error::Api {
            status: 404,
            message: "collection not found".to_string(),
        };
        assert!(error.is_not_found());
        assert!(!error.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        let error = Error::Api {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert!(error.is_transient());
        assert!(Error::Network("connection reset".to_string()).is_transient());
        assert!(!Error::InvalidInput("bad".to_string()).is_transient());
    }

    #[test]
    fn validation_failures_are_permanent() {
        assert!(Error::Api {
            status: 422,
            message: "title too long".to_string()
        }
        .is_permanent());
        assert!(!Error::Network("offline".to_string()).is_permanent());
    }
}
