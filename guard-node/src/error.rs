use thiserror::Error;

/// Errors that can occur in the proxy library
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Upstream Elasticsearch transport error
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Role backend error
    #[error("Role backend error: {0}")]
    RoleBackend(String),

    /// Group backend error
    #[error("Group backend error: {0}")]
    GroupBackend(String),

    /// Authentication backend error
    #[error("Authentication backend error: {0}")]
    AuthBackend(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using GuardError
pub type Result<T> = std::result::Result<T, GuardError>;

impl From<String> for GuardError {
    fn from(s: String) -> Self {
        GuardError::Other(s)
    }
}

impl From<&str> for GuardError {
    fn from(s: &str) -> Self {
        GuardError::Other(s.to_string())
    }
}

impl From<hyper::Error> for GuardError {
    fn from(err: hyper::Error) -> Self {
        GuardError::Upstream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GuardError::Config("invalid port".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid port");
    }

    #[test]
    fn test_error_from_string() {
        let err: GuardError = "test error".into();
        assert!(matches!(err, GuardError::Other(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GuardError = io_err.into();
        assert!(matches!(err, GuardError::Io(_)));
    }
}
