//! Connector errors.
//!
//! Every variant is either transient (worth a later retry) or permanent.

use thiserror::Error;

/// Failure of a call into an external service.
#[derive(Debug, Error)]
pub enum ConnectorError {
    // Connection errors (transient)
    /// Failed to establish connection to the external store.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The call did not complete in time. The external mutation may or may
    /// not have happened.
    #[error("operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// External service is temporarily unavailable (rate limited, 5xx).
    #[error("target system unavailable: {message}")]
    TargetUnavailable { message: String },

    /// The request was sent but the exchange broke off.
    #[error("network error: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Permanent errors
    /// The external store rejected our credentials.
    #[error("authentication failed against {service}")]
    AuthenticationFailed { service: String },

    /// Rejected by `ConnectorConfig::validate`.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// The connector does not support the requested operation.
    #[error("{service} does not support {operation}")]
    Unsupported {
        service: String,
        operation: &'static str,
    },

    /// Account or group already exists and the connector cannot adopt it.
    #[error("object already exists: {identifier}")]
    ObjectAlreadyExists { identifier: String },

    /// Account or group is absent.
    #[error("object not found: {identifier}")]
    ObjectNotFound { identifier: String },

    /// External store returned data we could not interpret.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    /// Database error that is not a connectivity problem.
    #[error("database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Password hashing failed.
    #[error("hashing failed: {message}")]
    Hashing { message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ConnectorError {
    /// Conditions on the far side that may clear on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::ConnectionFailed { .. }
                | ConnectorError::Timeout { .. }
                | ConnectorError::TargetUnavailable { .. }
                | ConnectorError::NetworkError { .. }
        )
    }

    /// Retrying the same call will fail the same way.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// True when the external outcome of the failed call is unknown.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, ConnectorError::Timeout { .. })
    }

    /// Stable code for logs and CLI output.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            ConnectorError::Timeout { .. } => "TIMEOUT",
            ConnectorError::TargetUnavailable { .. } => "TARGET_UNAVAILABLE",
            ConnectorError::NetworkError { .. } => "NETWORK_ERROR",
            ConnectorError::AuthenticationFailed { .. } => "AUTH_FAILED",
            ConnectorError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            ConnectorError::Unsupported { .. } => "UNSUPPORTED",
            ConnectorError::ObjectAlreadyExists { .. } => "OBJECT_EXISTS",
            ConnectorError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            ConnectorError::InvalidData { .. } => "INVALID_DATA",
            ConnectorError::Database { .. } => "DATABASE_ERROR",
            ConnectorError::Hashing { .. } => "HASHING_FAILED",
            ConnectorError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    // Constructors

    pub fn connection_failed(message: impl Into<String>) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::NetworkError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn database_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::Database {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn not_found(identifier: impl Into<String>) -> Self {
        ConnectorError::ObjectNotFound {
            identifier: identifier.into(),
        }
    }

    pub fn unsupported(service: impl Into<String>, operation: &'static str) -> Self {
        ConnectorError::Unsupported {
            service: service.into(),
            operation,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ConnectorError::Internal {
            message: message.into(),
        }
    }
}

/// Result of a connector call.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let transient_errors = vec![
            ConnectorError::connection_failed("test"),
            ConnectorError::Timeout { timeout_secs: 30 },
            ConnectorError::TargetUnavailable {
                message: "429".to_string(),
            },
            ConnectorError::NetworkError {
                message: "reset".to_string(),
                source: None,
            },
        ];

        for err in transient_errors {
            assert!(
                err.is_transient(),
                "Expected {} to be transient",
                err.error_code()
            );
        }
    }

    #[test]
    fn test_permanent_errors() {
        let permanent_errors = vec![
            ConnectorError::AuthenticationFailed {
                service: "discord".to_string(),
            },
            ConnectorError::InvalidConfiguration {
                message: "test".to_string(),
            },
            ConnectorError::not_found("alice"),
            ConnectorError::ObjectAlreadyExists {
                identifier: "alice".to_string(),
            },
            ConnectorError::unsupported("discord", "reset_password"),
        ];

        for err in permanent_errors {
            assert!(
                err.is_permanent(),
                "Expected {} to be permanent",
                err.error_code()
            );
        }
    }

    #[test]
    fn test_only_timeout_has_unknown_outcome() {
        assert!(ConnectorError::Timeout { timeout_secs: 5 }.is_outcome_unknown());
        assert!(!ConnectorError::connection_failed("refused").is_outcome_unknown());
    }

    #[test]
    fn test_error_display() {
        let err = ConnectorError::Timeout { timeout_secs: 30 };
        assert_eq!(err.to_string(), "operation timed out after 30 seconds");

        let err = ConnectorError::unsupported("ips4", "sync_groups");
        assert_eq!(err.to_string(), "ips4 does not support sync_groups");
    }

    #[test]
    fn test_source_is_chained() {
        use std::error::Error as _;

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ConnectorError::connection_failed_with_source("mysql unreachable", refused);

        assert!(err.is_transient());
        assert_eq!(err.source().map(|s| s.to_string()), Some("refused".to_string()));
    }
}
