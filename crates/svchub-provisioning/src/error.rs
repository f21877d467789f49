//! Sync error types
//!
//! The orchestrator's error taxonomy. Connector failures are folded into it
//! by [`SyncError::from_connector`]; end users only ever see
//! [`GENERIC_USER_MESSAGE`] plus a correlation id.

use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use svchub_connector::error::ConnectorError;

/// The only failure text shown to end users.
pub const GENERIC_USER_MESSAGE: &str = "An error occurred processing your account.";

/// Error raised by orchestrator, registry and account store operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Something an operation assumed present is absent.
    #[error("{what} not found: {identifier}")]
    NotFound {
        what: &'static str,
        identifier: String,
    },

    /// The user already holds an account on this service. No credentials
    /// were issued.
    #[error("account on {service_id} is already active")]
    AlreadyActive { service_id: String },

    /// The external store could not be reached. Safe to retry.
    ///
    /// When `outcome_unknown` is set the call timed out and the external
    /// mutation may or may not have happened.
    #[error("{service_id} unavailable: {source}")]
    ExternalUnavailable {
        service_id: String,
        outcome_unknown: bool,
        #[source]
        source: ConnectorError,
    },

    /// An activation for this account is in flight or awaiting a retry.
    /// Safe to retry once it settles.
    #[error("activation on {service_id} has not completed")]
    ActivationPending { service_id: String },

    /// The user lacks the permission the service requires.
    #[error("permission {permission} required for {service_id}")]
    PermissionDenied {
        service_id: String,
        permission: String,
    },

    /// Invalid or duplicate service configuration. Fatal at startup.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The account store failed.
    #[error("account store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The connector rejected the operation permanently.
    #[error("{service_id} rejected the operation: {source}")]
    Connector {
        service_id: String,
        #[source]
        source: ConnectorError,
    },
}

impl SyncError {
    /// Classify a connector failure for the given service.
    pub fn from_connector(service_id: &str, err: ConnectorError) -> Self {
        if err.is_transient() {
            return SyncError::ExternalUnavailable {
                service_id: service_id.to_string(),
                outcome_unknown: err.is_outcome_unknown(),
                source: err,
            };
        }
        match err {
            ConnectorError::ObjectNotFound { identifier } => SyncError::NotFound {
                what: "external account",
                identifier,
            },
            other => SyncError::Connector {
                service_id: service_id.to_string(),
                source: other,
            },
        }
    }

    /// Create a not-found error.
    pub fn not_found(what: &'static str, identifier: impl Into<String>) -> Self {
        SyncError::NotFound {
            what,
            identifier: identifier.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        SyncError::Configuration {
            message: message.into(),
        }
    }

    /// Create a store error with source.
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether a deferred task should try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ExternalUnavailable { .. }
                | SyncError::ActivationPending { .. }
                | SyncError::Store { .. }
        )
    }

    /// True when a timed-out call may still have changed the external store.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(
            self,
            SyncError::ExternalUnavailable {
                outcome_unknown: true,
                ..
            }
        )
    }

    /// Get the error code for categorization.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::NotFound { .. } => "NOT_FOUND",
            SyncError::AlreadyActive { .. } => "ALREADY_ACTIVE",
            SyncError::ExternalUnavailable { .. } => "EXTERNAL_UNAVAILABLE",
            SyncError::ActivationPending { .. } => "ACTIVATION_PENDING",
            SyncError::PermissionDenied { .. } => "PERMISSION_DENIED",
            SyncError::Configuration { .. } => "CONFIGURATION_ERROR",
            SyncError::Store { .. } => "STORE_ERROR",
            SyncError::Connector { .. } => "CONNECTOR_ERROR",
        }
    }

    /// Text safe to show an end user. Never reveals the error kind.
    pub fn user_message(&self) -> &'static str {
        GENERIC_USER_MESSAGE
    }

    /// Log this error under a fresh correlation id and return what the
    /// caller may display.
    pub fn report(&self) -> UserFacingError {
        let correlation_id = Uuid::new_v4();
        error!(
            correlation_id = %correlation_id,
            error_code = self.error_code(),
            error = %self,
            "Account operation failed"
        );
        UserFacingError {
            correlation_id,
            message: self.user_message(),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::store_with_source("database operation failed", err)
    }
}

/// What an end user is told about a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (reference {correlation_id})")]
pub struct UserFacingError {
    pub correlation_id: Uuid,
    pub message: &'static str,
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
