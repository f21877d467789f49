//! # Service Connector Framework
//!
//! Core abstractions for keeping accounts in third-party services (forum
//! boards, voice servers, Discord guilds) in step with the hub's directory.
//!
//! ## Architecture
//!
//! - [`ServiceConnector`] - the account lifecycle contract
//! - [`CredentialGenerator`] - random passwords and per-store hash schemes
//! - [`NamingPolicy`] - how each store spells account names
//! - [`GroupDiff`] - the reconciliation primitive behind `sync_groups`
//!
//! ## Crate Organization
//!
//! - [`types`] - Service kinds and account value types
//! - [`error`] - Error types with transient/permanent classification
//! - [`traits`] - The connector trait
//! - [`credentials`] - Password generation and hashing
//! - [`naming`] - Username and group spelling rules
//! - [`groups`] - Membership diffing and list helpers
//! - [`config`] - Configuration types and traits
//! - [`resilience`] - Retry with backoff and call timeouts

pub mod config;
pub mod credentials;
pub mod error;
pub mod groups;
pub mod naming;
pub mod resilience;
pub mod traits;
pub mod types;

pub use credentials::{CredentialGenerator, HashScheme, PasswordHash};
pub use groups::GroupDiff;
pub use naming::NamingPolicy;
pub use traits::ServiceConnector;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ConnectionSettings, ConnectorConfig};
    pub use crate::credentials::{CredentialGenerator, HashScheme, PasswordHash};
    pub use crate::error::{ConnectorError, ConnectorResult};
    pub use crate::groups::GroupDiff;
    pub use crate::naming::{hyphenate_group, sanitize_group_name, ApostrophePolicy, NamingPolicy};
    pub use crate::resilience::{with_timeout, RetryConfig, RetryExecutor};
    pub use crate::traits::ServiceConnector;
    pub use crate::types::{
        AccountRef, DeprovisionAction, ExternalAccountState, ProvisionRequest, ProvisionedAccount,
        ServiceKind,
    };

    pub use async_trait::async_trait;
}
