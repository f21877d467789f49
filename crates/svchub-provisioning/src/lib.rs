//! # Provisioning Core
//!
//! Keeps accounts in external services consistent with the central
//! directory.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐     ┌───────────────────┐
//! │ Directory event │────►│ SyncOrchestrator │────►│ ServiceConnector  │
//! │  / SyncTask     │     │                  │     │ (phpBB3, Discord…)│
//! └─────────────────┘     └────────┬─────────┘     └───────────────────┘
//!                                  │
//!                     ┌────────────┴────────────┐
//!                     ▼                         ▼
//!             ┌───────────────┐         ┌───────────────┐
//!             │ServiceRegistry│         │ AccountStore  │
//!             └───────────────┘         └───────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use svchub_provisioning::{InMemoryAccountStore, ServiceDescriptor, ServiceRegistry, SyncOrchestrator};
//!
//! let mut builder = ServiceRegistry::builder();
//! builder.register(ServiceDescriptor::new("mumble", "Mumble", connector))?;
//! let orchestrator = SyncOrchestrator::new(Arc::new(builder.build()), Arc::new(InMemoryAccountStore::new()));
//!
//! let credentials = orchestrator.activate(&user, "mumble").await?;
//! ```

pub mod account;
pub mod directory;
pub mod error;
pub mod events;
pub mod naming;
pub mod orchestrator;
pub mod registry;
pub mod tasks;

// Re-exports for convenience
pub use account::{AccountRecord, AccountStatus, AccountStore, InMemoryAccountStore, PgAccountStore};
pub use directory::{Character, DirectorySource, DirectoryUser, Group, StaticDirectory};
pub use error::{SyncError, SyncResult, UserFacingError, GENERIC_USER_MESSAGE};
pub use events::{DirectoryEvent, DirectoryEventHandler};
pub use naming::{NameFormatter, DEFAULT_NAME_TEMPLATE};
pub use orchestrator::{
    BatchFailure, BatchReport, Credentials, LinkedIdentity, OrchestratorConfig, SyncOrchestrator,
};
pub use registry::{ServiceDescriptor, ServicePlugin, ServiceRegistry, ServiceRegistryBuilder};
pub use tasks::{SyncTask, TaskOperation, TaskOutcome, TaskRunner};
