//! # Database Connectors
//!
//! SQL connectors that write straight into the schemas of foreign products.
//!
//! Each connector owns its statement templates and its pool. Schemas are
//! never unified: every product is versioned independently and its own
//! login code dictates the hash format.
//!
//! | Connector | Store | Hash |
//! |---|---|---|
//! | [`Phpbb3Connector`] | MySQL, `phpbb_*` tables | phpass `$H$` |
//! | [`SmfConnector`] | MySQL, `smf_*` tables | SHA1(username + password) |
//! | [`Ips4Connector`] | MySQL, `core_members` | bcrypt `$2y$` |
//! | [`MumbleConnector`] | PostgreSQL, `mumble_users` | SHA1(password) |
//!
//! ## Example
//!
//! ```ignore
//! use svchub_connector::prelude::*;
//! use svchub_connector_database::{Phpbb3Config, Phpbb3Connector};
//!
//! let connector = Phpbb3Connector::new(Phpbb3Config::new("mysql://forum:pw@db/phpbb"))?;
//! connector.test_connection().await?;
//! ```

pub mod config;
pub mod ips4;
mod membership;
pub mod mumble;
pub mod phpbb3;
mod pool;
pub mod smf;

// Re-exports
pub use config::{Ips4Config, MumbleConfig, Phpbb3Config, SmfConfig, SqlStoreConfig};
pub use ips4::Ips4Connector;
pub use mumble::MumbleConnector;
pub use phpbb3::Phpbb3Connector;
pub use pool::MANAGED_GROUP_MARKER;
pub use smf::SmfConnector;
