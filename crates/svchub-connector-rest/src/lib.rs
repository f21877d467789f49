//! # Discord Connector
//!
//! Guild membership provisioning over the Discord REST API.
//!
//! Accounts are guild members addressed by the user's snowflake. Joining a
//! user needs the OAuth access token the front end obtained for them; the
//! connector itself authenticates as a bot. Hub groups become guild roles,
//! created on demand.
//!
//! Requests respect Discord's 429 responses: the `Retry-After` hint is
//! remembered per route (or globally) and later calls wait it out.

pub mod config;
pub mod discord;
pub mod rate_limit;

// Re-exports
pub use config::DiscordConfig;
pub use discord::{role_name, DiscordConnector};
pub use rate_limit::{parse_retry_after, BackoffGate, RateLimitInfo};
