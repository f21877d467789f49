//! Connector type definitions
//!
//! Enums and value types passed across the connector boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// The external product a connector speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// phpBB3 forum board (MySQL).
    Phpbb3,
    /// Simple Machines Forum (MySQL).
    Smf,
    /// Invision Community 4 (MySQL).
    Ips4,
    /// Mumble voice server authenticator table.
    Mumble,
    /// Discord guild membership.
    Discord,
}

impl ServiceKind {
    /// Get all available service kinds.
    #[must_use]
    pub fn all() -> &'static [ServiceKind] {
        &[
            ServiceKind::Phpbb3,
            ServiceKind::Smf,
            ServiceKind::Ips4,
            ServiceKind::Mumble,
            ServiceKind::Discord,
        ]
    }

    /// Get the string representation used in configuration and storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Phpbb3 => "phpbb3",
            ServiceKind::Smf => "smf",
            ServiceKind::Ips4 => "ips4",
            ServiceKind::Mumble => "mumble",
            ServiceKind::Discord => "discord",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = ParseServiceKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "phpbb3" => Ok(ServiceKind::Phpbb3),
            "smf" => Ok(ServiceKind::Smf),
            "ips4" => Ok(ServiceKind::Ips4),
            "mumble" => Ok(ServiceKind::Mumble),
            "discord" => Ok(ServiceKind::Discord),
            _ => Err(ParseServiceKindError(s.to_string())),
        }
    }
}

/// Error parsing service kind from string.
#[derive(Debug, Clone)]
pub struct ParseServiceKindError(String);

impl fmt::Display for ParseServiceKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid service kind '{}', expected one of: phpbb3, smf, ips4, mumble, discord",
            self.0
        )
    }
}

impl std::error::Error for ParseServiceKindError {}

/// What deactivation does to the external account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeprovisionAction {
    /// Remove the external account.
    #[default]
    Delete,
    /// Keep the row but lock it out with a sentinel e-mail and random password.
    Revoke,
}

/// Lifecycle state of an external account as seen by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalAccountState {
    /// No account exists externally.
    Absent,
    /// The account exists and can log in.
    Active,
    /// The account exists but has been locked out by revocation.
    Revoked,
}

/// Handle on an already provisioned account.
///
/// Connectors pick whichever half they address accounts by: board
/// connectors key on the username, IPS4 and Discord on the external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRef {
    /// Username as stored in the external system.
    pub username: String,

    /// External identifier (member id, user id, snowflake).
    pub external_id: Option<String>,
}

impl AccountRef {
    /// Create a reference to an account by username and optional id.
    pub fn new(username: impl Into<String>, external_id: Option<String>) -> Self {
        Self {
            username: username.into(),
            external_id,
        }
    }

    /// The external id, or the username when no id was recorded.
    #[must_use]
    pub fn id_or_username(&self) -> &str {
        self.external_id.as_deref().unwrap_or(&self.username)
    }
}

/// Everything a connector needs to create an account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Formatted external username.
    pub username: String,

    /// Contact e-mail address.
    pub email: String,

    /// Initial external group set.
    #[serde(default)]
    pub groups: BTreeSet<String>,

    /// Main character id, used for board avatars.
    #[serde(default)]
    pub character_id: Option<i64>,

    /// Display name, used where the service shows a nickname.
    #[serde(default)]
    pub display_name: Option<String>,

    /// Identifier already known to the external service (Discord user id
    /// obtained by the front end's OAuth exchange).
    #[serde(default)]
    pub external_id: Option<String>,

    /// User access token that lets the connector act on the user's behalf.
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
}

impl ProvisionRequest {
    /// Create a request with username and e-mail.
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            ..Default::default()
        }
    }

    /// Set the initial groups.
    #[must_use]
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Set the character id.
    #[must_use]
    pub fn with_character_id(mut self, character_id: i64) -> Self {
        self.character_id = Some(character_id);
        self
    }
}

/// Result of a successful `create_user`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedAccount {
    /// Username as actually stored externally.
    pub username: String,

    /// Plaintext password, returned exactly once. `None` for services
    /// without passwords.
    pub password: Option<String>,

    /// External identifier used by later operations.
    pub external_id: String,

    /// True when an existing (for example revoked) account was adopted.
    pub adopted: bool,
}

impl ProvisionedAccount {
    /// Reference to the provisioned account.
    #[must_use]
    pub fn account_ref(&self) -> AccountRef {
        AccountRef::new(self.username.clone(), Some(self.external_id.clone()))
    }
}
