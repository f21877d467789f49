//! SQL connector configuration
//!
//! One config struct per foreign product. [`SqlStoreConfig`] is the common
//! view of each that the connection pool consumes.

use serde::{Deserialize, Serialize};
use svchub_connector::config::{redact_url, ConnectionSettings, ConnectorConfig};
use svchub_connector::credentials::{DEFAULT_BCRYPT_COST, DEFAULT_PHPASS_ROUNDS};
use svchub_connector::error::{ConnectorError, ConnectorResult};
use svchub_connector::types::ServiceKind;

/// Default portrait URL template base.
pub const DEFAULT_AVATAR_BASE_URL: &str = "https://image.eveonline.com/Character/";

/// Default sentinel address written on revocation.
pub const DEFAULT_REVOKED_EMAIL: &str = "revoked@localhost";

/// Connection to a foreign SQL store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlStoreConfig {
    /// `mysql://` or `postgres://` URL including credentials.
    pub database_url: String,

    /// Prefix the foreign product puts in front of its table names.
    #[serde(default)]
    pub table_prefix: String,

    /// Connection settings (timeouts, pool size).
    #[serde(default)]
    pub connection: ConnectionSettings,
}

impl SqlStoreConfig {
    fn validate(&self, schemes: &[&str]) -> ConnectorResult<()> {
        if self.database_url.is_empty() {
            return Err(ConnectorError::InvalidConfiguration {
                message: "database_url is required".to_string(),
            });
        }

        if !schemes
            .iter()
            .any(|scheme| self.database_url.starts_with(&format!("{scheme}://")))
        {
            return Err(ConnectorError::InvalidConfiguration {
                message: format!("database_url must use one of: {}", schemes.join(", ")),
            });
        }

        // The prefix is spliced into statement text, never bound.
        if !self
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConnectorError::InvalidConfiguration {
                message: format!("table_prefix '{}' contains illegal characters", self.table_prefix),
            });
        }

        if self.connection.pool_size == 0 {
            return Err(ConnectorError::InvalidConfiguration {
                message: "pool_size must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.database_url = redact_url(&config.database_url);
        config
    }
}

fn default_phpbb_prefix() -> String {
    "phpbb_".to_string()
}

fn default_smf_prefix() -> String {
    "smf_".to_string()
}

fn default_revoked_email() -> String {
    DEFAULT_REVOKED_EMAIL.to_string()
}

fn default_avatar_base_url() -> String {
    DEFAULT_AVATAR_BASE_URL.to_string()
}

fn default_phpass_rounds() -> u8 {
    DEFAULT_PHPASS_ROUNDS
}

fn default_bcrypt_cost() -> u32 {
    DEFAULT_BCRYPT_COST
}

fn default_member_group_id() -> u64 {
    3
}

fn default_mumble_table() -> String {
    "mumble_users".to_string()
}

/// phpBB3 board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phpbb3Config {
    pub database_url: String,

    #[serde(default = "default_phpbb_prefix")]
    pub table_prefix: String,

    /// Address written over the e-mail of revoked accounts.
    #[serde(default = "default_revoked_email")]
    pub revoked_email: String,

    /// log2 of the phpass iteration count.
    #[serde(default = "default_phpass_rounds")]
    pub phpass_rounds: u8,

    #[serde(default = "default_avatar_base_url")]
    pub avatar_base_url: String,

    #[serde(default)]
    pub connection: ConnectionSettings,
}

impl Phpbb3Config {
    /// Create a config pointing at the given MySQL URL with defaults.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            table_prefix: default_phpbb_prefix(),
            revoked_email: default_revoked_email(),
            phpass_rounds: default_phpass_rounds(),
            avatar_base_url: default_avatar_base_url(),
            connection: ConnectionSettings::default(),
        }
    }

    /// Set the table prefix.
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Set the revocation sentinel address.
    pub fn with_revoked_email(mut self, email: impl Into<String>) -> Self {
        self.revoked_email = email.into();
        self
    }

    pub(crate) fn store(&self) -> SqlStoreConfig {
        SqlStoreConfig {
            database_url: self.database_url.clone(),
            table_prefix: self.table_prefix.clone(),
            connection: self.connection.clone(),
        }
    }
}

impl ConnectorConfig for Phpbb3Config {
    fn service_kind() -> ServiceKind {
        ServiceKind::Phpbb3
    }

    fn validate(&self) -> ConnectorResult<()> {
        self.store().validate(&["mysql"])?;
        validate_revoked_email(&self.revoked_email)?;
        if !(7..=30).contains(&self.phpass_rounds) {
            return Err(ConnectorError::InvalidConfiguration {
                message: format!("phpass_rounds {} outside 7..=30", self.phpass_rounds),
            });
        }
        Ok(())
    }

    fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.database_url = self.store().redacted().database_url;
        config
    }
}

/// Simple Machines Forum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmfConfig {
    pub database_url: String,

    #[serde(default = "default_smf_prefix")]
    pub table_prefix: String,

    #[serde(default = "default_revoked_email")]
    pub revoked_email: String,

    #[serde(default = "default_avatar_base_url")]
    pub avatar_base_url: String,

    #[serde(default)]
    pub connection: ConnectionSettings,
}

impl SmfConfig {
    /// Create a config pointing at the given MySQL URL with defaults.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            table_prefix: default_smf_prefix(),
            revoked_email: default_revoked_email(),
            avatar_base_url: default_avatar_base_url(),
            connection: ConnectionSettings::default(),
        }
    }

    /// Set the table prefix.
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub(crate) fn store(&self) -> SqlStoreConfig {
        SqlStoreConfig {
            database_url: self.database_url.clone(),
            table_prefix: self.table_prefix.clone(),
            connection: self.connection.clone(),
        }
    }
}

impl ConnectorConfig for SmfConfig {
    fn service_kind() -> ServiceKind {
        ServiceKind::Smf
    }

    fn validate(&self) -> ConnectorResult<()> {
        self.store().validate(&["mysql"])?;
        validate_revoked_email(&self.revoked_email)
    }

    fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.database_url = self.store().redacted().database_url;
        config
    }
}

/// Invision Community 4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ips4Config {
    pub database_url: String,

    #[serde(default)]
    pub table_prefix: String,

    /// bcrypt work factor.
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,

    /// Primary group assigned to new members.
    #[serde(default = "default_member_group_id")]
    pub member_group_id: u64,

    #[serde(default)]
    pub connection: ConnectionSettings,
}

impl Ips4Config {
    /// Create a config pointing at the given MySQL URL with defaults.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            table_prefix: String::new(),
            bcrypt_cost: default_bcrypt_cost(),
            member_group_id: default_member_group_id(),
            connection: ConnectionSettings::default(),
        }
    }

    /// Set the bcrypt cost.
    #[must_use]
    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    pub(crate) fn store(&self) -> SqlStoreConfig {
        SqlStoreConfig {
            database_url: self.database_url.clone(),
            table_prefix: self.table_prefix.clone(),
            connection: self.connection.clone(),
        }
    }
}

impl ConnectorConfig for Ips4Config {
    fn service_kind() -> ServiceKind {
        ServiceKind::Ips4
    }

    fn validate(&self) -> ConnectorResult<()> {
        self.store().validate(&["mysql"])?;
        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(ConnectorError::InvalidConfiguration {
                message: format!("bcrypt_cost {} outside 4..=31", self.bcrypt_cost),
            });
        }
        Ok(())
    }

    fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.database_url = self.store().redacted().database_url;
        config
    }
}

/// Mumble authenticator table, owned by the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MumbleConfig {
    pub database_url: String,

    #[serde(default = "default_mumble_table")]
    pub table: String,

    /// Length of generated passwords.
    #[serde(default = "default_password_length")]
    pub password_length: usize,

    #[serde(default)]
    pub connection: ConnectionSettings,
}

fn default_password_length() -> usize {
    svchub_connector::credentials::DEFAULT_PASSWORD_LENGTH
}

impl MumbleConfig {
    /// Create a config pointing at the given PostgreSQL URL with defaults.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            table: default_mumble_table(),
            password_length: default_password_length(),
            connection: ConnectionSettings::default(),
        }
    }

    pub(crate) fn store(&self) -> SqlStoreConfig {
        SqlStoreConfig {
            database_url: self.database_url.clone(),
            table_prefix: String::new(),
            connection: self.connection.clone(),
        }
    }
}

impl ConnectorConfig for MumbleConfig {
    fn service_kind() -> ServiceKind {
        ServiceKind::Mumble
    }

    fn validate(&self) -> ConnectorResult<()> {
        self.store().validate(&["postgres", "postgresql"])?;
        if self.table.is_empty()
            || !self
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConnectorError::InvalidConfiguration {
                message: format!("table '{}' is not a plain identifier", self.table),
            });
        }
        if self.password_length < 8 {
            return Err(ConnectorError::InvalidConfiguration {
                message: "password_length must be at least 8".to_string(),
            });
        }
        Ok(())
    }

    fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.database_url = self.store().redacted().database_url;
        config
    }
}

fn validate_revoked_email(email: &str) -> ConnectorResult<()> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(ConnectorError::InvalidConfiguration {
            message: format!("revoked_email '{email}' is not an address"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phpbb3_defaults_from_json() {
        let config: Phpbb3Config =
            serde_json::from_str(r#"{"database_url": "mysql://forum:pw@db/phpbb"}"#).unwrap();
        assert_eq!(config.table_prefix, "phpbb_");
        assert_eq!(config.revoked_email, "revoked@localhost");
        assert_eq!(config.phpass_rounds, 19);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_wrong_scheme() {
        let config = Phpbb3Config::new("postgres://db/phpbb");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mysql"));

        assert!(MumbleConfig::new("mysql://db/mumble").validate().is_err());
        assert!(MumbleConfig::new("postgres://db/hub").validate().is_ok());
    }

    #[test]
    fn test_rejects_injected_prefix() {
        let config = SmfConfig::new("mysql://db/smf").with_table_prefix("smf_; DROP TABLE x; --");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_revoked_email() {
        let config = Phpbb3Config::new("mysql://db/phpbb").with_revoked_email("nobody");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ips4_cost_bounds() {
        assert!(Ips4Config::new("mysql://db/ips").validate().is_ok());
        assert!(Ips4Config::new("mysql://db/ips")
            .with_bcrypt_cost(3)
            .validate()
            .is_err());
    }

    #[test]
    fn test_redacted_hides_password() {
        let config = SmfConfig::new("mysql://smf:hunter2@db:3306/smf");
        let redacted = config.redacted();
        assert!(!redacted.database_url.contains("hunter2"));
        assert_eq!(redacted.table_prefix, "smf_");
    }
}
