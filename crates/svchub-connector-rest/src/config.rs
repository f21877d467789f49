//! Discord connector configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use svchub_connector::config::{ConnectionSettings, ConnectorConfig};
use svchub_connector::error::{ConnectorError, ConnectorResult};
use svchub_connector::types::ServiceKind;

/// Configuration for the Discord guild connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// API root, without a trailing slash.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Snowflake of the guild accounts are managed in.
    pub guild_id: String,

    /// Bot token, sent as `Authorization: Bot <token>`.
    pub bot_token: String,

    /// How long the guild role list is trusted before refetching.
    #[serde(default = "default_role_cache_ttl")]
    pub role_cache_ttl_secs: u64,

    /// Attempts per request while the API answers 429.
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,

    /// Upper bound on one rate-limit wait, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default)]
    pub connection: ConnectionSettings,
}

fn default_api_base_url() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_role_cache_ttl() -> u64 {
    30 * 60
}

fn default_max_rate_limit_retries() -> u32 {
    3
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl DiscordConfig {
    /// Create a config for one guild with defaults.
    pub fn new(guild_id: impl Into<String>, bot_token: impl Into<String>) -> Self {
        Self {
            api_base_url: default_api_base_url(),
            guild_id: guild_id.into(),
            bot_token: bot_token.into(),
            role_cache_ttl_secs: default_role_cache_ttl(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            max_backoff_ms: default_max_backoff_ms(),
            connection: ConnectionSettings::default(),
        }
    }

    /// Point the connector at a different API root.
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the role cache lifetime.
    #[must_use]
    pub fn with_role_cache_ttl(mut self, secs: u64) -> Self {
        self.role_cache_ttl_secs = secs;
        self
    }

    /// Set rate-limit retry behaviour.
    #[must_use]
    pub fn with_rate_limit(mut self, max_retries: u32, max_backoff_ms: u64) -> Self {
        self.max_rate_limit_retries = max_retries;
        self.max_backoff_ms = max_backoff_ms;
        self
    }

    /// Role cache lifetime as a Duration.
    pub fn role_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.role_cache_ttl_secs)
    }

    /// Maximum single backoff as a Duration.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl ConnectorConfig for DiscordConfig {
    fn service_kind() -> ServiceKind {
        ServiceKind::Discord
    }

    fn validate(&self) -> ConnectorResult<()> {
        if !(self.api_base_url.starts_with("https://") || self.api_base_url.starts_with("http://"))
        {
            return Err(ConnectorError::InvalidConfiguration {
                message: "api_base_url must be an http(s) URL".to_string(),
            });
        }

        if self.guild_id.is_empty() || !self.guild_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConnectorError::InvalidConfiguration {
                message: "guild_id must be a numeric snowflake".to_string(),
            });
        }

        if self.bot_token.is_empty() {
            return Err(ConnectorError::InvalidConfiguration {
                message: "bot_token is required".to_string(),
            });
        }

        if self.max_rate_limit_retries == 0 {
            return Err(ConnectorError::InvalidConfiguration {
                message: "max_rate_limit_retries must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.bot_token = "***REDACTED***".to_string();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DiscordConfig::new("1234", "token");
        assert_eq!(config.api_base_url, "https://discord.com/api/v10");
        assert_eq!(config.role_cache_ttl(), Duration::from_secs(1800));
        assert_eq!(config.max_rate_limit_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(DiscordConfig::new("guild", "token").validate().is_err());
        assert!(DiscordConfig::new("1234", "").validate().is_err());
        assert!(DiscordConfig::new("1234", "token")
            .with_api_base_url("ftp://example.com")
            .validate()
            .is_err());
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let config = DiscordConfig::new("1", "t").with_api_base_url("http://127.0.0.1:9000/");
        assert_eq!(config.api_base_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn test_redacted() {
        let config = DiscordConfig::new("1234", "very-secret");
        assert_eq!(config.redacted().bot_token, "***REDACTED***");
        assert_eq!(config.redacted().guild_id, "1234");
    }
}
