//! Hub configuration loaded from environment variables.
//!
//! Loading is fail-fast: a service counts as enabled once any of its
//! `SVCHUB_<SERVICE>_*` variables is set, and then all of its required
//! variables must be present and valid.
//!
//! # Required Variables
//!
//! - `SVCHUB_DATABASE_URL` - PostgreSQL URL of the account record store
//!
//! # Optional Variables
//!
//! - `SVCHUB_LOG` - Log filter (default: "info,svchub=debug"); `RUST_LOG` wins
//! - `SVCHUB_CALL_TIMEOUT_SECS` - Per connector call timeout (default: 60)
//!
//! # Per Service
//!
//! | Service | Required | Optional |
//! |---|---|---|
//! | `PHPBB3`, `SMF` | `DATABASE_URL` | `TABLE_PREFIX`, `REVOKED_EMAIL` |
//! | `IPS4` | `DATABASE_URL` | `TABLE_PREFIX`, `BCRYPT_COST` |
//! | `MUMBLE` | `DATABASE_URL` | `TABLE` |
//! | `DISCORD` | `GUILD_ID`, `BOT_TOKEN` | `API_BASE_URL` |
//!
//! Every service also accepts `TITLE`, `URL`, `NAME_FORMAT`, `PERMISSION`,
//! `DEPROVISION` (`delete` or `revoke`) and `GROUPS` (comma separated list
//! of exposed directory groups).

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use thiserror::Error;

use svchub_connector::config::ConnectorConfig;
use svchub_connector::groups::parse_group_list;
use svchub_connector::types::{DeprovisionAction, ServiceKind};
use svchub_connector_database::{Ips4Config, MumbleConfig, Phpbb3Config, SmfConfig};
use svchub_connector_rest::DiscordConfig;
use svchub_provisioning::NameFormatter;

const PREFIX: &str = "SVCHUB";
const DEFAULT_LOG_FILTER: &str = "info,svchub=debug";
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Connector-specific settings.
#[derive(Debug, Clone)]
pub enum ConnectorSettings {
    Phpbb3(Phpbb3Config),
    Smf(SmfConfig),
    Ips4(Ips4Config),
    Mumble(MumbleConfig),
    Discord(DiscordConfig),
}

/// One enabled service.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub kind: ServiceKind,
    pub title: String,
    pub url: Option<String>,
    pub name_format: Option<NameFormatter>,
    pub permission: Option<String>,
    pub deprovision: DeprovisionAction,
    pub exposed_groups: Option<Vec<String>>,
    pub connector: ConnectorSettings,
}

/// Whole-hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub database_url: String,
    pub log_filter: String,
    pub call_timeout_secs: u64,
    pub services: Vec<ServiceSettings>,
}

impl HubConfig {
    /// Load from the process environment, reading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_vars(env::vars().collect())
    }

    /// Load from an explicit variable map.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let vars = Vars(vars);

        let database_url = vars.required(&format!("{PREFIX}_DATABASE_URL"))?;
        if !database_url.starts_with("postgres://") && !database_url.starts_with("postgresql://")
        {
            return Err(ConfigError::InvalidValue {
                var: format!("{PREFIX}_DATABASE_URL"),
                message: "must be a postgres:// URL".to_string(),
            });
        }

        let log_filter = vars
            .optional(&format!("{PREFIX}_LOG"))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let call_timeout_secs = vars
            .parsed(&format!("{PREFIX}_CALL_TIMEOUT_SECS"))?
            .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS);

        let mut services = Vec::new();
        for &kind in ServiceKind::all() {
            if let Some(service) = load_service(&vars, kind)? {
                services.push(service);
            }
        }

        Ok(Self {
            database_url,
            log_filter,
            call_timeout_secs,
            services,
        })
    }
}

struct Vars(HashMap<String, String>);

impl Vars {
    fn optional(&self, name: &str) -> Option<String> {
        self.0
            .get(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.optional(name)
            .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(name)
            .map(|raw| {
                raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                    var: name.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    fn any_with_prefix(&self, prefix: &str) -> bool {
        self.0
            .iter()
            .any(|(k, v)| k.starts_with(prefix) && !v.trim().is_empty())
    }
}

fn invalid(var: &str, message: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        message: message.to_string(),
    }
}

fn load_service(vars: &Vars, kind: ServiceKind) -> Result<Option<ServiceSettings>, ConfigError> {
    let prefix = format!("{PREFIX}_{}_", kind.as_str().to_uppercase());
    if !vars.any_with_prefix(&prefix) {
        return Ok(None);
    }
    let var = |suffix: &str| format!("{prefix}{suffix}");

    let (connector, default_title, revocable) = match kind {
        ServiceKind::Phpbb3 => {
            let mut config = Phpbb3Config::new(vars.required(&var("DATABASE_URL"))?);
            if let Some(prefix) = vars.optional(&var("TABLE_PREFIX")) {
                config = config.with_table_prefix(prefix);
            }
            if let Some(email) = vars.optional(&var("REVOKED_EMAIL")) {
                config = config.with_revoked_email(email);
            }
            config.validate().map_err(|e| invalid(&var("DATABASE_URL"), e))?;
            (ConnectorSettings::Phpbb3(config), "Forums", true)
        }
        ServiceKind::Smf => {
            let mut config = SmfConfig::new(vars.required(&var("DATABASE_URL"))?);
            if let Some(prefix) = vars.optional(&var("TABLE_PREFIX")) {
                config = config.with_table_prefix(prefix);
            }
            if let Some(email) = vars.optional(&var("REVOKED_EMAIL")) {
                config.revoked_email = email;
            }
            config.validate().map_err(|e| invalid(&var("DATABASE_URL"), e))?;
            (ConnectorSettings::Smf(config), "SMF Forums", true)
        }
        ServiceKind::Ips4 => {
            let mut config = Ips4Config::new(vars.required(&var("DATABASE_URL"))?);
            if let Some(prefix) = vars.optional(&var("TABLE_PREFIX")) {
                config.table_prefix = prefix;
            }
            if let Some(cost) = vars.parsed(&var("BCRYPT_COST"))? {
                config = config.with_bcrypt_cost(cost);
            }
            config.validate().map_err(|e| invalid(&var("DATABASE_URL"), e))?;
            (ConnectorSettings::Ips4(config), "IPSuite4", false)
        }
        ServiceKind::Mumble => {
            let mut config = MumbleConfig::new(vars.required(&var("DATABASE_URL"))?);
            if let Some(table) = vars.optional(&var("TABLE")) {
                config.table = table;
            }
            config.validate().map_err(|e| invalid(&var("DATABASE_URL"), e))?;
            (ConnectorSettings::Mumble(config), "Mumble", false)
        }
        ServiceKind::Discord => {
            let mut config = DiscordConfig::new(
                vars.required(&var("GUILD_ID"))?,
                vars.required(&var("BOT_TOKEN"))?,
            );
            if let Some(url) = vars.optional(&var("API_BASE_URL")) {
                config = config.with_api_base_url(url);
            }
            config.validate().map_err(|e| invalid(&var("GUILD_ID"), e))?;
            (ConnectorSettings::Discord(config), "Discord", false)
        }
    };

    let deprovision = match vars.optional(&var("DEPROVISION")).as_deref() {
        None | Some("delete") => DeprovisionAction::Delete,
        Some("revoke") if revocable => DeprovisionAction::Revoke,
        Some("revoke") => {
            return Err(invalid(
                &var("DEPROVISION"),
                format!("{kind} accounts cannot be revoked"),
            ))
        }
        Some(other) => {
            return Err(invalid(
                &var("DEPROVISION"),
                format!("expected 'delete' or 'revoke', got '{other}'"),
            ))
        }
    };

    let name_format = vars
        .optional(&var("NAME_FORMAT"))
        .map(|template| NameFormatter::parse(&template))
        .transpose()
        .map_err(|e| invalid(&var("NAME_FORMAT"), e))?;

    let exposed_groups = vars
        .optional(&var("GROUPS"))
        .map(|raw| parse_group_list(&raw).into_iter().collect());

    Ok(Some(ServiceSettings {
        kind,
        title: vars
            .optional(&var("TITLE"))
            .unwrap_or_else(|| default_title.to_string()),
        url: vars.optional(&var("URL")),
        name_format,
        permission: vars.optional(&var("PERMISSION")),
        deprovision,
        exposed_groups,
        connector,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const DB: (&str, &str) = ("SVCHUB_DATABASE_URL", "postgres://hub:pw@localhost/hub");

    #[test]
    fn test_minimal_config() {
        let config = HubConfig::from_vars(vars(&[DB])).unwrap();
        assert!(config.services.is_empty());
        assert_eq!(config.log_filter, "info,svchub=debug");
        assert_eq!(config.call_timeout_secs, 60);
    }

    #[test]
    fn test_missing_database_url() {
        let err = HubConfig::from_vars(HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref v) if v == "SVCHUB_DATABASE_URL"));
    }

    #[test]
    fn test_services_in_fixed_order() {
        let config = HubConfig::from_vars(vars(&[
            DB,
            ("SVCHUB_MUMBLE_DATABASE_URL", "postgres://m:pw@localhost/mumble"),
            ("SVCHUB_PHPBB3_DATABASE_URL", "mysql://f:pw@localhost/forum"),
            ("SVCHUB_PHPBB3_DEPROVISION", "revoke"),
            ("SVCHUB_PHPBB3_GROUPS", "Member, Fleet"),
        ]))
        .unwrap();

        let kinds: Vec<_> = config.services.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![ServiceKind::Phpbb3, ServiceKind::Mumble]);
        assert_eq!(config.services[0].deprovision, DeprovisionAction::Revoke);
        assert_eq!(
            config.services[0].exposed_groups,
            Some(vec!["Fleet".to_string(), "Member".to_string()])
        );
    }

    #[test]
    fn test_partial_service_is_fatal() {
        let err = HubConfig::from_vars(vars(&[DB, ("SVCHUB_DISCORD_GUILD_ID", "1234")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref v) if v == "SVCHUB_DISCORD_BOT_TOKEN"));

        let err = HubConfig::from_vars(vars(&[DB, ("SVCHUB_SMF_TABLE_PREFIX", "forum_")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(_)));
    }

    #[test]
    fn test_revoke_only_for_boards() {
        let err = HubConfig::from_vars(vars(&[
            DB,
            ("SVCHUB_MUMBLE_DATABASE_URL", "postgres://m:pw@localhost/mumble"),
            ("SVCHUB_MUMBLE_DEPROVISION", "revoke"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_bad_name_format() {
        let err = HubConfig::from_vars(vars(&[
            DB,
            ("SVCHUB_IPS4_DATABASE_URL", "mysql://i:pw@localhost/ips"),
            ("SVCHUB_IPS4_NAME_FORMAT", "{nickname}"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "SVCHUB_IPS4_NAME_FORMAT"));
    }

    #[test]
    fn test_invalid_timeout() {
        let err = HubConfig::from_vars(vars(&[DB, ("SVCHUB_CALL_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
