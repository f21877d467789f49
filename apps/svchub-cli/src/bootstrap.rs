//! Wiring from configuration to a running orchestrator.

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;

use svchub_connector::error::ConnectorResult;
use svchub_connector::traits::ServiceConnector;
use svchub_connector_database::{Ips4Connector, MumbleConnector, Phpbb3Connector, SmfConnector};
use svchub_connector_rest::DiscordConnector;
use svchub_provisioning::registry::install;
use svchub_provisioning::{
    OrchestratorConfig, PgAccountStore, ServiceDescriptor, ServicePlugin, ServiceRegistry,
    ServiceRegistryBuilder, SyncError, SyncOrchestrator, SyncResult,
};

use crate::config::{ConnectorSettings, HubConfig, ServiceSettings};
use crate::error::CliResult;

/// Registers every service enabled in the environment.
pub struct ConfiguredServices<'a> {
    services: &'a [ServiceSettings],
}

impl<'a> ConfiguredServices<'a> {
    pub fn new(services: &'a [ServiceSettings]) -> Self {
        Self { services }
    }
}

impl ServicePlugin for ConfiguredServices<'_> {
    fn register(&self, registry: &mut ServiceRegistryBuilder) -> SyncResult<()> {
        for settings in self.services {
            registry.register(describe(settings)?)?;
        }
        Ok(())
    }
}

fn build_connector(settings: &ConnectorSettings) -> ConnectorResult<Arc<dyn ServiceConnector>> {
    let connector: Arc<dyn ServiceConnector> = match settings {
        ConnectorSettings::Phpbb3(c) => Arc::new(Phpbb3Connector::new(c.clone())?),
        ConnectorSettings::Smf(c) => Arc::new(SmfConnector::new(c.clone())?),
        ConnectorSettings::Ips4(c) => Arc::new(Ips4Connector::new(c.clone())?),
        ConnectorSettings::Mumble(c) => Arc::new(MumbleConnector::new(c.clone())?),
        ConnectorSettings::Discord(c) => Arc::new(DiscordConnector::new(c.clone())?),
    };
    Ok(connector)
}

fn describe(settings: &ServiceSettings) -> SyncResult<ServiceDescriptor> {
    let id = settings.kind.as_str();
    let connector = build_connector(&settings.connector)
        .map_err(|e| SyncError::configuration(format!("{id}: {e}")))?;

    let mut descriptor = ServiceDescriptor::new(id, &settings.title, connector)
        .with_deprovision(settings.deprovision);
    if let Some(url) = &settings.url {
        descriptor = descriptor.with_url(url);
    }
    if let Some(permission) = &settings.permission {
        descriptor = descriptor.with_permission(permission);
    }
    if let Some(formatter) = &settings.name_format {
        descriptor = descriptor.with_name_formatter(formatter.clone());
    }
    if let Some(groups) = &settings.exposed_groups {
        descriptor = descriptor.with_exposed_groups(groups.iter().cloned());
    }
    Ok(descriptor)
}

/// Build and install the process-wide registry.
pub fn build_registry(config: &HubConfig) -> CliResult<Arc<ServiceRegistry>> {
    let plugin = ConfiguredServices::new(&config.services);
    let registry = ServiceRegistry::from_plugins(&[&plugin])?;
    info!(services = registry.len(), "Service registry built");
    Ok(install(registry)?)
}

/// Connect to the account store and build the orchestrator.
pub async fn build_orchestrator(config: &HubConfig) -> CliResult<SyncOrchestrator> {
    let registry = build_registry(config)?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .map_err(SyncError::from)?;
    let store = PgAccountStore::new(pool);
    store.ensure_schema().await?;

    Ok(SyncOrchestrator::with_config(
        registry,
        Arc::new(store),
        OrchestratorConfig {
            call_timeout_secs: config.call_timeout_secs,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use svchub_connector::types::DeprovisionAction;

    fn config(pairs: &[(&str, &str)]) -> HubConfig {
        let mut vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.insert(
            "SVCHUB_DATABASE_URL".into(),
            "postgres://hub:pw@localhost/hub".into(),
        );
        HubConfig::from_vars(vars).unwrap()
    }

    #[tokio::test]
    async fn test_descriptors_follow_settings() {
        let config = config(&[
            ("SVCHUB_PHPBB3_DATABASE_URL", "mysql://f:pw@localhost/forum"),
            ("SVCHUB_PHPBB3_DEPROVISION", "revoke"),
            ("SVCHUB_PHPBB3_PERMISSION", "forums.access"),
            ("SVCHUB_DISCORD_GUILD_ID", "1234"),
            ("SVCHUB_DISCORD_BOT_TOKEN", "token"),
        ]);

        let plugin = ConfiguredServices::new(&config.services);
        let registry = ServiceRegistry::from_plugins(&[&plugin]).unwrap();

        let ids: Vec<_> = registry.all().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["phpbb3", "discord"]);

        let forum = registry.get("phpbb3").unwrap();
        assert_eq!(forum.required_permission, "forums.access");
        assert_eq!(forum.deprovision, DeprovisionAction::Revoke);
        assert_eq!(forum.title, "Forums");

        let discord = registry.get("discord").unwrap();
        assert_eq!(discord.required_permission, "discord.access_discord");
    }
}
