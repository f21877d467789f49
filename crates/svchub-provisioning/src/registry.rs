//! Service registry.
//!
//! Services are registered once during startup through a
//! [`ServiceRegistryBuilder`], usually by [`ServicePlugin`]s, then frozen
//! into an immutable [`ServiceRegistry`]. Registration order is listing
//! order. Duplicate ids abort startup.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use svchub_connector::traits::ServiceConnector;
use svchub_connector::types::DeprovisionAction;

use crate::directory::DirectoryUser;
use crate::error::{SyncError, SyncResult};
use crate::naming::NameFormatter;

/// Static metadata for one external service.
pub struct ServiceDescriptor {
    pub id: String,
    pub title: String,
    pub url: Option<String>,

    /// Permission a user must hold to keep an account on this service.
    pub required_permission: String,

    pub name_formatter: NameFormatter,

    /// What deactivation does to the external account.
    pub deprovision: DeprovisionAction,

    /// Directory groups this service sees. `None` exposes every group.
    pub exposed_groups: Option<BTreeSet<String>>,

    pub connector: Arc<dyn ServiceConnector>,
}

impl ServiceDescriptor {
    /// Describe a service with the default permission `<id>.access_<id>`.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        connector: Arc<dyn ServiceConnector>,
    ) -> Self {
        let id = id.into();
        Self {
            required_permission: format!("{id}.access_{id}"),
            id,
            title: title.into(),
            url: None,
            name_formatter: NameFormatter::default(),
            deprovision: DeprovisionAction::default(),
            exposed_groups: None,
            connector,
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permission = permission.into();
        self
    }

    #[must_use]
    pub fn with_name_formatter(mut self, formatter: NameFormatter) -> Self {
        self.name_formatter = formatter;
        self
    }

    #[must_use]
    pub fn with_deprovision(mut self, action: DeprovisionAction) -> Self {
        self.deprovision = action;
        self
    }

    #[must_use]
    pub fn with_exposed_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exposed_groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    /// The external group set `user` should hold on this service.
    #[must_use]
    pub fn desired_groups(&self, user: &DirectoryUser) -> BTreeSet<String> {
        let groups = user.group_names();
        match &self.exposed_groups {
            None => groups,
            Some(exposed) => groups.intersection(exposed).cloned().collect(),
        }
    }

    /// The external account name for `user`.
    pub fn account_name(&self, user: &DirectoryUser) -> SyncResult<String> {
        self.name_formatter
            .format(user, &self.connector.naming_policy())
    }

    fn validate(&self) -> SyncResult<()> {
        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SyncError::configuration(format!(
                "invalid service id '{}'",
                self.id
            )));
        }
        if self.required_permission.is_empty() {
            return Err(SyncError::configuration(format!(
                "service '{}' has no required permission",
                self.id
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("url", &self.url)
            .field("required_permission", &self.required_permission)
            .field("name_formatter", &self.name_formatter)
            .field("deprovision", &self.deprovision)
            .field("exposed_groups", &self.exposed_groups)
            .field("connector", &self.connector.display_name())
            .finish()
    }
}

/// Something that contributes services at startup.
pub trait ServicePlugin {
    fn register(&self, registry: &mut ServiceRegistryBuilder) -> SyncResult<()>;
}

/// Collects descriptors before the registry is frozen.
#[derive(Debug, Default)]
pub struct ServiceRegistryBuilder {
    services: Vec<ServiceDescriptor>,
}

impl ServiceRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service. Duplicate ids are rejected.
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> SyncResult<&mut Self> {
        descriptor.validate()?;
        if self.services.iter().any(|s| s.id == descriptor.id) {
            return Err(SyncError::configuration(format!(
                "service '{}' registered twice",
                descriptor.id
            )));
        }
        debug!(service_id = %descriptor.id, "Registered service");
        self.services.push(descriptor);
        Ok(self)
    }

    /// Let a plugin register its services.
    pub fn plugin(&mut self, plugin: &dyn ServicePlugin) -> SyncResult<&mut Self> {
        plugin.register(self)?;
        Ok(self)
    }

    /// Freeze the registry.
    pub fn build(self) -> ServiceRegistry {
        let services: Vec<Arc<ServiceDescriptor>> =
            self.services.into_iter().map(Arc::new).collect();
        let index = services
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        info!(services = services.len(), "Service registry ready");
        ServiceRegistry { services, index }
    }
}

/// Immutable, ordered set of registered services.
#[derive(Debug)]
pub struct ServiceRegistry {
    services: Vec<Arc<ServiceDescriptor>>,
    index: HashMap<String, usize>,
}

impl ServiceRegistry {
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::new()
    }

    /// Build a registry from plugins, in order.
    pub fn from_plugins(plugins: &[&dyn ServicePlugin]) -> SyncResult<Self> {
        let mut builder = ServiceRegistryBuilder::new();
        for plugin in plugins {
            builder.plugin(*plugin)?;
        }
        Ok(builder.build())
    }

    pub fn get(&self, service_id: &str) -> SyncResult<&Arc<ServiceDescriptor>> {
        self.index
            .get(service_id)
            .map(|&i| &self.services[i])
            .ok_or_else(|| SyncError::not_found("service", service_id))
    }

    /// Services in registration order.
    pub fn all(&self) -> &[Arc<ServiceDescriptor>] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<ServiceRegistry>> = OnceLock::new();

/// Install the process-wide registry. Fails if one is already installed.
pub fn install(registry: ServiceRegistry) -> SyncResult<Arc<ServiceRegistry>> {
    let registry = Arc::new(registry);
    GLOBAL_REGISTRY
        .set(Arc::clone(&registry))
        .map_err(|_| SyncError::configuration("service registry already installed"))?;
    Ok(registry)
}

/// The process-wide registry, once installed.
pub fn global() -> Option<Arc<ServiceRegistry>> {
    GLOBAL_REGISTRY.get().cloned()
}
