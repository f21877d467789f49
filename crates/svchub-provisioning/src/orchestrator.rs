//! Sync orchestrator
//!
//! Turns directory intent into connector calls and keeps
//! [`AccountRecord`]s in step with what the external stores hold.
//!
//! Every connector call is bounded by [`OrchestratorConfig::call_timeout`].
//! A call that times out surfaces as a retryable
//! [`SyncError::ExternalUnavailable`] with `outcome_unknown` set; nothing is
//! rolled back, since the external mutation may have happened. An
//! activation in that state keeps its record as `in_doubt`, and the next
//! activation for the pair resumes it, adopting the external account if the
//! lost call created it. The orchestrator never retries on its own; that is
//! the task runner's job.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use svchub_connector::error::{ConnectorError, ConnectorResult};
use svchub_connector::groups::GroupDiff;
use svchub_connector::resilience::with_timeout;
use svchub_connector::types::{AccountRef, DeprovisionAction, ProvisionRequest};

use crate::account::{AccountRecord, AccountStatus, AccountStore};
use crate::directory::{DirectorySource, DirectoryUser};
use crate::error::{SyncError, SyncResult};
use crate::registry::{ServiceDescriptor, ServiceRegistry};

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on a single connector call, in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_call_timeout() -> u64 {
    60
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl OrchestratorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Credentials handed to the caller once, for one-time display.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,

    /// `None` for services without passwords (Discord).
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .finish()
    }
}

/// Identity the user proved to the external service out of band, e.g.
/// through a Discord OAuth exchange.
#[derive(Debug, Clone, Default)]
pub struct LinkedIdentity {
    pub external_id: Option<String>,
    pub access_token: Option<String>,
}

/// One item of a batch that failed.
#[derive(Debug)]
pub struct BatchFailure {
    pub key: String,
    pub error: SyncError,
}

/// Outcome of an operation applied to many accounts.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

impl BatchReport {
    /// True when nothing failed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// True when at least one failure is worth retrying.
    pub fn has_retryable_failures(&self) -> bool {
        self.failed.iter().any(|f| f.error.is_retryable())
    }

    pub(crate) fn record(&mut self, key: String, result: SyncResult<()>) {
        match result {
            Ok(()) => self.succeeded.push(key),
            Err(error) => {
                warn!(key = %key, error = %error, "Batch item failed");
                self.failed.push(BatchFailure { key, error });
            }
        }
    }
}

/// Account details a create or adopt produced.
struct IssuedAccount {
    username: String,
    password: Option<String>,
    external_id: Option<String>,
    adopted: bool,
}

/// Reject records whose activation has not completed.
fn settled(record: AccountRecord) -> SyncResult<AccountRecord> {
    if record.is_active() {
        Ok(record)
    } else {
        Err(SyncError::ActivationPending {
            service_id: record.service_id,
        })
    }
}

/// The reconciliation engine.
pub struct SyncOrchestrator {
    registry: Arc<ServiceRegistry>,
    store: Arc<dyn AccountStore>,
    config: OrchestratorConfig,
}

impl SyncOrchestrator {
    pub fn new(registry: Arc<ServiceRegistry>, store: Arc<dyn AccountStore>) -> Self {
        Self::with_config(registry, store, OrchestratorConfig::default())
    }

    pub fn with_config(
        registry: Arc<ServiceRegistry>,
        store: Arc<dyn AccountStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Run one connector call under the timeout and classify its failure.
    async fn call<T, F>(&self, service: &ServiceDescriptor, operation: F) -> SyncResult<T>
    where
        F: Future<Output = ConnectorResult<T>>,
    {
        with_timeout(self.config.call_timeout(), operation)
            .await
            .map_err(|e| SyncError::from_connector(&service.id, e))
    }

    /// The user's active record on a service.
    ///
    /// A record whose activation has not completed is reported as
    /// [`SyncError::ActivationPending`].
    async fn record_for(
        &self,
        user: &DirectoryUser,
        service: &ServiceDescriptor,
    ) -> SyncResult<AccountRecord> {
        let record = self
            .store
            .get(user.id, &service.id)
            .await?
            .ok_or_else(|| {
                SyncError::not_found("account record", format!("{}/{}", user.username, service.id))
            })?;
        settled(record)
    }

    /// Create the user's account on a service.
    pub async fn activate(&self, user: &DirectoryUser, service_id: &str) -> SyncResult<Credentials> {
        self.activate_with(user, service_id, LinkedIdentity::default())
            .await
    }

    /// Create the user's account, passing an out-of-band identity to the
    /// connector.
    ///
    /// A second activation for the same (user, service) returns
    /// [`SyncError::AlreadyActive`], also when it races a concurrent one.
    /// An activation left `in_doubt` by a timeout is resumed instead.
    #[instrument(skip(self, user, linked), fields(user = %user.username))]
    pub async fn activate_with(
        &self,
        user: &DirectoryUser,
        service_id: &str,
        linked: LinkedIdentity,
    ) -> SyncResult<Credentials> {
        let service = self.registry.get(service_id)?;
        if !user.has_permission(&service.required_permission) {
            return Err(SyncError::PermissionDenied {
                service_id: service.id.clone(),
                permission: service.required_permission.clone(),
            });
        }

        let (reservation, resuming) = match self.store.get(user.id, &service.id).await? {
            Some(record) if record.status == AccountStatus::InDoubt => {
                let Some(record) = self.store.resume(record.id).await? else {
                    debug!("In-doubt activation resumed elsewhere");
                    return Err(SyncError::AlreadyActive {
                        service_id: service.id.clone(),
                    });
                };
                info!(username = %record.username, "Resuming in-doubt activation");
                (record, true)
            }
            Some(_) => {
                debug!("Account record exists, not reissuing credentials");
                return Err(SyncError::AlreadyActive {
                    service_id: service.id.clone(),
                });
            }
            None => {
                let username = service.account_name(user)?;
                let Some(record) = self.store.reserve(user.id, &service.id, &username).await?
                else {
                    debug!("Lost activation race");
                    return Err(SyncError::AlreadyActive {
                        service_id: service.id.clone(),
                    });
                };
                (record, false)
            }
        };

        let character = user.main_character.as_ref();
        let request = ProvisionRequest {
            username: reservation.username.clone(),
            email: user.email.clone(),
            groups: service.desired_groups(user),
            character_id: character.map(|c| c.id),
            display_name: character.map(|c| c.name.clone()),
            external_id: linked.external_id,
            access_token: linked.access_token,
        };

        let account = match self.create_or_adopt(service, &request, resuming).await {
            Ok(account) => account,
            Err(e) if resuming || e.is_outcome_unknown() => {
                warn!(error = %e, "Activation outcome unknown, keeping reservation");
                self.store.mark_in_doubt(reservation.id).await?;
                return Err(e);
            }
            Err(e) => {
                if let Err(release_err) = self.store.release(reservation.id).await {
                    warn!(error = %release_err, "Failed to release account reservation");
                }
                return Err(e);
            }
        };

        self.store
            .confirm(
                reservation.id,
                &account.username,
                account.external_id.as_deref(),
            )
            .await?;

        info!(
            service_id = %service.id,
            username = %account.username,
            external_id = ?account.external_id,
            adopted = account.adopted,
            "Activated service account"
        );

        Ok(Credentials {
            username: account.username,
            password: account.password,
        })
    }

    /// Create the external account. When resuming an in-doubt activation,
    /// an account that already exists under the reserved name is the one
    /// the lost call created, and is taken over with fresh credentials.
    async fn create_or_adopt(
        &self,
        service: &ServiceDescriptor,
        request: &ProvisionRequest,
        resuming: bool,
    ) -> SyncResult<IssuedAccount> {
        let created = with_timeout(
            self.config.call_timeout(),
            service.connector.create_user(request),
        )
        .await;

        match created {
            Ok(account) => Ok(IssuedAccount {
                username: account.username,
                password: account.password,
                external_id: Some(account.external_id),
                adopted: account.adopted,
            }),
            Err(ConnectorError::ObjectAlreadyExists { identifier }) if resuming => {
                let exists = self
                    .call(service, service.connector.user_exists(&request.username))
                    .await?;
                if !exists {
                    return Err(SyncError::from_connector(
                        &service.id,
                        ConnectorError::ObjectAlreadyExists { identifier },
                    ));
                }

                let account = AccountRef::new(request.username.clone(), None);
                let password = self
                    .call(service, service.connector.reset_password(&account))
                    .await?;
                self.call(service, service.connector.sync_groups(&account, &request.groups))
                    .await?;

                info!(username = %request.username, "Adopted account left by timed-out activation");
                Ok(IssuedAccount {
                    username: request.username.clone(),
                    password: Some(password),
                    external_id: None,
                    adopted: true,
                })
            }
            Err(e) => Err(SyncError::from_connector(&service.id, e)),
        }
    }

    /// Remove or revoke the external account, then the record.
    async fn teardown(&self, service: &ServiceDescriptor, record: &AccountRecord) -> SyncResult<()> {
        let account = record.account_ref();
        let result = match service.deprovision {
            DeprovisionAction::Delete => {
                self.call(service, service.connector.delete_user(&account))
                    .await
            }
            DeprovisionAction::Revoke => {
                self.call(service, service.connector.disable_user(&account))
                    .await
            }
        };

        match result {
            Ok(true) => {}
            Ok(false) | Err(SyncError::NotFound { .. }) => {
                warn!(
                    service_id = %service.id,
                    username = %record.username,
                    "External account already gone"
                );
            }
            Err(e) => return Err(e),
        }

        self.store.delete(record.id).await?;
        info!(
            service_id = %service.id,
            username = %record.username,
            action = ?service.deprovision,
            "Deactivated service account"
        );
        Ok(())
    }

    /// Tear down the user's account on a service.
    ///
    /// On failure the record is kept so the operation can be retried.
    #[instrument(skip(self, user), fields(user = %user.username))]
    pub async fn deactivate(&self, user: &DirectoryUser, service_id: &str) -> SyncResult<()> {
        let service = self.registry.get(service_id)?;
        let record = self.record_for(user, service).await?;
        self.teardown(service, &record).await
    }

    /// Issue a fresh random password.
    #[instrument(skip(self, user), fields(user = %user.username))]
    pub async fn reset_password(
        &self,
        user: &DirectoryUser,
        service_id: &str,
    ) -> SyncResult<Credentials> {
        let service = self.registry.get(service_id)?;
        let record = self.record_for(user, service).await?;
        let password = self
            .call(service, service.connector.reset_password(&record.account_ref()))
            .await?;

        info!(service_id = %service.id, "Reset service password");
        Ok(Credentials {
            username: record.username,
            password: Some(password),
        })
    }

    /// Store a password the user chose.
    #[instrument(skip(self, user, plaintext), fields(user = %user.username))]
    pub async fn set_password(
        &self,
        user: &DirectoryUser,
        service_id: &str,
        plaintext: &str,
    ) -> SyncResult<Credentials> {
        let service = self.registry.get(service_id)?;
        if plaintext.is_empty() {
            return Err(SyncError::Connector {
                service_id: service.id.clone(),
                source: ConnectorError::InvalidData {
                    message: "password must not be empty".to_string(),
                },
            });
        }
        let record = self.record_for(user, service).await?;
        let password = self
            .call(
                service,
                service.connector.set_password(&record.account_ref(), plaintext),
            )
            .await?;

        info!(service_id = %service.id, "Set service password");
        Ok(Credentials {
            username: record.username,
            password: Some(password),
        })
    }

    /// Bring one service's groups in line with the directory.
    #[instrument(skip(self, user), fields(user = %user.username))]
    pub async fn sync_groups(&self, user: &DirectoryUser, service_id: &str) -> SyncResult<GroupDiff> {
        let service = self.registry.get(service_id)?;
        let record = self.record_for(user, service).await?;
        self.sync_record_groups(service, &record, user).await
    }

    async fn sync_record_groups(
        &self,
        service: &ServiceDescriptor,
        record: &AccountRecord,
        user: &DirectoryUser,
    ) -> SyncResult<GroupDiff> {
        let desired = service.desired_groups(user);
        let diff = self
            .call(
                service,
                service.connector.sync_groups(&record.account_ref(), &desired),
            )
            .await?;

        if diff.is_empty() {
            debug!(service_id = %service.id, "Groups already in sync");
        } else {
            info!(
                service_id = %service.id,
                added = diff.to_add.len(),
                removed = diff.to_remove.len(),
                "Synced service groups"
            );
        }
        Ok(diff)
    }

    /// Re-sync groups on every service the user holds an account on.
    ///
    /// Failures on one service do not stop the others. Unfinished
    /// activations are skipped.
    #[instrument(skip(self, user), fields(user = %user.username))]
    pub async fn reconcile_groups_for_user(&self, user: &DirectoryUser) -> SyncResult<BatchReport> {
        let mut report = BatchReport::default();
        for record in self.store.list_for_user(user.id).await? {
            if !record.is_active() {
                report.skipped.push(record.service_id);
                continue;
            }
            let service = match self.registry.get(&record.service_id) {
                Ok(service) => service,
                Err(_) => {
                    warn!(service_id = %record.service_id, "Record for unregistered service");
                    report.skipped.push(record.service_id);
                    continue;
                }
            };
            let result = self
                .sync_record_groups(service, &record, user)
                .await
                .map(|_| ());
            report.record(record.service_id.clone(), result);
        }
        Ok(report)
    }

    /// Update the nickname shown on a service, where supported.
    #[instrument(skip(self, user), fields(user = %user.username))]
    pub async fn sync_nickname(&self, user: &DirectoryUser, service_id: &str) -> SyncResult<()> {
        let service = self.registry.get(service_id)?;
        let record = self.record_for(user, service).await?;
        let Some(character) = user.main_character.as_ref() else {
            debug!("No main character, nickname left alone");
            return Ok(());
        };

        match with_timeout(
            self.config.call_timeout(),
            service
                .connector
                .sync_nickname(&record.account_ref(), &character.name),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(ConnectorError::Unsupported { .. }) => {
                debug!(service_id = %service.id, "Service has no nicknames");
                Ok(())
            }
            Err(e) => Err(SyncError::from_connector(&service.id, e)),
        }
    }

    /// Re-sync groups for every account on one service.
    #[instrument(skip(self, directory))]
    pub async fn reconcile_service(
        &self,
        service_id: &str,
        directory: &dyn DirectorySource,
    ) -> SyncResult<BatchReport> {
        let service = self.registry.get(service_id)?;
        let mut report = BatchReport::default();

        for record in self.store.list_for_service(&service.id).await? {
            if !record.is_active() {
                debug!(username = %record.username, status = %record.status.as_str(), "Activation unfinished, skipping");
                report.skipped.push(record.username);
                continue;
            }
            let Some(user) = directory.get_user(record.user_id).await? else {
                warn!(username = %record.username, "Account owner missing from directory");
                report.skipped.push(record.username);
                continue;
            };
            let result = self
                .sync_record_groups(service, &record, &user)
                .await
                .map(|_| ());
            report.record(record.username.clone(), result);
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Reconciled service groups"
        );
        Ok(report)
    }

    /// Deactivate every account the user no longer has permission for.
    #[instrument(skip(self, user), fields(user = %user.username))]
    pub async fn validate_user(&self, user: &DirectoryUser) -> SyncResult<BatchReport> {
        let mut report = BatchReport::default();
        for record in self.store.list_for_user(user.id).await? {
            let Ok(service) = self.registry.get(&record.service_id) else {
                report.skipped.push(record.service_id);
                continue;
            };
            if !record.is_active() {
                report.skipped.push(record.service_id);
                continue;
            }
            if user.has_permission(&service.required_permission) {
                continue;
            }
            info!(service_id = %service.id, "Permission lost, deactivating");
            let result = self.teardown(service, &record).await;
            report.record(service.id.clone(), result);
        }
        Ok(report)
    }

    /// Tear down every account on a service, continuing past failures.
    ///
    /// Accounts whose activation is still unfinished are reported as
    /// pending failures, so the run can be repeated once they settle.
    #[instrument(skip(self))]
    pub async fn disable_all(&self, service_id: &str) -> SyncResult<BatchReport> {
        let service = self.registry.get(service_id)?;
        let mut report = BatchReport::default();

        for record in self.store.list_for_service(&service.id).await? {
            let username = record.username.clone();
            let result = match settled(record) {
                Ok(record) => self.teardown(service, &record).await,
                Err(e) => Err(e),
            };
            report.record(username, result);
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Disabled service"
        );
        Ok(report)
    }
}
