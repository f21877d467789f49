//! Directory event handling.
//!
//! The directory raises events when memberships or permissions change;
//! the handler turns them into orchestrator calls.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::directory::{DirectorySource, DirectoryUser};
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{BatchReport, SyncOrchestrator};

/// A change in the central directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectoryEvent {
    GroupMembershipChanged {
        user_id: Uuid,
        #[serde(default)]
        added: Vec<String>,
        #[serde(default)]
        removed: Vec<String>,
    },
    PermissionRevoked {
        user_id: Uuid,
        permission: String,
    },
    MainCharacterChanged {
        user_id: Uuid,
    },
}

impl DirectoryEvent {
    pub fn user_id(&self) -> Uuid {
        match self {
            DirectoryEvent::GroupMembershipChanged { user_id, .. }
            | DirectoryEvent::PermissionRevoked { user_id, .. }
            | DirectoryEvent::MainCharacterChanged { user_id } => *user_id,
        }
    }
}

/// Applies directory events through the orchestrator.
pub struct DirectoryEventHandler {
    orchestrator: Arc<SyncOrchestrator>,
    directory: Arc<dyn DirectorySource>,
}

impl DirectoryEventHandler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, directory: Arc<dyn DirectorySource>) -> Self {
        Self {
            orchestrator,
            directory,
        }
    }

    /// Resolve the event's user and dispatch.
    #[instrument(skip(self, event), fields(user_id = %event.user_id()))]
    pub async fn handle(&self, event: &DirectoryEvent) -> SyncResult<BatchReport> {
        let user_id = event.user_id();
        let user = self
            .directory
            .get_user(user_id)
            .await?
            .ok_or_else(|| SyncError::not_found("directory user", user_id.to_string()))?;

        match event {
            DirectoryEvent::GroupMembershipChanged { added, removed, .. } => {
                self.on_group_membership_changed(&user, added, removed)
                    .await
            }
            DirectoryEvent::PermissionRevoked { permission, .. } => {
                self.on_permission_revoked(&user, permission).await
            }
            DirectoryEvent::MainCharacterChanged { .. } => self.on_main_character_changed(&user).await,
        }
    }

    /// Re-sync every service account the user holds.
    pub async fn on_group_membership_changed(
        &self,
        user: &DirectoryUser,
        added: &[String],
        removed: &[String],
    ) -> SyncResult<BatchReport> {
        info!(?added, ?removed, "Group membership changed");
        self.orchestrator.reconcile_groups_for_user(user).await
    }

    /// Deactivate services gated by the revoked permission.
    pub async fn on_permission_revoked(
        &self,
        user: &DirectoryUser,
        permission: &str,
    ) -> SyncResult<BatchReport> {
        let mut report = BatchReport::default();
        let affected = self
            .orchestrator
            .registry()
            .all()
            .iter()
            .filter(|s| s.required_permission == permission);

        for service in affected {
            if user.has_permission(permission) {
                debug!(service_id = %service.id, "Permission still held through another grant");
                report.skipped.push(service.id.clone());
                continue;
            }
            let result = match self.orchestrator.deactivate(user, &service.id).await {
                Err(SyncError::NotFound { .. }) => {
                    report.skipped.push(service.id.clone());
                    continue;
                }
                other => other,
            };
            report.record(service.id.clone(), result);
        }
        Ok(report)
    }

    /// Push the new main character's name to services with nicknames.
    pub async fn on_main_character_changed(&self, user: &DirectoryUser) -> SyncResult<BatchReport> {
        let mut report = BatchReport::default();
        let services: Vec<String> = self
            .orchestrator
            .registry()
            .all()
            .iter()
            .map(|s| s.id.clone())
            .collect();

        for service_id in services {
            match self.orchestrator.sync_nickname(user, &service_id).await {
                Err(SyncError::NotFound { .. }) => report.skipped.push(service_id),
                result => report.record(service_id, result),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let user_id = Uuid::new_v4();
        let event = DirectoryEvent::PermissionRevoked {
            user_id,
            permission: "mumble.access_mumble".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "permission_revoked");

        let parsed: DirectoryEvent = serde_json::from_str(&format!(
            r#"{{"type":"group_membership_changed","user_id":"{user_id}","removed":["Member"]}}"#
        ))
        .unwrap();
        assert_eq!(parsed.user_id(), user_id);
    }
}
