//! Deferred sync tasks.
//!
//! Tasks are delivered at least once, so each carries a dedup key and every
//! operation is safe to repeat: activation tolerates "already active",
//! deactivation tolerates "not found".

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use svchub_connector::resilience::{RetryConfig, RetryExecutor};

use crate::directory::DirectorySource;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::SyncOrchestrator;

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOperation {
    Activate,
    Deactivate,
    SyncGroups,
    SyncNickname,
}

impl TaskOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOperation::Activate => "activate",
            TaskOperation::Deactivate => "deactivate",
            TaskOperation::SyncGroups => "sync_groups",
            TaskOperation::SyncNickname => "sync_nickname",
        }
    }
}

impl fmt::Display for TaskOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTask {
    pub operation: TaskOperation,
    pub user_id: Uuid,
    pub service_id: String,
}

impl SyncTask {
    pub fn new(operation: TaskOperation, user_id: Uuid, service_id: impl Into<String>) -> Self {
        Self {
            operation,
            user_id,
            service_id: service_id.into(),
        }
    }

    /// Stable key identifying duplicate deliveries.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.operation, self.user_id, self.service_id)
    }
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The operation ran to completion.
    Completed { attempts: u32 },
    /// The desired state already held.
    AlreadyDone,
    /// The same task is already running.
    Duplicate,
}

/// Executes tasks with backoff on retryable errors.
pub struct TaskRunner {
    orchestrator: Arc<SyncOrchestrator>,
    directory: Arc<dyn DirectorySource>,
    retry: RetryExecutor,
    in_flight: Mutex<HashSet<String>>,
}

impl TaskRunner {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, directory: Arc<dyn DirectorySource>) -> Self {
        Self::with_retry(
            orchestrator,
            directory,
            RetryConfig {
                max_retries: 5,
                ..RetryConfig::default()
            },
        )
    }

    pub fn with_retry(
        orchestrator: Arc<SyncOrchestrator>,
        directory: Arc<dyn DirectorySource>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            orchestrator,
            directory,
            retry: RetryExecutor::new(retry),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run a task, retrying retryable failures up to the configured limit.
    #[instrument(skip(self, task), fields(task = %task.key()))]
    pub async fn run(&self, task: &SyncTask) -> SyncResult<TaskOutcome> {
        let key = task.key();
        if !self.in_flight.lock().await.insert(key.clone()) {
            debug!("Task already running, dropping duplicate");
            return Ok(TaskOutcome::Duplicate);
        }

        let result = self.run_with_retry(task).await;
        self.in_flight.lock().await.remove(&key);
        result
    }

    async fn run_with_retry(&self, task: &SyncTask) -> SyncResult<TaskOutcome> {
        match self
            .retry
            .run(SyncError::is_retryable, || self.execute(task))
            .await?
        {
            (true, attempts) => {
                info!(attempts, "Task completed");
                Ok(TaskOutcome::Completed { attempts })
            }
            (false, _) => Ok(TaskOutcome::AlreadyDone),
        }
    }

    /// Returns false when there was nothing to do.
    async fn execute(&self, task: &SyncTask) -> SyncResult<bool> {
        let user = self
            .directory
            .get_user(task.user_id)
            .await?
            .ok_or_else(|| SyncError::not_found("directory user", task.user_id.to_string()))?;

        let service_id = task.service_id.as_str();
        match task.operation {
            TaskOperation::Activate => match self.orchestrator.activate(&user, service_id).await {
                Ok(_) => Ok(true),
                Err(SyncError::AlreadyActive { .. }) => Ok(false),
                Err(e) => Err(e),
            },
            TaskOperation::Deactivate => {
                match self.orchestrator.deactivate(&user, service_id).await {
                    Ok(()) => Ok(true),
                    Err(SyncError::NotFound { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            TaskOperation::SyncGroups => {
                match self.orchestrator.sync_groups(&user, service_id).await {
                    Ok(diff) => Ok(!diff.is_empty()),
                    Err(SyncError::NotFound { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            TaskOperation::SyncNickname => {
                self.orchestrator.sync_nickname(&user, service_id).await?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_key_is_stable() {
        let user_id = Uuid::nil();
        let a = SyncTask::new(TaskOperation::SyncGroups, user_id, "phpbb3");
        let b = SyncTask::new(TaskOperation::SyncGroups, user_id, "phpbb3");
        assert_eq!(a.key(), b.key());
        assert_eq!(
            a.key(),
            "sync_groups:00000000-0000-0000-0000-000000000000:phpbb3"
        );

        let c = SyncTask::new(TaskOperation::Deactivate, user_id, "phpbb3");
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_task_serde() {
        let task = SyncTask::new(TaskOperation::Activate, Uuid::nil(), "mumble");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["operation"], "activate");
    }
}
