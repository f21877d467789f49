//! Orchestrator tests against a mock connector and the in-memory store.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use svchub_connector::credentials::CredentialGenerator;
use svchub_connector::error::{ConnectorError, ConnectorResult};
use svchub_connector::groups::GroupDiff;
use svchub_connector::naming::NamingPolicy;
use svchub_connector::resilience::RetryConfig;
use svchub_connector::traits::ServiceConnector;
use svchub_connector::types::{
    AccountRef, DeprovisionAction, ProvisionRequest, ProvisionedAccount, ServiceKind,
};

use svchub_provisioning::{
    AccountStatus, AccountStore, Character, DirectoryEvent, DirectoryEventHandler, DirectoryUser, Group,
    InMemoryAccountStore, OrchestratorConfig, ServiceDescriptor, ServiceRegistry,
    StaticDirectory, SyncError, SyncOrchestrator, SyncTask, TaskOperation, TaskOutcome,
    TaskRunner,
};

// =============================================================================
// Mock connector
// =============================================================================

#[derive(Debug, Default)]
struct Board {
    next_id: u64,
    users: BTreeMap<String, (u64, BTreeSet<String>)>,
    revoked: HashSet<String>,
    /// group name -> members; groups exist only while listed here.
    groups: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Default)]
struct MockConnector {
    board: Mutex<Board>,
    creates: AtomicUsize,
    deletes: AtomicUsize,
    disables: AtomicUsize,
    group_mutations: AtomicUsize,
    create_delay: Option<Duration>,
    fail_deletes_for: Mutex<HashSet<String>>,
}

impl MockConnector {
    fn slow(delay: Duration) -> Self {
        Self {
            create_delay: Some(delay),
            ..Self::default()
        }
    }

    fn has_user(&self, username: &str) -> bool {
        self.board.lock().unwrap().users.contains_key(username)
    }

    fn group_rows(&self) -> usize {
        self.board.lock().unwrap().groups.len()
    }

    fn fail_delete(&self, username: &str) {
        self.fail_deletes_for
            .lock()
            .unwrap()
            .insert(username.to_string());
    }
}

#[async_trait]
impl ServiceConnector for MockConnector {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Phpbb3
    }

    fn display_name(&self) -> &str {
        "mock board"
    }

    fn naming_policy(&self) -> NamingPolicy {
        NamingPolicy::BOARD
    }

    async fn test_connection(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn user_exists(&self, username: &str) -> ConnectorResult<bool> {
        Ok(self.has_user(username))
    }

    async fn create_user(&self, request: &ProvisionRequest) -> ConnectorResult<ProvisionedAccount> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        self.creates.fetch_add(1, Ordering::SeqCst);

        let (id, adopted) = {
            let mut board = self.board.lock().unwrap();
            board.revoked.remove(&request.username);
            match board.users.get(&request.username) {
                Some((id, _)) => (*id, true),
                None => {
                    board.next_id += 1;
                    let id = board.next_id;
                    board
                        .users
                        .insert(request.username.clone(), (id, BTreeSet::new()));
                    (id, false)
                }
            }
        };
        self.sync_groups(&AccountRef::new(request.username.clone(), None), &request.groups)
            .await?;

        Ok(ProvisionedAccount {
            username: request.username.clone(),
            password: Some(CredentialGenerator::generate_password(16)),
            external_id: id.to_string(),
            adopted,
        })
    }

    async fn delete_user(&self, account: &AccountRef) -> ConnectorResult<bool> {
        if self
            .fail_deletes_for
            .lock()
            .unwrap()
            .contains(&account.username)
        {
            return Err(ConnectorError::connection_failed("board offline"));
        }
        if !self.has_user(&account.username) {
            return Ok(false);
        }
        self.sync_groups(account, &BTreeSet::new()).await?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .board
            .lock()
            .unwrap()
            .users
            .remove(&account.username)
            .is_some())
    }

    async fn disable_user(&self, account: &AccountRef) -> ConnectorResult<bool> {
        if !self.has_user(&account.username) {
            return Ok(false);
        }
        self.sync_groups(account, &BTreeSet::new()).await?;
        self.disables.fetch_add(1, Ordering::SeqCst);
        self.board
            .lock()
            .unwrap()
            .revoked
            .insert(account.username.clone());
        Ok(true)
    }

    async fn reset_password(&self, account: &AccountRef) -> ConnectorResult<String> {
        if !self.has_user(&account.username) {
            return Err(ConnectorError::not_found(account.username.clone()));
        }
        Ok(CredentialGenerator::generate_password(16))
    }

    async fn set_password(&self, account: &AccountRef, plaintext: &str) -> ConnectorResult<String> {
        if !self.has_user(&account.username) {
            return Err(ConnectorError::not_found(account.username.clone()));
        }
        Ok(plaintext.to_string())
    }

    async fn sync_groups(
        &self,
        account: &AccountRef,
        desired: &BTreeSet<String>,
    ) -> ConnectorResult<GroupDiff> {
        let mut board = self.board.lock().unwrap();
        let current = board
            .users
            .get(&account.username)
            .map(|(_, groups)| groups.clone())
            .ok_or_else(|| ConnectorError::not_found(account.username.clone()))?;

        let diff = GroupDiff::between(&current, desired);
        for group in &diff.to_add {
            board
                .groups
                .entry(group.clone())
                .or_default()
                .insert(account.username.clone());
        }
        for group in &diff.to_remove {
            if let Some(members) = board.groups.get_mut(group) {
                members.remove(&account.username);
                if members.is_empty() {
                    board.groups.remove(group);
                }
            }
        }
        if let Some((_, groups)) = board.users.get_mut(&account.username) {
            *groups = desired.clone();
        }
        self.group_mutations
            .fetch_add(diff.change_count(), Ordering::SeqCst);
        Ok(diff)
    }
}

/// Voice server whose first create commits the row and then stops
/// answering. Creating a name that exists fails, as on Mumble.
#[derive(Default)]
struct StallingVoice {
    users: Mutex<BTreeMap<String, BTreeSet<String>>>,
    stalled: AtomicBool,
    creates: AtomicUsize,
    resets: AtomicUsize,
}

impl StallingVoice {
    fn rows(&self) -> usize {
        self.users.lock().unwrap().len()
    }
}

#[async_trait]
impl ServiceConnector for StallingVoice {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Mumble
    }

    fn display_name(&self) -> &str {
        "stalling voice"
    }

    fn naming_policy(&self) -> NamingPolicy {
        NamingPolicy::BOARD
    }

    async fn test_connection(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn user_exists(&self, username: &str) -> ConnectorResult<bool> {
        Ok(self.users.lock().unwrap().contains_key(username))
    }

    async fn create_user(&self, request: &ProvisionRequest) -> ConnectorResult<ProvisionedAccount> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        {
            let mut users = self.users.lock().unwrap();
            if users.contains_key(&request.username) {
                return Err(ConnectorError::ObjectAlreadyExists {
                    identifier: request.username.clone(),
                });
            }
            users.insert(request.username.clone(), request.groups.clone());
        }
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(ProvisionedAccount {
            username: request.username.clone(),
            password: Some(CredentialGenerator::generate_password(16)),
            external_id: self.rows().to_string(),
            adopted: false,
        })
    }

    async fn delete_user(&self, account: &AccountRef) -> ConnectorResult<bool> {
        Ok(self.users.lock().unwrap().remove(&account.username).is_some())
    }

    async fn reset_password(&self, account: &AccountRef) -> ConnectorResult<String> {
        if !self.users.lock().unwrap().contains_key(&account.username) {
            return Err(ConnectorError::not_found(account.username.clone()));
        }
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(CredentialGenerator::generate_password(16))
    }

    async fn set_password(&self, _account: &AccountRef, plaintext: &str) -> ConnectorResult<String> {
        Ok(plaintext.to_string())
    }

    async fn sync_groups(
        &self,
        account: &AccountRef,
        desired: &BTreeSet<String>,
    ) -> ConnectorResult<GroupDiff> {
        let mut users = self.users.lock().unwrap();
        let current = users
            .get_mut(&account.username)
            .ok_or_else(|| ConnectorError::not_found(account.username.clone()))?;
        let diff = GroupDiff::between(&*current, desired);
        *current = desired.clone();
        Ok(diff)
    }
}

// =============================================================================
// Helpers
// =============================================================================

const BOARD: &str = "phpbb3";
const PERMISSION: &str = "phpbb3.access_phpbb3";

fn alice() -> DirectoryUser {
    DirectoryUser::new("alice", "a@example.com")
        .with_permission(PERMISSION)
        .with_group(Group::new("Member"))
        .with_main_character(Character {
            id: 90000001,
            name: "Alice Doe".into(),
            corporation_id: 98000001,
            corporation_name: "Test Corp".into(),
            corporation_ticker: "TEST".into(),
            alliance_id: None,
            alliance_name: None,
            alliance_ticker: None,
        })
}

fn named(username: &str, character: &str) -> DirectoryUser {
    let mut user = alice();
    user.username = username.to_string();
    user.id = uuid::Uuid::new_v4();
    if let Some(c) = user.main_character.as_mut() {
        c.name = character.to_string();
    }
    user
}

struct Harness {
    connector: Arc<MockConnector>,
    store: Arc<InMemoryAccountStore>,
    orchestrator: Arc<SyncOrchestrator>,
}

fn harness_with(connector: MockConnector, deprovision: DeprovisionAction) -> Harness {
    let connector = Arc::new(connector);
    let mut builder = ServiceRegistry::builder();
    builder
        .register(
            ServiceDescriptor::new(BOARD, "Forum", connector.clone())
                .with_deprovision(deprovision),
        )
        .unwrap();
    let store = Arc::new(InMemoryAccountStore::new());
    let orchestrator = Arc::new(SyncOrchestrator::new(
        Arc::new(builder.build()),
        store.clone(),
    ));
    Harness {
        connector,
        store,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(MockConnector::default(), DeprovisionAction::Delete)
}

// =============================================================================
// Activation
// =============================================================================

#[tokio::test]
async fn test_alice_lifecycle() {
    let h = harness();
    let user = alice();

    let credentials = h.orchestrator.activate(&user, BOARD).await.unwrap();
    assert_eq!(credentials.username, "alice_doe");
    assert_eq!(credentials.password.as_deref().map(str::len), Some(16));

    let record = h.store.get(user.id, BOARD).await.unwrap().unwrap();
    assert!(record.is_active());
    assert!(!record.external_id.unwrap_or_default().is_empty());
    assert!(h.connector.has_user("alice_doe"));

    h.orchestrator.deactivate(&user, BOARD).await.unwrap();
    assert!(h.store.get(user.id, BOARD).await.unwrap().is_none());
    assert!(!h.connector.has_user("alice_doe"));
    assert_eq!(h.connector.group_rows(), 0);
}

#[tokio::test]
async fn test_double_activate_is_already_active() {
    let h = harness();
    let user = alice();

    h.orchestrator.activate(&user, BOARD).await.unwrap();
    let err = h.orchestrator.activate(&user, BOARD).await.unwrap_err();

    assert!(matches!(err, SyncError::AlreadyActive { .. }));
    assert_eq!(h.store.len().await, 1);
    assert_eq!(h.connector.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_activate_creates_once() {
    let h = harness_with(
        MockConnector::slow(Duration::from_millis(20)),
        DeprovisionAction::Delete,
    );
    let user = alice();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            let user = user.clone();
            tokio::spawn(async move { orchestrator.activate(&user, BOARD).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(SyncError::AlreadyActive { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(h.store.len().await, 1);
    assert_eq!(h.connector.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_activate_requires_permission() {
    let h = harness();
    let mut user = alice();
    user.permissions.clear();

    let err = h.orchestrator.activate(&user, BOARD).await.unwrap_err();
    assert!(matches!(err, SyncError::PermissionDenied { .. }));
    assert!(h.store.is_empty().await);
    assert_eq!(h.connector.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_service() {
    let h = harness();
    let err = h.orchestrator.activate(&alice(), "teamspeak").await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound { .. }));
}

fn stalling_voice() -> (Arc<StallingVoice>, Arc<InMemoryAccountStore>, SyncOrchestrator) {
    let voice = Arc::new(StallingVoice::default());
    let mut builder = ServiceRegistry::builder();
    builder
        .register(
            ServiceDescriptor::new("mumble", "Mumble", voice.clone()).with_permission(PERMISSION),
        )
        .unwrap();
    let store = Arc::new(InMemoryAccountStore::new());
    let orchestrator = SyncOrchestrator::with_config(
        Arc::new(builder.build()),
        store.clone(),
        OrchestratorConfig {
            call_timeout_secs: 5,
        },
    );
    (voice, store, orchestrator)
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_activation_converges_on_retry() {
    let (voice, store, orchestrator) = stalling_voice();
    let user = alice();

    let err = orchestrator.activate(&user, "mumble").await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::ExternalUnavailable {
            outcome_unknown: true,
            ..
        }
    ));
    assert!(err.is_retryable());

    // The row was committed before the stall; the record must survive.
    assert_eq!(voice.rows(), 1);
    let record = store.get(user.id, "mumble").await.unwrap().unwrap();
    assert_eq!(record.status, AccountStatus::InDoubt);

    // Work against the unfinished record is refused until it settles.
    let err = orchestrator.sync_groups(&user, "mumble").await.unwrap_err();
    assert!(matches!(err, SyncError::ActivationPending { .. }));

    let credentials = orchestrator.activate(&user, "mumble").await.unwrap();
    assert_eq!(credentials.username, "alice_doe");
    assert_eq!(credentials.password.as_deref().map(str::len), Some(16));
    assert_eq!(voice.resets.load(Ordering::SeqCst), 1);
    assert_eq!(voice.creates.load(Ordering::SeqCst), 2);
    assert_eq!(voice.rows(), 1);

    let record = store.get(user.id, "mumble").await.unwrap().unwrap();
    assert!(record.is_active());
    assert_eq!(store.len().await, 1);

    let err = orchestrator.activate(&user, "mumble").await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadyActive { .. }));

    orchestrator.deactivate(&user, "mumble").await.unwrap();
    assert_eq!(voice.rows(), 0);
    assert!(store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_in_doubt_record_is_left_out_of_batches() {
    let (voice, store, orchestrator) = stalling_voice();
    let user = alice();
    orchestrator.activate(&user, "mumble").await.unwrap_err();

    let directory = StaticDirectory::new(vec![user.clone()]);
    let report = orchestrator
        .reconcile_service("mumble", &directory)
        .await
        .unwrap();
    assert_eq!(report.skipped, vec!["alice_doe".to_string()]);
    assert!(report.succeeded.is_empty());

    let report = orchestrator.disable_all("mumble").await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(report.has_retryable_failures());
    assert_eq!(voice.rows(), 1);
    assert!(store.get(user.id, "mumble").await.unwrap().is_some());
}

#[tokio::test]
async fn test_deactivate_during_activation_is_pending() {
    let h = harness_with(
        MockConnector::slow(Duration::from_millis(50)),
        DeprovisionAction::Delete,
    );
    let user = alice();

    let activation = {
        let orchestrator = h.orchestrator.clone();
        let user = user.clone();
        tokio::spawn(async move { orchestrator.activate(&user, BOARD).await })
    };
    while h.store.is_empty().await {
        tokio::task::yield_now().await;
    }

    let err = h.orchestrator.deactivate(&user, BOARD).await.unwrap_err();
    assert!(matches!(err, SyncError::ActivationPending { .. }));
    assert!(err.is_retryable());

    activation.await.unwrap().unwrap();
    let record = h.store.get(user.id, BOARD).await.unwrap().unwrap();
    assert!(record.is_active());
    assert!(h.connector.has_user("alice_doe"));

    h.orchestrator.deactivate(&user, BOARD).await.unwrap();
    assert!(!h.connector.has_user("alice_doe"));
    assert!(h.store.is_empty().await);
}

// =============================================================================
// Deactivation and passwords
// =============================================================================

#[tokio::test]
async fn test_deactivate_without_record() {
    let h = harness();
    let err = h.orchestrator.deactivate(&alice(), BOARD).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound { .. }));
}

#[tokio::test]
async fn test_deactivate_already_gone_externally() {
    let h = harness();
    let user = alice();
    h.orchestrator.activate(&user, BOARD).await.unwrap();
    h.connector.board.lock().unwrap().users.clear();

    h.orchestrator.deactivate(&user, BOARD).await.unwrap();
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_failed_deactivate_keeps_record() {
    let h = harness();
    let user = alice();
    h.orchestrator.activate(&user, BOARD).await.unwrap();
    h.connector.fail_delete("alice_doe");

    let err = h.orchestrator.deactivate(&user, BOARD).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(h.store.get(user.id, BOARD).await.unwrap().is_some());
}

#[tokio::test]
async fn test_revoke_keeps_external_row() {
    let h = harness_with(MockConnector::default(), DeprovisionAction::Revoke);
    let user = alice();
    h.orchestrator.activate(&user, BOARD).await.unwrap();

    h.orchestrator.deactivate(&user, BOARD).await.unwrap();
    assert!(h.store.is_empty().await);
    assert!(h.connector.has_user("alice_doe"));
    assert_eq!(h.connector.disables.load(Ordering::SeqCst), 1);
    assert_eq!(h.connector.deletes.load(Ordering::SeqCst), 0);

    // Re-activation adopts the revoked row.
    let credentials = h.orchestrator.activate(&user, BOARD).await.unwrap();
    assert!(credentials.password.is_some());
    assert!(!h.connector.board.lock().unwrap().revoked.contains("alice_doe"));
}

#[tokio::test]
async fn test_password_operations() {
    let h = harness();
    let user = alice();
    h.orchestrator.activate(&user, BOARD).await.unwrap();
    let before = h.store.get(user.id, BOARD).await.unwrap();

    let reset = h.orchestrator.reset_password(&user, BOARD).await.unwrap();
    assert_eq!(reset.username, "alice_doe");
    assert_eq!(reset.password.as_deref().map(str::len), Some(16));

    let set = h
        .orchestrator
        .set_password(&user, BOARD, "correct horse")
        .await
        .unwrap();
    assert_eq!(set.password.as_deref(), Some("correct horse"));

    assert_eq!(h.store.get(user.id, BOARD).await.unwrap(), before);
}

#[tokio::test]
async fn test_reset_password_for_missing_external_account() {
    let h = harness();
    let user = alice();
    h.orchestrator.activate(&user, BOARD).await.unwrap();
    h.connector.board.lock().unwrap().users.clear();

    let err = h.orchestrator.reset_password(&user, BOARD).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound { .. }));
}

// =============================================================================
// Group reconciliation
// =============================================================================

#[tokio::test]
async fn test_group_sync_is_idempotent() {
    let h = harness();
    let mut user = alice();
    h.orchestrator.activate(&user, BOARD).await.unwrap();

    user.groups.push(Group::new("Fleet"));
    let first = h.orchestrator.sync_groups(&user, BOARD).await.unwrap();
    assert_eq!(first.change_count(), 1);

    let mutations = h.connector.group_mutations.load(Ordering::SeqCst);
    let second = h.orchestrator.sync_groups(&user, BOARD).await.unwrap();
    assert!(second.is_empty());
    assert_eq!(h.connector.group_mutations.load(Ordering::SeqCst), mutations);
}

#[tokio::test]
async fn test_removal_from_only_group_leaves_no_rows() {
    let h = harness();
    let mut user = alice();
    h.orchestrator.activate(&user, BOARD).await.unwrap();
    assert_eq!(h.connector.group_rows(), 1);

    user.groups.clear();
    let report = h.orchestrator.reconcile_groups_for_user(&user).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.succeeded, vec![BOARD.to_string()]);

    let board = h.connector.board.lock().unwrap();
    assert!(board.users["alice_doe"].1.is_empty());
    assert!(board.groups.is_empty());
}

#[tokio::test]
async fn test_reconcile_service_skips_unknown_users() {
    let h = harness();
    let alice = alice();
    let bob = named("bob", "Bob Roe");
    h.orchestrator.activate(&alice, BOARD).await.unwrap();
    h.orchestrator.activate(&bob, BOARD).await.unwrap();

    let directory = StaticDirectory::new([alice.with_group(Group::new("Fleet"))]);
    let report = h
        .orchestrator
        .reconcile_service(BOARD, &directory)
        .await
        .unwrap();

    assert_eq!(report.succeeded, vec!["alice_doe".to_string()]);
    assert_eq!(report.skipped, vec!["bob_roe".to_string()]);
}

// =============================================================================
// Bulk operations
// =============================================================================

#[tokio::test]
async fn test_disable_all_continues_past_failures() {
    let h = harness();
    let users = [
        named("alice", "Alice Doe"),
        named("bob", "Bob Roe"),
        named("carol", "Carol Poe"),
    ];
    for user in &users {
        h.orchestrator.activate(user, BOARD).await.unwrap();
    }
    h.connector.fail_delete("bob_roe");

    let report = h.orchestrator.disable_all(BOARD).await.unwrap();
    assert_eq!(report.succeeded, vec!["alice_doe", "carol_poe"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].key, "bob_roe");
    assert!(report.has_retryable_failures());

    let remaining = h.store.list_for_service(BOARD).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].username, "bob_roe");
}

#[tokio::test]
async fn test_validate_user_deactivates_lost_permission() {
    let h = harness();
    let mut user = alice();
    h.orchestrator.activate(&user, BOARD).await.unwrap();

    let report = h.orchestrator.validate_user(&user).await.unwrap();
    assert!(report.succeeded.is_empty());

    user.permissions.clear();
    let report = h.orchestrator.validate_user(&user).await.unwrap();
    assert_eq!(report.succeeded, vec![BOARD.to_string()]);
    assert!(h.store.is_empty().await);
    assert!(!h.connector.has_user("alice_doe"));
}

// =============================================================================
// Events and tasks
// =============================================================================

#[tokio::test]
async fn test_permission_revoked_event() {
    let h = harness();
    let user = alice();
    h.orchestrator.activate(&user, BOARD).await.unwrap();

    let mut revoked = user.clone();
    revoked.permissions.clear();
    let directory = Arc::new(StaticDirectory::new([revoked]));
    let handler = DirectoryEventHandler::new(h.orchestrator.clone(), directory);

    let report = handler
        .handle(&DirectoryEvent::PermissionRevoked {
            user_id: user.id,
            permission: PERMISSION.into(),
        })
        .await
        .unwrap();
    assert_eq!(report.succeeded, vec![BOARD.to_string()]);
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_group_change_event_syncs() {
    let h = harness();
    let user = alice();
    h.orchestrator.activate(&user, BOARD).await.unwrap();

    let updated = user.clone().with_group(Group::new("Fleet"));
    let directory = Arc::new(StaticDirectory::new([updated]));
    let handler = DirectoryEventHandler::new(h.orchestrator.clone(), directory);

    handler
        .handle(&DirectoryEvent::GroupMembershipChanged {
            user_id: user.id,
            added: vec!["Fleet".into()],
            removed: vec![],
        })
        .await
        .unwrap();
    assert!(h.connector.board.lock().unwrap().groups.contains_key("Fleet"));
}

#[tokio::test]
async fn test_tasks_are_safe_to_redeliver() {
    let h = harness();
    let user = alice();
    let directory = Arc::new(StaticDirectory::new([user.clone()]));
    let runner = TaskRunner::with_retry(h.orchestrator.clone(), directory, RetryConfig::disabled());

    let activate = SyncTask::new(TaskOperation::Activate, user.id, BOARD);
    assert!(matches!(
        runner.run(&activate).await.unwrap(),
        TaskOutcome::Completed { attempts: 1 }
    ));
    assert_eq!(runner.run(&activate).await.unwrap(), TaskOutcome::AlreadyDone);

    let deactivate = SyncTask::new(TaskOperation::Deactivate, user.id, BOARD);
    runner.run(&deactivate).await.unwrap();
    assert_eq!(runner.run(&deactivate).await.unwrap(), TaskOutcome::AlreadyDone);
    assert_eq!(h.connector.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_task_retries_transient_failure() {
    let h = harness();
    let user = alice();
    h.orchestrator.activate(&user, BOARD).await.unwrap();
    h.connector.fail_delete("alice_doe");

    let directory = Arc::new(StaticDirectory::new([user.clone()]));
    let runner = TaskRunner::with_retry(
        h.orchestrator.clone(),
        directory,
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        },
    );

    let connector = h.connector.clone();
    let heal = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        connector.fail_deletes_for.lock().unwrap().clear();
    });

    let outcome = runner
        .run(&SyncTask::new(TaskOperation::Deactivate, user.id, BOARD))
        .await
        .unwrap();
    heal.await.unwrap();

    assert_eq!(outcome, TaskOutcome::Completed { attempts: 2 });
    assert!(h.store.is_empty().await);
}
