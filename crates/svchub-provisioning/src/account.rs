//! Account records.
//!
//! One [`AccountRecord`] per (user, service) pair. Creation is a two-phase
//! compare-and-set: [`AccountStore::reserve`] claims the pair as `pending`
//! before the connector runs, [`AccountStore::confirm`] marks it `active`
//! once the external account exists. Losing the reservation race means
//! another caller is already activating the same pair.
//!
//! A reservation whose connector call timed out is parked as `in_doubt`
//! instead of being dropped: the external account may exist. The next
//! activation [`resume`](AccountStore::resume)s it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use svchub_connector::types::AccountRef;

use crate::error::{SyncError, SyncResult};

/// Schema for [`PgAccountStore`].
pub const ACCOUNT_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS service_accounts (
    id          UUID PRIMARY KEY,
    user_id     UUID NOT NULL,
    service_id  TEXT NOT NULL,
    username    TEXT NOT NULL,
    external_id TEXT,
    status      TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (user_id, service_id)
)";

/// Lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    /// Reserved; the connector call is in flight.
    Pending,
    /// The connector call timed out. The external account may exist.
    #[serde(rename = "in_doubt")]
    InDoubt,
    /// The external account has been created.
    Active,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Pending => "pending",
            AccountStatus::InDoubt => "in_doubt",
            AccountStatus::Active => "active",
        }
    }

    fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "pending" => Ok(AccountStatus::Pending),
            "in_doubt" => Ok(AccountStatus::InDoubt),
            "active" => Ok(AccountStatus::Active),
            other => Err(SyncError::Store {
                message: format!("unknown account status '{other}'"),
                source: None,
            }),
        }
    }
}

/// Directory-side record of an externally provisioned account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub service_id: String,
    pub username: String,
    pub external_id: Option<String>,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

impl AccountRecord {
    fn pending(user_id: Uuid, service_id: &str, username: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            service_id: service_id.to_string(),
            username: username.to_string(),
            external_id: None,
            status: AccountStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Handle the connector addresses this account by.
    pub fn account_ref(&self) -> AccountRef {
        AccountRef::new(self.username.clone(), self.external_id.clone())
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// Persistence for account records.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Claim (user, service). Returns `None` when a record already exists.
    async fn reserve(
        &self,
        user_id: Uuid,
        service_id: &str,
        username: &str,
    ) -> SyncResult<Option<AccountRecord>>;

    /// Mark a reservation active with the names the connector reported.
    async fn confirm(
        &self,
        id: Uuid,
        username: &str,
        external_id: Option<&str>,
    ) -> SyncResult<AccountRecord>;

    /// Drop a reservation whose connector call failed.
    async fn release(&self, id: Uuid) -> SyncResult<()>;

    /// Park a pending reservation whose connector call has an unknown
    /// outcome.
    async fn mark_in_doubt(&self, id: Uuid) -> SyncResult<()>;

    /// Take over an in-doubt reservation, moving it back to pending.
    /// Returns `None` when it is no longer in doubt.
    async fn resume(&self, id: Uuid) -> SyncResult<Option<AccountRecord>>;

    async fn get(&self, user_id: Uuid, service_id: &str) -> SyncResult<Option<AccountRecord>>;

    /// Remove a record. Returns false when it was already gone.
    async fn delete(&self, id: Uuid) -> SyncResult<bool>;

    async fn list_for_user(&self, user_id: Uuid) -> SyncResult<Vec<AccountRecord>>;

    async fn list_for_service(&self, service_id: &str) -> SyncResult<Vec<AccountRecord>>;
}

const RECORD_COLUMNS: &str = "id, user_id, service_id, username, external_id, status, created_at";

/// PostgreSQL-backed account store.
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table if missing.
    pub async fn ensure_schema(&self) -> SyncResult<()> {
        sqlx::query(ACCOUNT_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: &PgRow) -> SyncResult<AccountRecord> {
        let status: String = row.try_get("status")?;
        Ok(AccountRecord {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            service_id: row.try_get("service_id")?,
            username: row.try_get("username")?,
            external_id: row.try_get("external_id")?,
            status: AccountStatus::parse(&status)?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    #[instrument(skip(self))]
    async fn reserve(
        &self,
        user_id: Uuid,
        service_id: &str,
        username: &str,
    ) -> SyncResult<Option<AccountRecord>> {
        let record = AccountRecord::pending(user_id, service_id, username);
        let result = sqlx::query(
            r"
            INSERT INTO service_accounts (id, user_id, service_id, username, external_id, status, created_at)
            VALUES ($1, $2, $3, $4, NULL, $5, $6)
            ON CONFLICT (user_id, service_id) DO NOTHING
            ",
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.service_id)
        .bind(&record.username)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Reservation lost, record already exists");
            return Ok(None);
        }
        Ok(Some(record))
    }

    #[instrument(skip(self))]
    async fn confirm(
        &self,
        id: Uuid,
        username: &str,
        external_id: Option<&str>,
    ) -> SyncResult<AccountRecord> {
        let row = sqlx::query(&format!(
            "UPDATE service_accounts SET status = 'active', username = $2, external_id = $3 \
             WHERE id = $1 AND status = 'pending' RETURNING {RECORD_COLUMNS}"
        ))
        .bind(id)
        .bind(username)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SyncError::not_found("account reservation", id.to_string()))?;

        Self::row_to_record(&row)
    }

    #[instrument(skip(self))]
    async fn release(&self, id: Uuid) -> SyncResult<()> {
        sqlx::query("DELETE FROM service_accounts WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_in_doubt(&self, id: Uuid) -> SyncResult<()> {
        sqlx::query(
            "UPDATE service_accounts SET status = 'in_doubt' WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resume(&self, id: Uuid) -> SyncResult<Option<AccountRecord>> {
        let row = sqlx::query(&format!(
            "UPDATE service_accounts SET status = 'pending' \
             WHERE id = $1 AND status = 'in_doubt' RETURNING {RECORD_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn get(&self, user_id: Uuid, service_id: &str) -> SyncResult<Option<AccountRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM service_accounts WHERE user_id = $1 AND service_id = $2"
        ))
        .bind(user_id)
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> SyncResult<bool> {
        let result = sqlx::query("DELETE FROM service_accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_for_user(&self, user_id: Uuid) -> SyncResult<Vec<AccountRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM service_accounts WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn list_for_service(&self, service_id: &str) -> SyncResult<Vec<AccountRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM service_accounts WHERE service_id = $1 ORDER BY created_at"
        ))
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

/// In-process account store with the same semantics as [`PgAccountStore`].
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    records: Mutex<Vec<AccountRecord>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn reserve(
        &self,
        user_id: Uuid,
        service_id: &str,
        username: &str,
    ) -> SyncResult<Option<AccountRecord>> {
        let mut records = self.records.lock().await;
        if records
            .iter()
            .any(|r| r.user_id == user_id && r.service_id == service_id)
        {
            return Ok(None);
        }
        let record = AccountRecord::pending(user_id, service_id, username);
        records.push(record.clone());
        Ok(Some(record))
    }

    async fn confirm(
        &self,
        id: Uuid,
        username: &str,
        external_id: Option<&str>,
    ) -> SyncResult<AccountRecord> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id && r.status == AccountStatus::Pending)
            .ok_or_else(|| SyncError::not_found("account reservation", id.to_string()))?;
        record.status = AccountStatus::Active;
        record.username = username.to_string();
        record.external_id = external_id.map(str::to_string);
        Ok(record.clone())
    }

    async fn release(&self, id: Uuid) -> SyncResult<()> {
        self.records
            .lock()
            .await
            .retain(|r| !(r.id == id && r.status == AccountStatus::Pending));
        Ok(())
    }

    async fn mark_in_doubt(&self, id: Uuid) -> SyncResult<()> {
        let mut records = self.records.lock().await;
        if let Some(record) = records
            .iter_mut()
            .find(|r| r.id == id && r.status == AccountStatus::Pending)
        {
            record.status = AccountStatus::InDoubt;
        }
        Ok(())
    }

    async fn resume(&self, id: Uuid) -> SyncResult<Option<AccountRecord>> {
        let mut records = self.records.lock().await;
        Ok(records
            .iter_mut()
            .find(|r| r.id == id && r.status == AccountStatus::InDoubt)
            .map(|record| {
                record.status = AccountStatus::Pending;
                record.clone()
            }))
    }

    async fn get(&self, user_id: Uuid, service_id: &str) -> SyncResult<Option<AccountRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .find(|r| r.user_id == user_id && r.service_id == service_id)
            .cloned())
    }

    async fn delete(&self, id: Uuid) -> SyncResult<bool> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() < before)
    }

    async fn list_for_user(&self, user_id: Uuid) -> SyncResult<Vec<AccountRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_for_service(&self, service_id: &str) -> SyncResult<Vec<AccountRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect())
    }
}
