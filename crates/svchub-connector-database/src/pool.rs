//! Lazily established connection pools and sqlx error mapping.

use sqlx::pool::PoolOptions;
use sqlx::{Database, Pool};
use tokio::sync::RwLock;
use tracing::{debug, info};

use svchub_connector::config::redact_url;
use svchub_connector::error::{ConnectorError, ConnectorResult};

use crate::config::SqlStoreConfig;

/// Description written on groups a connector inserted on demand.
///
/// Only groups carrying it are pruned when they lose their last member.
pub const MANAGED_GROUP_MARKER: &str = "Managed by svchub";

/// A pool that connects on first use and is then reused.
pub(crate) struct LazyPool<DB: Database> {
    store: SqlStoreConfig,
    pool: RwLock<Option<Pool<DB>>>,
}

impl<DB: Database> LazyPool<DB> {
    pub(crate) fn new(store: SqlStoreConfig) -> Self {
        Self {
            store,
            pool: RwLock::new(None),
        }
    }

    /// Get a connection pool, creating one if necessary.
    pub(crate) async fn get(&self) -> ConnectorResult<Pool<DB>> {
        {
            let guard = self.pool.read().await;
            if let Some(ref pool) = *guard {
                return Ok(pool.clone());
            }
        }

        let mut guard = self.pool.write().await;
        // Another caller may have connected while we waited for the lock.
        if let Some(ref pool) = *guard {
            return Ok(pool.clone());
        }

        let target = redact_url(&self.store.database_url);
        debug!(target_db = %target, "Creating database connection pool");

        let pool = PoolOptions::<DB>::new()
            .max_connections(self.store.connection.pool_size)
            .acquire_timeout(self.store.connection.connection_timeout())
            .connect(&self.store.database_url)
            .await
            .map_err(|e| {
                ConnectorError::connection_failed_with_source(
                    format!("Failed to connect to database at {target}"),
                    e,
                )
            })?;

        info!(target_db = %target, "Database connection pool established");

        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Prefix the foreign schema puts on table names.
    pub(crate) fn prefix(&self) -> &str {
        &self.store.table_prefix
    }
}

/// Classify a sqlx failure: connectivity problems are transient, everything
/// else is a permanent database error.
pub(crate) fn map_sqlx_error(context: impl Into<String>, err: sqlx::Error) -> ConnectorError {
    let context = context.into();
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ConnectorError::connection_failed_with_source(context, err),
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            ConnectorError::ObjectAlreadyExists { identifier: context }
        }
        other => ConnectorError::database_with_source(context, other),
    }
}

/// Portrait URL for a character id.
pub(crate) fn avatar_url(base: &str, character_id: i64) -> String {
    format!("{base}{character_id}_64.jpg")
}

/// Seconds since the epoch, as the boards store registration dates.
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
