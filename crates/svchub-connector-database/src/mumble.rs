//! Mumble connector.
//!
//! The Mumble authenticator reads a table the hub owns:
//!
//! ```sql
//! CREATE TABLE mumble_users (
//!     id       BIGSERIAL PRIMARY KEY,
//!     username TEXT NOT NULL UNIQUE,
//!     pwhash   TEXT NOT NULL,
//!     hashfn   TEXT NOT NULL DEFAULT 'sha1',
//!     groups   TEXT NOT NULL DEFAULT ''
//! );
//! ```

use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

use svchub_connector::config::ConnectorConfig;
use svchub_connector::credentials::{CredentialGenerator, HashScheme};
use svchub_connector::error::{ConnectorError, ConnectorResult};
use svchub_connector::groups::{join_group_list, parse_group_list, GroupDiff};
use svchub_connector::naming::NamingPolicy;
use svchub_connector::traits::ServiceConnector;
use svchub_connector::types::{AccountRef, ProvisionRequest, ProvisionedAccount, ServiceKind};

use crate::config::MumbleConfig;
use crate::membership::normalize_groups;
use crate::pool::{map_sqlx_error, LazyPool};

/// Value of the `hashfn` column for rows this connector writes.
pub const MUMBLE_HASH_FN: &str = "sha1";

#[derive(Debug, Clone)]
struct MumbleSql {
    insert: String,
    exists: String,
    delete: String,
    update_password: String,
    groups: String,
    update_groups: String,
}

impl MumbleSql {
    fn new(table: &str) -> Self {
        Self {
            insert: format!(
                "INSERT INTO {table} (username, pwhash, hashfn, groups) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (username) DO NOTHING RETURNING id"
            ),
            exists: format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE username = $1)"),
            delete: format!("DELETE FROM {table} WHERE username = $1"),
            update_password: format!(
                "UPDATE {table} SET pwhash = $1, hashfn = $2 WHERE username = $3"
            ),
            groups: format!("SELECT groups FROM {table} WHERE username = $1"),
            update_groups: format!("UPDATE {table} SET groups = $1 WHERE username = $2"),
        }
    }
}

/// Connector for the Mumble authenticator table.
pub struct MumbleConnector {
    config: MumbleConfig,
    display_name: String,
    pool: LazyPool<Postgres>,
    sql: MumbleSql,
}

impl std::fmt::Debug for MumbleConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MumbleConnector")
            .field("config", &self.config.redacted())
            .field("display_name", &self.display_name)
            .finish()
    }
}

impl MumbleConnector {
    /// Create a new Mumble connector with the given configuration.
    pub fn new(config: MumbleConfig) -> ConnectorResult<Self> {
        config.validate()?;

        let pool = LazyPool::new(config.store());
        let sql = MumbleSql::new(&config.table);
        let display_name = format!("mumble: {}", config.table);

        Ok(Self {
            config,
            display_name,
            pool,
            sql,
        })
    }

    async fn current_groups(
        &self,
        pool: &PgPool,
        username: &str,
    ) -> ConnectorResult<Option<BTreeSet<String>>> {
        let raw = sqlx::query_scalar::<_, String>(&self.sql.groups)
            .bind(username)
            .fetch_optional(pool)
            .await
            .map_err(|e| map_sqlx_error(format!("read mumble groups for {username}"), e))?;
        Ok(raw.map(|raw| parse_group_list(&raw)))
    }
}

/// Diff the stored `groups` column against the desired groups, returning
/// the column to write when anything changed.
fn plan_groups_column(
    current: &BTreeSet<String>,
    desired: &BTreeSet<String>,
) -> (GroupDiff, Option<String>) {
    let desired = normalize_groups(desired);
    let diff = GroupDiff::between(current, &desired);
    let column = (!diff.is_empty()).then(|| join_group_list(&desired));
    (diff, column)
}

#[async_trait]
impl ServiceConnector for MumbleConnector {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Mumble
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn naming_policy(&self) -> NamingPolicy {
        NamingPolicy::VOICE
    }

    #[instrument(skip(self))]
    async fn test_connection(&self) -> ConnectorResult<()> {
        let pool = self.pool.get().await?;

        let table_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
        )
        .bind(&self.config.table)
        .fetch_one(&pool)
        .await
        .map_err(|e| ConnectorError::connection_failed_with_source("Table check failed", e))?;

        if !table_exists {
            return Err(ConnectorError::connection_failed(format!(
                "Mumble table '{}' not found in database",
                self.config.table
            )));
        }

        info!("mumble connection test successful");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn user_exists(&self, username: &str) -> ConnectorResult<bool> {
        let pool = self.pool.get().await?;
        sqlx::query_scalar::<_, bool>(&self.sql.exists)
            .bind(self.naming_policy().apply(username))
            .fetch_one(&pool)
            .await
            .map_err(|e| map_sqlx_error("check mumble user", e))
    }

    /// Mumble names are unique across the server, so an existing row is
    /// never adopted: it may belong to somebody else.
    #[instrument(skip(self, request), fields(username = %request.username))]
    async fn create_user(&self, request: &ProvisionRequest) -> ConnectorResult<ProvisionedAccount> {
        let pool = self.pool.get().await?;
        let username = self.naming_policy().apply(&request.username);
        let password = CredentialGenerator::generate_password(self.config.password_length);
        let hash = CredentialGenerator::hash_for(HashScheme::Sha1Password, &username, &password)?;
        let groups = join_group_list(&normalize_groups(&request.groups));
        debug!(username = %username, hash_prefix = %hash.log_prefix(), "Adding mumble user");

        let id = sqlx::query_scalar::<_, i64>(&self.sql.insert)
            .bind(&username)
            .bind(&hash.hash)
            .bind(MUMBLE_HASH_FN)
            .bind(&groups)
            .fetch_optional(&pool)
            .await
            .map_err(|e| map_sqlx_error(format!("insert mumble user {username}"), e))?;

        let Some(id) = id else {
            warn!(username = %username, "mumble username already taken");
            return Err(ConnectorError::ObjectAlreadyExists {
                identifier: username,
            });
        };

        info!(username = %username, id, "Added mumble user");
        Ok(ProvisionedAccount {
            username,
            password: Some(password),
            external_id: id.to_string(),
            adopted: false,
        })
    }

    #[instrument(skip(self, account), fields(username = %account.username))]
    async fn delete_user(&self, account: &AccountRef) -> ConnectorResult<bool> {
        let pool = self.pool.get().await?;
        let result = sqlx::query(&self.sql.delete)
            .bind(&account.username)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("delete mumble user", e))?;

        if result.rows_affected() == 0 {
            warn!("mumble user not found, nothing to delete");
            return Ok(false);
        }
        info!("Deleted mumble user");
        Ok(true)
    }

    async fn reset_password(&self, account: &AccountRef) -> ConnectorResult<String> {
        let password = CredentialGenerator::generate_password(self.config.password_length);
        self.set_password(account, &password).await
    }

    #[instrument(skip(self, account, plaintext), fields(username = %account.username))]
    async fn set_password(&self, account: &AccountRef, plaintext: &str) -> ConnectorResult<String> {
        let pool = self.pool.get().await?;
        let hash =
            CredentialGenerator::hash_for(HashScheme::Sha1Password, &account.username, plaintext)?;
        debug!(hash_prefix = %hash.log_prefix(), "Updating mumble password");

        let result = sqlx::query(&self.sql.update_password)
            .bind(&hash.hash)
            .bind(MUMBLE_HASH_FN)
            .bind(&account.username)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("update mumble password", e))?;

        if result.rows_affected() == 0 {
            return Err(ConnectorError::not_found(account.username.clone()));
        }
        info!("Updated mumble password");
        Ok(plaintext.to_string())
    }

    #[instrument(skip(self, account, desired), fields(username = %account.username))]
    async fn sync_groups(
        &self,
        account: &AccountRef,
        desired: &BTreeSet<String>,
    ) -> ConnectorResult<GroupDiff> {
        let pool = self.pool.get().await?;
        let current = self
            .current_groups(&pool, &account.username)
            .await?
            .ok_or_else(|| ConnectorError::not_found(account.username.clone()))?;

        let (diff, column) = plan_groups_column(&current, desired);
        let Some(column) = column else {
            debug!("mumble groups already in sync");
            return Ok(diff);
        };

        sqlx::query(&self.sql.update_groups)
            .bind(column)
            .bind(&account.username)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("update mumble groups", e))?;

        info!(added = ?diff.to_add, removed = ?diff.to_remove, "Updated mumble groups");
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_column_plan() {
        let desired: BTreeSet<String> = ["Fleet Commanders".to_string(), "Member".to_string()].into();
        let (diff, column) = plan_groups_column(&BTreeSet::new(), &desired);
        assert_eq!(diff.to_add.len(), 2);
        assert_eq!(column.as_deref(), Some("Fleet-Commanders,Member"));

        let stored = parse_group_list("Fleet-Commanders,Member");
        let (diff, column) = plan_groups_column(&stored, &desired);
        assert!(diff.is_empty());
        assert_eq!(column, None);

        let stored = parse_group_list("Member,Officers");
        let (diff, column) = plan_groups_column(&stored, &desired);
        assert!(diff.to_remove.contains("Officers"));
        assert_eq!(column.as_deref(), Some("Fleet-Commanders,Member"));
    }

    #[test]
    fn test_insert_is_conflict_safe() {
        let sql = MumbleSql::new("mumble_users");
        assert!(sql.insert.contains("ON CONFLICT (username) DO NOTHING RETURNING id"));
    }

    #[test]
    fn test_new_rejects_mysql_url() {
        assert!(MumbleConnector::new(MumbleConfig::new("mysql://db/mumble")).is_err());
        let connector = MumbleConnector::new(MumbleConfig::new("postgres://hub@db/hub")).unwrap();
        assert_eq!(connector.naming_policy().apply("Alice Doe"), "Alice_Doe");
    }
}
