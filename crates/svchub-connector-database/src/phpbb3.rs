//! phpBB3 connector
//!
//! Talks to a phpBB3 MySQL schema directly. Accounts are addressed by
//! `username`; group membership lives in `<prefix>user_group` rows.

use async_trait::async_trait;
use sqlx::{MySql, MySqlPool};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, instrument, warn};

use svchub_connector::config::ConnectorConfig;
use svchub_connector::credentials::{CredentialGenerator, HashScheme};
use svchub_connector::error::{ConnectorError, ConnectorResult};
use svchub_connector::groups::GroupDiff;
use svchub_connector::naming::NamingPolicy;
use svchub_connector::traits::ServiceConnector;
use svchub_connector::types::{
    AccountRef, ExternalAccountState, ProvisionRequest, ProvisionedAccount, ServiceKind,
};

use crate::config::Phpbb3Config;
use crate::membership::{normalize_groups, MembershipPlan};
use crate::pool::{avatar_url, map_sqlx_error, unix_now, LazyPool, MANAGED_GROUP_MARKER};

/// phpBB's built-in REGISTERED group, used as the primary group.
const REGISTERED_GROUP_ID: u64 = 2;

/// Statement templates for one table prefix.
#[derive(Debug, Clone)]
struct Phpbb3Sql {
    add_user: String,
    del_user: String,
    revoke_user: String,
    user_id: String,
    user_email: String,
    update_password: String,
    add_avatar: String,
    clear_permissions: String,
    del_sessions: String,
    del_autologin: String,
    all_groups: String,
    user_groups: String,
    add_group: String,
    add_user_group: String,
    remove_user_group: String,
    prune_group: String,
}

impl Phpbb3Sql {
    fn new(p: &str) -> Self {
        Self {
            add_user: format!(
                "INSERT INTO {p}users (username, username_clean, user_password, user_email, \
                 group_id, user_regdate, user_permissions, user_sig, user_lang) \
                 VALUES (?, ?, ?, ?, ?, ?, '', '', 'en')"
            ),
            del_user: format!("DELETE FROM {p}users WHERE user_id = ?"),
            revoke_user: format!(
                "UPDATE {p}users SET user_email = ?, user_password = ? WHERE user_id = ?"
            ),
            user_id: format!("SELECT user_id FROM {p}users WHERE username = ?"),
            user_email: format!("SELECT user_email FROM {p}users WHERE username = ?"),
            update_password: format!("UPDATE {p}users SET user_password = ? WHERE user_id = ?"),
            add_avatar: format!(
                "UPDATE {p}users SET user_avatar_type = 2, user_avatar_width = 64, \
                 user_avatar_height = 64, user_avatar = ? WHERE user_id = ?"
            ),
            clear_permissions: format!(
                "UPDATE {p}users SET user_permissions = '' WHERE user_id = ?"
            ),
            del_sessions: format!("DELETE FROM {p}sessions WHERE session_user_id = ?"),
            del_autologin: format!("DELETE FROM {p}sessions_keys WHERE user_id = ?"),
            all_groups: format!("SELECT group_id, group_name FROM {p}groups"),
            user_groups: format!(
                "SELECT g.group_name FROM {p}groups g \
                 JOIN {p}user_group ug ON ug.group_id = g.group_id \
                 WHERE ug.user_id = ?"
            ),
            add_group: format!(
                "INSERT INTO {p}groups (group_name, group_desc, group_legend) VALUES (?, ?, 0)"
            ),
            add_user_group: format!(
                "INSERT INTO {p}user_group (group_id, user_id, user_pending) VALUES (?, ?, 0)"
            ),
            remove_user_group: format!(
                "DELETE FROM {p}user_group WHERE user_id = ? AND group_id = ?"
            ),
            prune_group: format!(
                "DELETE FROM {p}groups WHERE group_id = ? AND group_desc = ? \
                 AND NOT EXISTS (SELECT 1 FROM {p}user_group WHERE group_id = ?)"
            ),
        }
    }
}

/// Connector for a phpBB3 board.
pub struct Phpbb3Connector {
    config: Phpbb3Config,
    display_name: String,
    pool: LazyPool<MySql>,
    sql: Phpbb3Sql,
}

impl std::fmt::Debug for Phpbb3Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phpbb3Connector")
            .field("config", &self.config.redacted())
            .field("display_name", &self.display_name)
            .finish()
    }
}

impl Phpbb3Connector {
    /// Create a new phpBB3 connector with the given configuration.
    pub fn new(config: Phpbb3Config) -> ConnectorResult<Self> {
        config.validate()?;

        let pool = LazyPool::new(config.store());
        let sql = Phpbb3Sql::new(pool.prefix());
        let display_name = format!("phpbb3: {}", config.redacted().database_url);

        Ok(Self {
            config,
            display_name,
            pool,
            sql,
        })
    }

    fn scheme(&self) -> HashScheme {
        HashScheme::Phpass {
            rounds_log2: self.config.phpass_rounds,
        }
    }

    async fn user_id(&self, pool: &MySqlPool, username: &str) -> ConnectorResult<Option<u64>> {
        sqlx::query_scalar::<_, u64>(&self.sql.user_id)
            .bind(username)
            .fetch_optional(pool)
            .await
            .map_err(|e| map_sqlx_error(format!("look up phpbb user {username}"), e))
    }

    async fn require_user_id(&self, pool: &MySqlPool, username: &str) -> ConnectorResult<u64> {
        self.user_id(pool, username)
            .await?
            .ok_or_else(|| ConnectorError::not_found(username))
    }

    async fn set_avatar(&self, pool: &MySqlPool, user_id: u64, character_id: i64) -> ConnectorResult<()> {
        let url = avatar_url(&self.config.avatar_base_url, character_id);
        debug!(user_id, character_id, "Setting phpbb avatar");
        sqlx::query(&self.sql.add_avatar)
            .bind(url)
            .bind(user_id)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("set phpbb avatar", e))?;
        Ok(())
    }

    async fn create_group(&self, pool: &MySqlPool, name: &str) -> ConnectorResult<u64> {
        let result = sqlx::query(&self.sql.add_group)
            .bind(name)
            .bind(MANAGED_GROUP_MARKER)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error(format!("create phpbb group {name}"), e))?;
        info!(group = %name, "Created phpbb group");
        Ok(result.last_insert_id())
    }

    /// Bring the membership rows of `user_id` in line with `desired`.
    async fn apply_groups(
        &self,
        pool: &MySqlPool,
        user_id: u64,
        desired: &BTreeSet<String>,
    ) -> ConnectorResult<GroupDiff> {
        let desired = normalize_groups(desired);

        let current: BTreeSet<String> = sqlx::query_scalar::<_, String>(&self.sql.user_groups)
            .bind(user_id)
            .fetch_all(pool)
            .await
            .map_err(|e| map_sqlx_error("read phpbb user groups", e))?
            .into_iter()
            .collect();

        let diff = GroupDiff::between(&current, &desired);
        if diff.is_empty() {
            debug!(user_id, "phpbb groups already in sync");
            return Ok(diff);
        }

        let mut forum_groups: HashMap<String, u64> =
            sqlx::query_as::<_, (u64, String)>(&self.sql.all_groups)
                .fetch_all(pool)
                .await
                .map_err(|e| map_sqlx_error("list phpbb groups", e))?
                .into_iter()
                .map(|(id, name)| (name, id))
                .collect();

        let plan = MembershipPlan::new(diff, &forum_groups);
        for name in &plan.to_create {
            let id = self.create_group(pool, name).await?;
            forum_groups.insert(name.clone(), id);
        }

        for name in &plan.diff.to_add {
            let Some(&group_id) = forum_groups.get(name) else {
                continue;
            };
            sqlx::query(&self.sql.add_user_group)
                .bind(group_id)
                .bind(user_id)
                .execute(pool)
                .await
                .map_err(|e| map_sqlx_error(format!("add phpbb user to {name}"), e))?;
        }

        for (name, &group_id) in &plan.to_leave {
            sqlx::query(&self.sql.remove_user_group)
                .bind(user_id)
                .bind(group_id)
                .execute(pool)
                .await
                .map_err(|e| map_sqlx_error(format!("remove phpbb user from {name}"), e))?;
            self.prune_group(pool, group_id).await?;
        }

        // phpBB caches the permission mask; clear it so the board recomputes.
        sqlx::query(&self.sql.clear_permissions)
            .bind(user_id)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("clear phpbb permission cache", e))?;

        info!(
            user_id,
            added = ?plan.diff.to_add,
            removed = ?plan.diff.to_remove,
            "Updated phpbb groups"
        );
        Ok(plan.diff)
    }

    async fn prune_group(&self, pool: &MySqlPool, group_id: u64) -> ConnectorResult<()> {
        let result = sqlx::query(&self.sql.prune_group)
            .bind(group_id)
            .bind(MANAGED_GROUP_MARKER)
            .bind(group_id)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("prune phpbb group", e))?;
        if result.rows_affected() > 0 {
            info!(group_id, "Removed empty managed phpbb group");
        }
        Ok(())
    }

    async fn drop_sessions(&self, pool: &MySqlPool, user_id: u64) -> ConnectorResult<()> {
        for statement in [&self.sql.del_autologin, &self.sql.del_sessions] {
            sqlx::query(statement)
                .bind(user_id)
                .execute(pool)
                .await
                .map_err(|e| map_sqlx_error("drop phpbb sessions", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceConnector for Phpbb3Connector {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Phpbb3
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn naming_policy(&self) -> NamingPolicy {
        NamingPolicy::BOARD
    }

    #[instrument(skip(self))]
    async fn test_connection(&self) -> ConnectorResult<()> {
        let pool = self.pool.get().await?;
        sqlx::query(&self.sql.all_groups)
            .fetch_all(&pool)
            .await
            .map_err(|e| ConnectorError::connection_failed_with_source("Test query failed", e))?;
        info!("phpbb connection test successful");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn user_exists(&self, username: &str) -> ConnectorResult<bool> {
        let pool = self.pool.get().await?;
        let username = self.naming_policy().apply(username);
        Ok(self.user_id(&pool, &username).await?.is_some())
    }

    #[instrument(skip(self))]
    async fn account_state(&self, username: &str) -> ConnectorResult<ExternalAccountState> {
        let pool = self.pool.get().await?;
        let username = self.naming_policy().apply(username);
        let email = sqlx::query_scalar::<_, String>(&self.sql.user_email)
            .bind(&username)
            .fetch_optional(&pool)
            .await
            .map_err(|e| map_sqlx_error(format!("look up phpbb user {username}"), e))?;
        Ok(match email {
            None => ExternalAccountState::Absent,
            Some(email) if email == self.config.revoked_email => ExternalAccountState::Revoked,
            Some(_) => ExternalAccountState::Active,
        })
    }

    #[instrument(skip(self, request), fields(username = %request.username))]
    async fn create_user(&self, request: &ProvisionRequest) -> ConnectorResult<ProvisionedAccount> {
        let pool = self.pool.get().await?;
        let username = self.naming_policy().apply(&request.username);
        let password = CredentialGenerator::generate_legacy_password();
        let hash = CredentialGenerator::hash_for(self.scheme(), &username, &password)?;
        debug!(
            username = %username,
            hash_prefix = %hash.log_prefix(),
            "Adding phpbb user"
        );

        let (user_id, adopted) = match self.user_id(&pool, &username).await? {
            Some(user_id) => {
                // Most likely a previously revoked account.
                warn!(username = %username, "phpbb user already exists, updating instead");
                sqlx::query(&self.sql.revoke_user)
                    .bind(&request.email)
                    .bind(&hash.hash)
                    .bind(user_id)
                    .execute(&pool)
                    .await
                    .map_err(|e| map_sqlx_error(format!("update phpbb user {username}"), e))?;
                (user_id, true)
            }
            None => {
                let result = sqlx::query(&self.sql.add_user)
                    .bind(&username)
                    .bind(&username)
                    .bind(&hash.hash)
                    .bind(&request.email)
                    .bind(REGISTERED_GROUP_ID)
                    .bind(unix_now())
                    .execute(&pool)
                    .await
                    .map_err(|e| map_sqlx_error(format!("insert phpbb user {username}"), e))?;
                (result.last_insert_id(), false)
            }
        };

        self.apply_groups(&pool, user_id, &request.groups).await?;
        if let Some(character_id) = request.character_id {
            self.set_avatar(&pool, user_id, character_id).await?;
        }

        info!(username = %username, user_id, adopted, "Added phpbb user");
        Ok(ProvisionedAccount {
            username,
            password: Some(password),
            external_id: user_id.to_string(),
            adopted,
        })
    }

    #[instrument(skip(self, account), fields(username = %account.username))]
    async fn delete_user(&self, account: &AccountRef) -> ConnectorResult<bool> {
        let pool = self.pool.get().await?;
        let Some(user_id) = self.user_id(&pool, &account.username).await? else {
            warn!("phpbb user not found, nothing to delete");
            return Ok(false);
        };

        self.apply_groups(&pool, user_id, &BTreeSet::new()).await?;
        self.drop_sessions(&pool, user_id).await?;
        let result = sqlx::query(&self.sql.del_user)
            .bind(user_id)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("delete phpbb user", e))?;

        info!(user_id, "Deleted phpbb user");
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, account), fields(username = %account.username))]
    async fn disable_user(&self, account: &AccountRef) -> ConnectorResult<bool> {
        let pool = self.pool.get().await?;
        let Some(user_id) = self.user_id(&pool, &account.username).await? else {
            warn!("phpbb user not found, nothing to revoke");
            return Ok(false);
        };

        let throwaway = CredentialGenerator::generate_password(
            svchub_connector::credentials::DEFAULT_PASSWORD_LENGTH,
        );
        let hash = CredentialGenerator::hash_for(self.scheme(), &account.username, &throwaway)?;
        sqlx::query(&self.sql.revoke_user)
            .bind(&self.config.revoked_email)
            .bind(&hash.hash)
            .bind(user_id)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("revoke phpbb user", e))?;
        self.drop_sessions(&pool, user_id).await?;
        self.apply_groups(&pool, user_id, &BTreeSet::new()).await?;

        info!(user_id, "Revoked phpbb user");
        Ok(true)
    }

    async fn reset_password(&self, account: &AccountRef) -> ConnectorResult<String> {
        let password = CredentialGenerator::generate_legacy_password();
        self.set_password(account, &password).await
    }

    #[instrument(skip(self, account, plaintext), fields(username = %account.username))]
    async fn set_password(&self, account: &AccountRef, plaintext: &str) -> ConnectorResult<String> {
        let pool = self.pool.get().await?;
        let user_id = self.require_user_id(&pool, &account.username).await?;
        let hash = CredentialGenerator::hash_for(self.scheme(), &account.username, plaintext)?;
        debug!(hash_prefix = %hash.log_prefix(), "Updating phpbb password");

        sqlx::query(&self.sql.update_password)
            .bind(&hash.hash)
            .bind(user_id)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("update phpbb password", e))?;

        info!(user_id, "Updated phpbb password");
        Ok(plaintext.to_string())
    }

    #[instrument(skip(self, account, desired), fields(username = %account.username))]
    async fn sync_groups(
        &self,
        account: &AccountRef,
        desired: &BTreeSet<String>,
    ) -> ConnectorResult<GroupDiff> {
        let pool = self.pool.get().await?;
        let user_id = self.require_user_id(&pool, &account.username).await?;
        self.apply_groups(&pool, user_id, desired).await
    }
}
