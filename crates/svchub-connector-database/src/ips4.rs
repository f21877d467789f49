//! Invision Community 4 connector.
//!
//! IPS4 verifies `$2y$` bcrypt hashes and also wants the salt in a column of
//! its own. Group membership is not managed.

use async_trait::async_trait;
use sqlx::{MySql, MySqlPool};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

use svchub_connector::config::ConnectorConfig;
use svchub_connector::credentials::{CredentialGenerator, HashScheme};
use svchub_connector::error::{ConnectorError, ConnectorResult};
use svchub_connector::groups::GroupDiff;
use svchub_connector::traits::ServiceConnector;
use svchub_connector::types::{AccountRef, ProvisionRequest, ProvisionedAccount, ServiceKind};

use crate::config::Ips4Config;
use crate::pool::{map_sqlx_error, LazyPool};

#[derive(Debug, Clone)]
struct Ips4Sql {
    add_user: String,
    member_id: String,
    update_password: String,
    update_email_password: String,
    del_user: String,
    ping: String,
}

impl Ips4Sql {
    fn new(p: &str) -> Self {
        Self {
            add_user: format!(
                "INSERT INTO {p}core_members (name, email, members_pass_hash, members_pass_salt, \
                 member_group_id) VALUES (?, ?, ?, ?, ?)"
            ),
            member_id: format!("SELECT member_id FROM {p}core_members WHERE name = ?"),
            update_password: format!(
                "UPDATE {p}core_members SET members_pass_hash = ?, members_pass_salt = ? \
                 WHERE member_id = ?"
            ),
            update_email_password: format!(
                "UPDATE {p}core_members SET email = ?, members_pass_hash = ?, \
                 members_pass_salt = ? WHERE member_id = ?"
            ),
            del_user: format!("DELETE FROM {p}core_members WHERE member_id = ?"),
            ping: format!("SELECT COUNT(*) FROM {p}core_members"),
        }
    }
}

/// Connector for an Invision Community 4 site.
pub struct Ips4Connector {
    config: Ips4Config,
    display_name: String,
    pool: LazyPool<MySql>,
    sql: Ips4Sql,
}

impl std::fmt::Debug for Ips4Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ips4Connector")
            .field("config", &self.config.redacted())
            .field("display_name", &self.display_name)
            .finish()
    }
}

impl Ips4Connector {
    /// Create a new IPS4 connector with the given configuration.
    pub fn new(config: Ips4Config) -> ConnectorResult<Self> {
        config.validate()?;

        let pool = LazyPool::new(config.store());
        let sql = Ips4Sql::new(pool.prefix());
        let display_name = format!("ips4: {}", config.redacted().database_url);

        Ok(Self {
            config,
            display_name,
            pool,
            sql,
        })
    }

    fn scheme(&self) -> HashScheme {
        HashScheme::Bcrypt {
            cost: self.config.bcrypt_cost,
        }
    }

    async fn member_id(&self, pool: &MySqlPool, name: &str) -> ConnectorResult<Option<u64>> {
        sqlx::query_scalar::<_, u64>(&self.sql.member_id)
            .bind(name)
            .fetch_optional(pool)
            .await
            .map_err(|e| map_sqlx_error(format!("look up ips4 member {name}"), e))
    }

    /// Resolve the member id, preferring the one recorded at creation.
    async fn resolve(&self, pool: &MySqlPool, account: &AccountRef) -> ConnectorResult<Option<u64>> {
        match account.external_id.as_deref().map(str::parse::<u64>) {
            Some(Ok(id)) => Ok(Some(id)),
            _ => self.member_id(pool, &account.username).await,
        }
    }
}

#[async_trait]
impl ServiceConnector for Ips4Connector {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Ips4
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    #[instrument(skip(self))]
    async fn test_connection(&self) -> ConnectorResult<()> {
        let pool = self.pool.get().await?;
        sqlx::query(&self.sql.ping)
            .fetch_one(&pool)
            .await
            .map_err(|e| ConnectorError::connection_failed_with_source("Test query failed", e))?;
        info!("ips4 connection test successful");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn user_exists(&self, username: &str) -> ConnectorResult<bool> {
        let pool = self.pool.get().await?;
        Ok(self.member_id(&pool, username).await?.is_some())
    }

    #[instrument(skip(self, request), fields(username = %request.username))]
    async fn create_user(&self, request: &ProvisionRequest) -> ConnectorResult<ProvisionedAccount> {
        let pool = self.pool.get().await?;
        let password = CredentialGenerator::generate_legacy_password();
        let hash = CredentialGenerator::hash_for(self.scheme(), &request.username, &password)?;
        let salt = hash.salt.clone().unwrap_or_default();
        debug!(hash_prefix = %hash.log_prefix(), "Adding ips4 member");

        let (member_id, adopted) = match self.member_id(&pool, &request.username).await? {
            Some(member_id) => {
                warn!(member_id, "ips4 member already exists, updating instead");
                sqlx::query(&self.sql.update_email_password)
                    .bind(&request.email)
                    .bind(&hash.hash)
                    .bind(&salt)
                    .bind(member_id)
                    .execute(&pool)
                    .await
                    .map_err(|e| map_sqlx_error("update ips4 member", e))?;
                (member_id, true)
            }
            None => {
                let result = sqlx::query(&self.sql.add_user)
                    .bind(&request.username)
                    .bind(&request.email)
                    .bind(&hash.hash)
                    .bind(&salt)
                    .bind(self.config.member_group_id)
                    .execute(&pool)
                    .await
                    .map_err(|e| map_sqlx_error("insert ips4 member", e))?;
                (result.last_insert_id(), false)
            }
        };

        info!(member_id, adopted, "Added ips4 member");
        Ok(ProvisionedAccount {
            username: request.username.clone(),
            password: Some(password),
            external_id: member_id.to_string(),
            adopted,
        })
    }

    #[instrument(skip(self, account), fields(username = %account.username))]
    async fn delete_user(&self, account: &AccountRef) -> ConnectorResult<bool> {
        let pool = self.pool.get().await?;
        let Some(member_id) = self.resolve(&pool, account).await? else {
            warn!("ips4 member not found, nothing to delete");
            return Ok(false);
        };

        let result = sqlx::query(&self.sql.del_user)
            .bind(member_id)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("delete ips4 member", e))?;

        if result.rows_affected() == 0 {
            warn!(member_id, "ips4 member already gone");
            return Ok(false);
        }
        info!(member_id, "Deleted ips4 member");
        Ok(true)
    }

    async fn reset_password(&self, account: &AccountRef) -> ConnectorResult<String> {
        let password = CredentialGenerator::generate_legacy_password();
        self.set_password(account, &password).await
    }

    #[instrument(skip(self, account, plaintext), fields(username = %account.username))]
    async fn set_password(&self, account: &AccountRef, plaintext: &str) -> ConnectorResult<String> {
        let pool = self.pool.get().await?;
        let member_id = self
            .resolve(&pool, account)
            .await?
            .ok_or_else(|| ConnectorError::not_found(account.username.clone()))?;

        let hash = CredentialGenerator::hash_for(self.scheme(), &account.username, plaintext)?;
        let salt = hash.salt.clone().unwrap_or_default();
        let result = sqlx::query(&self.sql.update_password)
            .bind(&hash.hash)
            .bind(&salt)
            .bind(member_id)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("update ips4 password", e))?;

        if result.rows_affected() == 0 {
            return Err(ConnectorError::not_found(account.id_or_username()));
        }
        info!(member_id, "Updated ips4 password");
        Ok(plaintext.to_string())
    }

    async fn sync_groups(
        &self,
        _account: &AccountRef,
        _desired: &BTreeSet<String>,
    ) -> ConnectorResult<GroupDiff> {
        debug!("ips4 group membership is not managed");
        Ok(GroupDiff::default())
    }
}
