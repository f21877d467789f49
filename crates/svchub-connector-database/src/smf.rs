//! Simple Machines Forum connector.
//!
//! SMF keeps secondary group membership in a comma separated
//! `additional_groups` column of group ids on the member row.

use async_trait::async_trait;
use sqlx::{MySql, MySqlPool};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, instrument, warn};

use svchub_connector::config::ConnectorConfig;
use svchub_connector::credentials::{CredentialGenerator, HashScheme, DEFAULT_PASSWORD_LENGTH};
use svchub_connector::error::{ConnectorError, ConnectorResult};
use svchub_connector::groups::{parse_group_list, GroupDiff};
use svchub_connector::naming::NamingPolicy;
use svchub_connector::traits::ServiceConnector;
use svchub_connector::types::{
    AccountRef, ExternalAccountState, ProvisionRequest, ProvisionedAccount, ServiceKind,
};

use crate::config::SmfConfig;
use crate::membership::{normalize_groups, MembershipPlan};
use crate::pool::{avatar_url, map_sqlx_error, unix_now, LazyPool, MANAGED_GROUP_MARKER};

#[derive(Debug, Clone)]
struct SmfSql {
    add_user: String,
    del_user: String,
    revoke_user: String,
    member: String,
    update_password: String,
    add_avatar: String,
    set_additional_groups: String,
    all_groups: String,
    add_group: String,
    prune_group: String,
}

impl SmfSql {
    fn new(p: &str) -> Self {
        Self {
            add_user: format!(
                "INSERT INTO {p}members (member_name, passwd, email_address, date_registered, \
                 real_name, buddy_list, message_labels, openid_uri, signature, ignore_boards) \
                 VALUES (?, ?, ?, ?, ?, '', '', '', '', '')"
            ),
            del_user: format!("DELETE FROM {p}members WHERE id_member = ?"),
            revoke_user: format!(
                "UPDATE {p}members SET email_address = ?, passwd = ? WHERE id_member = ?"
            ),
            member: format!(
                "SELECT id_member, email_address, additional_groups \
                 FROM {p}members WHERE member_name = ?"
            ),
            update_password: format!("UPDATE {p}members SET passwd = ? WHERE id_member = ?"),
            add_avatar: format!("UPDATE {p}members SET avatar = ? WHERE id_member = ?"),
            set_additional_groups: format!(
                "UPDATE {p}members SET additional_groups = ? WHERE id_member = ?"
            ),
            all_groups: format!("SELECT id_group, group_name FROM {p}membergroups"),
            add_group: format!(
                "INSERT INTO {p}membergroups (group_name, description) VALUES (?, ?)"
            ),
            prune_group: format!(
                "DELETE FROM {p}membergroups WHERE id_group = ? AND description = ? \
                 AND NOT EXISTS (SELECT 1 FROM {p}members \
                 WHERE id_group = ? OR FIND_IN_SET(?, additional_groups) > 0)"
            ),
        }
    }
}

/// The columns of a member row the connector works with.
#[derive(Debug, Clone, sqlx::FromRow)]
struct MemberRow {
    id_member: u64,
    email_address: String,
    additional_groups: String,
}

/// Connector for an SMF board.
pub struct SmfConnector {
    config: SmfConfig,
    display_name: String,
    pool: LazyPool<MySql>,
    sql: SmfSql,
}

impl std::fmt::Debug for SmfConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmfConnector")
            .field("config", &self.config.redacted())
            .field("display_name", &self.display_name)
            .finish()
    }
}

impl SmfConnector {
    /// Create a new SMF connector with the given configuration.
    pub fn new(config: SmfConfig) -> ConnectorResult<Self> {
        config.validate()?;

        let pool = LazyPool::new(config.store());
        let sql = SmfSql::new(pool.prefix());
        let display_name = format!("smf: {}", config.redacted().database_url);

        Ok(Self {
            config,
            display_name,
            pool,
            sql,
        })
    }

    async fn member(&self, pool: &MySqlPool, username: &str) -> ConnectorResult<Option<MemberRow>> {
        sqlx::query_as::<_, MemberRow>(&self.sql.member)
            .bind(username)
            .fetch_optional(pool)
            .await
            .map_err(|e| map_sqlx_error(format!("look up smf member {username}"), e))
    }

    async fn require_member(&self, pool: &MySqlPool, username: &str) -> ConnectorResult<MemberRow> {
        self.member(pool, username)
            .await?
            .ok_or_else(|| ConnectorError::not_found(username))
    }

    async fn all_groups(&self, pool: &MySqlPool) -> ConnectorResult<HashMap<u64, String>> {
        Ok(sqlx::query_as::<_, (u64, String)>(&self.sql.all_groups)
            .fetch_all(pool)
            .await
            .map_err(|e| map_sqlx_error("list smf groups", e))?
            .into_iter()
            .collect())
    }

    async fn create_group(&self, pool: &MySqlPool, name: &str) -> ConnectorResult<u64> {
        let result = sqlx::query(&self.sql.add_group)
            .bind(name)
            .bind(MANAGED_GROUP_MARKER)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error(format!("create smf group {name}"), e))?;
        info!(group = %name, "Created smf group");
        Ok(result.last_insert_id())
    }

    /// Rewrite `additional_groups` so the member's named groups equal `desired`.
    async fn apply_groups(
        &self,
        pool: &MySqlPool,
        member: &MemberRow,
        desired: &BTreeSet<String>,
    ) -> ConnectorResult<GroupDiff> {
        let desired = normalize_groups(desired);

        let by_id = self.all_groups(pool).await?;
        let current = member_group_names(&member.additional_groups, &by_id);

        let diff = GroupDiff::between(&current, &desired);
        if diff.is_empty() {
            debug!(id_member = member.id_member, "smf groups already in sync");
            return Ok(diff);
        }

        let mut by_name: HashMap<String, u64> =
            by_id.iter().map(|(id, name)| (name.clone(), *id)).collect();
        let plan = MembershipPlan::new(diff, &by_name);
        for name in &plan.to_create {
            let id = self.create_group(pool, name).await?;
            by_name.insert(name.clone(), id);
        }

        let column = additional_groups_column(&desired, &by_name);

        sqlx::query(&self.sql.set_additional_groups)
            .bind(&column)
            .bind(member.id_member)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("update smf additional_groups", e))?;

        for &id in plan.to_leave.values() {
            self.prune_group(pool, id).await?;
        }

        info!(
            id_member = member.id_member,
            added = ?plan.diff.to_add,
            removed = ?plan.diff.to_remove,
            "Updated smf groups"
        );
        Ok(plan.diff)
    }

    async fn prune_group(&self, pool: &MySqlPool, group_id: u64) -> ConnectorResult<()> {
        let result = sqlx::query(&self.sql.prune_group)
            .bind(group_id)
            .bind(MANAGED_GROUP_MARKER)
            .bind(group_id)
            .bind(group_id.to_string())
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("prune smf group", e))?;
        if result.rows_affected() > 0 {
            info!(group_id, "Removed empty managed smf group");
        }
        Ok(())
    }

    async fn write_password(
        &self,
        pool: &MySqlPool,
        id_member: u64,
        username: &str,
        plaintext: &str,
    ) -> ConnectorResult<()> {
        let hash =
            CredentialGenerator::hash_for(HashScheme::Sha1UsernamePassword, username, plaintext)?;
        debug!(hash_prefix = %hash.log_prefix(), "Updating smf password");
        sqlx::query(&self.sql.update_password)
            .bind(&hash.hash)
            .bind(id_member)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("update smf password", e))?;
        Ok(())
    }
}

/// Names of the groups listed in an `additional_groups` column. Ids with
/// no group row are ignored.
fn member_group_names(column: &str, by_id: &HashMap<u64, String>) -> BTreeSet<String> {
    parse_group_list(column)
        .iter()
        .filter_map(|id| id.parse::<u64>().ok())
        .filter_map(|id| by_id.get(&id).cloned())
        .collect()
}

/// The `additional_groups` value that makes a member's groups equal
/// `desired`, ids ascending.
fn additional_groups_column(desired: &BTreeSet<String>, by_name: &HashMap<String, u64>) -> String {
    desired
        .iter()
        .filter_map(|name| by_name.get(name).copied())
        .collect::<BTreeSet<u64>>()
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ServiceConnector for SmfConnector {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Smf
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn naming_policy(&self) -> NamingPolicy {
        NamingPolicy::SMF
    }

    #[instrument(skip(self))]
    async fn test_connection(&self) -> ConnectorResult<()> {
        let pool = self.pool.get().await?;
        sqlx::query(&self.sql.all_groups)
            .fetch_all(&pool)
            .await
            .map_err(|e| ConnectorError::connection_failed_with_source("Test query failed", e))?;
        info!("smf connection test successful");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn user_exists(&self, username: &str) -> ConnectorResult<bool> {
        let pool = self.pool.get().await?;
        let username = self.naming_policy().apply(username);
        Ok(self.member(&pool, &username).await?.is_some())
    }

    #[instrument(skip(self))]
    async fn account_state(&self, username: &str) -> ConnectorResult<ExternalAccountState> {
        let pool = self.pool.get().await?;
        let username = self.naming_policy().apply(username);
        Ok(match self.member(&pool, &username).await? {
            None => ExternalAccountState::Absent,
            Some(m) if m.email_address == self.config.revoked_email => {
                ExternalAccountState::Revoked
            }
            Some(_) => ExternalAccountState::Active,
        })
    }

    #[instrument(skip(self, request), fields(username = %request.username))]
    async fn create_user(&self, request: &ProvisionRequest) -> ConnectorResult<ProvisionedAccount> {
        let pool = self.pool.get().await?;
        let username = self.naming_policy().apply(&request.username);
        let password = CredentialGenerator::generate_legacy_password();
        let hash =
            CredentialGenerator::hash_for(HashScheme::Sha1UsernamePassword, &username, &password)?;
        debug!(username = %username, hash_prefix = %hash.log_prefix(), "Adding smf member");

        let adopted = match self.member(&pool, &username).await? {
            Some(existing) => {
                warn!(username = %username, "smf member already exists, updating instead");
                sqlx::query(&self.sql.revoke_user)
                    .bind(&request.email)
                    .bind(&hash.hash)
                    .bind(existing.id_member)
                    .execute(&pool)
                    .await
                    .map_err(|e| map_sqlx_error(format!("update smf member {username}"), e))?;
                true
            }
            None => {
                sqlx::query(&self.sql.add_user)
                    .bind(&username)
                    .bind(&hash.hash)
                    .bind(&request.email)
                    .bind(unix_now())
                    .bind(&username)
                    .execute(&pool)
                    .await
                    .map_err(|e| map_sqlx_error(format!("insert smf member {username}"), e))?;
                false
            }
        };

        let member = self.require_member(&pool, &username).await?;
        self.apply_groups(&pool, &member, &request.groups).await?;
        if let Some(character_id) = request.character_id {
            sqlx::query(&self.sql.add_avatar)
                .bind(avatar_url(&self.config.avatar_base_url, character_id))
                .bind(member.id_member)
                .execute(&pool)
                .await
                .map_err(|e| map_sqlx_error("set smf avatar", e))?;
        }

        info!(username = %username, id_member = member.id_member, adopted, "Added smf member");
        Ok(ProvisionedAccount {
            username,
            password: Some(password),
            external_id: member.id_member.to_string(),
            adopted,
        })
    }

    #[instrument(skip(self, account), fields(username = %account.username))]
    async fn delete_user(&self, account: &AccountRef) -> ConnectorResult<bool> {
        let pool = self.pool.get().await?;
        let Some(member) = self.member(&pool, &account.username).await? else {
            warn!("smf member not found, nothing to delete");
            return Ok(false);
        };

        self.apply_groups(&pool, &member, &BTreeSet::new()).await?;
        let result = sqlx::query(&self.sql.del_user)
            .bind(member.id_member)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("delete smf member", e))?;

        info!(id_member = member.id_member, "Deleted smf member");
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, account), fields(username = %account.username))]
    async fn disable_user(&self, account: &AccountRef) -> ConnectorResult<bool> {
        let pool = self.pool.get().await?;
        let Some(member) = self.member(&pool, &account.username).await? else {
            warn!("smf member not found, nothing to revoke");
            return Ok(false);
        };

        let throwaway = CredentialGenerator::generate_password(DEFAULT_PASSWORD_LENGTH);
        let hash = CredentialGenerator::hash_for(
            HashScheme::Sha1UsernamePassword,
            &account.username,
            &throwaway,
        )?;
        sqlx::query(&self.sql.revoke_user)
            .bind(&self.config.revoked_email)
            .bind(&hash.hash)
            .bind(member.id_member)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("revoke smf member", e))?;
        self.apply_groups(&pool, &member, &BTreeSet::new()).await?;

        info!(id_member = member.id_member, "Revoked smf member");
        Ok(true)
    }

    async fn reset_password(&self, account: &AccountRef) -> ConnectorResult<String> {
        let password = CredentialGenerator::generate_legacy_password();
        self.set_password(account, &password).await
    }

    #[instrument(skip(self, account, plaintext), fields(username = %account.username))]
    async fn set_password(&self, account: &AccountRef, plaintext: &str) -> ConnectorResult<String> {
        let pool = self.pool.get().await?;
        let member = self.require_member(&pool, &account.username).await?;
        self.write_password(&pool, member.id_member, &account.username, plaintext)
            .await?;
        info!(id_member = member.id_member, "Updated smf password");
        Ok(plaintext.to_string())
    }

    #[instrument(skip(self, account, desired), fields(username = %account.username))]
    async fn sync_groups(
        &self,
        account: &AccountRef,
        desired: &BTreeSet<String>,
    ) -> ConnectorResult<GroupDiff> {
        let pool = self.pool.get().await?;
        let member = self.require_member(&pool, &account.username).await?;
        self.apply_groups(&pool, &member, desired).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_use_prefix() {
        let sql = SmfSql::new("smf_");
        assert!(sql.add_user.starts_with("INSERT INTO smf_members"));
        assert!(sql.all_groups.ends_with("FROM smf_membergroups"));
        assert!(sql.prune_group.contains("FIND_IN_SET(?, additional_groups)"));
    }

    #[test]
    fn test_add_user_binds_five_values() {
        let sql = SmfSql::new("smf_");
        assert_eq!(sql.add_user.matches('?').count(), 5);
    }

    fn by_id() -> HashMap<u64, String> {
        HashMap::from([
            (4, "Member".to_string()),
            (9, "Fleet-Commanders".to_string()),
            (12, "Moderators".to_string()),
        ])
    }

    fn by_name() -> HashMap<String, u64> {
        by_id().into_iter().map(|(id, name)| (name, id)).collect()
    }

    #[test]
    fn test_member_group_names_skips_unknown_ids() {
        let names = member_group_names("9, 4,,77,junk", &by_id());
        let expected: BTreeSet<String> = ["Fleet-Commanders".to_string(), "Member".to_string()].into();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_additional_groups_column() {
        let desired = normalize_groups(&["Member".to_string(), "Fleet Commanders".to_string()].into());
        assert_eq!(additional_groups_column(&desired, &by_name()), "4,9");
        assert_eq!(additional_groups_column(&BTreeSet::new(), &by_name()), "");
    }

    #[test]
    fn test_resync_with_same_groups_plans_nothing() {
        let desired = normalize_groups(&["Fleet Commanders".to_string(), "Member".to_string()].into());
        let current = member_group_names("4,9", &by_id());
        let plan = MembershipPlan::new(GroupDiff::between(&current, &desired), &by_name());
        assert!(plan.diff.is_empty());
        assert_eq!(additional_groups_column(&desired, &by_name()), "4,9");
    }

    #[test]
    fn test_hand_granted_group_is_dropped_from_column() {
        let desired = normalize_groups(&["Member".to_string()].into());
        let current = member_group_names("4,12", &by_id());
        let plan = MembershipPlan::new(GroupDiff::between(&current, &desired), &by_name());

        assert_eq!(plan.to_leave.get("Moderators"), Some(&12));
        assert_eq!(additional_groups_column(&desired, &by_name()), "4");
    }

    #[test]
    fn test_naming_replaces_apostrophe() {
        let connector = SmfConnector::new(SmfConfig::new("mysql://smf@db/smf")).unwrap();
        assert_eq!(connector.naming_policy().apply("O'Neil Jr"), "o_neil_jr");
        assert_eq!(connector.kind(), ServiceKind::Smf);
    }
}
