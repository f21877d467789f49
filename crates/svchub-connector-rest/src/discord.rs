//! Discord guild connector.
//!
//! Accounts are guild memberships addressed by the Discord user id. Groups
//! map to guild roles, created on demand. Discord has no passwords.

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use svchub_connector::config::ConnectorConfig;
use svchub_connector::error::{ConnectorError, ConnectorResult};
use svchub_connector::groups::GroupDiff;
use svchub_connector::naming::sanitize_group_name;
use svchub_connector::traits::ServiceConnector;
use svchub_connector::types::{AccountRef, ProvisionRequest, ProvisionedAccount, ServiceKind};

use crate::config::DiscordConfig;
use crate::rate_limit::{log_rate_limited, BackoffGate, RateLimitInfo};

/// Discord's limit on nickname length.
pub const MAX_NICKNAME_LENGTH: usize = 32;

/// Discord's limit on role name length.
pub const MAX_ROLE_NAME_LENGTH: usize = 100;

/// Permissions granted to roles the connector creates.
pub const MANAGED_ROLE_PERMISSIONS: &str = "36785152";

#[derive(Debug, Clone, Deserialize)]
struct GuildRole {
    id: String,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GuildMember {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug)]
struct RoleCache {
    fetched_at: Instant,
    by_name: HashMap<String, String>,
}

impl RoleCache {
    fn name_of(&self, id: &str) -> Option<&String> {
        self.by_name
            .iter()
            .find_map(|(name, role_id)| (role_id == id).then_some(name))
    }
}

/// Spell a group name the way the guild stores role names.
#[must_use]
pub fn role_name(group: &str) -> String {
    sanitize_group_name(group)
        .chars()
        .take(MAX_ROLE_NAME_LENGTH)
        .collect()
}

/// Connector for a Discord guild.
pub struct DiscordConnector {
    config: DiscordConfig,
    display_name: String,
    client: Client,
    roles: RwLock<Option<RoleCache>>,
    gate: BackoffGate,
}

impl std::fmt::Debug for DiscordConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConnector")
            .field("config", &self.config.redacted())
            .field("display_name", &self.display_name)
            .finish()
    }
}

impl DiscordConnector {
    /// Create a new Discord connector with the given configuration.
    pub fn new(config: DiscordConfig) -> ConnectorResult<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.connection.operation_timeout())
            .connect_timeout(config.connection.connection_timeout())
            .build()
            .map_err(|e| ConnectorError::InvalidConfiguration {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        let display_name = format!("discord: guild {}", config.guild_id);

        Ok(Self {
            config,
            display_name,
            client,
            roles: RwLock::new(None),
            gate: BackoffGate::new(),
        })
    }

    fn guild_url(&self, tail: &str) -> String {
        format!(
            "{}/guilds/{}{}",
            self.config.api_base_url, self.config.guild_id, tail
        )
    }

    /// Send a request, waiting out 429s up to the configured attempt count.
    async fn send(
        &self,
        method: Method,
        route: &'static str,
        url: &str,
        body: Option<&Value>,
    ) -> ConnectorResult<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.gate.wait(route, self.config.max_backoff()).await;

            let mut request = self
                .client
                .request(method.clone(), url)
                .header(
                    reqwest::header::AUTHORIZATION,
                    format!("Bot {}", self.config.bot_token),
                )
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }

            debug!(method = %method, route = %route, attempt, "Sending Discord request");
            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    ConnectorError::Timeout {
                        timeout_secs: self.config.connection.operation_timeout_secs,
                    }
                } else {
                    ConnectorError::network_with_source(format!("{method} {route} failed"), e)
                }
            })?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            let info =
                RateLimitInfo::from_headers(response.headers()).capped(self.config.max_backoff());
            log_rate_limited(route, &info, attempt);
            self.gate.record(route, info).await;

            if attempt >= self.config.max_rate_limit_retries {
                return Err(ConnectorError::TargetUnavailable {
                    message: "Discord API is too busy, try again later".to_string(),
                });
            }
        }
    }

    /// Turn a non-success response into an error.
    async fn error_for(&self, response: Response, identifier: &str) -> ConnectorError {
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(status = %status, error = %e, "Could not read Discord error body");
                String::new()
            }
        };
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ConnectorError::AuthenticationFailed {
                    service: format!("discord ({status})"),
                }
            }
            StatusCode::NOT_FOUND => ConnectorError::not_found(identifier),
            s if s.is_server_error() => ConnectorError::TargetUnavailable {
                message: format!("HTTP {status}: {body}"),
            },
            _ => ConnectorError::InvalidData {
                message: format!("HTTP {status}: {body}"),
            },
        }
    }

    async fn fetch_roles(&self) -> ConnectorResult<HashMap<String, String>> {
        let response = self
            .send(Method::GET, "roles", &self.guild_url("/roles"), None)
            .await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, "guild roles").await);
        }
        let roles: Vec<GuildRole> = response.json().await.map_err(|e| ConnectorError::InvalidData {
            message: format!("Failed to parse guild roles: {e}"),
        })?;
        Ok(roles.into_iter().map(|r| (r.name, r.id)).collect())
    }

    /// The guild's roles by name, served from cache while fresh.
    async fn role_map(&self, force_refresh: bool) -> ConnectorResult<HashMap<String, String>> {
        if !force_refresh {
            let cache = self.roles.read().await;
            if let Some(cache) = cache.as_ref() {
                if cache.fetched_at.elapsed() < self.config.role_cache_ttl() {
                    return Ok(cache.by_name.clone());
                }
            }
        }

        let by_name = self.fetch_roles().await?;
        debug!(roles = by_name.len(), "Refreshed Discord role cache");
        *self.roles.write().await = Some(RoleCache {
            fetched_at: Instant::now(),
            by_name: by_name.clone(),
        });
        Ok(by_name)
    }

    /// Create a role and give it the managed defaults.
    async fn create_role(&self, name: &str) -> ConnectorResult<String> {
        let response = self
            .send(
                Method::POST,
                "roles",
                &self.guild_url("/roles"),
                Some(&json!({ "name": name })),
            )
            .await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, name).await);
        }
        let role: GuildRole = response.json().await.map_err(|e| ConnectorError::InvalidData {
            message: format!("Failed to parse created role: {e}"),
        })?;

        let body = json!({
            "name": name,
            "color": 0,
            "hoist": true,
            "permissions": MANAGED_ROLE_PERMISSIONS,
        });
        let response = self
            .send(
                Method::PATCH,
                "roles",
                &self.guild_url(&format!("/roles/{}", role.id)),
                Some(&body),
            )
            .await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, name).await);
        }

        if let Some(cache) = self.roles.write().await.as_mut() {
            cache.by_name.insert(name.to_string(), role.id.clone());
        }
        info!(role = %name, role_id = %role.id, "Created Discord role");
        Ok(role.id)
    }

    /// Resolve role names to ids, creating roles the guild lacks.
    async fn role_ids(&self, names: &BTreeSet<String>) -> ConnectorResult<Vec<String>> {
        let mut roles = self.role_map(false).await?;
        if names.iter().any(|n| !roles.contains_key(n)) {
            roles = self.role_map(true).await?;
        }

        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let id = match roles.get(name) {
                Some(id) => id.clone(),
                None => self.create_role(name).await?,
            };
            ids.push(id);
        }
        Ok(ids)
    }

    async fn member(&self, user_id: &str) -> ConnectorResult<Option<GuildMember>> {
        let response = self
            .send(
                Method::GET,
                "members",
                &self.guild_url(&format!("/members/{user_id}")),
                None,
            )
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let member = response.json().await.map_err(|e| ConnectorError::InvalidData {
                    message: format!("Failed to parse guild member: {e}"),
                })?;
                Ok(Some(member))
            }
            _ => Err(self.error_for(response, user_id).await),
        }
    }

    async fn patch_member(&self, user_id: &str, body: &Value) -> ConnectorResult<bool> {
        let response = self
            .send(
                Method::PATCH,
                "members",
                &self.guild_url(&format!("/members/{user_id}")),
                Some(body),
            )
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(self.error_for(response, user_id).await),
        }
    }
}

fn truncate_nickname(nickname: &str) -> String {
    nickname.chars().take(MAX_NICKNAME_LENGTH).collect()
}

fn desired_role_names(groups: &BTreeSet<String>) -> BTreeSet<String> {
    groups
        .iter()
        .map(|g| role_name(g))
        .filter(|g| !g.is_empty())
        .collect()
}

#[async_trait]
impl ServiceConnector for DiscordConnector {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Discord
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    #[instrument(skip(self))]
    async fn test_connection(&self) -> ConnectorResult<()> {
        let response = self
            .send(Method::GET, "guild", &self.guild_url(""), None)
            .await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, &self.config.guild_id).await);
        }
        info!(guild_id = %self.config.guild_id, "Discord connection test successful");
        Ok(())
    }

    /// `username` is the Discord user id.
    #[instrument(skip(self))]
    async fn user_exists(&self, username: &str) -> ConnectorResult<bool> {
        Ok(self.member(username).await?.is_some())
    }

    /// Joins the user to the guild with their OAuth access token.
    ///
    /// Discord answers 204 when the user is already a member; the existing
    /// membership is adopted and its roles and nickname are brought in line.
    #[instrument(skip(self, request), fields(username = %request.username))]
    async fn create_user(&self, request: &ProvisionRequest) -> ConnectorResult<ProvisionedAccount> {
        let user_id = request
            .external_id
            .as_deref()
            .ok_or_else(|| ConnectorError::InvalidData {
                message: "Discord user id is required to join the guild".to_string(),
            })?;
        let access_token =
            request
                .access_token
                .as_deref()
                .ok_or_else(|| ConnectorError::InvalidData {
                    message: "OAuth access token is required to join the guild".to_string(),
                })?;

        let role_ids = self.role_ids(&desired_role_names(&request.groups)).await?;
        let nickname = request
            .display_name
            .as_deref()
            .map(truncate_nickname)
            .unwrap_or_else(|| truncate_nickname(&request.username));

        let body = json!({
            "access_token": access_token,
            "roles": role_ids,
            "nick": nickname,
        });
        let response = self
            .send(
                Method::PUT,
                "members",
                &self.guild_url(&format!("/members/{user_id}")),
                Some(&body),
            )
            .await?;

        let adopted = match response.status() {
            StatusCode::CREATED => false,
            StatusCode::NO_CONTENT => true,
            s if s.is_success() => false,
            _ => return Err(self.error_for(response, user_id).await),
        };

        if adopted {
            warn!(user_id = %user_id, "Discord user already in guild, updating instead");
            let account = AccountRef::new(nickname.clone(), Some(user_id.to_string()));
            self.sync_groups(&account, &request.groups).await?;
            self.sync_nickname(&account, &nickname).await?;
        }

        info!(user_id = %user_id, adopted, "Added Discord guild member");
        Ok(ProvisionedAccount {
            username: nickname,
            password: None,
            external_id: user_id.to_string(),
            adopted,
        })
    }

    #[instrument(skip(self, account), fields(user_id = %account.id_or_username()))]
    async fn delete_user(&self, account: &AccountRef) -> ConnectorResult<bool> {
        let user_id = account.id_or_username();
        let response = self
            .send(
                Method::DELETE,
                "members",
                &self.guild_url(&format!("/members/{user_id}")),
                None,
            )
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                warn!("Discord member not found, nothing to remove");
                Ok(false)
            }
            s if s.is_success() => {
                info!("Removed Discord guild member");
                Ok(true)
            }
            _ => Err(self.error_for(response, user_id).await),
        }
    }

    async fn reset_password(&self, _account: &AccountRef) -> ConnectorResult<String> {
        Err(ConnectorError::unsupported("discord", "reset_password"))
    }

    async fn set_password(
        &self,
        _account: &AccountRef,
        _plaintext: &str,
    ) -> ConnectorResult<String> {
        Err(ConnectorError::unsupported("discord", "set_password"))
    }

    /// Replaces the member's roles with the desired set in one PATCH. Role
    /// ids the guild no longer lists are passed through untouched.
    #[instrument(skip(self, account, desired), fields(user_id = %account.id_or_username()))]
    async fn sync_groups(
        &self,
        account: &AccountRef,
        desired: &BTreeSet<String>,
    ) -> ConnectorResult<GroupDiff> {
        let user_id = account.id_or_username();
        let member = self
            .member(user_id)
            .await?
            .ok_or_else(|| ConnectorError::not_found(user_id))?;

        let desired = desired_role_names(desired);
        let mut roles = self.role_map(false).await?;
        if member.roles.iter().any(|id| !roles.values().any(|r| r == id)) {
            roles = self.role_map(true).await?;
        }
        let cache = RoleCache {
            fetched_at: Instant::now(),
            by_name: roles,
        };

        let mut unnamed = Vec::new();
        let mut current = BTreeSet::new();
        for id in &member.roles {
            match cache.name_of(id) {
                Some(name) => {
                    current.insert(name.clone());
                }
                None => unnamed.push(id.clone()),
            }
        }

        let diff = GroupDiff::between(&current, &desired);
        if diff.is_empty() {
            debug!("Discord roles already in sync");
            return Ok(diff);
        }

        let mut role_ids = self.role_ids(&desired).await?;
        role_ids.extend(unnamed);
        if !self
            .patch_member(user_id, &json!({ "roles": role_ids }))
            .await?
        {
            return Err(ConnectorError::not_found(user_id));
        }

        info!(added = ?diff.to_add, removed = ?diff.to_remove, "Updated Discord roles");
        Ok(diff)
    }

    #[instrument(skip(self, account), fields(user_id = %account.id_or_username()))]
    async fn sync_nickname(&self, account: &AccountRef, nickname: &str) -> ConnectorResult<()> {
        let nickname = truncate_nickname(nickname);
        if self
            .patch_member(account.id_or_username(), &json!({ "nick": nickname }))
            .await?
        {
            info!(nickname = %nickname, "Updated Discord nickname");
        } else {
            debug!("Discord member gone, nickname not updated");
        }
        Ok(())
    }
}
