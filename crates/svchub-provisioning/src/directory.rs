//! Read-only view of the central directory.
//!
//! Users, their groups and their main character are owned by the identity
//! subsystem. The sync core only reads them through [`DirectorySource`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// A game character used to name a user's external accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: i64,
    pub name: String,
    pub corporation_id: i64,
    pub corporation_name: String,
    pub corporation_ticker: String,
    #[serde(default)]
    pub alliance_id: Option<i64>,
    #[serde(default)]
    pub alliance_name: Option<String>,
    #[serde(default)]
    pub alliance_ticker: Option<String>,
}

impl Character {
    /// Alliance ticker, or the corporation's when not in an alliance.
    #[must_use]
    pub fn alliance_or_corp_ticker(&self) -> &str {
        self.alliance_ticker
            .as_deref()
            .unwrap_or(&self.corporation_ticker)
    }

    /// Alliance name, or the corporation's when not in an alliance.
    #[must_use]
    pub fn alliance_or_corp_name(&self) -> &str {
        self.alliance_name.as_deref().unwrap_or(&self.corporation_name)
    }
}

/// A directory group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,

    /// System-managed groups cannot be joined by users.
    #[serde(default)]
    pub internal: bool,

    #[serde(default)]
    pub description: Option<String>,
}

impl Group {
    /// A user-joinable group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            internal: false,
            description: None,
        }
    }

    /// A system-managed group.
    pub fn internal(name: impl Into<String>) -> Self {
        Self {
            internal: true,
            ..Self::new(name)
        }
    }
}

/// A principal authenticated by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,

    /// Membership state (e.g. "Member", "Blue"). Synced like a group.
    #[serde(default)]
    pub state: Option<String>,

    #[serde(default)]
    pub groups: Vec<Group>,

    /// Granted permission names, e.g. `phpbb3.access_phpbb3`.
    #[serde(default)]
    pub permissions: BTreeSet<String>,

    #[serde(default)]
    pub main_character: Option<Character>,
}

impl DirectoryUser {
    /// Create a user without groups, permissions or character.
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            email: email.into(),
            state: None,
            groups: Vec::new(),
            permissions: BTreeSet::new(),
            main_character: None,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: Group) -> Self {
        self.groups.push(group);
        self
    }

    #[must_use]
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    #[must_use]
    pub fn with_main_character(mut self, character: Character) -> Self {
        self.main_character = Some(character);
        self
    }

    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Names of every group the user belongs to, state included.
    #[must_use]
    pub fn group_names(&self) -> BTreeSet<String> {
        self.state
            .iter()
            .cloned()
            .chain(self.groups.iter().map(|g| g.name.clone()))
            .collect()
    }
}

/// Access to the directory's users.
#[async_trait]
pub trait DirectorySource: Send + Sync {
    /// Look a user up by id.
    async fn get_user(&self, id: Uuid) -> SyncResult<Option<DirectoryUser>>;

    /// Every user the directory knows.
    async fn list_users(&self) -> SyncResult<Vec<DirectoryUser>>;
}

/// A fixed set of users, loaded up front.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    users: HashMap<Uuid, DirectoryUser>,
    order: Vec<Uuid>,
}

impl StaticDirectory {
    pub fn new(users: impl IntoIterator<Item = DirectoryUser>) -> Self {
        let mut directory = Self::default();
        for user in users {
            if directory.users.insert(user.id, user.clone()).is_none() {
                directory.order.push(user.id);
            }
        }
        directory
    }

    /// Load a JSON array of users exported from the directory.
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let users: Vec<DirectoryUser> = serde_json::from_str(&raw).map_err(|e| {
            SyncError::configuration(format!("invalid directory export {}: {e}", path.display()))
        })?;
        Ok(Self::new(users))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[async_trait]
impl DirectorySource for StaticDirectory {
    async fn get_user(&self, id: Uuid) -> SyncResult<Option<DirectoryUser>> {
        Ok(self.users.get(&id).cloned())
    }

    async fn list_users(&self) -> SyncResult<Vec<DirectoryUser>> {
        Ok(self
            .order
            .iter()
            .filter_map(|id| self.users.get(id).cloned())
            .collect())
    }
}
