//! External account names from templates.
//!
//! A template such as `[{corp_ticker}]{character_name}` is parsed once, at
//! registration, then rendered against a user's main character. The
//! connector's [`NamingPolicy`] is applied to the rendered name.

use serde::{Deserialize, Serialize};
use std::fmt;

use svchub_connector::naming::NamingPolicy;

use crate::directory::{Character, DirectoryUser};
use crate::error::{SyncError, SyncResult};

/// Template used when a service configures none.
pub const DEFAULT_NAME_TEMPLATE: &str = "{character_name}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    CharacterName,
    CharacterId,
    CorpName,
    CorpId,
    CorpTicker,
    AllianceName,
    AllianceId,
    AllianceTicker,
    AllianceOrCorpName,
    AllianceOrCorpTicker,
    Username,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "character_name" => Field::CharacterName,
            "character_id" => Field::CharacterId,
            "corp_name" => Field::CorpName,
            "corp_id" => Field::CorpId,
            "corp_ticker" => Field::CorpTicker,
            "alliance_name" => Field::AllianceName,
            "alliance_id" => Field::AllianceId,
            "alliance_ticker" => Field::AllianceTicker,
            "alliance_or_corp_name" => Field::AllianceOrCorpName,
            "alliance_or_corp_ticker" => Field::AllianceOrCorpTicker,
            "username" => Field::Username,
            _ => return None,
        })
    }

    fn needs_character(self) -> bool {
        self != Field::Username
    }

    fn render(self, user: &DirectoryUser, character: Option<&Character>, out: &mut String) {
        let Some(c) = character else {
            if self == Field::Username {
                out.push_str(&user.username);
            }
            return;
        };
        match self {
            Field::CharacterName => out.push_str(&c.name),
            Field::CharacterId => out.push_str(&c.id.to_string()),
            Field::CorpName => out.push_str(&c.corporation_name),
            Field::CorpId => out.push_str(&c.corporation_id.to_string()),
            Field::CorpTicker => out.push_str(&c.corporation_ticker),
            Field::AllianceName => out.push_str(c.alliance_name.as_deref().unwrap_or_default()),
            Field::AllianceId => {
                if let Some(id) = c.alliance_id {
                    out.push_str(&id.to_string());
                }
            }
            Field::AllianceTicker => out.push_str(c.alliance_ticker.as_deref().unwrap_or_default()),
            Field::AllianceOrCorpName => out.push_str(c.alliance_or_corp_name()),
            Field::AllianceOrCorpTicker => out.push_str(c.alliance_or_corp_ticker()),
            Field::Username => out.push_str(&user.username),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// A parsed naming template.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NameFormatter {
    template: String,
    segments: Vec<Segment>,
    default_to_username: bool,
}

impl NameFormatter {
    /// Parse a template. Unknown fields and unbalanced braces are
    /// configuration errors.
    pub fn parse(template: &str) -> SyncResult<Self> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find(['{', '}']) {
            if rest[open..].starts_with('}') {
                return Err(SyncError::configuration(format!(
                    "unbalanced '}}' in name template '{template}'"
                )));
            }
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                SyncError::configuration(format!("unclosed '{{' in name template '{template}'"))
            })?;
            let name = &after[..close];
            let field = Field::parse(name).ok_or_else(|| {
                SyncError::configuration(format!(
                    "unknown field '{{{name}}}' in name template '{template}'"
                ))
            })?;
            segments.push(Segment::Field(field));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        if segments.is_empty() {
            return Err(SyncError::configuration("name template is empty"));
        }

        Ok(Self {
            template: template.to_string(),
            segments,
            default_to_username: false,
        })
    }

    /// Fall back to the directory username when the user has no main
    /// character.
    #[must_use]
    pub fn with_default_to_username(mut self, enabled: bool) -> Self {
        self.default_to_username = enabled;
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// The unpoliced name for `user`.
    pub fn render(&self, user: &DirectoryUser) -> SyncResult<String> {
        let character = user.main_character.as_ref();
        let needs_character = self.segments.iter().any(|s| match s {
            Segment::Field(f) => f.needs_character(),
            Segment::Literal(_) => false,
        });

        if character.is_none() && needs_character {
            if self.default_to_username {
                return Ok(user.username.clone());
            }
            return Err(SyncError::not_found("main character", &user.username));
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => field.render(user, character, &mut out),
            }
        }
        Ok(out)
    }

    /// The external account name for `user` under a connector's policy.
    pub fn format(&self, user: &DirectoryUser, policy: &NamingPolicy) -> SyncResult<String> {
        let name = policy.apply(self.render(user)?.trim());
        if name.is_empty() {
            return Err(SyncError::configuration(format!(
                "name template '{}' renders empty for {}",
                self.template, user.username
            )));
        }
        Ok(name)
    }
}

impl Default for NameFormatter {
    fn default() -> Self {
        Self {
            template: DEFAULT_NAME_TEMPLATE.to_string(),
            segments: vec![Segment::Field(Field::CharacterName)],
            default_to_username: false,
        }
    }
}

impl fmt::Debug for NameFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameFormatter")
            .field("template", &self.template)
            .field("default_to_username", &self.default_to_username)
            .finish()
    }
}

impl TryFrom<String> for NameFormatter {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NameFormatter> for String {
    fn from(value: NameFormatter) -> Self {
        value.template
    }
}
