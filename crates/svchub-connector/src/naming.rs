//! Per-service spelling rules for usernames and group names.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// What to do with apostrophes in account names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApostrophePolicy {
    Keep,
    Remove,
    Replace(char),
}

/// Username spelling rules of one external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingPolicy {
    /// Character that replaces spaces, if spaces are illegal.
    pub space_replacement: Option<char>,
    pub apostrophes: ApostrophePolicy,
    pub lowercase: bool,
}

impl NamingPolicy {
    /// Names pass through unchanged.
    pub const VERBATIM: NamingPolicy = NamingPolicy {
        space_replacement: None,
        apostrophes: ApostrophePolicy::Keep,
        lowercase: false,
    };

    /// phpBB3 and similar boards.
    pub const BOARD: NamingPolicy = NamingPolicy {
        space_replacement: Some('_'),
        apostrophes: ApostrophePolicy::Remove,
        lowercase: true,
    };

    /// SMF keeps the apostrophe's position as an underscore.
    pub const SMF: NamingPolicy = NamingPolicy {
        space_replacement: Some('_'),
        apostrophes: ApostrophePolicy::Replace('_'),
        lowercase: true,
    };

    /// Voice servers: no spaces, case preserved.
    pub const VOICE: NamingPolicy = NamingPolicy {
        space_replacement: Some('_'),
        apostrophes: ApostrophePolicy::Keep,
        lowercase: false,
    };

    /// Apply the policy to a raw name.
    #[must_use]
    pub fn apply(&self, raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        for c in raw.chars() {
            match c {
                ' ' => match self.space_replacement {
                    Some(r) => out.push(r),
                    None => out.push(' '),
                },
                '\'' => match self.apostrophes {
                    ApostrophePolicy::Keep => out.push('\''),
                    ApostrophePolicy::Remove => {}
                    ApostrophePolicy::Replace(r) => out.push(r),
                },
                c => out.push(c),
            }
        }
        if self.lowercase {
            out.to_lowercase()
        } else {
            out
        }
    }
}

impl Default for NamingPolicy {
    fn default() -> Self {
        Self::VERBATIM
    }
}

/// Forum boards and Mumble store group names with spaces as hyphens.
#[must_use]
pub fn hyphenate_group(name: &str) -> String {
    name.replace(' ', "-")
}

static GROUP_NAME_ILLEGAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w.-]").unwrap());

/// Strip leading/trailing spaces and underscores, then drop everything
/// outside `[\w.-]`. Discord role names are spelled this way.
#[must_use]
pub fn sanitize_group_name(name: &str) -> String {
    let trimmed = name.trim_matches(|c| c == ' ' || c == '_');
    GROUP_NAME_ILLEGAL.replace_all(trimmed, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_policy() {
        assert_eq!(NamingPolicy::BOARD.apply("Alice Doe"), "alice_doe");
        assert_eq!(NamingPolicy::BOARD.apply("Mc'Gregor Jr"), "mcgregor_jr");
    }

    #[test]
    fn test_smf_policy_replaces_apostrophe() {
        assert_eq!(NamingPolicy::SMF.apply("Mc'Gregor Jr"), "mc_gregor_jr");
    }

    #[test]
    fn test_voice_policy_keeps_case() {
        assert_eq!(NamingPolicy::VOICE.apply("[TICK]Alice Doe"), "[TICK]Alice_Doe");
    }

    #[test]
    fn test_verbatim() {
        assert_eq!(NamingPolicy::default().apply("Alice Doe's"), "Alice Doe's");
    }

    #[test]
    fn test_sanitize_group_name() {
        assert_eq!(sanitize_group_name(" _Fleet Commanders_ "), "FleetCommanders");
        assert_eq!(sanitize_group_name("Corp [TICK]"), "CorpTICK");
        assert_eq!(sanitize_group_name("alpha.beta-gamma_1"), "alpha.beta-gamma_1");
    }

    #[test]
    fn test_hyphenate_group() {
        assert_eq!(hyphenate_group("Fleet Commanders"), "Fleet-Commanders");
        assert_eq!(hyphenate_group("Corp [TICK]"), "Corp-[TICK]");
    }
}
