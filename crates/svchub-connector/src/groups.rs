//! Group membership reconciliation.
//!
//! Connectors never apply incremental add/remove requests from callers.
//! They read the external membership, diff it against the full desired set
//! and apply only the difference, so a second run with the same target is
//! a no-op.

use std::collections::BTreeSet;

/// The minimal set of membership changes that makes `current` equal `desired`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDiff {
    /// Groups the account must join.
    pub to_add: BTreeSet<String>,
    /// Groups the account must leave.
    pub to_remove: BTreeSet<String>,
}

impl GroupDiff {
    /// Compute the diff between the external and desired memberships.
    ///
    /// Order of the inputs does not matter; duplicates collapse.
    pub fn between<'a, C, D>(current: C, desired: D) -> Self
    where
        C: IntoIterator<Item = &'a String>,
        D: IntoIterator<Item = &'a String>,
    {
        let current: BTreeSet<&String> = current.into_iter().collect();
        let desired: BTreeSet<&String> = desired.into_iter().collect();

        Self {
            to_add: desired
                .difference(&current)
                .map(|g| (*g).clone())
                .collect(),
            to_remove: current
                .difference(&desired)
                .map(|g| (*g).clone())
                .collect(),
        }
    }

    /// True when no external mutation is needed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Number of membership mutations this diff implies.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.to_add.len() + self.to_remove.len()
    }
}

/// Parse a comma separated group column, ignoring blanks.
#[must_use]
pub fn parse_group_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect()
}

/// Render a group set as a comma separated column.
#[must_use]
pub fn join_group_list<'a, I>(groups: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    groups
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}
