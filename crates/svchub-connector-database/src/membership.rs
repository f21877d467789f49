//! Group membership planning for the SQL connectors.
//!
//! The connectors read the stored membership, plan here, then issue the
//! statements the plan lists. Nothing in this module touches a database.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use svchub_connector::groups::GroupDiff;
use svchub_connector::naming::hyphenate_group;

/// Spell directory group names the way boards and Mumble store them.
pub(crate) fn normalize_groups(groups: &BTreeSet<String>) -> BTreeSet<String> {
    groups
        .iter()
        .map(|g| hyphenate_group(g.trim()))
        .filter(|g| !g.is_empty())
        .collect()
}

/// Statements needed to move one member from its current groups to the
/// desired ones on a board with a group table.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MembershipPlan {
    pub diff: GroupDiff,
    /// Groups to join that have no row on the board yet.
    pub to_create: BTreeSet<String>,
    /// Groups to leave, by name, with their board ids. Each is a prune
    /// candidate; the prune statement only removes empty managed groups.
    pub to_leave: BTreeMap<String, u64>,
}

impl MembershipPlan {
    /// Plan `diff` against the board's existing groups.
    pub fn new(diff: GroupDiff, known: &HashMap<String, u64>) -> Self {
        let to_create = diff
            .to_add
            .iter()
            .filter(|name| !known.contains_key(*name))
            .cloned()
            .collect();
        let to_leave = diff
            .to_remove
            .iter()
            .filter_map(|name| known.get(name).map(|id| (name.clone(), *id)))
            .collect();
        Self {
            diff,
            to_create,
            to_leave,
        }
    }
}
