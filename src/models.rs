//! Core data model: archived tabs and the two-level grouping tree
//!
//! Wire names (camelCase) match the persisted document format, so trees
//! written by earlier versions of the extension remain readable.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A snapshot of a tab taken when it was archived.
///
/// `id` is a stable identity assigned at archive time. The browser's own
/// tab handle is session-scoped and reused after restarts, so it is kept
/// only as the `live_tab_id` back-reference and never used as a key in
/// persisted lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRecord {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_timestamp: Option<i64>,
    /// Ephemeral browser tab handle this record was captured from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_tab_id: Option<i64>,
}

impl TabRecord {
    /// Fresh record with a generated stable id
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        TabRecord {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            url: url.into(),
            favicon: None,
            closed_timestamp: None,
            live_tab_id: None,
        }
    }
}

/// Second-level bucket inside a [`Group`]. Insertion order is display order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subgroup {
    pub title: String,
    #[serde(default)]
    pub tabs: Vec<TabRecord>,
}

impl Subgroup {
    pub fn with_tab(title: impl Into<String>, tab: TabRecord) -> Self {
        Subgroup { title: title.into(), tabs: vec![tab] }
    }
}

/// Top-level category in the grouping tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub title: String,
    #[serde(default)]
    pub subgroups: Vec<Subgroup>,
    /// Weak link to a currently-open native tab group. Set only while the
    /// user has materialized this group into live tabs; clearable and
    /// reassignable at any time.
    #[serde(
        rename = "liveChromeGroupId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub live_group_id: Option<i64>,
}

impl Group {
    pub fn new(title: impl Into<String>) -> Self {
        Group { title: title.into(), subgroups: Vec::new(), live_group_id: None }
    }

    /// Exact-title subgroup lookup. All tree navigation goes through the
    /// find_* helpers so the matching rule lives in one place.
    pub fn find_subgroup_mut(&mut self, title: &str) -> Option<&mut Subgroup> {
        self.subgroups.iter_mut().find(|sg| sg.title == title)
    }
}

/// The persisted two-level taxonomy plus the ungrouped bucket.
///
/// Invariant: once reconciliation has completed for a tab, its id appears
/// exactly once in the tree (in one subgroup, or in `ungrouped`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTree {
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub ungrouped: Vec<TabRecord>,
}

impl ClusterTree {
    /// Exact-title group lookup (see [`Group::find_subgroup_mut`])
    pub fn find_group_mut(&mut self, title: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.title == title)
    }

    pub fn find_group_by_live_id_mut(&mut self, live_group_id: i64) -> Option<&mut Group> {
        self.groups
            .iter_mut()
            .find(|g| g.live_group_id == Some(live_group_id))
    }

    /// Locate a record anywhere in the tree by its live browser handle
    pub fn find_tab_by_live_id_mut(&mut self, live_tab_id: i64) -> Option<&mut TabRecord> {
        for group in &mut self.groups {
            for subgroup in &mut group.subgroups {
                if let Some(tab) = subgroup
                    .tabs
                    .iter_mut()
                    .find(|t| t.live_tab_id == Some(live_tab_id))
                {
                    return Some(tab);
                }
            }
        }
        self.ungrouped
            .iter_mut()
            .find(|t| t.live_tab_id == Some(live_tab_id))
    }

    /// All tab ids currently placed anywhere in the tree
    pub fn tab_ids(&self) -> HashSet<String> {
        let mut ids = HashSet::new();
        for group in &self.groups {
            for subgroup in &group.subgroups {
                for tab in &subgroup.tabs {
                    ids.insert(tab.id.clone());
                }
            }
        }
        for tab in &self.ungrouped {
            ids.insert(tab.id.clone());
        }
        ids
    }

    pub fn tab_count(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| &g.subgroups)
            .map(|sg| sg.tabs.len())
            .sum::<usize>()
            + self.ungrouped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.ungrouped.is_empty()
    }
}

/// Single-slot snapshot of the grouping tree, overwritten on each backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingBackup {
    pub data: ClusterTree,
    pub timestamp: i64,
    pub version: String,
}
