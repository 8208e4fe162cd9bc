//! Reconciliation engine: keeps the grouping tree consistent with the
//! archive
//!
//! Each "get current grouping" call selects one of four modes, in
//! precedence order: full regroup (forced, or first read with
//! incremental mode off), refresh-only, incremental integration
//! (unprocessed tabs pending, or no tree yet), cached.
//!
//! The merge is defended by a dedup guard rebuilt from the persisted
//! tree on every run: the oracle may re-assign an id that is already
//! placed (retried or duplicated integration), and the guard makes that
//! a no-op instead of a double insert.

use crate::ai_client::{Action, AiClient, PromptContext};
use crate::backup::BackupManager;
use crate::models::{ClusterTree, Group, Subgroup, TabRecord};
use crate::settings::Settings;
use crate::storage::Storage;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct GroupingQuery {
    pub force_regroup: bool,
    pub force_refresh: bool,
}

/// A grouping read, plus whether it wrote a new tree (callers broadcast
/// a change notification when it did)
#[derive(Debug, Clone)]
pub struct GroupingOutcome {
    pub tree: ClusterTree,
    pub mutated: bool,
}

pub struct Reconciler {
    storage: Arc<Storage>,
    client: AiClient,
    backups: BackupManager,
}

impl Reconciler {
    pub fn new(storage: Arc<Storage>, client: AiClient) -> Self {
        let backups = BackupManager::new(storage.clone());
        Reconciler { storage, client, backups }
    }

    /// Mode selection and execution for one grouping read
    pub async fn current_grouping(
        &self,
        query: GroupingQuery,
        settings: &Settings,
    ) -> Result<GroupingOutcome, String> {
        let tree = self.storage.load_tree().map_err(|e| e.to_string())?;
        let ctx = PromptContext::from_settings(settings);

        if query.force_regroup || (!settings.incremental_grouping && tree.is_none()) {
            return self.full_regroup(&ctx).await;
        }

        if query.force_refresh {
            return Ok(GroupingOutcome { tree: tree.unwrap_or_default(), mutated: false });
        }

        if settings.incremental_grouping {
            let unprocessed = self.storage.load_unprocessed().map_err(|e| e.to_string())?;
            if !unprocessed.is_empty() || tree.is_none() {
                return self.integrate(tree.unwrap_or_default(), unprocessed, &ctx).await;
            }
        }

        Ok(GroupingOutcome { tree: tree.unwrap_or_default(), mutated: false })
    }

    /// Reclassify the whole archive from scratch, replacing the tree
    async fn full_regroup(&self, ctx: &PromptContext) -> Result<GroupingOutcome, String> {
        if let Err(e) = self.backups.backup() {
            eprintln!("[Reconcile] Backup before regroup failed: {}", e);
        }

        let master = self.storage.load_master().map_err(|e| e.to_string())?;
        let tree = self.client.classify_full(&master, ctx).await;
        // full replacement; the unprocessed queue is superseded wholesale
        self.storage
            .save_tree_and_clear_unprocessed(&tree)
            .map_err(|e| e.to_string())?;
        Ok(GroupingOutcome { tree, mutated: true })
    }

    /// Merge the unprocessed queue into the existing tree
    async fn integrate(
        &self,
        mut tree: ClusterTree,
        new_tabs: Vec<TabRecord>,
        ctx: &PromptContext,
    ) -> Result<GroupingOutcome, String> {
        if new_tabs.is_empty() {
            return Ok(GroupingOutcome { tree, mutated: false });
        }

        match self.client.classify_incremental(&new_tabs, &tree, ctx).await {
            Ok(actions) => {
                apply_actions(&mut tree, &actions, &new_tabs);
            }
            Err(e) => {
                eprintln!("[Reconcile] Incremental classification failed: {}", e);
                let placed = tree.tab_ids();
                tree.ungrouped
                    .extend(new_tabs.into_iter().filter(|t| !placed.contains(&t.id)));
            }
        }

        self.storage
            .save_tree_and_clear_unprocessed(&tree)
            .map_err(|e| e.to_string())?;
        println!("[Reconcile] Incremental integration complete ({} tabs in tree)", tree.tab_count());
        Ok(GroupingOutcome { tree, mutated: true })
    }
}

/// Execute oracle actions against a working copy of the tree.
///
/// Per action: ids outside the new-tab set are dropped (hallucination),
/// ids already present anywhere in the tree are skipped (dedup guard),
/// missing target groups/subgroups are synthesized, and unknown action
/// kinds land the tab in `ungrouped`. No single action can abort the
/// batch.
pub fn apply_actions(tree: &mut ClusterTree, actions: &[Action], new_tabs: &[TabRecord]) {
    let lookup: HashMap<&str, &TabRecord> =
        new_tabs.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut placed = tree.tab_ids();

    for action in actions {
        let tab_id = action.tab_id();
        let record = match lookup.get(tab_id) {
            Some(record) => (*record).clone(),
            None => continue,
        };
        if placed.contains(tab_id) {
            eprintln!("[Reconcile] Skipping action for already-placed tab {}", tab_id);
            continue;
        }
        placed.insert(record.id.clone());

        match action {
            Action::AppendSubgroup { group_title, subgroup_title, .. } => {
                append_tab(tree, group_title, subgroup_title, record);
            }
            Action::InsertSubgroup { group_title, subgroup_title, .. }
            | Action::InsertGroup { group_title, subgroup_title, .. } => {
                insert_subgroup(tree, group_title, subgroup_title, record);
            }
            Action::Ungrouped { .. } => tree.ungrouped.push(record),
            Action::Unknown { kind, .. } => {
                eprintln!("[Reconcile] Unknown action type '{}', tab {} goes ungrouped", kind, tab_id);
                tree.ungrouped.push(record);
            }
        }
    }
}

/// Append into an existing subgroup, synthesizing group and subgroup as
/// needed when the oracle's targets do not exist
fn append_tab(tree: &mut ClusterTree, group_title: &str, subgroup_title: &str, tab: TabRecord) {
    match tree.find_group_mut(group_title) {
        Some(group) => match group.find_subgroup_mut(subgroup_title) {
            Some(subgroup) => subgroup.tabs.push(tab),
            None => group.subgroups.push(Subgroup::with_tab(subgroup_title, tab)),
        },
        None => push_new_group(tree, group_title, subgroup_title, tab),
    }
}

/// Add a fresh subgroup, reusing a same-titled group when one exists
fn insert_subgroup(tree: &mut ClusterTree, group_title: &str, subgroup_title: &str, tab: TabRecord) {
    match tree.find_group_mut(group_title) {
        Some(group) => group.subgroups.push(Subgroup::with_tab(subgroup_title, tab)),
        None => push_new_group(tree, group_title, subgroup_title, tab),
    }
}

fn push_new_group(tree: &mut ClusterTree, group_title: &str, subgroup_title: &str, tab: TabRecord) {
    let mut group = Group::new(group_title);
    group.subgroups.push(Subgroup::with_tab(subgroup_title, tab));
    tree.groups.push(group);
}
