//! Live tab/group event bridge
//!
//! Keeps the persisted tree in step with tabs the user has reopened into
//! native groups: materializes a Group as live tabs, inserts placeholder
//! records as tabs appear inside tracked groups, and overwrites them
//! with final data once the page finishes loading.

use crate::browser::{is_restricted_url, Browser, LiveTab};
use crate::models::{ClusterTree, Subgroup, TabRecord};
use crate::storage::Storage;
use std::collections::HashMap;
use std::sync::Arc;

pub const PLACEHOLDER_TITLE: &str = "Loading...";
const DEFAULT_SUBGROUP_TITLE: &str = "Grouped Tabs";

/// In-memory view of one live native group the bridge watches
struct TrackedGroup {
    title: String,
    tabs: Vec<TabRecord>,
}

/// A materialized group as reported back to the caller
#[derive(Debug, Clone)]
pub struct OpenedGroup {
    pub group_id: i64,
    pub tabs: Vec<TabRecord>,
}

pub struct LiveBridge {
    storage: Arc<Storage>,
    active_groups: HashMap<i64, TrackedGroup>,
}

impl LiveBridge {
    pub fn new(storage: Arc<Storage>) -> Self {
        LiveBridge { storage, active_groups: HashMap::new() }
    }

    /// Open the given records as live tabs inside a fresh native group
    /// and link the stored Group to it
    pub async fn open_in_group(
        &mut self,
        browser: &dyn Browser,
        title: &str,
        tabs: &[TabRecord],
    ) -> Result<OpenedGroup, String> {
        let mut created = Vec::new();
        for tab in tabs {
            created.push(browser.create_tab(&tab.url, false).await?);
        }
        let tab_ids: Vec<i64> = created.iter().map(|t| t.id).collect();
        let group_id = browser.group_tabs(&tab_ids).await?;
        browser.update_group_title(group_id, title).await?;

        self.link_live_group(browser, title, group_id).await;

        let records: Vec<TabRecord> = created
            .into_iter()
            .map(|live| TabRecord {
                id: uuid::Uuid::new_v4().to_string(),
                title: live.title.unwrap_or_else(|| "New Tab".to_string()),
                url: live.url.unwrap_or_default(),
                favicon: live.favicon,
                closed_timestamp: None,
                live_tab_id: Some(live.id),
            })
            .collect();
        self.active_groups.insert(
            group_id,
            TrackedGroup { title: title.to_string(), tabs: records.clone() },
        );

        Ok(OpenedGroup { group_id, tabs: records })
    }

    /// Find the stored Group matching the chosen display title and inject
    /// the live group handle.
    ///
    /// The live group may have been materialized under a Subgroup's
    /// title; in that case the owning Group is linked instead and the
    /// live group is renamed to the Group's title.
    async fn link_live_group(&self, browser: &dyn Browser, target_title: &str, group_id: i64) {
        let mut tree = match self.storage.load_tree() {
            Ok(Some(tree)) => tree,
            Ok(None) => return,
            Err(e) => {
                eprintln!("[Bridge] Failed to load tree for linking: {}", e);
                return;
            }
        };

        let parent_title = if tree.find_group_mut(target_title).is_some() {
            Some(target_title.to_string())
        } else {
            let owner = tree
                .groups
                .iter()
                .find(|g| g.subgroups.iter().any(|sg| sg.title == target_title))
                .map(|g| g.title.clone());
            if let Some(title) = &owner {
                // keep the live group consistent with the stored Group
                if let Err(e) = browser.update_group_title(group_id, title).await {
                    eprintln!("[Bridge] Failed to rename live group {}: {}", group_id, e);
                }
                println!(
                    "[Bridge] Matched subgroup title '{}', linking parent group '{}'",
                    target_title, title
                );
            }
            owner
        };

        match parent_title {
            Some(title) => {
                if let Some(group) = tree.find_group_mut(&title) {
                    group.live_group_id = Some(group_id);
                }
                if let Err(e) = self.storage.save_tree(&tree) {
                    eprintln!("[Bridge] Failed to persist live group link: {}", e);
                }
            }
            None => {
                eprintln!("[Bridge] No stored group matching title '{}'", target_title);
            }
        }
    }

    /// A tab appeared inside a live group. If the group is linked to a
    /// stored Group, insert a placeholder record that the load-complete
    /// event will later overwrite. Returns the updated tree when a
    /// persisted mutation happened.
    pub async fn handle_tab_created(
        &mut self,
        browser: &dyn Browser,
        tab: &LiveTab,
    ) -> Result<Option<ClusterTree>, String> {
        let group_id = match tab.group_id {
            Some(id) => id,
            None => return Ok(None),
        };
        if tab.url.as_deref().map(is_restricted_url).unwrap_or(false) {
            return Ok(None);
        }

        let placeholder = TabRecord {
            id: uuid::Uuid::new_v4().to_string(),
            title: tab.title.clone().unwrap_or_else(|| PLACEHOLDER_TITLE.to_string()),
            url: tab.url.clone().unwrap_or_default(),
            favicon: tab.favicon.clone(),
            closed_timestamp: None,
            live_tab_id: Some(tab.id),
        };

        // track the group even if it was materialized outside this session
        if !self.active_groups.contains_key(&group_id) {
            let title = browser
                .group_title(group_id)
                .await?
                .unwrap_or_default();
            self.active_groups
                .insert(group_id, TrackedGroup { title, tabs: Vec::new() });
        }
        if let Some(tracked) = self.active_groups.get_mut(&group_id) {
            tracked.tabs.push(placeholder.clone());
        }

        let mut tree = match self.storage.load_tree().map_err(|e| e.to_string())? {
            Some(tree) => tree,
            None => return Ok(None),
        };
        let group = match tree.find_group_by_live_id_mut(group_id) {
            Some(group) => group,
            None => return Ok(None),
        };
        if group.subgroups.is_empty() {
            group.subgroups.push(Subgroup { title: DEFAULT_SUBGROUP_TITLE.to_string(), tabs: Vec::new() });
        }
        group.subgroups[0].tabs.push(placeholder);

        self.storage.save_tree(&tree).map_err(|e| e.to_string())?;
        Ok(Some(tree))
    }

    /// A tracked tab finished loading: overwrite its placeholder with the
    /// final title/url/favicon, keeping the stable id and any
    /// closed-timestamp already on the record
    pub fn handle_tab_completed(&mut self, tab: &LiveTab) -> Result<Option<ClusterTree>, String> {
        if tab.url.as_deref().map(is_restricted_url).unwrap_or(false) {
            return Ok(None);
        }
        let mut tree = match self.storage.load_tree().map_err(|e| e.to_string())? {
            Some(tree) => tree,
            None => return Ok(None),
        };

        let updated = match tree.find_tab_by_live_id_mut(tab.id) {
            Some(record) => {
                record.title = tab.title.clone().unwrap_or_default();
                record.url = tab.url.clone().unwrap_or_default();
                record.favicon = tab.favicon.clone();
                true
            }
            None => false,
        };
        if !updated {
            return Ok(None);
        }

        self.storage.save_tree(&tree).map_err(|e| e.to_string())?;
        println!("[Bridge] Final tab info stored for live tab {}", tab.id);
        Ok(Some(tree))
    }

    /// The user renamed a live group; mirror it in the tracking map
    pub fn handle_group_renamed(&mut self, group_id: i64, title: &str) {
        if let Some(tracked) = self.active_groups.get_mut(&group_id) {
            println!(
                "[Bridge] Live group {} renamed '{}' -> '{}'",
                group_id, tracked.title, title
            );
            tracked.title = title.to_string();
        }
    }

    /// A live tab closed; drop it from tracking and forget groups that
    /// have emptied out
    pub fn handle_tab_removed(&mut self, live_tab_id: i64) {
        self.active_groups
            .values_mut()
            .for_each(|g| g.tabs.retain(|t| t.live_tab_id != Some(live_tab_id)));
        self.active_groups.retain(|_, g| !g.tabs.is_empty());
    }

    #[cfg(test)]
    pub(crate) fn tracked_group_count(&self) -> usize {
        self.active_groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::MockBrowser;
    use crate::models::Group;

    fn stored_tree() -> ClusterTree {
        ClusterTree {
            groups: vec![Group {
                title: "Dev".into(),
                subgroups: vec![Subgroup {
                    title: "React".into(),
                    tabs: vec![TabRecord::new("React Docs", "https://react.dev")],
                }],
                live_group_id: None,
            }],
            ungrouped: vec![],
        }
    }

    #[tokio::test]
    async fn test_open_in_group_links_by_group_title() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        storage.save_tree(&stored_tree()).unwrap();
        let browser = MockBrowser::new(vec![]);
        let mut bridge = LiveBridge::new(storage.clone());

        let to_open = vec![TabRecord::new("React Docs", "https://react.dev")];
        let opened = bridge.open_in_group(&browser, "Dev", &to_open).await.unwrap();

        assert_eq!(opened.tabs.len(), 1);
        assert_eq!(browser.created.lock().unwrap().len(), 1);
        let tree = storage.load_tree().unwrap().unwrap();
        assert_eq!(tree.groups[0].live_group_id, Some(opened.group_id));
        assert_eq!(bridge.tracked_group_count(), 1);
    }

    #[tokio::test]
    async fn test_open_in_group_matches_subgroup_title_and_renames() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        storage.save_tree(&stored_tree()).unwrap();
        let browser = MockBrowser::new(vec![]);
        let mut bridge = LiveBridge::new(storage.clone());

        let to_open = vec![TabRecord::new("React Docs", "https://react.dev")];
        let opened = bridge.open_in_group(&browser, "React", &to_open).await.unwrap();

        // linked to the owning group, and the live group renamed to match
        let tree = storage.load_tree().unwrap().unwrap();
        assert_eq!(tree.groups[0].live_group_id, Some(opened.group_id));
        let renames = browser.renames.lock().unwrap();
        assert_eq!(renames.last().unwrap(), &(opened.group_id, "Dev".to_string()));
    }

    #[tokio::test]
    async fn test_placeholder_inserted_for_new_tab_in_linked_group() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let mut tree = stored_tree();
        tree.groups[0].live_group_id = Some(55);
        storage.save_tree(&tree).unwrap();
        let browser = MockBrowser::new(vec![]);
        browser.group_titles.lock().unwrap().insert(55, "Dev".into());
        let mut bridge = LiveBridge::new(storage.clone());

        let live = LiveTab {
            id: 9,
            title: None,
            url: Some("https://new.example".into()),
            favicon: None,
            active: false,
            group_id: Some(55),
        };
        let updated = bridge.handle_tab_created(&browser, &live).await.unwrap().unwrap();
        let tabs = &updated.groups[0].subgroups[0].tabs;
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[1].title, PLACEHOLDER_TITLE);
        assert_eq!(tabs[1].live_tab_id, Some(9));
    }

    #[tokio::test]
    async fn test_placeholder_creates_subgroup_when_group_is_bare() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let tree = ClusterTree {
            groups: vec![Group {
                title: "Dev".into(),
                subgroups: vec![],
                live_group_id: Some(55),
            }],
            ungrouped: vec![],
        };
        storage.save_tree(&tree).unwrap();
        let browser = MockBrowser::new(vec![]);
        let mut bridge = LiveBridge::new(storage.clone());

        let live = LiveTab {
            id: 9,
            title: None,
            url: Some("https://new.example".into()),
            favicon: None,
            active: false,
            group_id: Some(55),
        };
        let updated = bridge.handle_tab_created(&browser, &live).await.unwrap().unwrap();
        assert_eq!(updated.groups[0].subgroups[0].title, "Grouped Tabs");
        assert_eq!(updated.groups[0].subgroups[0].tabs.len(), 1);
    }

    #[tokio::test]
    async fn test_untracked_or_ungrouped_tabs_are_ignored() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        storage.save_tree(&stored_tree()).unwrap();
        let browser = MockBrowser::new(vec![]);
        let mut bridge = LiveBridge::new(storage.clone());

        let loose = LiveTab {
            id: 9,
            title: None,
            url: Some("https://new.example".into()),
            favicon: None,
            active: false,
            group_id: None,
        };
        assert!(bridge.handle_tab_created(&browser, &loose).await.unwrap().is_none());

        let restricted = LiveTab {
            id: 10,
            title: None,
            url: Some("chrome://settings".into()),
            favicon: None,
            active: false,
            group_id: Some(55),
        };
        assert!(bridge.handle_tab_created(&browser, &restricted).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_complete_overwrites_placeholder() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let mut tree = stored_tree();
        tree.groups[0].subgroups[0].tabs.push(TabRecord {
            id: "stable-id".into(),
            title: PLACEHOLDER_TITLE.into(),
            url: String::new(),
            favicon: None,
            closed_timestamp: Some(777),
            live_tab_id: Some(9),
        });
        storage.save_tree(&tree).unwrap();
        let mut bridge = LiveBridge::new(storage.clone());

        let live = LiveTab {
            id: 9,
            title: Some("Loaded Page".into()),
            url: Some("https://loaded.example".into()),
            favicon: Some("https://loaded.example/favicon.ico".into()),
            active: false,
            group_id: Some(55),
        };
        let updated = bridge.handle_tab_completed(&live).unwrap().unwrap();
        let record = &updated.groups[0].subgroups[0].tabs[1];
        assert_eq!(record.title, "Loaded Page");
        assert_eq!(record.url, "https://loaded.example");
        // stable identity and archive timestamp survive the overwrite
        assert_eq!(record.id, "stable-id");
        assert_eq!(record.closed_timestamp, Some(777));
    }

    #[tokio::test]
    async fn test_tab_removal_prunes_tracking() {
        let storage = Arc::new(Storage::in_memory().unwrap());
        storage.save_tree(&stored_tree()).unwrap();
        let browser = MockBrowser::new(vec![]);
        let mut bridge = LiveBridge::new(storage.clone());

        let to_open = vec![TabRecord::new("React Docs", "https://react.dev")];
        let opened = bridge.open_in_group(&browser, "Dev", &to_open).await.unwrap();
        assert_eq!(bridge.tracked_group_count(), 1);

        bridge.handle_group_renamed(opened.group_id, "Dev Tools");
        let live_id = opened.tabs[0].live_tab_id.unwrap();
        bridge.handle_tab_removed(live_id);
        assert_eq!(bridge.tracked_group_count(), 0);
    }
}
