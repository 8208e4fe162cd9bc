//! Archive of closed tabs: the bounded master list plus the queue of
//! tabs not yet merged into the grouping tree
//!
//! Repository object owning its persistence boundaries: every mutation
//! loads, edits, and saves through [`Storage`] rather than keeping
//! ambient in-memory copies of the lists.

use crate::browser::{is_restricted_url, Browser};
use crate::models::TabRecord;
use crate::storage::Storage;
use crate::utils::now_millis;
use std::sync::Arc;

/// Master list is truncated to this many most-recent records
pub const MAX_ARCHIVED_TABS: usize = 100;

pub struct ArchiveStore {
    storage: Arc<Storage>,
}

impl ArchiveStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        ArchiveStore { storage }
    }

    pub fn master(&self) -> Result<Vec<TabRecord>, String> {
        self.storage.load_master().map_err(|e| e.to_string())
    }

    pub fn unprocessed(&self) -> Result<Vec<TabRecord>, String> {
        self.storage.load_unprocessed().map_err(|e| e.to_string())
    }

    /// Snapshot and close every archivable tab in the current window.
    ///
    /// Records are persisted before any tab is closed, so a failing close
    /// can leave tabs open but never lose data. Restricted pages and
    /// (optionally) the active tab are skipped.
    pub async fn archive_current_window(
        &self,
        browser: &dyn Browser,
        exclude_active: bool,
    ) -> Result<Vec<TabRecord>, String> {
        let tabs = browser.query_current_window().await?;

        let mut newly_closed = Vec::new();
        let mut to_close = Vec::new();
        let now = now_millis();
        for tab in &tabs {
            if exclude_active && tab.active {
                continue;
            }
            let url = match tab.url.as_deref() {
                Some(url) if !url.is_empty() && !is_restricted_url(url) => url.to_string(),
                _ => continue,
            };
            newly_closed.push(TabRecord {
                id: uuid::Uuid::new_v4().to_string(),
                title: tab.title.clone().unwrap_or_default(),
                url,
                favicon: tab.favicon.clone(),
                closed_timestamp: Some(now),
                live_tab_id: Some(tab.id),
            });
            to_close.push(tab.id);
        }

        if newly_closed.is_empty() {
            return Ok(newly_closed);
        }

        let mut master = newly_closed.clone();
        master.extend(self.storage.load_master().map_err(|e| e.to_string())?);
        master.truncate(MAX_ARCHIVED_TABS);

        let mut unprocessed = newly_closed.clone();
        unprocessed.extend(self.storage.load_unprocessed().map_err(|e| e.to_string())?);

        self.storage
            .save_archive(&master, &unprocessed)
            .map_err(|e| e.to_string())?;

        println!("[Archive] Archived {} tabs from current window", newly_closed.len());

        if let Err(e) = browser.close_tabs(&to_close).await {
            // Tabs stay open; the archive already holds their records
            eprintln!("[Archive] Failed to close tabs: {}", e);
        }

        Ok(newly_closed)
    }

    /// Remove a record from both lists by id. Idempotent.
    pub fn remove(&self, tab_id: &str) -> Result<(), String> {
        let mut master = self.storage.load_master().map_err(|e| e.to_string())?;
        let mut unprocessed = self.storage.load_unprocessed().map_err(|e| e.to_string())?;
        master.retain(|tab| tab.id != tab_id);
        unprocessed.retain(|tab| tab.id != tab_id);
        self.storage
            .save_archive(&master, &unprocessed)
            .map_err(|e| e.to_string())
    }

    /// Wipe the archive and everything derived from it. Stored identities
    /// are meaningless once the lists are gone, so the grouping tree and
    /// backup go too.
    pub fn clear(&self) -> Result<(), String> {
        self.storage.clear_all().map_err(|e| e.to_string())
    }
}
