//! Seam to the host browser's tab and tab-group API
//!
//! Everything the core needs from the browser goes through [`Browser`],
//! so the engine can be driven by a real extension shell or by a mock in
//! tests. Calls are suspension points; the service serializes its own
//! state mutations around them.

use async_trait::async_trait;

/// Point-in-time view of an open tab
#[derive(Debug, Clone)]
pub struct LiveTab {
    /// Session-scoped browser handle. Not a stable identity.
    pub id: i64,
    pub title: Option<String>,
    pub url: Option<String>,
    pub favicon: Option<String>,
    pub active: bool,
    /// Native tab-group handle, if the tab is currently grouped
    pub group_id: Option<i64>,
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// All tabs in the current window
    async fn query_current_window(&self) -> Result<Vec<LiveTab>, String>;

    /// Request closure of the given tabs. Failures here must not be
    /// treated as fatal by callers that already persisted their state.
    async fn close_tabs(&self, tab_ids: &[i64]) -> Result<(), String>;

    async fn create_tab(&self, url: &str, active: bool) -> Result<LiveTab, String>;

    /// Put the given tabs into a new native group, returning its handle
    async fn group_tabs(&self, tab_ids: &[i64]) -> Result<i64, String>;

    async fn update_group_title(&self, group_id: i64, title: &str) -> Result<(), String>;

    async fn group_title(&self, group_id: i64) -> Result<Option<String>, String>;
}

/// Pages that must never be archived, clustered, or injected into:
/// browser-internal pages, the extension store, and extension pages.
pub fn is_restricted_url(url: &str) -> bool {
    url.starts_with("chrome://")
        || url.starts_with("https://chrome.google.com/webstore")
        || url.starts_with("chrome-extension://")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    /// Scriptable in-memory browser for tests. Records every mutating
    /// call so assertions can check ordering and arguments.
    pub struct MockBrowser {
        pub tabs: Mutex<Vec<LiveTab>>,
        pub closed: Mutex<Vec<i64>>,
        pub created: Mutex<Vec<String>>,
        pub renames: Mutex<Vec<(i64, String)>>,
        pub group_titles: Mutex<HashMap<i64, String>>,
        pub fail_close: Mutex<bool>,
        next_id: AtomicI64,
        next_group_id: AtomicI64,
    }

    impl MockBrowser {
        pub fn new(tabs: Vec<LiveTab>) -> Self {
            let next = tabs.iter().map(|t| t.id).max().unwrap_or(0) + 1;
            MockBrowser {
                tabs: Mutex::new(tabs),
                closed: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
                renames: Mutex::new(Vec::new()),
                group_titles: Mutex::new(HashMap::new()),
                fail_close: Mutex::new(false),
                next_id: AtomicI64::new(next),
                next_group_id: AtomicI64::new(100),
            }
        }

        pub fn live_tab(id: i64, title: &str, url: &str, active: bool) -> LiveTab {
            LiveTab {
                id,
                title: Some(title.to_string()),
                url: Some(url.to_string()),
                favicon: None,
                active,
                group_id: None,
            }
        }
    }

    #[async_trait]
    impl Browser for MockBrowser {
        async fn query_current_window(&self) -> Result<Vec<LiveTab>, String> {
            Ok(self.tabs.lock().unwrap().clone())
        }

        async fn close_tabs(&self, tab_ids: &[i64]) -> Result<(), String> {
            if *self.fail_close.lock().unwrap() {
                return Err("tabs could not be closed".to_string());
            }
            self.closed.lock().unwrap().extend_from_slice(tab_ids);
            self.tabs
                .lock()
                .unwrap()
                .retain(|t| !tab_ids.contains(&t.id));
            Ok(())
        }

        async fn create_tab(&self, url: &str, active: bool) -> Result<LiveTab, String> {
            self.created.lock().unwrap().push(url.to_string());
            let tab = LiveTab {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                title: None,
                url: Some(url.to_string()),
                favicon: None,
                active,
                group_id: None,
            };
            self.tabs.lock().unwrap().push(tab.clone());
            Ok(tab)
        }

        async fn group_tabs(&self, tab_ids: &[i64]) -> Result<i64, String> {
            let group_id = self.next_group_id.fetch_add(1, Ordering::SeqCst);
            let mut tabs = self.tabs.lock().unwrap();
            for tab in tabs.iter_mut() {
                if tab_ids.contains(&tab.id) {
                    tab.group_id = Some(group_id);
                }
            }
            Ok(group_id)
        }

        async fn update_group_title(&self, group_id: i64, title: &str) -> Result<(), String> {
            self.renames.lock().unwrap().push((group_id, title.to_string()));
            self.group_titles
                .lock()
                .unwrap()
                .insert(group_id, title.to_string());
            Ok(())
        }

        async fn group_title(&self, group_id: i64) -> Result<Option<String>, String> {
            Ok(self.group_titles.lock().unwrap().get(&group_id).cloned())
        }
    }
}
