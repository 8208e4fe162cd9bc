//! Message-passing surface of the engine
//!
//! One tokio task owns every state mutation. UI collaborators and the
//! browser event feed both enqueue onto the same channel, which
//! serializes reconciliation runs against live-tab updates without any
//! locking; the dedup guard in the merge remains as defense in depth.
//! Requests are answered over oneshot channels; observers get
//! fire-and-forget notifications on a broadcast channel.

use crate::ai_client::{AiClient, OracleTransport};
use crate::archive::ArchiveStore;
use crate::backup::{BackupManager, RestoreOutcome};
use crate::bridge::LiveBridge;
use crate::browser::{is_restricted_url, Browser, LiveTab};
use crate::models::{ClusterTree, TabRecord};
use crate::reconcile::{GroupingQuery, Reconciler};
use crate::settings::Settings;
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Tabs to materialize as a live native group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenGroupData {
    pub title: String,
    #[serde(default)]
    pub tabs: Vec<TabRecord>,
}

/// Requests from UI collaborators, wire-compatible with the extension's
/// message format (`action` tag, camelCase fields)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    Organize,
    #[serde(rename_all = "camelCase")]
    GetClosedTabs {
        #[serde(default)]
        force_regroup: bool,
        #[serde(default)]
        force_refresh: bool,
    },
    #[serde(rename_all = "camelCase")]
    RemoveFromClosedTabs { tab_id: String },
    #[serde(rename_all = "camelCase")]
    OpenAndRemoveTab { tab_id: String, url: String },
    #[serde(rename_all = "camelCase")]
    OpenTab {
        #[serde(default)]
        tab_id: Option<String>,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    OpenInGroup { group_data: OpenGroupData },
    ClearAllStoredTabs,
    RestoreGrouping,
    CheckBackupExists,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Response {
    Status {
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    GroupedTabs {
        grouped_tabs: ClusterTree,
    },
    #[serde(rename_all = "camelCase")]
    OpenedGroup {
        status: String,
        group_id: i64,
        tabs: Vec<TabRecord>,
    },
    Restore(RestoreOutcome),
    BackupExists {
        exists: bool,
    },
    Error {
        status: String,
        message: String,
    },
}

impl Response {
    fn success() -> Self {
        Response::Status { status: "success".to_string() }
    }

    fn error(message: impl Into<String>) -> Self {
        Response::Error { status: "error".to_string(), message: message.into() }
    }
}

/// Fire-and-forget events pushed to observers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    TabGroupUpdated { grouped_tabs: ClusterTree },
    #[serde(rename_all = "camelCase")]
    UpdateActiveTab { tab_id: String, url: String, title: String },
}

/// Raw browser events fed into the service by the embedding shell
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    TabCreated(LiveTab),
    /// A tab finished loading
    TabCompleted(LiveTab),
    TabActivated(LiveTab),
    GroupRenamed { group_id: i64, title: String },
    TabRemoved { tab_id: i64 },
}

enum Envelope {
    Request { request: Request, reply: oneshot::Sender<Response> },
    Event(BrowserEvent),
}

#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Envelope>,
    notifications: broadcast::Sender<Notification>,
}

impl ServiceHandle {
    pub async fn request(&self, request: Request) -> Result<Response, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Request { request, reply })
            .await
            .map_err(|_| "service stopped".to_string())?;
        rx.await.map_err(|_| "service dropped the request".to_string())
    }

    pub async fn submit_event(&self, event: BrowserEvent) -> Result<(), String> {
        self.tx
            .send(Envelope::Event(event))
            .await
            .map_err(|_| "service stopped".to_string())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }
}

pub struct TabService {
    browser: Arc<dyn Browser>,
    storage: Arc<Storage>,
    archive: ArchiveStore,
    reconciler: Reconciler,
    backups: BackupManager,
    bridge: LiveBridge,
    settings: Settings,
    notifications: broadcast::Sender<Notification>,
}

impl TabService {
    /// Start the single-writer worker and return its handle
    pub fn spawn(
        storage: Arc<Storage>,
        browser: Arc<dyn Browser>,
        transport: impl OracleTransport + 'static,
        settings: Settings,
    ) -> ServiceHandle {
        let (tx, rx) = mpsc::channel(32);
        let (notifications, _) = broadcast::channel(64);

        let service = TabService {
            browser,
            storage: storage.clone(),
            archive: ArchiveStore::new(storage.clone()),
            reconciler: Reconciler::new(storage.clone(), AiClient::new(transport)),
            backups: BackupManager::new(storage.clone()),
            bridge: LiveBridge::new(storage),
            settings,
            notifications: notifications.clone(),
        };
        tokio::spawn(service.run(rx));

        ServiceHandle { tx, notifications }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::Request { request, reply } => {
                    let response = self.handle_request(request).await;
                    let _ = reply.send(response);
                }
                Envelope::Event(event) => self.handle_event(event).await,
            }
        }
    }

    fn notify_tree(&self, tree: ClusterTree) {
        let _ = self
            .notifications
            .send(Notification::TabGroupUpdated { grouped_tabs: tree });
    }

    async fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::Organize => {
                if let Err(e) = self.backups.backup() {
                    eprintln!("[Service] Backup before organize failed: {}", e);
                }
                match self
                    .archive
                    .archive_current_window(self.browser.as_ref(), true)
                    .await
                {
                    Ok(_) => Response::success(),
                    Err(e) => Response::error(e),
                }
            }
            Request::GetClosedTabs { force_regroup, force_refresh } => {
                let query = GroupingQuery { force_regroup, force_refresh };
                match self.reconciler.current_grouping(query, &self.settings).await {
                    Ok(outcome) => {
                        if outcome.mutated {
                            self.notify_tree(outcome.tree.clone());
                        }
                        Response::GroupedTabs { grouped_tabs: outcome.tree }
                    }
                    Err(e) => Response::error(e),
                }
            }
            Request::RemoveFromClosedTabs { tab_id } => match self.archive.remove(&tab_id) {
                Ok(()) => Response::success(),
                Err(e) => Response::error(e),
            },
            Request::OpenAndRemoveTab { tab_id, url } => {
                if let Err(e) = self.browser.create_tab(&url, true).await {
                    return Response::error(e);
                }
                match self.archive.remove(&tab_id) {
                    Ok(()) => Response::success(),
                    Err(e) => Response::error(e),
                }
            }
            Request::OpenTab { url, .. } => match self.browser.create_tab(&url, true).await {
                Ok(_) => Response::success(),
                Err(e) => Response::error(e),
            },
            Request::OpenInGroup { group_data } => {
                match self
                    .bridge
                    .open_in_group(self.browser.as_ref(), &group_data.title, &group_data.tabs)
                    .await
                {
                    Ok(opened) => {
                        // the live-group link is a persisted tree mutation
                        if let Ok(Some(tree)) = self.storage.load_tree() {
                            self.notify_tree(tree);
                        }
                        Response::OpenedGroup {
                            status: "success".to_string(),
                            group_id: opened.group_id,
                            tabs: opened.tabs,
                        }
                    }
                    Err(e) => Response::error(e),
                }
            }
            Request::ClearAllStoredTabs => match self.archive.clear() {
                Ok(()) => Response::success(),
                Err(e) => Response::error(e),
            },
            Request::RestoreGrouping => Response::Restore(self.backups.restore()),
            Request::CheckBackupExists => match self.backups.exists() {
                Ok(exists) => Response::BackupExists { exists },
                Err(e) => Response::error(e),
            },
        }
    }

    async fn handle_event(&mut self, event: BrowserEvent) {
        match event {
            BrowserEvent::TabCreated(tab) => {
                match self.bridge.handle_tab_created(self.browser.as_ref(), &tab).await {
                    Ok(Some(tree)) => self.notify_tree(tree),
                    Ok(None) => {}
                    Err(e) => eprintln!("[Service] Tab-created handling failed: {}", e),
                }
            }
            BrowserEvent::TabCompleted(tab) => {
                if tab.active {
                    self.notify_active_tab(&tab);
                }
                if tab.group_id.is_some() {
                    match self.bridge.handle_tab_completed(&tab) {
                        Ok(Some(tree)) => self.notify_tree(tree),
                        Ok(None) => {}
                        Err(e) => eprintln!("[Service] Tab-completed handling failed: {}", e),
                    }
                }
            }
            BrowserEvent::TabActivated(tab) => self.notify_active_tab(&tab),
            BrowserEvent::GroupRenamed { group_id, title } => {
                self.bridge.handle_group_renamed(group_id, &title);
            }
            BrowserEvent::TabRemoved { tab_id } => self.bridge.handle_tab_removed(tab_id),
        }
    }

    fn notify_active_tab(&self, tab: &LiveTab) {
        let url = tab.url.clone().unwrap_or_default();
        if url.is_empty() || is_restricted_url(&url) {
            return;
        }
        let _ = self.notifications.send(Notification::UpdateActiveTab {
            tab_id: tab.id.to_string(),
            url,
            title: tab.title.clone().unwrap_or_default(),
        });
    }
}
