//! tabvault: AI-assisted archiving and grouping engine for browser tabs
//!
//! The engine closes and archives a window's tabs, asks an external
//! classification oracle to cluster them into a two-level taxonomy
//! (groups → subgroups), and keeps that persisted tree consistent with
//! live browser events while tolerating an oracle that is occasionally
//! wrong. The embedding shell (extension UI, browser adapter) talks to
//! the engine through the message-passing surface in [`service`].

pub mod ai_client;
pub mod archive;
pub mod backup;
pub mod bridge;
pub mod browser;
pub mod models;
pub mod reconcile;
pub mod service;
pub mod settings;
pub mod storage;
pub mod utils;

pub use ai_client::{
    Action, AiClient, ClassifyMode, HttpTransport, OracleError, OracleTransport, PromptContext,
    RetryConfig, RetryingTransport,
};
pub use archive::{ArchiveStore, MAX_ARCHIVED_TABS};
pub use backup::{BackupManager, RestoreOutcome};
pub use bridge::LiveBridge;
pub use browser::{is_restricted_url, Browser, LiveTab};
pub use models::{ClusterTree, Group, GroupingBackup, Subgroup, TabRecord};
pub use reconcile::{apply_actions, GroupingQuery, Reconciler};
pub use service::{BrowserEvent, Notification, Request, Response, ServiceHandle, TabService};
pub use settings::Settings;
pub use storage::{Storage, StorageError};
