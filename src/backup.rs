//! Single-slot backup of the grouping tree
//!
//! Taken immediately before destructive operations (organize, full
//! regroup) and restored only on explicit user request. Restore is the
//! one place that verifies its own write: a silent partial restore is
//! worse than a visible failure.

use crate::models::GroupingBackup;
use crate::storage::Storage;
use crate::utils::now_millis;
use serde::Serialize;
use std::sync::Arc;

pub const BACKUP_VERSION: &str = "1.0";

/// Result reported back to the user for a restore attempt
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RestoreOutcome {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl RestoreOutcome {
    fn success(message: impl Into<String>, timestamp: i64) -> Self {
        RestoreOutcome {
            status: "success".to_string(),
            message: message.into(),
            timestamp: Some(timestamp),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        RestoreOutcome { status: "error".to_string(), message: message.into(), timestamp: None }
    }
}

pub struct BackupManager {
    storage: Arc<Storage>,
}

impl BackupManager {
    pub fn new(storage: Arc<Storage>) -> Self {
        BackupManager { storage }
    }

    /// Snapshot the current tree into the single backup slot. Returns
    /// false when there is no tree to back up.
    pub fn backup(&self) -> Result<bool, String> {
        let tree = match self.storage.load_tree().map_err(|e| e.to_string())? {
            Some(tree) => tree,
            None => return Ok(false),
        };
        let backup = GroupingBackup {
            data: tree,
            timestamp: now_millis(),
            version: BACKUP_VERSION.to_string(),
        };
        self.storage.save_backup(&backup).map_err(|e| e.to_string())?;
        println!("[Backup] Snapshot taken at {}", backup.timestamp);
        Ok(true)
    }

    /// Overwrite the live tree with the backup, then read the write back
    /// and compare it byte-for-byte against the backup payload.
    pub fn restore(&self) -> RestoreOutcome {
        let backup = match self.storage.load_backup() {
            Ok(Some(backup)) => backup,
            Ok(None) => return RestoreOutcome::error("No backup found"),
            Err(e) => return RestoreOutcome::error(format!("Failed to restore backup: {}", e)),
        };

        if let Err(e) = self.storage.save_tree(&backup.data) {
            return RestoreOutcome::error(format!("Failed to restore backup: {}", e));
        }

        // Write verification: reread what was just written
        let written = match self.storage.load_tree() {
            Ok(tree) => tree,
            Err(e) => return RestoreOutcome::error(format!("Failed to restore backup: {}", e)),
        };
        let expected = serde_json::to_string(&backup.data).unwrap_or_default();
        let actual = written
            .map(|tree| serde_json::to_string(&tree).unwrap_or_default())
            .unwrap_or_default();
        if expected != actual {
            eprintln!("[Backup] Restore verification failed");
            return RestoreOutcome::error("Restore verification failed");
        }

        RestoreOutcome::success(
            "Previous tab grouping restored successfully",
            backup.timestamp,
        )
    }

    pub fn exists(&self) -> Result<bool, String> {
        self.storage.backup_exists().map_err(|e| e.to_string())
    }
}
