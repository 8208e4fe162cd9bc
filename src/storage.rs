//! Persisted state: a keyed JSON-document store on SQLite
//!
//! The extension's state is a handful of documents (master archive,
//! unprocessed queue, grouping tree, backup slot). They live in a single
//! `state` table. Writes that must be observed together, like the
//! grouping tree and the unprocessed queue, go through one transaction.

use crate::models::{ClusterTree, GroupingBackup, TabRecord};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const MASTER_KEY: &str = "master_tabs";
const UNPROCESSED_KEY: &str = "unprocessed_tabs";
const GROUPED_KEY: &str = "grouped_tabs";
const BACKUP_KEY: &str = "grouping_backup";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub struct Storage {
    conn: Mutex<Connection>,
    #[cfg(test)]
    corrupt_next_tree_write: std::sync::atomic::AtomicBool,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let storage = Storage {
            conn: Mutex::new(conn),
            #[cfg(test)]
            corrupt_next_tree_write: std::sync::atomic::AtomicBool::new(false),
        };
        storage.init()?;
        Ok(storage)
    }

    fn init(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn read_doc<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM state WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn write_doc<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let text = serde_json::to_string(value)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, text],
        )?;
        Ok(())
    }

    fn delete_docs(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM state WHERE key = ?1", params![key])?;
        }
        tx.commit()?;
        Ok(())
    }

    // ==================== Archive lists ====================

    pub fn load_master(&self) -> Result<Vec<TabRecord>, StorageError> {
        Ok(self.read_doc(MASTER_KEY)?.unwrap_or_default())
    }

    pub fn load_unprocessed(&self) -> Result<Vec<TabRecord>, StorageError> {
        Ok(self.read_doc(UNPROCESSED_KEY)?.unwrap_or_default())
    }

    /// Persist both archive lists in one transaction
    pub fn save_archive(
        &self,
        master: &[TabRecord],
        unprocessed: &[TabRecord],
    ) -> Result<(), StorageError> {
        let master_text = serde_json::to_string(master)?;
        let unprocessed_text = serde_json::to_string(unprocessed)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![MASTER_KEY, master_text],
        )?;
        tx.execute(
            "INSERT INTO state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![UNPROCESSED_KEY, unprocessed_text],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ==================== Grouping tree ====================

    pub fn load_tree(&self) -> Result<Option<ClusterTree>, StorageError> {
        self.read_doc(GROUPED_KEY)
    }

    pub fn save_tree(&self, tree: &ClusterTree) -> Result<(), StorageError> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self.corrupt_next_tree_write.swap(false, Ordering::SeqCst) {
                // Simulates a store that acknowledges the write but drops it
                return self.write_doc(GROUPED_KEY, &ClusterTree::default());
            }
        }
        self.write_doc(GROUPED_KEY, tree)
    }

    /// Persist the merged tree and empty the unprocessed queue as a single
    /// write, so readers never observe one without the other
    pub fn save_tree_and_clear_unprocessed(&self, tree: &ClusterTree) -> Result<(), StorageError> {
        let tree_text = serde_json::to_string(tree)?;
        let empty: Vec<TabRecord> = Vec::new();
        let empty_text = serde_json::to_string(&empty)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![GROUPED_KEY, tree_text],
        )?;
        tx.execute(
            "INSERT INTO state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![UNPROCESSED_KEY, empty_text],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ==================== Backup slot ====================

    pub fn load_backup(&self) -> Result<Option<GroupingBackup>, StorageError> {
        self.read_doc(BACKUP_KEY)
    }

    pub fn save_backup(&self, backup: &GroupingBackup) -> Result<(), StorageError> {
        self.write_doc(BACKUP_KEY, backup)
    }

    pub fn backup_exists(&self) -> Result<bool, StorageError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM state WHERE key = ?1",
                params![BACKUP_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ==================== Wipes ====================

    /// Remove every persisted document: archive lists, tree, and backup.
    /// Used by "clear all"; archived identities become meaningless, so the
    /// derived structures go with them.
    pub fn clear_all(&self) -> Result<(), StorageError> {
        self.delete_docs(&[MASTER_KEY, UNPROCESSED_KEY, GROUPED_KEY, BACKUP_KEY])
    }

    #[cfg(test)]
    pub fn corrupt_next_tree_write(&self) {
        self.corrupt_next_tree_write
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Group, Subgroup};

    fn tab(id: &str) -> TabRecord {
        TabRecord {
            id: id.to_string(),
            title: format!("Tab {}", id),
            url: format!("https://example.com/{}", id),
            favicon: None,
            closed_timestamp: Some(1000),
            live_tab_id: None,
        }
    }

    fn tree_with(id: &str) -> ClusterTree {
        ClusterTree {
            groups: vec![Group {
                title: "Dev".into(),
                subgroups: vec![Subgroup { title: "React".into(), tabs: vec![tab(id)] }],
                live_group_id: None,
            }],
            ungrouped: vec![],
        }
    }

    #[test]
    fn test_archive_round_trip() {
        let storage = Storage::in_memory().unwrap();
        assert!(storage.load_master().unwrap().is_empty());
        storage.save_archive(&[tab("1"), tab("2")], &[tab("2")]).unwrap();
        assert_eq!(storage.load_master().unwrap().len(), 2);
        assert_eq!(storage.load_unprocessed().unwrap().len(), 1);
    }

    #[test]
    fn test_save_tree_and_clear_unprocessed() {
        let storage = Storage::in_memory().unwrap();
        storage.save_archive(&[tab("1")], &[tab("1")]).unwrap();
        storage.save_tree_and_clear_unprocessed(&tree_with("1")).unwrap();
        assert_eq!(storage.load_tree().unwrap().unwrap(), tree_with("1"));
        assert!(storage.load_unprocessed().unwrap().is_empty());
        // master list is untouched
        assert_eq!(storage.load_master().unwrap().len(), 1);
    }

    #[test]
    fn test_backup_slot_overwrites() {
        let storage = Storage::in_memory().unwrap();
        assert!(!storage.backup_exists().unwrap());
        let first = GroupingBackup { data: tree_with("1"), timestamp: 1, version: "1.0".into() };
        let second = GroupingBackup { data: tree_with("2"), timestamp: 2, version: "1.0".into() };
        storage.save_backup(&first).unwrap();
        storage.save_backup(&second).unwrap();
        assert_eq!(storage.load_backup().unwrap().unwrap(), second);
        assert!(storage.backup_exists().unwrap());
    }

    #[test]
    fn test_clear_all_removes_everything() {
        let storage = Storage::in_memory().unwrap();
        storage.save_archive(&[tab("1")], &[tab("1")]).unwrap();
        storage.save_tree(&tree_with("1")).unwrap();
        storage
            .save_backup(&GroupingBackup { data: tree_with("1"), timestamp: 1, version: "1.0".into() })
            .unwrap();
        storage.clear_all().unwrap();
        assert!(storage.load_master().unwrap().is_empty());
        assert!(storage.load_unprocessed().unwrap().is_empty());
        assert!(storage.load_tree().unwrap().is_none());
        assert!(!storage.backup_exists().unwrap());
    }

    #[test]
    fn test_on_disk_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabvault.db");
        {
            let storage = Storage::new(&path).unwrap();
            storage.save_tree(&tree_with("1")).unwrap();
        }
        let storage = Storage::new(&path).unwrap();
        assert_eq!(storage.load_tree().unwrap().unwrap(), tree_with("1"));
    }
}
