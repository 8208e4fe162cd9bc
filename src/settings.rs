//! User-facing configuration
//!
//! Stored as a JSON file in the app data directory. The core reads these
//! flags but does not own them; the embedding shell writes them on the
//! user's behalf and hands a snapshot to the service.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Merge newly archived tabs into the existing tree instead of
    /// re-clustering everything on each read
    #[serde(default = "default_true")]
    pub incremental_grouping: bool,
    #[serde(default)]
    pub custom_instruction_enabled: bool,
    #[serde(default)]
    pub custom_instruction: Option<String>,
    /// Classification endpoint, `{mode, payload}` POST target
    #[serde(default = "default_oracle_endpoint")]
    pub oracle_endpoint: String,
    #[serde(default)]
    pub oracle_api_key: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_oracle_endpoint() -> String {
    "http://127.0.0.1:8787/v1/classify-tabs".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            incremental_grouping: true,
            custom_instruction_enabled: false,
            custom_instruction: None,
            oracle_endpoint: default_oracle_endpoint(),
            oracle_api_key: None,
        }
    }
}

impl Settings {
    /// Load settings from disk, falling back to defaults on a missing or
    /// unreadable file
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(text) => match serde_json::from_str(&text) {
                    Ok(settings) => return settings,
                    Err(e) => eprintln!("[Settings] Failed to parse {}: {}", path.display(), e),
                },
                Err(e) => eprintln!("[Settings] Failed to read {}: {}", path.display(), e),
            }
        }
        Settings::default()
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;
        fs::write(path, text).map_err(|e| e.to_string())
    }

    /// Default settings file location under the user's data directory
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tabvault")
            .join("settings.json")
    }

    /// The custom instruction text, only when the toggle is on and the
    /// text is non-empty
    pub fn active_custom_instruction(&self) -> Option<&str> {
        if !self.custom_instruction_enabled {
            return None;
        }
        self.custom_instruction
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }
}
