use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage + prompt locations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root of the interaction blob store.
    #[serde(default = "d_storage_root")]
    pub storage_root: PathBuf,
    /// SQLite database file.
    #[serde(default = "d_db_path")]
    pub db_path: PathBuf,
    /// Directory holding the three prompt template files. Missing files
    /// fail startup.
    #[serde(default = "d_prompt_dir")]
    pub prompt_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            storage_root: d_storage_root(),
            db_path: d_db_path(),
            prompt_dir: d_prompt_dir(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_storage_root() -> PathBuf {
    PathBuf::from("./data/llm_logs")
}
fn d_db_path() -> PathBuf {
    PathBuf::from("./data/segmentation.db")
}
fn d_prompt_dir() -> PathBuf {
    PathBuf::from("./prompts")
}
