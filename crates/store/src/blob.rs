//! Local blob store for raw LLM interaction records.
//!
//! Layout: `<storage_root>/<run_id>/interactions/<type>_batch_<id>_attempt_<n>_<ts>_<uuid8>.json`
//! plus an optional `<run_id>/prompts/` subdirectory for archived template
//! renderings. Every write embeds a SHA-256 checksum of the record; reads
//! recompute and compare it. Paths never collide — each includes a UUID.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use ps_domain::error::{Error, Result};
use ps_domain::interaction::InteractionRecord;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// On-disk shape: the record plus its content hash.
#[derive(Debug, Serialize, Deserialize)]
struct BlobEnvelope {
    checksum: String,
    record: InteractionRecord,
}

fn record_checksum(record: &InteractionRecord) -> Result<String> {
    let canonical = serde_json::to_vec(record)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Blob store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct BlobStore {
    root: PathBuf,
}

/// Result of a read: the record plus whether the stored checksum matched.
pub struct BlobRead {
    pub record: InteractionRecord,
    pub checksum_ok: bool,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a record and return its store-relative path.
    pub fn write_interaction(&self, record: &InteractionRecord) -> Result<String> {
        let rel_path = self.interaction_path(record);
        let full_path = self.root.join(&rel_path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let envelope = BlobEnvelope {
            checksum: record_checksum(record)?,
            record: record.clone(),
        };
        let json = serde_json::to_string_pretty(&envelope)?;
        std::fs::write(&full_path, json)?;
        tracing::debug!(path = %full_path.display(), "interaction blob written");
        Ok(rel_path)
    }

    /// Read a record back, verifying its checksum. A mismatch is reported
    /// via `checksum_ok = false` but the data is still returned — the
    /// caller decides whether to discard it.
    pub fn read_interaction(&self, rel_path: &str) -> Result<BlobRead> {
        let full_path = self.root.join(rel_path);
        let raw = std::fs::read_to_string(&full_path)
            .map_err(|e| Error::NotFound(format!("blob {rel_path}: {e}")))?;
        let envelope: BlobEnvelope = serde_json::from_str(&raw)?;

        let actual = record_checksum(&envelope.record)?;
        let checksum_ok = actual == envelope.checksum;
        if !checksum_ok {
            tracing::warn!(
                path = %full_path.display(),
                expected = %envelope.checksum,
                actual = %actual,
                "blob checksum mismatch"
            );
        }
        Ok(BlobRead {
            record: envelope.record,
            checksum_ok,
        })
    }

    /// Archive a rendered prompt template for a run. Returns the relative path.
    pub fn write_prompt(&self, run_id: &str, prompt_type: &str, content: &str) -> Result<String> {
        let rel_path = format!("{run_id}/prompts/{prompt_type}_prompt.txt");
        let full_path = self.root.join(&rel_path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full_path, content)?;
        Ok(rel_path)
    }

    /// All interaction blob paths of a run, sorted for stable listings.
    pub fn list_run(&self, run_id: &str) -> Result<Vec<String>> {
        let dir = self.root.join(run_id).join("interactions");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                paths.push(format!(
                    "{run_id}/interactions/{}",
                    entry.file_name().to_string_lossy()
                ));
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Administrative cleanup: delete all blobs of a run. Returns how many
    /// files were removed.
    pub fn clear_run(&self, run_id: &str) -> Result<usize> {
        let dir = self.root.join(run_id);
        if !dir.exists() {
            return Ok(0);
        }
        let count = walk_count(&dir)?;
        std::fs::remove_dir_all(&dir)?;
        Ok(count)
    }

    fn interaction_path(&self, record: &InteractionRecord) -> String {
        let ts = Utc::now().format("%Y%m%d_%H%M%S");
        let unique = Uuid::new_v4().simple().to_string();
        format!(
            "{}/interactions/{}_batch_{}_attempt_{}_{}_{}.json",
            record.run_id,
            record.interaction_type.as_str(),
            record.batch_id,
            record.attempt,
            ts,
            &unique[..8]
        )
    }
}

fn walk_count(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            count += walk_count(&entry.path())?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use ps_domain::interaction::InteractionKind;

    fn record(run_id: &str) -> InteractionRecord {
        InteractionRecord {
            run_id: run_id.into(),
            interaction_type: InteractionKind::Extraction,
            batch_id: 1,
            attempt: 1,
            timestamp: Utc::now(),
            prompt: "prompt text".into(),
            response_text: r#"{"a":1}"#.into(),
            response_parsed: serde_json::json!({"a": 1}),
            latency_ms: 42,
            input_tokens: 10,
            output_tokens: 3,
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();

        let rel = store.write_interaction(&record("RUN_A")).unwrap();
        assert!(rel.starts_with("RUN_A/interactions/extraction_batch_1_attempt_1_"));

        let read = store.read_interaction(&rel).unwrap();
        assert!(read.checksum_ok);
        assert_eq!(read.record.prompt, "prompt text");
        assert_eq!(read.record.response_parsed["a"], 1);
    }

    #[test]
    fn tampered_blob_reports_checksum_mismatch_but_returns_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let rel = store.write_interaction(&record("RUN_A")).unwrap();

        let full = dir.path().join(&rel);
        let tampered = std::fs::read_to_string(&full)
            .unwrap()
            .replace("prompt text", "tampered text");
        std::fs::write(&full, tampered).unwrap();

        let read = store.read_interaction(&rel).unwrap();
        assert!(!read.checksum_ok);
        assert_eq!(read.record.prompt, "tampered text");
    }

    #[test]
    fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        assert!(store.read_interaction("RUN_A/interactions/nope.json").is_err());
    }

    #[test]
    fn paths_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let rec = record("RUN_A");
        let a = store.write_interaction(&rec).unwrap();
        let b = store.write_interaction(&rec).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn list_run_returns_only_that_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        store.write_interaction(&record("RUN_A")).unwrap();
        store.write_interaction(&record("RUN_A")).unwrap();
        store.write_interaction(&record("RUN_B")).unwrap();

        let listing = store.list_run("RUN_A").unwrap();
        assert_eq!(listing.len(), 2);
        assert!(listing.iter().all(|p| p.starts_with("RUN_A/")));
        assert!(store.list_run("RUN_MISSING").unwrap().is_empty());
    }

    #[test]
    fn prompt_archive_is_layout_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let rel = store.write_prompt("RUN_A", "extraction", "template body").unwrap();
        assert_eq!(rel, "RUN_A/prompts/extraction_prompt.txt");
        let content = std::fs::read_to_string(dir.path().join(rel)).unwrap();
        assert_eq!(content, "template body");
    }

    #[test]
    fn clear_run_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        store.write_interaction(&record("RUN_A")).unwrap();
        store.write_prompt("RUN_A", "extraction", "x").unwrap();

        let removed = store.clear_run("RUN_A").unwrap();
        assert_eq!(removed, 2);
        assert!(store.list_run("RUN_A").unwrap().is_empty());
        assert_eq!(store.clear_run("RUN_A").unwrap(), 0);
    }
}
