//! Content-addressed interaction cache — the lookup-before-call layer.
//!
//! Hybrid design: the database index gives O(1) lookup by `cache_key`; the
//! blob store holds the actual record. A checksum mismatch on the blob is
//! logged and treated as a cache miss so the call proceeds against the
//! provider.

use std::collections::BTreeMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use ps_domain::error::{Error, Result};
use ps_domain::interaction::{InteractionIndexEntry, InteractionRecord};

use crate::blob::BlobStore;
use crate::interactions::{InteractionIndexRepository, NewInteraction};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache key
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Call context folded into the cache key. A `BTreeMap` keeps the JSON
/// serialization deterministically sorted.
pub type CacheContext = BTreeMap<String, serde_json::Value>;

/// 32-hex content hash of `prompt` plus the canonicalized context.
/// Collision-resistant, not cryptographically authenticated.
pub fn cache_key(prompt: &str, context: &CacheContext) -> String {
    let canonical = serde_json::to_string(context).unwrap_or_else(|_| "{}".into());
    let payload = format!("{prompt}|||{canonical}");
    hex::encode(Sha256::digest(payload.as_bytes()))[..32].to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interaction store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Index + blob pair presented as one store to the LLM gateway.
pub struct InteractionStore {
    blobs: BlobStore,
    index: Arc<dyn InteractionIndexRepository>,
}

/// A cache hit: the stored record plus the index row that pointed at it.
pub struct CachedInteraction {
    pub record: InteractionRecord,
    pub entry: InteractionIndexEntry,
}

impl InteractionStore {
    pub fn new(blobs: BlobStore, index: Arc<dyn InteractionIndexRepository>) -> Self {
        Self { blobs, index }
    }

    /// Look up a previous interaction by cache key. Missing blobs and
    /// checksum mismatches count as misses.
    pub async fn lookup(&self, key: &str) -> Result<Option<CachedInteraction>> {
        let entry = match self.index.get_by_cache_key(key).await? {
            Some(e) => e,
            None => return Ok(None),
        };

        match self.blobs.read_interaction(&entry.file_path) {
            Ok(read) if read.checksum_ok => Ok(Some(CachedInteraction {
                record: read.record,
                entry,
            })),
            Ok(_) => {
                let err = Error::IntegrityMismatch(entry.file_path.clone());
                tracing::warn!(
                    cache_key = %key,
                    error = %err,
                    "cached blob failed integrity check, treating as miss"
                );
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(
                    cache_key = %key,
                    file_path = %entry.file_path,
                    error = %e,
                    "cached blob unreadable, treating as miss"
                );
                Ok(None)
            }
        }
    }

    /// Persist a fresh interaction: blob first, then the index row that
    /// points at it. Returns the blob path.
    pub async fn record(&self, record: &InteractionRecord, key: &str) -> Result<String> {
        let file_path = self.blobs.write_interaction(record)?;
        self.index
            .insert(NewInteraction {
                run_id: record.run_id.clone(),
                interaction_type: record.interaction_type,
                batch_id: record.batch_id,
                attempt: record.attempt,
                file_path: file_path.clone(),
                cache_key: key.to_string(),
            })
            .await?;
        Ok(file_path)
    }

    /// Index a cache hit under a new run without writing a new blob.
    /// The fresh row points at the existing file.
    pub async fn record_replay(
        &self,
        hit: &CachedInteraction,
        run_id: &str,
        batch_id: u32,
        key: &str,
    ) -> Result<()> {
        self.index
            .insert(NewInteraction {
                run_id: run_id.to_string(),
                interaction_type: hit.record.interaction_type,
                batch_id,
                attempt: hit.record.attempt,
                file_path: hit.entry.file_path.clone(),
                cache_key: key.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Archive a rendered prompt template for a run.
    pub fn archive_prompt(&self, run_id: &str, prompt_type: &str, content: &str) -> Result<String> {
        self.blobs.write_prompt(run_id, prompt_type, content)
    }

    /// All interaction blob paths of a run.
    pub fn list_run(&self, run_id: &str) -> Result<Vec<String>> {
        self.blobs.list_run(run_id)
    }

    /// Administrative: drop all blobs of a run.
    pub fn clear_run(&self, run_id: &str) -> Result<usize> {
        self.blobs.clear_run(run_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
