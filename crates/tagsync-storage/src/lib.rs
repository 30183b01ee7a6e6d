//! File-backed target store: identifier index, modified marks, and atomic
//! hash-addressed snapshot writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tagsync_core::{TagPatch, TaggedEntity};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tagsync-storage";

/// Working copy of the target dataset inside a store root.
pub const WORKING_FILE: &str = "targets.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no target entity with id `{0}`")]
    UnknownEntity(String),
    #[error("target entity has no id and cannot be patched")]
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTarget {
    #[serde(flatten)]
    pub entity: TaggedEntity,
    #[serde(default)]
    pub modified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub saved_at: DateTime<Utc>,
    pub entities: Vec<StoredTarget>,
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct TargetStore {
    root: PathBuf,
    entities: Vec<StoredTarget>,
    by_id: HashMap<String, usize>,
}

impl TargetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entities: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn from_entities(root: impl Into<PathBuf>, entities: Vec<TaggedEntity>) -> Self {
        let mut store = Self::new(root);
        for entity in entities {
            store.insert(StoredTarget {
                entity,
                modified: false,
            });
        }
        store
    }

    /// Opens the working file under `root`; a missing file yields an empty store.
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let mut store = Self::new(root);
        let path = store.root.join(WORKING_FILE);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(store);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let snapshot: TargetSnapshot =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        for stored in snapshot.entities {
            store.insert(stored);
        }
        Ok(store)
    }

    fn insert(&mut self, stored: StoredTarget) {
        if let Some(id) = &stored.entity.id {
            if self.by_id.contains_key(id) {
                warn!(id = %id, "duplicate target id, keeping the first");
            } else {
                self.by_id.insert(id.clone(), self.entities.len());
            }
        }
        self.entities.push(stored);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &TaggedEntity> {
        self.entities.iter().map(|s| &s.entity)
    }

    pub fn to_entities(&self) -> Vec<TaggedEntity> {
        self.entities().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&TaggedEntity> {
        self.by_id.get(id).map(|i| &self.entities[*i].entity)
    }

    pub fn is_modified(&self, id: &str) -> bool {
        self.by_id
            .get(id)
            .map(|i| self.entities[*i].modified)
            .unwrap_or(false)
    }

    /// All entities carrying `key=value`. More than one means the target
    /// dataset has duplicate links.
    pub fn find_by_tag(&self, key: &str, value: &str) -> Vec<&TaggedEntity> {
        self.entities()
            .filter(|e| e.tag(key) == Some(value))
            .collect()
    }

    pub fn modified(&self) -> Vec<&TaggedEntity> {
        self.entities
            .iter()
            .filter(|s| s.modified)
            .map(|s| &s.entity)
            .collect()
    }

    /// Applies `patch` to the entity with `id` and marks it modified.
    pub fn apply_patch(&mut self, id: &str, patch: &TagPatch) -> Result<&TaggedEntity, StoreError> {
        let index = *self
            .by_id
            .get(id)
            .ok_or_else(|| StoreError::UnknownEntity(id.to_string()))?;
        let stored = &mut self.entities[index];
        stored.entity.apply_patch(patch);
        stored.modified = true;
        info!(id, %patch, "patched target entity");
        Ok(&stored.entity)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(&self, saved_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        let stamp = saved_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from("snapshots")
            .join(stamp)
            .join(format!("{content_hash}.json"))
    }

    /// Writes an immutable snapshot and then replaces the working file, both
    /// through a temp file and rename.
    pub async fn save(&self, saved_at: DateTime<Utc>) -> anyhow::Result<StoredSnapshot> {
        let span = info_span!("target_store_save", root = %self.root.display(), entities = self.entities.len());
        self.save_inner(saved_at).instrument(span).await
    }

    async fn save_inner(&self, saved_at: DateTime<Utc>) -> anyhow::Result<StoredSnapshot> {
        let snapshot = TargetSnapshot {
            saved_at,
            entities: self.entities.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot).context("serializing target snapshot")?;
        // hash the entities only so identical content dedupes across saves
        let content_hash = Self::sha256_hex(
            &serde_json::to_vec(&snapshot.entities).context("serializing entities for hashing")?,
        );
        let relative_path = self.snapshot_relative_path(saved_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            true
        } else {
            write_atomically(&absolute_path, &bytes).await?
        };
        write_atomically(&self.root.join(WORKING_FILE), &bytes).await?;

        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Returns `true` when another writer created the file first.
async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(true)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), path.display())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn sample(root: &Path) -> TargetStore {
        TargetStore::from_entities(
            root,
            vec![
                TaggedEntity::new()
                    .with_id("way/317205476")
                    .with_tag("name", "Spilloppen barnehage")
                    .with_tag("ref", "1016218"),
                TaggedEntity::new()
                    .with_id("node/1")
                    .with_tag("name", "Sol")
                    .with_tag("ref", "7"),
                TaggedEntity::new()
                    .with_id("node/2")
                    .with_tag("name", "Sol kopi")
                    .with_tag("ref", "7"),
            ],
        )
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            TargetStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn find_by_tag_exposes_duplicate_links() {
        let store = sample(Path::new("."));
        assert_eq!(store.find_by_tag("ref", "1016218").len(), 1);
        assert_eq!(store.find_by_tag("ref", "7").len(), 2);
        assert!(store.find_by_tag("ref", "404").is_empty());
    }

    #[test]
    fn patching_marks_entity_modified() {
        let mut store = sample(Path::new("."));
        let mut patch = TagPatch::new();
        patch.set("capacity", "25");
        let patched = store.apply_patch("node/1", &patch).expect("patch");
        assert_eq!(patched.tag("capacity"), Some("25"));
        assert!(store.is_modified("node/1"));
        assert!(!store.is_modified("node/2"));
        assert_eq!(store.modified().len(), 1);

        let err = store.apply_patch("node/404", &patch).unwrap_err();
        assert!(matches!(err, StoreError::UnknownEntity(id) if id == "node/404"));
    }

    #[tokio::test]
    async fn save_round_trips_and_deduplicates() {
        let dir = tempdir().expect("tempdir");
        let mut store = sample(dir.path());
        let mut patch = TagPatch::new();
        patch.delete("name");
        store.apply_patch("node/2", &patch).expect("patch");

        let first = store.save(ts()).await.expect("first save");
        let second = store.save(ts()).await.expect("second save");
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());

        let reopened = TargetStore::open(dir.path()).await.expect("open");
        assert_eq!(reopened.len(), 3);
        assert!(reopened.is_modified("node/2"));
        assert_eq!(reopened.get("node/2").and_then(|e| e.tag("name")), None);
    }

    #[tokio::test]
    async fn opening_an_empty_root_gives_an_empty_store() {
        let dir = tempdir().expect("tempdir");
        let store = TargetStore::open(dir.path()).await.expect("open");
        assert!(store.is_empty());
    }
}
