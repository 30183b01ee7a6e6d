//! Collaborator contracts around the core: record sources that hand batches of
//! `TaggedEntity` to the engines, and patch sinks that persist approved
//! patches.

use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tagsync_core::{Correspondence, Position, TagPatch, TaggedEntity, Tags};
use tagsync_storage::{StoreError, TargetStore};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

pub const CRATE_NAME: &str = "tagsync-adapters";

/// Bundle file names inside a [`DirectorySource`] root.
pub const PREVIOUS_BUNDLE: &str = "authoritative/previous.json";
pub const CURRENT_BUNDLE: &str = "authoritative/current.json";
pub const TARGET_STORE_DIR: &str = "target";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("record {entity}: tag `{key}` has a structured value; only scalars are allowed")]
    InvalidTagValue { entity: String, key: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Snapshot {
    Previous,
    Current,
}

/// Supplies the three batches the engines consume.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn authoritative(&self, snapshot: Snapshot) -> Result<Vec<TaggedEntity>, AdapterError>;

    async fn targets(&self) -> Result<Vec<TaggedEntity>, AdapterError>;
}

/// Accepts an approved patch for a linked pair and persists it.
#[async_trait]
pub trait PatchSink: Send + Sync {
    async fn apply(&self, correspondence: &Correspondence, patch: &TagPatch) -> Result<(), AdapterError>;
}

// ---------------------------------------------------------------------------
// Snapshot bundles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub dataset: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub entities: Vec<BundleEntity>,
}

/// Entity as collectors write it: loosely typed tag values, flat coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub tags: JsonMap<String, JsonValue>,
}

pub fn load_snapshot_bundle(path: impl AsRef<Path>) -> Result<SnapshotBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Turns loosely typed values into tag strings: booleans become `yes`/`no`,
/// numbers their decimal text; null and empty values are dropped.
pub fn normalize_tags(entity: &str, raw: &JsonMap<String, JsonValue>) -> Result<Tags, AdapterError> {
    let mut tags = Tags::new();
    for (key, value) in raw {
        let text = match value {
            JsonValue::Null => continue,
            JsonValue::Bool(true) => "yes".to_string(),
            JsonValue::Bool(false) => "no".to_string(),
            JsonValue::Number(n) => n.to_string(),
            JsonValue::String(s) if s.is_empty() => continue,
            JsonValue::String(s) => s.clone(),
            JsonValue::Array(_) | JsonValue::Object(_) => {
                return Err(AdapterError::InvalidTagValue {
                    entity: entity.to_string(),
                    key: key.clone(),
                })
            }
        };
        tags.insert(key.clone(), text);
    }
    Ok(tags)
}

impl BundleEntity {
    pub fn to_core(&self, index: usize) -> Result<TaggedEntity, AdapterError> {
        let label = self.id.clone().unwrap_or_else(|| format!("#{index}"));
        let position = match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(Position::new(lat, lon)),
            _ => None,
        };
        Ok(TaggedEntity {
            id: self.id.clone(),
            position,
            tags: normalize_tags(&label, &self.tags)?,
        })
    }
}

impl SnapshotBundle {
    pub fn to_entities(&self) -> Result<Vec<TaggedEntity>, AdapterError> {
        self.entities
            .iter()
            .enumerate()
            .map(|(i, e)| e.to_core(i))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Reads authoritative bundles and the target store from one directory:
///
/// ```text
/// <root>/authoritative/previous.json
/// <root>/authoritative/current.json
/// <root>/target/targets.json
/// ```
///
/// A missing previous bundle is an empty batch (first run).
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn target_store_root(&self) -> PathBuf {
        self.root.join(TARGET_STORE_DIR)
    }

    fn bundle_path(&self, snapshot: Snapshot) -> PathBuf {
        match snapshot {
            Snapshot::Previous => self.root.join(PREVIOUS_BUNDLE),
            Snapshot::Current => self.root.join(CURRENT_BUNDLE),
        }
    }
}

#[async_trait]
impl RecordSource for DirectorySource {
    fn source_id(&self) -> &str {
        "directory"
    }

    async fn authoritative(&self, snapshot: Snapshot) -> Result<Vec<TaggedEntity>, AdapterError> {
        let path = self.bundle_path(snapshot);
        let exists = tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
        if snapshot == Snapshot::Previous && !exists {
            debug!(path = %path.display(), "no previous bundle, treating as empty");
            return Ok(Vec::new());
        }
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let bundle: SnapshotBundle =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        debug!(dataset = %bundle.dataset, captured_at = %bundle.captured_at, entities = bundle.entities.len(), "loaded bundle");
        bundle.to_entities()
    }

    async fn targets(&self) -> Result<Vec<TaggedEntity>, AdapterError> {
        let store = TargetStore::open(self.target_store_root()).await?;
        Ok(store.to_entities())
    }
}

/// In-memory batches, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub previous: Vec<TaggedEntity>,
    pub current: Vec<TaggedEntity>,
    pub targets: Vec<TaggedEntity>,
}

#[async_trait]
impl RecordSource for MemorySource {
    fn source_id(&self) -> &str {
        "memory"
    }

    async fn authoritative(&self, snapshot: Snapshot) -> Result<Vec<TaggedEntity>, AdapterError> {
        Ok(match snapshot {
            Snapshot::Previous => self.previous.clone(),
            Snapshot::Current => self.current.clone(),
        })
    }

    async fn targets(&self) -> Result<Vec<TaggedEntity>, AdapterError> {
        Ok(self.targets.clone())
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedPatch {
    pub target_id: Option<String>,
    pub patch: TagPatch,
    pub patched: TaggedEntity,
}

/// Records every patch it receives together with the patched entity.
#[derive(Debug, Default)]
pub struct MemoryPatchSink {
    applied: StdMutex<Vec<AppliedPatch>>,
}

impl MemoryPatchSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<AppliedPatch> {
        self.applied
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PatchSink for MemoryPatchSink {
    async fn apply(&self, correspondence: &Correspondence, patch: &TagPatch) -> Result<(), AdapterError> {
        let mut patched = correspondence.target.clone();
        patched.apply_patch(patch);
        self.applied
            .lock()
            .map_err(|_| AdapterError::Message("patch log poisoned".into()))?
            .push(AppliedPatch {
                target_id: correspondence.target.id.clone(),
                patch: patch.clone(),
                patched,
            });
        Ok(())
    }
}

/// Applies patches to a [`TargetStore`] by target id, marking them modified.
/// Persisting the store stays with the caller.
#[derive(Debug)]
pub struct StorePatchSink {
    store: Mutex<TargetStore>,
}

impl StorePatchSink {
    pub fn new(store: TargetStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, TargetStore> {
        self.store.lock().await
    }

    pub fn into_inner(self) -> TargetStore {
        self.store.into_inner()
    }
}

#[async_trait]
impl PatchSink for StorePatchSink {
    async fn apply(&self, correspondence: &Correspondence, patch: &TagPatch) -> Result<(), AdapterError> {
        let id = correspondence.target.id.as_deref().ok_or(StoreError::Anonymous)?;
        self.store.lock().await.apply_patch(id, patch)?;
        Ok(())
    }
}
