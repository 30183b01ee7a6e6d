//! Core record model shared by the linkage and reconciliation engines.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "tagsync-core";

/// Tag key → tag value. Ordered so every diff and report is deterministic.
pub type Tags = BTreeMap<String, String>;

/// Latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Squared euclidean distance in raw degrees. Unit-less on purpose; only
    /// used as a relative proximity signal.
    pub fn squared_distance(&self, other: &Position) -> f64 {
        let dlat = self.lat - other.lat;
        let dlon = self.lon - other.lon;
        dlat * dlat + dlon * dlon
    }
}

/// The common unit flowing through linkage and reconciliation.
///
/// Authoritative records and target records share this shape. Collaborators
/// normalize their raw input into it; the core never rewrites keys or values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaggedEntity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub tags: Tags,
}

impl TaggedEntity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn at(mut self, lat: f64, lon: f64) -> Self {
        self.position = Some(Position::new(lat, lon));
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn has_tags(&self) -> bool {
        !self.tags.is_empty()
    }

    /// Short human label for logs: id, else name, else a placeholder.
    pub fn label(&self) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        match self.tag("name") {
            Some(name) => format!("\"{name}\""),
            None => "<unnamed>".to_string(),
        }
    }

    pub fn apply_patch(&mut self, patch: &TagPatch) {
        patch.apply_to(&mut self.tags);
    }
}

/// One instruction in a [`TagPatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum PatchOp {
    Set(String),
    /// Tombstone: remove the key from the target.
    Delete,
}

/// Tag-level change set computed by the merge engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagPatch(BTreeMap<String, PatchOp>);

impl TagPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), PatchOp::Set(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.0.insert(key.into(), PatchOp::Delete);
    }

    pub fn get(&self, key: &str) -> Option<&PatchOp> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PatchOp)> {
        self.0.iter()
    }

    pub fn apply_to(&self, tags: &mut Tags) {
        for (key, op) in &self.0 {
            match op {
                PatchOp::Set(value) => {
                    tags.insert(key.clone(), value.clone());
                }
                PatchOp::Delete => {
                    tags.remove(key);
                }
            }
        }
    }

    pub fn applied(&self, tags: &Tags) -> Tags {
        let mut out = tags.clone();
        self.apply_to(&mut out);
        out
    }
}

impl fmt::Display for TagPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .0
            .iter()
            .map(|(key, op)| match op {
                PatchOp::Set(value) => format!("{key}={value:?}"),
                PatchOp::Delete => format!("-{key}"),
            })
            .collect::<Vec<_>>();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Accepted 1:1 link between an authoritative record and a target record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub source_index: usize,
    pub target_index: usize,
    pub source: TaggedEntity,
    pub target: TaggedEntity,
    pub score: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Source added a key the target already holds with another value.
    AddedDiffers,
    /// Source removed a key whose target value was edited.
    RemovedButEdited,
    /// Source modified a key whose target value was edited.
    ModifiedButEdited,
    /// Source modified a key the target does not carry.
    ModifiedButMissing,
}

/// One key the merge engine could not reconcile, with all three values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReason {
    pub key: String,
    pub kind: ConflictKind,
    pub old: Option<String>,
    pub new: Option<String>,
    pub target: Option<String>,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<String>| match v {
            Some(v) => format!("{v:?}"),
            None => "<absent>".to_string(),
        };
        write!(
            f,
            "{}: old={} new={} target={} ({:?})",
            self.key,
            show(&self.old),
            show(&self.new),
            show(&self.target),
            self.kind
        )
    }
}

/// Result of three-way reconciliation for one linked pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum MergeOutcome {
    NoChange,
    Update(TagPatch),
    Conflict(Vec<ConflictReason>),
}

impl MergeOutcome {
    pub fn is_no_change(&self) -> bool {
        matches!(self, Self::NoChange)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn patch(&self) -> Option<&TagPatch> {
        match self {
            Self::Update(patch) => Some(patch),
            _ => None,
        }
    }

    pub fn conflicts(&self) -> &[ConflictReason] {
        match self {
            Self::Conflict(reasons) => reasons,
            _ => &[],
        }
    }
}

/// Non-blocking note for a human reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "advisory", rename_all = "snake_case")]
pub enum Advisory {
    /// The authoritative position moved; either the entity moved or the
    /// coordinate improved.
    PositionChanged { old: Position, new: Position },
    /// A key excluded from the diff changed value.
    WatchedKeyChanged {
        key: String,
        old: Option<String>,
        new: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    pub advisories: Vec<Advisory>,
}

/// Malformed input reported per entity. Never fatal to a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum EntityError {
    #[error("record #{index} ({label}) is missing required tag `{key}`")]
    MissingTag {
        index: usize,
        label: String,
        key: String,
    },
    #[error("record #{index} ({label}) carries no tags")]
    Untagged { index: usize, label: String },
}
