//! Three-way reconciliation of tag sets: (old source, new source, current
//! target) → no change, an unambiguous patch, or the full list of conflicts.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tagsync_core::{
    Advisory, ConflictKind, ConflictReason, MergeOutcome, MergeReport, TagPatch, TaggedEntity,
    Tags,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePolicy {
    /// Slow-moving integer counters where small target drift is tolerated.
    pub tolerant_keys: BTreeSet<String>,
    /// Exclusive bound on `|target - old|` for tolerant keys.
    pub numeric_tolerance: i64,
    /// Keys whose modification is dropped when the target lacks them.
    pub ignorable_keys: BTreeSet<String>,
    /// Keys excluded from the diff; a change raises an advisory instead.
    pub watched_keys: BTreeSet<String>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            tolerant_keys: BTreeSet::from(["capacity".to_string()]),
            numeric_tolerance: 10,
            ignorable_keys: BTreeSet::new(),
            watched_keys: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    policy: MergePolicy,
}

impl MergeEngine {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    /// Classifies every key in `old ∪ new` and aggregates the result. Never
    /// stops at the first conflict.
    pub fn reconcile(&self, old: &Tags, new: &Tags, target: &Tags) -> MergeOutcome {
        let keys = old
            .keys()
            .chain(new.keys())
            .filter(|key| !self.policy.watched_keys.contains(*key))
            .collect::<BTreeSet<_>>();

        let mut patch = TagPatch::new();
        let mut conflicts = Vec::new();
        let mut conflict = |key: &str, kind: ConflictKind| {
            let reason = ConflictReason {
                key: key.to_string(),
                kind,
                old: old.get(key).cloned(),
                new: new.get(key).cloned(),
                target: target.get(key).cloned(),
            };
            warn!(%reason, "unresolved conflict");
            conflicts.push(reason);
        };

        for key in keys {
            let current = target.get(key);
            match (old.get(key), new.get(key)) {
                (None, Some(added)) => match current {
                    None => {
                        debug!(key, value = %added, "source added tag");
                        patch.set(key, added);
                    }
                    Some(value) if value == added => {}
                    Some(_) => conflict(key, ConflictKind::AddedDiffers),
                },
                (Some(removed), None) => match current {
                    None => {}
                    Some(value) if value == removed => {
                        debug!(key, value = %removed, "source removed tag");
                        patch.delete(key);
                    }
                    Some(_) => conflict(key, ConflictKind::RemovedButEdited),
                },
                (Some(before), Some(after)) if before == after => {}
                (Some(before), Some(after)) => match current {
                    Some(value) if value == after => {
                        debug!(key, "target already caught up");
                    }
                    Some(value) if value == before => {
                        debug!(key, from = %before, to = %after, "source modified tag");
                        patch.set(key, after);
                    }
                    Some(value) if self.within_tolerance(key, before, value) => {
                        debug!(key, target = %value, to = %after, "drift within tolerance, folding new value");
                        patch.set(key, after);
                    }
                    Some(_) => conflict(key, ConflictKind::ModifiedButEdited),
                    None if self.policy.ignorable_keys.contains(key) => {
                        debug!(key, "modified tag absent from target, ignoring");
                    }
                    None => conflict(key, ConflictKind::ModifiedButMissing),
                },
                (None, None) => {}
            }
        }

        if !conflicts.is_empty() {
            MergeOutcome::Conflict(conflicts)
        } else if patch.is_empty() {
            MergeOutcome::NoChange
        } else {
            MergeOutcome::Update(patch)
        }
    }

    /// Entity-level reconciliation: the tag outcome plus advisories for a
    /// moved position or a changed watched key.
    pub fn reconcile_entities(
        &self,
        old: &TaggedEntity,
        new: &TaggedEntity,
        target: &TaggedEntity,
    ) -> MergeReport {
        MergeReport {
            outcome: self.reconcile(&old.tags, &new.tags, &target.tags),
            advisories: self.advisories(old, new),
        }
    }

    /// Notes for a human that never block an update: a moved position and
    /// every watched key whose value changed.
    pub fn advisories(&self, old: &TaggedEntity, new: &TaggedEntity) -> Vec<Advisory> {
        let mut advisories = Vec::new();

        if let (Some(before), Some(after)) = (old.position, new.position) {
            if before != after {
                warn!(
                    entity = %new.label(),
                    "position changed; check whether the entity moved or the coordinate improved"
                );
                advisories.push(Advisory::PositionChanged {
                    old: before,
                    new: after,
                });
            }
        }

        for key in &self.policy.watched_keys {
            let before = old.tags.get(key);
            let after = new.tags.get(key);
            if before != after {
                warn!(entity = %new.label(), key = %key, "watched tag changed");
                advisories.push(Advisory::WatchedKeyChanged {
                    key: key.clone(),
                    old: before.cloned(),
                    new: after.cloned(),
                });
            }
        }

        advisories
    }

    fn within_tolerance(&self, key: &str, old: &str, target: &str) -> bool {
        if !self.policy.tolerant_keys.contains(key) {
            return false;
        }
        match (old.parse::<i64>(), target.parse::<i64>()) {
            (Ok(a), Ok(b)) => a.abs_diff(b) < self.policy.numeric_tolerance.max(0) as u64,
            _ => false,
        }
    }
}
