//! Sync orchestration: loads batches from a record source, runs linkage or
//! three-way reconciliation, routes decisions to a reviewer and approved
//! patches to a sink.

pub mod linkage;
pub mod merge;
pub mod rules;
pub mod score;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tagsync_adapters::{PatchSink, RecordSource, Snapshot};
use tagsync_core::{
    Advisory, ConflictReason, Correspondence, MergeOutcome, MergeReport, TagPatch, TaggedEntity,
};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use linkage::{
    is_perfect_match, percentile, Candidate, LinkConfig, LinkReport, LinkageEngine, MatchResolver,
    Resolution, RowState, ScoreMatrix, ScriptedResolver, SkipAmbiguous, SkipReason, TakeBest,
};
pub use merge::{MergeEngine, MergePolicy};
pub use rules::SyncRules;
pub use score::{DistanceSign, ScoreBreakdown, ScoreWeights, Scorer};

pub const CRATE_NAME: &str = "tagsync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub rules_path: Option<PathBuf>,
    pub batch: bool,
    pub tag_links: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("TAGSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            rules_path: std::env::var("TAGSYNC_RULES").ok().map(PathBuf::from),
            batch: std::env::var("TAGSYNC_BATCH")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            tag_links: std::env::var("TAGSYNC_TAG_LINKS")
                .map(|v| parse_flag(&v))
                .unwrap_or(true),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Skip,
    Defer,
    Abort,
}

/// Decides what happens to an unambiguous update before it reaches the sink.
pub trait PatchReviewer {
    fn review(
        &mut self,
        correspondence: &Correspondence,
        report: &MergeReport,
        patch: &TagPatch,
    ) -> ReviewDecision;
}

impl<F> PatchReviewer for F
where
    F: FnMut(&Correspondence, &MergeReport, &TagPatch) -> ReviewDecision,
{
    fn review(
        &mut self,
        correspondence: &Correspondence,
        report: &MergeReport,
        patch: &TagPatch,
    ) -> ReviewDecision {
        self(correspondence, report, patch)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ApproveAll;

impl PatchReviewer for ApproveAll {
    fn review(&mut self, _: &Correspondence, _: &MergeReport, _: &TagPatch) -> ReviewDecision {
        ReviewDecision::Approve
    }
}

/// Batch mode: every update is left for a later interactive run.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferAll;

impl PatchReviewer for DeferAll {
    fn review(&mut self, _: &Correspondence, _: &MergeReport, _: &TagPatch) -> ReviewDecision {
        ReviewDecision::Defer
    }
}

// ---------------------------------------------------------------------------
// Run summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LinkRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub targets: usize,
    pub rejected: usize,
    pub accepted: usize,
    pub skipped: usize,
    pub tagged: usize,
    pub untagged: usize,
    pub aborted: bool,
    pub report: LinkReport,
}

impl LinkRunSummary {
    pub fn summary_line(&self) -> String {
        format!(
            "linked {}/{} sources against {} targets ({} skipped, {} rejected, {} targets tagged, {} failed to tag){}",
            self.accepted,
            self.sources,
            self.targets,
            self.skipped,
            self.rejected,
            self.tagged,
            self.untagged,
            if self.aborted { ", aborted" } else { "" }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    PreviouslyWithdrawn,
    WithdrawnUnlinked,
    WithdrawnLinked,
    NoRelevantChange,
    NotLinked,
    DuplicateLink,
    Resolved,
    Unresolved,
    Applied,
    Skipped,
    NeedsReview,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileEntry {
    pub key: String,
    pub status: ReconcileStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<TagPatch>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictReason>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<Advisory>,
}

impl ReconcileEntry {
    fn new(key: &str, status: ReconcileStatus) -> Self {
        Self {
            key: key.to_string(),
            status,
            target_ids: Vec::new(),
            patch: None,
            conflicts: Vec::new(),
            advisories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub aborted: bool,
    pub tallies: BTreeMap<ReconcileStatus, usize>,
    pub entries: Vec<ReconcileEntry>,
}

impl ReconcileRunSummary {
    pub fn count(&self, status: ReconcileStatus) -> usize {
        self.tallies.get(&status).copied().unwrap_or(0)
    }

    pub fn entries_with(&self, status: ReconcileStatus) -> impl Iterator<Item = &ReconcileEntry> {
        self.entries.iter().filter(move |e| e.status == status)
    }

    pub fn summary_line(&self) -> String {
        use ReconcileStatus::*;
        let mut line = format!(
            "{} records: {} unchanged, {} resolved, {} applied, {} skipped, {} need review, {} unresolved, {} not linked, {} duplicate links, {} withdrawn ({} still linked)",
            self.entries.len(),
            self.count(NoRelevantChange),
            self.count(Resolved),
            self.count(Applied),
            self.count(Skipped),
            self.count(NeedsReview),
            self.count(Unresolved),
            self.count(NotLinked),
            self.count(DuplicateLink),
            self.count(WithdrawnUnlinked) + self.count(WithdrawnLinked),
            self.count(WithdrawnLinked),
        );
        if self.aborted {
            line.push_str(", aborted");
        }
        line
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct SyncPipeline {
    linkage: LinkageEngine,
    merge: MergeEngine,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn PatchSink>,
    tag_links: bool,
}

impl SyncPipeline {
    pub fn new(rules: SyncRules, source: Arc<dyn RecordSource>, sink: Arc<dyn PatchSink>) -> Self {
        Self {
            linkage: LinkageEngine::new(Scorer::new(rules.scoring), rules.linkage),
            merge: MergeEngine::new(rules.merge),
            source,
            sink,
            tag_links: true,
        }
    }

    pub fn with_tag_links(mut self, tag_links: bool) -> Self {
        self.tag_links = tag_links;
        self
    }

    pub fn scorer(&self) -> &Scorer {
        self.linkage.scorer()
    }

    fn id_key(&self) -> &str {
        &self.scorer().weights().id_key
    }

    /// Links current authoritative records to targets. Accepted targets
    /// lacking the identifier tag get it written through the sink.
    pub async fn run_link(&self, resolver: &mut dyn MatchResolver) -> Result<LinkRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("link_run", %run_id, source = self.source.source_id());
        self.run_link_inner(run_id, resolver).instrument(span).await
    }

    async fn run_link_inner(
        &self,
        run_id: Uuid,
        resolver: &mut dyn MatchResolver,
    ) -> Result<LinkRunSummary> {
        let started_at = Utc::now();
        let sources = self
            .source
            .authoritative(Snapshot::Current)
            .await
            .context("loading current authoritative records")?;
        let targets = self.source.targets().await.context("loading target records")?;

        let report = self.linkage.link(&sources, &targets, resolver);

        let mut tagged = 0usize;
        let mut untagged = 0usize;
        if self.tag_links {
            for correspondence in &report.correspondences {
                let Some(patch) = self.link_tag_patch(correspondence) else {
                    continue;
                };
                match self.sink.apply(correspondence, &patch).await {
                    Ok(()) => tagged += 1,
                    Err(err) => {
                        warn!(entity = %correspondence.target.label(), %err, "failed to tag linked target");
                        untagged += 1;
                    }
                }
            }
        }

        let summary = LinkRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: sources.len(),
            targets: targets.len(),
            rejected: report.rejected.len(),
            accepted: report.correspondences.len(),
            skipped: report.skipped(),
            tagged,
            untagged,
            aborted: report.aborted,
            report,
        };
        info!("{}", summary.summary_line());
        Ok(summary)
    }

    fn link_tag_patch(&self, correspondence: &Correspondence) -> Option<TagPatch> {
        let key = self.id_key();
        let value = correspondence.source.tag(key)?;
        if correspondence.target.tag(key) == Some(value) {
            return None;
        }
        let mut patch = TagPatch::new();
        patch.set(key, value);
        Some(patch)
    }

    /// Diffs previous against current authoritative records and folds the
    /// change into the linked target of each, asking `reviewer` about every
    /// unambiguous update.
    pub async fn run_reconcile(&self, reviewer: &mut dyn PatchReviewer) -> Result<ReconcileRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", %run_id, source = self.source.source_id());
        self.run_reconcile_inner(run_id, reviewer).instrument(span).await
    }

    async fn run_reconcile_inner(
        &self,
        run_id: Uuid,
        reviewer: &mut dyn PatchReviewer,
    ) -> Result<ReconcileRunSummary> {
        let started_at = Utc::now();
        let previous = self
            .source
            .authoritative(Snapshot::Previous)
            .await
            .context("loading previous authoritative records")?;
        let current = self
            .source
            .authoritative(Snapshot::Current)
            .await
            .context("loading current authoritative records")?;
        let targets = self.source.targets().await.context("loading target records")?;

        let previous = self.index_by_key(&previous, "previous");
        let current = self.index_by_key(&current, "current");
        let mut keys = previous.keys().chain(current.keys()).cloned().collect::<Vec<_>>();
        keys.sort();
        keys.dedup();

        let mut entries = Vec::with_capacity(keys.len());
        let mut aborted = false;

        for key in &keys {
            let linked = targets
                .iter()
                .enumerate()
                .filter(|(_, t)| t.tag(self.id_key()) == Some(key.as_str()))
                .collect::<Vec<_>>();
            let target_ids = linked
                .iter()
                .map(|(_, t)| t.label())
                .collect::<Vec<_>>();

            let (old, new) = match (previous.get(key), current.get(key)) {
                (None, _) => {
                    debug!(key = %key, "no previous snapshot");
                    entries.push(ReconcileEntry::new(key, ReconcileStatus::PreviouslyWithdrawn));
                    continue;
                }
                (Some(_), None) if linked.is_empty() => {
                    debug!(key = %key, "withdrawn, not linked");
                    entries.push(ReconcileEntry::new(key, ReconcileStatus::WithdrawnUnlinked));
                    continue;
                }
                (Some(_), None) => {
                    warn!(key = %key, targets = ?target_ids, "withdrawn record is still linked; needs a human");
                    let mut entry = ReconcileEntry::new(key, ReconcileStatus::WithdrawnLinked);
                    entry.target_ids = target_ids;
                    entries.push(entry);
                    continue;
                }
                (Some(old), Some(new)) => (*old, *new),
            };

            if old.1.tags == new.1.tags {
                let mut entry = ReconcileEntry::new(key, ReconcileStatus::NoRelevantChange);
                entry.advisories = self.merge.advisories(old.1, new.1);
                if !entry.advisories.is_empty() {
                    entry.target_ids = target_ids;
                }
                entries.push(entry);
                continue;
            }

            let (target_index, target) = match linked.as_slice() {
                [] => {
                    debug!(key = %key, "changed but not linked");
                    entries.push(ReconcileEntry::new(key, ReconcileStatus::NotLinked));
                    continue;
                }
                [single] => *single,
                _ => {
                    warn!(key = %key, targets = ?target_ids, "several targets carry the same identifier");
                    let mut entry = ReconcileEntry::new(key, ReconcileStatus::DuplicateLink);
                    entry.target_ids = target_ids;
                    entries.push(entry);
                    continue;
                }
            };

            let report = self.merge.reconcile_entities(old.1, new.1, target);
            let mut entry = ReconcileEntry::new(key, ReconcileStatus::Resolved);
            entry.target_ids = target_ids;
            entry.advisories = report.advisories.clone();

            match &report.outcome {
                MergeOutcome::NoChange => {}
                MergeOutcome::Conflict(reasons) => {
                    entry.status = ReconcileStatus::Unresolved;
                    entry.conflicts = reasons.clone();
                }
                MergeOutcome::Update(patch) => {
                    entry.patch = Some(patch.clone());
                    let correspondence = Correspondence {
                        source_index: new.0,
                        target_index,
                        source: new.1.clone(),
                        target: target.clone(),
                        score: self.scorer().score(new.1, target),
                    };
                    match reviewer.review(&correspondence, &report, patch) {
                        ReviewDecision::Approve => {
                            self.sink
                                .apply(&correspondence, patch)
                                .await
                                .with_context(|| format!("applying patch for {key}"))?;
                            entry.status = ReconcileStatus::Applied;
                        }
                        ReviewDecision::Skip => entry.status = ReconcileStatus::Skipped,
                        ReviewDecision::Defer => entry.status = ReconcileStatus::NeedsReview,
                        ReviewDecision::Abort => {
                            info!(key = %key, "reconcile aborted by reviewer");
                            entry.status = ReconcileStatus::Aborted;
                            aborted = true;
                        }
                    }
                }
            }

            entries.push(entry);
            if aborted {
                break;
            }
        }

        let mut tallies = BTreeMap::new();
        for entry in &entries {
            *tallies.entry(entry.status).or_insert(0usize) += 1;
        }

        let summary = ReconcileRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            aborted,
            tallies,
            entries,
        };
        info!("{}", summary.summary_line());
        Ok(summary)
    }

    /// Keyed by the identifier tag, falling back to the entity id. Records
    /// with neither are dropped; a repeated key keeps the first record.
    fn index_by_key<'a>(
        &self,
        records: &'a [TaggedEntity],
        batch: &str,
    ) -> BTreeMap<String, (usize, &'a TaggedEntity)> {
        let mut out = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            let Some(key) = record.tag(self.id_key()).or(record.id.as_deref()) else {
                warn!(batch, record = %record.label(), "record has no identifier, ignoring");
                continue;
            };
            if out.contains_key(key) {
                warn!(batch, key, "duplicate identifier in authoritative batch, keeping the first");
                continue;
            }
            out.insert(key.to_string(), (index, record));
        }
        out
    }
}
