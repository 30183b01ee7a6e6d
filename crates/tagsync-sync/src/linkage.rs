//! Batch entity linkage: score matrix, percentile threshold and greedy 1:1
//! resolution with an external tie-breaker.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tagsync_core::{Correspondence, EntityError, TaggedEntity};
use tracing::{debug, info, warn};

use crate::score::Scorer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Percentile of the strictly positive scores used as acceptance cutoff.
    pub percentile: f64,
    /// Sources lacking this tag are rejected before scoring.
    pub required_source_tag: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            percentile: 90.0,
            required_source_tag: None,
        }
    }
}

/// Dense rows × columns score table for one linkage run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreMatrix {
    rows: usize,
    cols: usize,
    cells: Vec<i64>,
}

impl ScoreMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![0; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> i64 {
        self.cells[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: i64) {
        self.cells[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[i64] {
        &self.cells[row * self.cols..(row + 1) * self.cols]
    }

    pub fn row_max(&self, row: usize) -> i64 {
        self.row(row).iter().copied().max().unwrap_or(0)
    }

    pub fn zero_row(&mut self, row: usize) {
        for cell in &mut self.cells[row * self.cols..(row + 1) * self.cols] {
            *cell = 0;
        }
    }

    pub fn zero_column(&mut self, col: usize) {
        for row in 0..self.rows {
            self.cells[row * self.cols + col] = 0;
        }
    }

    /// Zeroes every cell strictly below `threshold`.
    pub fn apply_threshold(&mut self, threshold: f64) {
        for cell in &mut self.cells {
            if (*cell as f64) < threshold {
                *cell = 0;
            }
        }
    }

    pub fn positive_values(&self) -> Vec<i64> {
        self.cells.iter().copied().filter(|v| *v > 0).collect()
    }
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[i64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let base = sorted[lo] as f64;
    Some(base + (sorted[hi] as f64 - base) * (rank - lo as f64))
}

/// A surviving target offered to the resolver for one source.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub target_index: usize,
    pub score: i64,
    pub target: &'a TaggedEntity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Position in the candidate slice, not a target index.
    Choose(usize),
    Skip,
    Abort,
}

/// Decides between several surviving candidates. May block on a prompt.
pub trait MatchResolver {
    fn resolve(&mut self, source: &TaggedEntity, candidates: &[Candidate<'_>]) -> Resolution;
}

impl<F> MatchResolver for F
where
    F: FnMut(&TaggedEntity, &[Candidate<'_>]) -> Resolution,
{
    fn resolve(&mut self, source: &TaggedEntity, candidates: &[Candidate<'_>]) -> Resolution {
        self(source, candidates)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SkipAmbiguous;

impl MatchResolver for SkipAmbiguous {
    fn resolve(&mut self, _source: &TaggedEntity, _candidates: &[Candidate<'_>]) -> Resolution {
        Resolution::Skip
    }
}

/// Takes the highest-scoring candidate (candidates arrive sorted).
#[derive(Debug, Default, Clone, Copy)]
pub struct TakeBest;

impl MatchResolver for TakeBest {
    fn resolve(&mut self, _source: &TaggedEntity, candidates: &[Candidate<'_>]) -> Resolution {
        if candidates.is_empty() {
            Resolution::Skip
        } else {
            Resolution::Choose(0)
        }
    }
}

/// Replays a fixed list of answers, then falls back to a default.
#[derive(Debug, Clone)]
pub struct ScriptedResolver {
    answers: VecDeque<Resolution>,
    fallback: Resolution,
    pub asked: usize,
}

impl ScriptedResolver {
    pub fn new(answers: impl IntoIterator<Item = Resolution>, fallback: Resolution) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            fallback,
            asked: 0,
        }
    }
}

impl MatchResolver for ScriptedResolver {
    fn resolve(&mut self, _source: &TaggedEntity, _candidates: &[Candidate<'_>]) -> Resolution {
        self.asked += 1;
        self.answers.pop_front().unwrap_or(self.fallback)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoCandidates,
    Resolver,
    InvalidChoice,
}

/// Terminal state of one source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RowState {
    Unprocessed,
    Rejected,
    Accepted { target_index: usize, perfect: bool },
    Skipped { reason: SkipReason },
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub correspondences: Vec<Correspondence>,
    pub rows: Vec<RowState>,
    pub rejected: Vec<EntityError>,
    pub threshold: Option<f64>,
    pub aborted: bool,
}

impl LinkReport {
    pub fn skipped(&self) -> usize {
        self.rows
            .iter()
            .filter(|s| matches!(s, RowState::Skipped { .. }))
            .count()
    }
}

/// Every source tag is present on the target with the same value.
pub fn is_perfect_match(source: &TaggedEntity, target: &TaggedEntity) -> bool {
    source.has_tags()
        && source
            .tags
            .iter()
            .all(|(key, value)| target.tags.get(key) == Some(value))
}

#[derive(Debug, Clone, Default)]
pub struct LinkageEngine {
    scorer: Scorer,
    config: LinkConfig,
}

impl LinkageEngine {
    pub fn new(scorer: Scorer, config: LinkConfig) -> Self {
        Self { scorer, config }
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn validate_source(&self, index: usize, source: &TaggedEntity) -> Result<(), EntityError> {
        if !source.has_tags() {
            return Err(EntityError::Untagged {
                index,
                label: source.label(),
            });
        }
        if let Some(key) = &self.config.required_source_tag {
            if source.tag(key).is_none() {
                return Err(EntityError::MissingTag {
                    index,
                    label: source.label(),
                    key: key.clone(),
                });
            }
        }
        Ok(())
    }

    /// Scores every (source, target) pair. Rows in `skip_rows` and untagged
    /// targets stay zero; so does any pair supported by distance alone.
    pub fn build_matrix(
        &self,
        sources: &[TaggedEntity],
        targets: &[TaggedEntity],
        skip_rows: &[bool],
    ) -> ScoreMatrix {
        let mut matrix = ScoreMatrix::new(sources.len(), targets.len());
        for (r, source) in sources.iter().enumerate() {
            if skip_rows.get(r).copied().unwrap_or(false) {
                continue;
            }
            for (c, target) in targets.iter().enumerate() {
                if !target.has_tags() {
                    continue;
                }
                let breakdown = self.scorer.score_breakdown(source, target);
                if breakdown.evidence() > 0 {
                    matrix.set(r, c, breakdown.total());
                }
            }
        }
        matrix
    }

    pub fn link(
        &self,
        sources: &[TaggedEntity],
        targets: &[TaggedEntity],
        resolver: &mut dyn MatchResolver,
    ) -> LinkReport {
        let mut rows = vec![RowState::Unprocessed; sources.len()];
        let mut rejected = Vec::new();
        for (index, source) in sources.iter().enumerate() {
            if let Err(err) = self.validate_source(index, source) {
                warn!(%err, "rejecting malformed source");
                rows[index] = RowState::Rejected;
                rejected.push(err);
            }
        }
        let skip_rows = rows
            .iter()
            .map(|s| *s == RowState::Rejected)
            .collect::<Vec<_>>();

        let mut matrix = self.build_matrix(sources, targets, &skip_rows);
        let threshold = percentile(&matrix.positive_values(), self.config.percentile);
        debug!(
            rows = matrix.rows(),
            cols = matrix.cols(),
            ?threshold,
            "score matrix built"
        );
        if let Some(threshold) = threshold {
            matrix.apply_threshold(threshold);
        }

        let mut correspondences = Vec::new();
        let mut aborted = false;

        while let Some(r) = next_row(&matrix, &rows) {
            let source = &sources[r];
            let mut candidates = matrix
                .row(r)
                .iter()
                .enumerate()
                .filter(|(_, score)| **score > 0)
                .map(|(c, score)| Candidate {
                    target_index: c,
                    score: *score,
                    target: &targets[c],
                })
                .collect::<Vec<_>>();
            candidates.sort_by(|a, b| b.score.cmp(&a.score).then(a.target_index.cmp(&b.target_index)));

            let perfect = candidates
                .iter()
                .position(|c| is_perfect_match(source, c.target));

            let chosen = match (perfect, candidates.len()) {
                (Some(i), _) => Some((i, true)),
                (None, 1) => Some((0, false)),
                (None, _) => match resolver.resolve(source, &candidates) {
                    Resolution::Choose(i) if i < candidates.len() => Some((i, false)),
                    Resolution::Choose(i) => {
                        warn!(source = %source.label(), choice = i, "resolver picked a missing candidate, skipping");
                        rows[r] = RowState::Skipped {
                            reason: SkipReason::InvalidChoice,
                        };
                        None
                    }
                    Resolution::Skip => {
                        debug!(source = %source.label(), candidates = candidates.len(), "ambiguous match skipped");
                        rows[r] = RowState::Skipped {
                            reason: SkipReason::Resolver,
                        };
                        None
                    }
                    Resolution::Abort => {
                        info!(source = %source.label(), "linkage aborted by resolver");
                        rows[r] = RowState::Aborted;
                        aborted = true;
                        None
                    }
                },
            };

            if aborted {
                break;
            }

            if let Some((i, perfect)) = chosen {
                let candidate = candidates[i];
                info!(
                    source = %source.label(),
                    target = %candidate.target.label(),
                    score = candidate.score,
                    perfect,
                    "correspondence accepted"
                );
                correspondences.push(Correspondence {
                    source_index: r,
                    target_index: candidate.target_index,
                    source: source.clone(),
                    target: candidate.target.clone(),
                    score: candidate.score,
                });
                rows[r] = RowState::Accepted {
                    target_index: candidate.target_index,
                    perfect,
                };
                matrix.zero_column(candidate.target_index);
            }
            matrix.zero_row(r);
        }

        if !aborted {
            for state in rows.iter_mut() {
                if *state == RowState::Unprocessed {
                    *state = RowState::Skipped {
                        reason: SkipReason::NoCandidates,
                    };
                }
            }
        }

        LinkReport {
            correspondences,
            rows,
            rejected,
            threshold,
            aborted,
        }
    }
}

/// Unprocessed row with the highest remaining score; lowest index wins ties.
fn next_row(matrix: &ScoreMatrix, rows: &[RowState]) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (r, state) in rows.iter().enumerate() {
        if *state != RowState::Unprocessed {
            continue;
        }
        let max = matrix.row_max(r);
        if max <= 0 {
            continue;
        }
        if best.map_or(true, |(_, b)| max > b) {
            best = Some((r, max));
        }
    }
    best.map(|(r, _)| r)
}
