//! Pairwise compatibility scoring between an authoritative and a target record.

use serde::{Deserialize, Serialize};
use tagsync_core::TaggedEntity;

/// How the geographic term is folded into the total.
///
/// `Additive` reproduces the observed heuristic, where a larger distance
/// increases the raw number. `Subtractive` turns the term into a penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceSign {
    #[default]
    Additive,
    Subtractive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub key_overlap: i64,
    pub value_agreement: i64,
    pub exact_name: i64,
    pub name_word: i64,
    pub id_match: i64,
    pub id_mismatch: i64,
    pub distance_factor: f64,
    pub distance_sign: DistanceSign,
    pub name_key: String,
    pub alt_name_key: Option<String>,
    pub id_key: String,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            key_overlap: 1,
            value_agreement: 10,
            exact_name: 100,
            name_word: 10,
            id_match: 100,
            id_mismatch: -10,
            distance_factor: 1000.0,
            distance_sign: DistanceSign::Additive,
            name_key: "name".to_string(),
            alt_name_key: Some("alt_name".to_string()),
            id_key: "ref".to_string(),
        }
    }
}

/// Every term of a score, kept apart for diagnostics and for the linkage
/// engine, which refuses candidates whose only signal is distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScoreBreakdown {
    pub key_overlap: i64,
    pub value_agreement: i64,
    pub name: i64,
    pub identifier: i64,
    pub distance: i64,
}

impl ScoreBreakdown {
    /// Sum of the non-geographic terms.
    pub fn evidence(&self) -> i64 {
        self.key_overlap + self.value_agreement + self.name + self.identifier
    }

    pub fn total(&self) -> i64 {
        self.evidence() + self.distance
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scorer {
    weights: ScoreWeights,
}

impl Scorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    pub fn score(&self, source: &TaggedEntity, target: &TaggedEntity) -> i64 {
        self.score_breakdown(source, target).total()
    }

    pub fn score_breakdown(&self, source: &TaggedEntity, target: &TaggedEntity) -> ScoreBreakdown {
        let w = &self.weights;
        let mut out = ScoreBreakdown::default();

        for (key, value) in &source.tags {
            if let Some(other) = target.tags.get(key) {
                out.key_overlap += w.key_overlap;
                if other == value {
                    out.value_agreement += w.value_agreement;
                }
            }
        }

        let source_name = source.tag(&w.name_key);
        out.name += self.name_similarity(source_name, target.tag(&w.name_key));
        if let Some(alt_key) = &w.alt_name_key {
            out.name += self.name_similarity(source_name, target.tag(alt_key));
        }

        if let (Some(a), Some(b)) = (source.tag(&w.id_key), target.tag(&w.id_key)) {
            out.identifier = if a == b { w.id_match } else { w.id_mismatch };
        }

        if let (Some(a), Some(b)) = (&source.position, &target.position) {
            let term = (w.distance_factor * a.squared_distance(b)).floor() as i64;
            out.distance = match w.distance_sign {
                DistanceSign::Additive => term,
                DistanceSign::Subtractive => -term,
            };
        }

        out
    }

    /// Exact (case-insensitive) match scores `exact_name`; otherwise each
    /// word of the source name found inside the target name scores
    /// `name_word`.
    pub fn name_similarity(&self, source: Option<&str>, target: Option<&str>) -> i64 {
        let (Some(source), Some(target)) = (source, target) else {
            return 0;
        };
        if source.to_lowercase() == target.to_lowercase() {
            return self.weights.exact_name;
        }
        source
            .split_whitespace()
            .filter(|word| target.contains(word))
            .count() as i64
            * self.weights.name_word
    }
}
