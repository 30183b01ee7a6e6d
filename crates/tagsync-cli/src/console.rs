//! Interactive stdin prompts for ambiguous matches and patch review.

use std::io::{self, BufRead, Write};

use tagsync_core::{Correspondence, MergeReport, TagPatch, TaggedEntity};
use tagsync_sync::{Candidate, MatchResolver, PatchReviewer, Resolution, ReviewDecision};
use tracing::warn;

/// Empty input or `s`/`n` skips, `q` aborts, a number picks that candidate.
pub fn parse_resolution(answer: &str, candidates: usize) -> Option<Resolution> {
    match answer.trim().to_lowercase().as_str() {
        "" | "s" | "n" => Some(Resolution::Skip),
        "q" => Some(Resolution::Abort),
        other => other
            .parse::<usize>()
            .ok()
            .filter(|i| *i < candidates)
            .map(Resolution::Choose),
    }
}

/// Empty input or `y` approves, `s`/`n` skips, `d` defers, `q` aborts.
pub fn parse_decision(answer: &str) -> Option<ReviewDecision> {
    match answer.trim().to_lowercase().as_str() {
        "" | "y" => Some(ReviewDecision::Approve),
        "s" | "n" => Some(ReviewDecision::Skip),
        "d" => Some(ReviewDecision::Defer),
        "q" => Some(ReviewDecision::Abort),
        _ => None,
    }
}

fn describe(entity: &TaggedEntity) -> String {
    let tags = entity
        .tags
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} [{tags}]", entity.label())
}

/// Reads one trimmed line; end of input reads as `q`.
fn ask(prompt: &str) -> String {
    let mut out = io::stdout().lock();
    let _ = write!(out, "{prompt} ");
    let _ = out.flush();
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) => "q".to_string(),
        Ok(_) => line.trim().to_string(),
        Err(err) => {
            warn!(%err, "failed to read answer, aborting");
            "q".to_string()
        }
    }
}

#[derive(Debug, Default)]
pub struct ConsoleResolver;

impl MatchResolver for ConsoleResolver {
    fn resolve(&mut self, source: &TaggedEntity, candidates: &[Candidate<'_>]) -> Resolution {
        println!("\nsource  {}", describe(source));
        for (i, candidate) in candidates.iter().enumerate() {
            println!("  [{i}] score {:>5}  {}", candidate.score, describe(candidate.target));
        }
        loop {
            let answer = ask("choose [0-9]*, (s)kip, (q)uit:");
            if let Some(resolution) = parse_resolution(&answer, candidates.len()) {
                return resolution;
            }
            println!("invalid answer {answer:?}");
        }
    }
}

#[derive(Debug, Default)]
pub struct ConsoleReviewer;

impl PatchReviewer for ConsoleReviewer {
    fn review(
        &mut self,
        correspondence: &Correspondence,
        report: &MergeReport,
        patch: &TagPatch,
    ) -> ReviewDecision {
        println!("\nsource  {}", describe(&correspondence.source));
        println!("target  {}", describe(&correspondence.target));
        println!("patch   {patch}");
        for advisory in &report.advisories {
            println!("note    {}", serde_json::to_string(advisory).unwrap_or_default());
        }
        loop {
            let answer = ask("apply? (y)es, (s)kip, (d)efer, (q)uit:");
            if let Some(decision) = parse_decision(&answer) {
                return decision;
            }
            println!("invalid answer {answer:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_answers() {
        assert_eq!(parse_resolution("", 2), Some(Resolution::Skip));
        assert_eq!(parse_resolution(" N ", 2), Some(Resolution::Skip));
        assert_eq!(parse_resolution("q", 2), Some(Resolution::Abort));
        assert_eq!(parse_resolution("1", 2), Some(Resolution::Choose(1)));
        assert_eq!(parse_resolution("2", 2), None);
        assert_eq!(parse_resolution("maybe", 2), None);
    }

    #[test]
    fn decision_answers() {
        assert_eq!(parse_decision(""), Some(ReviewDecision::Approve));
        assert_eq!(parse_decision("Y"), Some(ReviewDecision::Approve));
        assert_eq!(parse_decision("s"), Some(ReviewDecision::Skip));
        assert_eq!(parse_decision("d"), Some(ReviewDecision::Defer));
        assert_eq!(parse_decision("q"), Some(ReviewDecision::Abort));
        assert_eq!(parse_decision("later"), None);
    }
}
