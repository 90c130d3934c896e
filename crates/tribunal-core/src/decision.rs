//! Decisions and the scan outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::{LayerIssue, LayerWeights, Thresholds};
use crate::pattern::SkippedPattern;
use crate::types::{Candidate, CandidateId, Classification, LayerVerdict, Severity};

/// Weights and thresholds in force when a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionBasis {
    /// Effective layer weights (disabled layers weighted zero).
    pub weights: LayerWeights,
    /// Classification thresholds.
    pub thresholds: Thresholds,
}

/// The aggregated, final judgment on a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// The judged candidate.
    pub candidate: Candidate,
    /// Severity of the candidate's pattern.
    pub severity: Severity,
    /// Category of the candidate's pattern.
    pub category: String,
    /// Weighted score; high means "not a real violation".
    pub score: f64,
    /// Aggregated confidence.
    pub confidence: f64,
    /// Final classification.
    pub classification: Classification,
    /// Contributing verdicts ordered pattern, context, deep.
    pub verdicts: Vec<LayerVerdict>,
    /// Weights and thresholds used.
    pub basis: DecisionBasis,
    /// Primary confirmed violation this one overlaps, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<CandidateId>,
    /// Rendered fix suggestion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

impl Decision {
    /// Returns the candidate id.
    #[must_use]
    pub fn id(&self) -> &CandidateId {
        &self.candidate.id
    }

    /// Returns true unless this decision duplicates another.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.duplicate_of.is_none()
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} (score {:.3}, confidence {:.3})",
            self.candidate.location,
            self.candidate.pattern,
            self.classification,
            self.score,
            self.confidence
        )
    }
}

/// Admit/block verdict for a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum ScanVerdict {
    /// The change set may proceed.
    Admit {
        /// Primary confirmed violations and needs-review decisions that did not block.
        warnings: usize,
    },
    /// The change set must not proceed.
    Block {
        /// Decisions that caused the block.
        blocking: usize,
    },
}

impl ScanVerdict {
    /// Returns true for [`ScanVerdict::Block`].
    #[must_use]
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

impl fmt::Display for ScanVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admit { warnings } => write!(f, "admit ({warnings} warning(s))"),
            Self::Block { blocking } => write!(f, "block ({blocking} blocking decision(s))"),
        }
    }
}

/// Aggregate statistics for a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    /// Files offered to the scan.
    pub files_seen: usize,
    /// Files that passed every exclusion source.
    pub files_included: usize,
    /// Files excluded.
    pub files_excluded: usize,
    /// Exclusions per source.
    pub excluded_by_source: BTreeMap<String, usize>,
    /// Candidates emitted by the pattern layer.
    pub candidates: usize,
    /// Candidates with a decision.
    pub decided: usize,
    /// Candidates left without a decision (cancelled scans only).
    pub undecided: usize,
    /// Decisions marked as duplicates.
    pub duplicates: usize,
    /// Deep-analysis calls actually submitted.
    pub deep_invocations: usize,
    /// Deep-analysis results served from the cache.
    pub deep_cache_hits: usize,
    /// Decisions per classification.
    pub by_classification: BTreeMap<Classification, usize>,
    /// Decisions per category and classification.
    pub by_category: BTreeMap<String, BTreeMap<Classification, usize>>,
}

impl ScanStats {
    /// Counts a decision.
    pub fn count_decision(&mut self, decision: &Decision) {
        self.decided += 1;
        if !decision.is_primary() {
            self.duplicates += 1;
        }
        *self
            .by_classification
            .entry(decision.classification)
            .or_default() += 1;
        *self
            .by_category
            .entry(decision.category.clone())
            .or_default()
            .entry(decision.classification)
            .or_default() += 1;
    }

    /// Returns the number of decisions with a classification.
    #[must_use]
    pub fn count(&self, classification: Classification) -> usize {
        self.by_classification
            .get(&classification)
            .copied()
            .unwrap_or(0)
    }
}

/// The decision for an entire change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// Scan identifier.
    pub scan_id: String,
    /// When the scan started.
    pub started_at: DateTime<Utc>,
    /// When the outcome was sealed.
    pub finished_at: DateTime<Utc>,
    /// Decisions ordered by file, line, column and pattern id.
    pub decisions: Vec<Decision>,
    /// Admit/block verdict.
    pub verdict: ScanVerdict,
    /// Aggregate statistics.
    pub stats: ScanStats,
    /// True if the scan was cancelled before every candidate was decided.
    pub partial: bool,
    /// Pattern definitions that were skipped.
    #[serde(default)]
    pub skipped_patterns: Vec<SkippedPattern>,
    /// Layers disabled by configuration.
    #[serde(default)]
    pub disabled_layers: Vec<LayerIssue>,
}

impl ScanOutcome {
    /// Returns the decisions with a given classification.
    pub fn with_classification(
        &self,
        classification: Classification,
    ) -> impl Iterator<Item = &Decision> {
        self.decisions
            .iter()
            .filter(move |d| d.classification == classification)
    }

    /// Returns the decision for a candidate.
    #[must_use]
    pub fn decision(&self, id: &CandidateId) -> Option<&Decision> {
        self.decisions.iter().find(|d| d.id() == id)
    }

    /// Digest of the outcome with the scan id, all timestamps and the
    /// deep-analysis cache counters removed.
    ///
    /// Two scans over the same inputs produce the same digest, whether or
    /// not the second one was served from the deep-analysis cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the outcome cannot be serialized.
    pub fn canonical_digest(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("scan_id");
            obj.remove("started_at");
            obj.remove("finished_at");
            if let Some(stats) = obj.get_mut("stats").and_then(|s| s.as_object_mut()) {
                stats.remove("deep_invocations");
                stats.remove("deep_cache_hits");
            }
            if let Some(decisions) = obj.get_mut("decisions").and_then(|d| d.as_array_mut()) {
                for verdict in decisions
                    .iter_mut()
                    .filter_map(|d| d.get_mut("verdicts").and_then(|v| v.as_array_mut()))
                    .flatten()
                {
                    if let Some(v) = verdict.as_object_mut() {
                        v.remove("timestamp");
                    }
                }
            }
        }
        let bytes = serde_json::to_vec(&value)?;
        Ok(format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&bytes)))
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "scan {}: {}{}",
            self.scan_id,
            self.verdict,
            if self.partial { " [partial]" } else { "" }
        )?;
        for decision in self.decisions.iter().filter(|d| d.is_primary()) {
            writeln!(f, "  {decision}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternId;
    use crate::types::{LayerKind, Location, Rationale, Vote};
    use std::path::PathBuf;

    fn decision(classification: Classification) -> Decision {
        let candidate = Candidate::new(
            PatternId::new("wildcard-cors").unwrap(),
            Location::new(PathBuf::from("a.py"), 1, 12).with_span(11, 3),
            "\"*\"",
        );
        let verdict = LayerVerdict::new(
            candidate.id.clone(),
            LayerKind::Pattern,
            Vote::cast(0.15, 0.7),
            Rationale::new("regex-match", "matched"),
        );
        Decision {
            candidate,
            severity: Severity::Error,
            category: "security".to_string(),
            score: 0.15,
            confidence: 0.7,
            classification,
            verdicts: vec![verdict],
            basis: DecisionBasis {
                weights: LayerWeights::default(),
                thresholds: Thresholds::default(),
            },
            duplicate_of: None,
            fix: None,
        }
    }

    fn outcome(scan_id: &str) -> ScanOutcome {
        let mut stats = ScanStats::default();
        let d = decision(Classification::ConfirmedViolation);
        stats.count_decision(&d);
        ScanOutcome {
            scan_id: scan_id.to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            decisions: vec![d],
            verdict: ScanVerdict::Block { blocking: 1 },
            stats,
            partial: false,
            skipped_patterns: Vec::new(),
            disabled_layers: Vec::new(),
        }
    }

    #[test]
    fn digest_ignores_ids_and_timestamps() {
        let a = outcome("scan-a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = outcome("scan-b");
        assert_ne!(a, b);
        assert_eq!(a.canonical_digest().unwrap(), b.canonical_digest().unwrap());
    }

    #[test]
    fn stats_count_by_category() {
        let outcome = outcome("s");
        assert_eq!(outcome.stats.count(Classification::ConfirmedViolation), 1);
        assert_eq!(
            outcome.stats.by_category["security"][&Classification::ConfirmedViolation],
            1
        );
        let json = serde_json::to_string(&outcome.stats).unwrap();
        let back: ScanStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome.stats);
    }

    #[test]
    fn verdict_display() {
        assert_eq!(ScanVerdict::Admit { warnings: 2 }.to_string(), "admit (2 warning(s))");
        assert!(ScanVerdict::Block { blocking: 1 }.is_block());
    }
}
