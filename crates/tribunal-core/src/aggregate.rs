//! Vote aggregation: weighted scores, classification and the scan verdict.
//!
//! ```text
//! score      = Σ(w·s·c) / Σ(w·c)   over cast votes
//! confidence = Σ(w·c)   / Σ(w)     over cast votes
//! ```
//!
//! Abstentions contribute to neither sum. Everything here is a pure function
//! of the verdicts and the [`DecisionBasis`], so an audit export can
//! recompute every decision.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::{LayerWeights, NeedsReviewPolicy, Thresholds, VerdictPolicy};
use crate::decision::{Decision, DecisionBasis, ScanVerdict};
use crate::pattern::PatternDefinition;
use crate::types::{Candidate, CandidateId, Classification, LayerVerdict};

/// Score used when no vote carries weight.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Result of the weighted-score formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedScore {
    /// `Σ(w·s·c) / Σ(w·c)`.
    pub score: f64,
    /// `Σ(w·c) / Σ(w)`.
    pub confidence: f64,
}

/// Computes the weighted score over cast votes.
///
/// Returns `None` if no cast vote has positive effective weight (`w·c`).
#[must_use]
pub fn weighted_score(verdicts: &[LayerVerdict], weights: &LayerWeights) -> Option<WeightedScore> {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    let mut weight_sum = 0.0;

    for verdict in verdicts {
        let Some((score, confidence)) = verdict.vote.scored() else {
            continue;
        };
        let weight = weights.weight(verdict.layer);
        if !weight.is_finite() || weight <= 0.0 {
            continue;
        }
        numerator += weight * score * confidence;
        denominator += weight * confidence;
        weight_sum += weight;
    }

    if denominator <= 0.0 || !denominator.is_finite() {
        return None;
    }
    Some(WeightedScore {
        score: numerator / denominator,
        confidence: denominator / weight_sum,
    })
}

/// Classifies a score. Both thresholds are inclusive.
#[must_use]
pub fn classify(score: f64, thresholds: &Thresholds) -> Classification {
    if score >= thresholds.commit {
        Classification::Dismissed
    } else if score <= thresholds.block {
        Classification::ConfirmedViolation
    } else {
        Classification::NeedsReview
    }
}

/// Score, confidence and classification of a set of verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Weighted score.
    pub score: f64,
    /// Aggregated confidence.
    pub confidence: f64,
    /// Classification under the basis thresholds.
    pub classification: Classification,
}

/// Evaluates verdicts under a basis.
///
/// When every vote abstains or carries no effective weight the result is
/// needs-review with score 0.5 and confidence 0.
///
/// # Errors
///
/// Returns [`AggregationError::NoVerdicts`] for an empty verdict list.
pub fn evaluate(
    candidate: &CandidateId,
    verdicts: &[LayerVerdict],
    basis: &DecisionBasis,
) -> Result<Evaluation, AggregationError> {
    if verdicts.is_empty() {
        return Err(AggregationError::NoVerdicts {
            candidate: candidate.clone(),
        });
    }
    Ok(match weighted_score(verdicts, &basis.weights) {
        Some(ws) => Evaluation {
            score: ws.score,
            confidence: ws.confidence,
            classification: classify(ws.score, &basis.thresholds),
        },
        None => Evaluation {
            score: NEUTRAL_SCORE,
            confidence: 0.0,
            classification: Classification::NeedsReview,
        },
    })
}

/// Aggregation precondition failures.
#[derive(Debug, Clone, thiserror::Error, Diagnostic)]
pub enum AggregationError {
    /// A decision was requested for a candidate with no verdicts.
    #[error("candidate {candidate} reached the aggregator without any verdict")]
    #[diagnostic(
        code(tribunal::invariant::no_verdicts),
        help("every candidate must carry its originating pattern verdict")
    )]
    NoVerdicts {
        /// The offending candidate.
        candidate: CandidateId,
    },
}

/// Merges per-layer verdicts into decisions.
#[derive(Debug, Clone, Copy)]
pub struct VoteAggregator {
    basis: DecisionBasis,
}

impl VoteAggregator {
    /// Creates an aggregator with effective weights and thresholds.
    #[must_use]
    pub fn new(weights: LayerWeights, thresholds: Thresholds) -> Self {
        Self {
            basis: DecisionBasis {
                weights,
                thresholds,
            },
        }
    }

    /// Returns the basis recorded on every decision.
    #[must_use]
    pub fn basis(&self) -> &DecisionBasis {
        &self.basis
    }

    /// Computes the decision for one candidate.
    ///
    /// Verdicts are ordered pattern, context, deep before evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::NoVerdicts`] for an empty verdict list.
    pub fn decide(
        &self,
        candidate: Candidate,
        pattern: &PatternDefinition,
        mut verdicts: Vec<LayerVerdict>,
    ) -> Result<Decision, AggregationError> {
        verdicts.sort_by_key(|v| v.layer);
        let evaluation = evaluate(&candidate.id, &verdicts, &self.basis)?;
        let fix = pattern.fix.as_ref().map(|f| f.render(&candidate));

        Ok(Decision {
            candidate,
            severity: pattern.severity,
            category: pattern.category.clone(),
            score: evaluation.score,
            confidence: evaluation.confidence,
            classification: evaluation.classification,
            verdicts,
            basis: self.basis,
            duplicate_of: None,
            fix,
        })
    }
}

/// Marks overlapping confirmed violations as duplicates.
///
/// Within each file the confirmed violation with the lowest score (ties:
/// lowest candidate id) is primary; every other confirmed violation whose
/// span overlaps a primary one gets `duplicate_of` set.
#[must_use]
pub fn mark_duplicates(decisions: Vec<Decision>) -> Vec<Decision> {
    let mut by_file: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
    for (i, d) in decisions.iter().enumerate() {
        if d.classification == Classification::ConfirmedViolation {
            by_file
                .entry(d.candidate.location.file.clone())
                .or_default()
                .push(i);
        }
    }

    let mut duplicate_of: BTreeMap<usize, CandidateId> = BTreeMap::new();
    for mut indices in by_file.into_values() {
        indices.sort_by(|&a, &b| {
            decisions[a]
                .score
                .total_cmp(&decisions[b].score)
                .then_with(|| decisions[a].id().cmp(decisions[b].id()))
        });
        let mut primaries: Vec<usize> = Vec::new();
        for i in indices {
            let loc = &decisions[i].candidate.location;
            match primaries
                .iter()
                .find(|&&p| decisions[p].candidate.location.overlaps(loc))
            {
                Some(&p) => {
                    duplicate_of.insert(i, decisions[p].id().clone());
                }
                None => primaries.push(i),
            }
        }
    }

    decisions
        .into_iter()
        .enumerate()
        .map(|(i, d)| match duplicate_of.remove(&i) {
            Some(primary) => Decision {
                duplicate_of: Some(primary),
                ..d
            },
            None => d,
        })
        .collect()
}

/// Computes the admit/block verdict for a set of decisions.
///
/// Duplicates never count.
#[must_use]
pub fn scan_verdict(decisions: &[Decision], policy: &VerdictPolicy) -> ScanVerdict {
    let mut blocking = 0;
    let mut warnings = 0;

    for d in decisions.iter().filter(|d| d.is_primary()) {
        match d.classification {
            Classification::ConfirmedViolation if d.severity >= policy.block_on => blocking += 1,
            Classification::NeedsReview if policy.needs_review == NeedsReviewPolicy::Block => {
                blocking += 1;
            }
            Classification::ConfirmedViolation | Classification::NeedsReview => warnings += 1,
            Classification::Dismissed => {}
        }
    }

    if blocking > 0 {
        ScanVerdict::Block { blocking }
    } else {
        ScanVerdict::Admit { warnings }
    }
}
