//! Core types for candidates and per-layer verdicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::pattern::PatternId;

/// Severity level attached to a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational finding, never blocks.
    Info,
    /// Finding that should be addressed.
    Warning,
    /// Finding that must be fixed.
    Error,
    /// Finding that must be fixed before anything else.
    Critical,
}

impl Severity {
    /// Parses a lowercase severity name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Source code location of a match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// File path relative to the scan root.
    pub file: PathBuf,
    /// Start line (1-indexed).
    pub line: usize,
    /// Start column (1-indexed, in bytes).
    pub column: usize,
    /// End line (1-indexed, inclusive).
    pub end_line: usize,
    /// End column (1-indexed, exclusive, in bytes).
    pub end_column: usize,
    /// Byte offset of the match in the file.
    pub offset: usize,
    /// Length of the match in bytes.
    pub length: usize,
}

impl Location {
    /// Creates a single-point location.
    #[must_use]
    pub fn new(file: PathBuf, line: usize, column: usize) -> Self {
        Self {
            file,
            line,
            column,
            end_line: line,
            end_column: column,
            offset: 0,
            length: 0,
        }
    }

    /// Sets the byte offset and length for this location.
    #[must_use]
    pub fn with_span(mut self, offset: usize, length: usize) -> Self {
        self.offset = offset;
        self.length = length;
        self
    }

    /// Sets the end line and column.
    #[must_use]
    pub fn with_end(mut self, end_line: usize, end_column: usize) -> Self {
        self.end_line = end_line;
        self.end_column = end_column;
        self
    }

    /// Returns true if both locations are in the same file and their byte spans intersect.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.file != other.file {
            return false;
        }
        let a_end = self.offset + self.length.max(1);
        let b_end = other.offset + other.length.max(1);
        self.offset < b_end && other.offset < a_end
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// Deterministic identifier of a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    /// Derives the id from the pattern and the matched span.
    ///
    /// The same pattern matching the same bytes of the same file always yields
    /// the same id, across runs and machines.
    #[must_use]
    pub fn derive(pattern: &PatternId, location: &Location) -> Self {
        let key = format!(
            "{}\u{0}{}\u{0}{}\u{0}{}",
            pattern.as_str(),
            location.file.to_string_lossy(),
            location.offset,
            location.length
        );
        Self(format!("{:016x}", xxhash_rust::xxh3::xxh3_64(key.as_bytes())))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The analysis layer that produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// Deterministic pattern matching.
    Pattern,
    /// Project-context re-scoring.
    Context,
    /// External semantic analysis.
    Deep,
}

impl LayerKind {
    /// All layers in evaluation order.
    pub const ALL: [Self; 3] = [Self::Pattern, Self::Context, Self::Deep];
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern => write!(f, "pattern"),
            Self::Context => write!(f, "context"),
            Self::Deep => write!(f, "deep"),
        }
    }
}

/// An unconfirmed match of a pattern at a location.
///
/// Created by the pattern layer and never modified afterwards; later layers
/// refer to it by [`CandidateId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Deterministic id.
    pub id: CandidateId,
    /// Pattern that matched.
    pub pattern: PatternId,
    /// Where the match is.
    pub location: Location,
    /// The raw matched text.
    pub matched_text: String,
    /// Layer that created the candidate (always the pattern layer).
    pub origin: LayerKind,
}

impl Candidate {
    /// Creates a new candidate originating from the pattern layer.
    #[must_use]
    pub fn new(pattern: PatternId, location: Location, matched_text: impl Into<String>) -> Self {
        let id = CandidateId::derive(&pattern, &location);
        Self {
            id,
            pattern,
            location,
            matched_text: matched_text.into(),
            origin: LayerKind::Pattern,
        }
    }
}

/// A layer's vote on a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "vote", rename_all = "snake_case")]
pub enum Vote {
    /// A scored judgment. A high score means "not a real violation".
    Cast {
        /// Score in `[0, 1]`.
        score: f64,
        /// Confidence in `[0, 1]`.
        confidence: f64,
    },
    /// The layer declined to judge.
    Abstain {
        /// Why the layer abstained.
        reason: String,
    },
}

impl Vote {
    /// Creates a cast vote, clamping both values into `[0, 1]`.
    ///
    /// A non-finite score or confidence carries no judgment and becomes an
    /// abstention.
    #[must_use]
    pub fn cast(score: f64, confidence: f64) -> Self {
        if !score.is_finite() || !confidence.is_finite() {
            return Self::abstain("non-finite vote");
        }
        Self::Cast {
            score: score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Creates an abstention.
    #[must_use]
    pub fn abstain(reason: impl Into<String>) -> Self {
        Self::Abstain {
            reason: reason.into(),
        }
    }

    /// Returns `(score, confidence)` for cast votes.
    #[must_use]
    pub fn scored(&self) -> Option<(f64, f64)> {
        match self {
            Self::Cast { score, confidence } => Some((*score, *confidence)),
            Self::Abstain { .. } => None,
        }
    }

    /// Returns true if the layer abstained.
    #[must_use]
    pub fn is_abstain(&self) -> bool {
        matches!(self, Self::Abstain { .. })
    }
}

/// Short structured explanation of a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rationale {
    /// Machine-readable reason code (e.g., "security-config-key").
    pub code: String,
    /// Human-readable explanation.
    pub detail: String,
    /// Named signals that contributed, sorted by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signals: BTreeMap<String, String>,
}

impl Rationale {
    /// Creates a rationale without signals.
    #[must_use]
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
            signals: BTreeMap::new(),
        }
    }

    /// Adds a named signal.
    #[must_use]
    pub fn with_signal(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.signals.insert(name.into(), value.into());
        self
    }
}

/// One layer's judgment on one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerVerdict {
    /// The candidate being judged.
    pub candidate: CandidateId,
    /// Layer that produced the verdict.
    pub layer: LayerKind,
    /// The vote.
    #[serde(flatten)]
    pub vote: Vote,
    /// Why the layer voted this way.
    pub rationale: Rationale,
    /// When the verdict was produced.
    pub timestamp: DateTime<Utc>,
}

impl LayerVerdict {
    /// Creates a verdict stamped with the current time.
    #[must_use]
    pub fn new(candidate: CandidateId, layer: LayerKind, vote: Vote, rationale: Rationale) -> Self {
        Self {
            candidate,
            layer,
            vote,
            rationale,
            timestamp: Utc::now(),
        }
    }

    /// Returns a stable reference string `"<candidate>/<layer>"`.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}/{}", self.candidate, self.layer)
    }
}

/// Final classification of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    /// A real violation.
    ConfirmedViolation,
    /// Neither threshold reached.
    NeedsReview,
    /// Not a real violation.
    Dismissed,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfirmedViolation => write!(f, "confirmed-violation"),
            Self::NeedsReview => write!(f, "needs-review"),
            Self::Dismissed => write!(f, "dismissed"),
        }
    }
}
