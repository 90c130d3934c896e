//! Append-only audit trail.
//!
//! Every decision point of a scan is recorded as an [`AuditEntry`]. Sequence
//! numbers and timestamps are issued together under one lock, so the
//! sequence order is also the wall-clock issuance order. Workers buffer
//! entries in an [`AuditBatch`] and flush in bulk; multi-part steps are
//! wrapped in an [`AuditStep`] that records a partial entry if it is dropped
//! before completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::warn;

use crate::aggregate::{evaluate, Evaluation};
use crate::config::LayerIssue;
use crate::decision::DecisionBasis;
use crate::exclusion::ExclusionSource;
use crate::pattern::{PatternId, SkippedPattern};
use crate::types::{CandidateId, Classification, LayerVerdict};

/// Entries buffered by an [`AuditBatch`] before it flushes.
pub const BATCH_SIZE: usize = 64;

/// Kind of decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditKind {
    /// A file passed every exclusion source.
    FileIncluded,
    /// A file was excluded.
    FileExcluded,
    /// A pattern matched a file.
    PatternMatched,
    /// A pattern was checked against a file without matching.
    PatternChecked,
    /// A pattern was skipped (malformed definition or path exclude).
    PatternSkipped,
    /// A layer was disabled by configuration.
    LayerDisabled,
    /// A layer emitted a verdict.
    VerdictEmitted,
    /// The deep-analysis layer was consulted.
    DeepInvoked,
    /// A decision was computed.
    AggregationComplete,
    /// A candidate was left without a decision.
    CandidateUndecided,
    /// The scan was cancelled.
    ScanCancelled,
    /// The trail was sealed.
    ScanSealed,
}

/// What an entry is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSubject {
    /// Candidate involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateId>,
    /// File involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Pattern involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<PatternId>,
}

impl AuditSubject {
    /// Subject for a file.
    #[must_use]
    pub fn file(path: &Path) -> Self {
        Self {
            file: Some(path.to_path_buf()),
            ..Self::default()
        }
    }

    /// Subject for a pattern checked against a file.
    #[must_use]
    pub fn file_pattern(path: &Path, pattern: &PatternId) -> Self {
        Self {
            file: Some(path.to_path_buf()),
            pattern: Some(pattern.clone()),
            candidate: None,
        }
    }

    /// Subject for a candidate.
    #[must_use]
    pub fn candidate(id: &CandidateId, path: &Path, pattern: &PatternId) -> Self {
        Self {
            candidate: Some(id.clone()),
            file: Some(path.to_path_buf()),
            pattern: Some(pattern.clone()),
        }
    }
}

/// Structured payload of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditPayload {
    /// A file exclusion.
    Exclusion {
        /// Source that excluded the file.
        source: ExclusionSource,
        /// Why.
        reason: String,
    },
    /// Candidates produced by one pattern in one file.
    Matches {
        /// Candidate ids in span order.
        candidates: Vec<CandidateId>,
    },
    /// A skipped pattern definition.
    Skipped(SkippedPattern),
    /// A disabled layer.
    Layer(LayerIssue),
    /// A layer verdict, in full.
    Verdict(LayerVerdict),
    /// A deep-analysis invocation.
    Deep {
        /// `verdict`, `abstain`, `timeout`, `error` or `cancelled`.
        outcome: String,
        /// True if the result came from the cache.
        cached: bool,
    },
    /// A computed decision.
    Aggregation {
        /// Weighted score.
        score: f64,
        /// Aggregated confidence.
        confidence: f64,
        /// Classification.
        classification: Classification,
        /// Weights and thresholds used.
        basis: DecisionBasis,
        /// References (`candidate/layer`) of the contributing verdicts, in order.
        verdicts: Vec<String>,
        /// Primary decision this one duplicates.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duplicate_of: Option<CandidateId>,
    },
    /// Counts for scan-level entries.
    Counts(BTreeMap<String, usize>),
}

/// One row in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Strictly increasing sequence number, starting at 1.
    pub seq: u64,
    /// When the entry was issued.
    pub timestamp: DateTime<Utc>,
    /// Kind of decision point.
    pub kind: AuditKind,
    /// Free-form context.
    pub context: String,
    /// Duration of the step in microseconds.
    pub elapsed_us: u64,
    /// What the entry is about.
    #[serde(default)]
    pub subject: AuditSubject,
    /// Structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<AuditPayload>,
    /// True if the step did not complete.
    #[serde(default)]
    pub partial: bool,
}

/// An entry before sequence number and timestamp are issued.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// Kind of decision point.
    pub kind: AuditKind,
    /// Free-form context.
    pub context: String,
    /// Duration of the step in microseconds.
    pub elapsed_us: u64,
    /// What the entry is about.
    pub subject: AuditSubject,
    /// Structured payload.
    pub payload: Option<AuditPayload>,
    /// True if the step did not complete.
    pub partial: bool,
}

impl AuditRecord {
    /// Creates a record without payload.
    #[must_use]
    pub fn new(kind: AuditKind, context: impl Into<String>, subject: AuditSubject) -> Self {
        Self {
            kind,
            context: context.into(),
            elapsed_us: 0,
            subject,
            payload: None,
            partial: false,
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: AuditPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the elapsed time from a start instant.
    #[must_use]
    pub fn elapsed_since(mut self, started: Instant) -> Self {
        self.elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self
    }

    /// Flags the record as describing a step that did not complete.
    #[must_use]
    pub fn mark_partial(mut self) -> Self {
        self.partial = true;
        self
    }
}

#[derive(Debug)]
struct TrailState {
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
    entries: Vec<AuditEntry>,
    sealed: bool,
}

/// Thread-safe, append-only audit trail for one scan.
#[derive(Debug)]
pub struct AuditTrail {
    scan_id: String,
    state: Mutex<TrailState>,
}

impl AuditTrail {
    /// Creates an empty trail.
    #[must_use]
    pub fn new(scan_id: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.into(),
            state: Mutex::new(TrailState {
                next_seq: 1,
                last_timestamp: None,
                entries: Vec::new(),
                sealed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrailState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the scan id.
    #[must_use]
    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    /// Issues one entry and returns its sequence number.
    pub fn record(&self, record: AuditRecord) -> Option<u64> {
        let mut state = self.lock();
        issue(&mut state, record)
    }

    /// Issues several entries under one lock, in order.
    pub fn record_all(&self, records: impl IntoIterator<Item = AuditRecord>) {
        let mut state = self.lock();
        for record in records {
            issue(&mut state, record);
        }
    }

    /// Starts a buffered batch.
    #[must_use]
    pub fn batch(&self) -> AuditBatch<'_> {
        AuditBatch {
            trail: self,
            buffer: Vec::with_capacity(BATCH_SIZE),
        }
    }

    /// Starts a guarded step.
    #[must_use]
    pub fn step(
        &self,
        kind: AuditKind,
        context: impl Into<String>,
        subject: AuditSubject,
    ) -> AuditStep<'_> {
        AuditStep {
            trail: self,
            kind,
            context: context.into(),
            subject,
            started: Instant::now(),
            finished: false,
        }
    }

    /// Marks the trail complete. Later records are dropped.
    pub fn seal(&self) {
        let mut state = self.lock();
        if state.sealed {
            return;
        }
        let count = state.entries.len();
        issue(
            &mut state,
            AuditRecord::new(
                AuditKind::ScanSealed,
                format!("sealed after {count} entries"),
                AuditSubject::default(),
            ),
        );
        state.sealed = true;
    }

    /// Returns true once sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Returns the number of issued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if nothing was issued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exports a copy of every entry.
    #[must_use]
    pub fn export(&self) -> AuditExport {
        let state = self.lock();
        AuditExport {
            scan_id: self.scan_id.clone(),
            sealed: state.sealed,
            entries: state.entries.clone(),
        }
    }
}

fn issue(state: &mut TrailState, record: AuditRecord) -> Option<u64> {
    if state.sealed {
        warn!(kind = ?record.kind, "Audit record after seal dropped");
        return None;
    }
    let now = Utc::now();
    let timestamp = match state.last_timestamp {
        Some(last) if last > now => last,
        _ => now,
    };
    let seq = state.next_seq;
    state.next_seq += 1;
    state.last_timestamp = Some(timestamp);
    state.entries.push(AuditEntry {
        seq,
        timestamp,
        kind: record.kind,
        context: record.context,
        elapsed_us: record.elapsed_us,
        subject: record.subject,
        payload: record.payload,
        partial: record.partial,
    });
    Some(seq)
}

/// Per-worker buffer of audit records.
///
/// Flushes every [`BATCH_SIZE`] records and on drop.
#[derive(Debug)]
pub struct AuditBatch<'a> {
    trail: &'a AuditTrail,
    buffer: Vec<AuditRecord>,
}

impl AuditBatch<'_> {
    /// Buffers a record.
    pub fn push(&mut self, record: AuditRecord) {
        self.buffer.push(record);
        if self.buffer.len() >= BATCH_SIZE {
            self.flush();
        }
    }

    /// Issues every buffered record.
    pub fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.trail.record_all(self.buffer.drain(..));
        }
    }
}

impl Drop for AuditBatch<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Guard for a step that must be recorded even if it never completes.
#[derive(Debug)]
pub struct AuditStep<'a> {
    trail: &'a AuditTrail,
    kind: AuditKind,
    context: String,
    subject: AuditSubject,
    started: Instant,
    finished: bool,
}

impl AuditStep<'_> {
    /// Records the completed step.
    pub fn finish(mut self, context: impl Into<String>, payload: Option<AuditPayload>) {
        self.finished = true;
        let mut record =
            AuditRecord::new(self.kind, context, std::mem::take(&mut self.subject))
                .elapsed_since(self.started);
        record.payload = payload;
        self.trail.record(record);
    }
}

impl Drop for AuditStep<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut record = AuditRecord::new(
            self.kind,
            format!("{} (interrupted)", self.context),
            std::mem::take(&mut self.subject),
        )
        .elapsed_since(self.started);
        record.partial = true;
        self.trail.record(record);
    }
}

/// Errors reading or replaying an export.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// IO failure.
    #[error("audit export I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A line is not valid JSON for its position.
    #[error("line {line}: {source}")]
    Json {
        /// 1-indexed line.
        line: usize,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// The export has no header line.
    #[error("audit export is empty")]
    MissingHeader,

    /// An aggregation entry references a verdict not in the export.
    #[error("decision for {candidate} references missing verdict `{reference}`")]
    MissingVerdict {
        /// Candidate of the decision.
        candidate: CandidateId,
        /// The missing reference.
        reference: String,
    },

    /// Recomputation disagrees with the recorded decision.
    #[error("decision for {candidate} does not replay: recorded {recorded:?}, recomputed {recomputed:?}")]
    Mismatch {
        /// Candidate of the decision.
        candidate: CandidateId,
        /// What the trail recorded.
        recorded: Evaluation,
        /// What replay computed.
        recomputed: Evaluation,
    },

    /// Recomputation failed.
    #[error(transparent)]
    Aggregation(#[from] crate::aggregate::AggregationError),
}

#[derive(Serialize, Deserialize)]
struct ExportHeader {
    scan_id: String,
    sealed: bool,
    entries: usize,
}

/// A decision rebuilt from audit entries alone.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedDecision {
    /// Candidate of the decision.
    pub candidate: CandidateId,
    /// Verdicts recovered from `VerdictEmitted` entries, in decision order.
    pub verdicts: Vec<LayerVerdict>,
    /// Recomputed evaluation.
    pub evaluation: Evaluation,
    /// Basis used.
    pub basis: DecisionBasis,
}

/// Complete, self-contained record of a scan's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditExport {
    /// Scan id.
    pub scan_id: String,
    /// Whether the trail was sealed.
    pub sealed: bool,
    /// Entries in sequence order.
    pub entries: Vec<AuditEntry>,
}

impl AuditExport {
    /// Entries about a candidate.
    #[must_use]
    pub fn by_candidate(&self, id: &CandidateId) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .filter(|e| e.subject.candidate.as_ref() == Some(id))
            .collect()
    }

    /// Entries about a file.
    #[must_use]
    pub fn by_file(&self, path: &Path) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .filter(|e| e.subject.file.as_deref() == Some(path))
            .collect()
    }

    /// Entries of a kind.
    #[must_use]
    pub fn by_kind(&self, kind: AuditKind) -> Vec<&AuditEntry> {
        self.entries.iter().filter(|e| e.kind == kind).collect()
    }

    /// Entries issued within `[from, to]`.
    #[must_use]
    pub fn in_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .collect()
    }

    /// Entries flagged as partial.
    #[must_use]
    pub fn partial_entries(&self) -> Vec<&AuditEntry> {
        self.entries.iter().filter(|e| e.partial).collect()
    }

    /// Writes the export as JSON lines: a header, then one entry per line.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_jsonl<W: Write>(&self, mut writer: W) -> Result<(), AuditError> {
        let header = ExportHeader {
            scan_id: self.scan_id.clone(),
            sealed: self.sealed,
            entries: self.entries.len(),
        };
        let to_io = |e: serde_json::Error| AuditError::Io(e.into());
        serde_json::to_writer(&mut writer, &header).map_err(to_io)?;
        writer.write_all(b"\n")?;
        for entry in &self.entries {
            serde_json::to_writer(&mut writer, entry).map_err(to_io)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads an export written by [`AuditExport::write_jsonl`].
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, a missing header or invalid JSON.
    pub fn read_jsonl<R: BufRead>(reader: R) -> Result<Self, AuditError> {
        let mut lines = reader.lines().enumerate();
        let header: ExportHeader = loop {
            match lines.next() {
                Some((_, Ok(l))) if l.trim().is_empty() => {}
                Some((i, Ok(l))) => {
                    break serde_json::from_str(&l)
                        .map_err(|source| AuditError::Json { line: i + 1, source })?
                }
                Some((_, Err(e))) => return Err(e.into()),
                None => return Err(AuditError::MissingHeader),
            }
        };

        let mut entries = Vec::with_capacity(header.entries);
        for (i, line) in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(
                serde_json::from_str(&line)
                    .map_err(|source| AuditError::Json { line: i + 1, source })?,
            );
        }

        Ok(Self {
            scan_id: header.scan_id,
            sealed: header.sealed,
            entries,
        })
    }

    /// Rebuilds every decision from `VerdictEmitted` and
    /// `AggregationComplete` entries and checks each one recomputes to the
    /// recorded score and classification.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced verdict is missing or a decision does
    /// not recompute to what was recorded.
    pub fn replay(&self) -> Result<Vec<ReplayedDecision>, AuditError> {
        let verdicts: BTreeMap<String, &LayerVerdict> = self
            .entries
            .iter()
            .filter(|e| e.kind == AuditKind::VerdictEmitted)
            .filter_map(|e| match &e.payload {
                Some(AuditPayload::Verdict(v)) => Some((v.reference(), v)),
                _ => None,
            })
            .collect();

        let mut replayed = Vec::new();
        for entry in self.by_kind(AuditKind::AggregationComplete) {
            let Some(AuditPayload::Aggregation {
                score,
                confidence,
                classification,
                basis,
                verdicts: references,
                ..
            }) = &entry.payload
            else {
                continue;
            };
            let Some(candidate) = entry.subject.candidate.clone() else {
                continue;
            };

            let contributing = references
                .iter()
                .map(|r| {
                    verdicts
                        .get(r)
                        .map(|v| (*v).clone())
                        .ok_or_else(|| AuditError::MissingVerdict {
                            candidate: candidate.clone(),
                            reference: r.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let recomputed = evaluate(&candidate, &contributing, basis)?;
            let recorded = Evaluation {
                score: *score,
                confidence: *confidence,
                classification: *classification,
            };
            if recomputed.classification != recorded.classification
                || (recomputed.score - recorded.score).abs() > 1e-12
                || (recomputed.confidence - recorded.confidence).abs() > 1e-12
            {
                return Err(AuditError::Mismatch {
                    candidate,
                    recorded,
                    recomputed,
                });
            }

            replayed.push(ReplayedDecision {
                candidate,
                verdicts: contributing,
                evaluation: recomputed,
                basis: *basis,
            });
        }

        Ok(replayed)
    }
}
