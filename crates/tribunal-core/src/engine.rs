//! Scan orchestration.
//!
//! A scan runs in four phases:
//!
//! 1. file exclusion,
//! 2. pattern matching and context analysis (CPU-bound, on rayon workers),
//! 3. deep analysis of uncertain candidates (async, bounded),
//! 4. aggregation, deduplication and the admit/block verdict.
//!
//! Every phase writes to the scan's [`AuditTrail`]; the trail is sealed and
//! exported with the outcome.

use chrono::Utc;
use miette::Diagnostic;
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::{
    mark_duplicates, scan_verdict, weighted_score, AggregationError, VoteAggregator,
    NEUTRAL_SCORE,
};
use crate::audit::{
    AuditBatch, AuditExport, AuditKind, AuditPayload, AuditRecord, AuditSubject, AuditTrail,
};
use crate::cancel::ScanCancellation;
use crate::config::{ConfigError, ConfigReport, EngineConfig};
use crate::context::{ContextLayer, FileSnapshot, ProjectContext};
use crate::decision::{Decision, ScanOutcome, ScanStats};
use crate::deep::{ContextWindow, DeepAnalyzer, DeepInvoker, DeepOutcome, DeepRequest, DeepResult};
use crate::exclusion::{ExclusionResolver, SourceFile};
use crate::matching::{PatternHit, PatternLayer};
use crate::pattern::{PatternDefinition, PatternStore};
use crate::source::{ContentAccessor, FileInput};
use crate::types::{Candidate, LayerKind, LayerVerdict};

/// Errors that abort a scan.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    /// Configuration could not be used.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    /// An internal invariant was violated.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Invariant(#[from] AggregationError),

    /// A scan worker terminated abnormally.
    #[error("scan worker failed: {0}")]
    #[diagnostic(code(tribunal::engine::worker))]
    Worker(String),

    /// The blocking runtime could not be started.
    #[error("failed to start scan runtime: {0}")]
    #[diagnostic(code(tribunal::engine::runtime))]
    Runtime(#[from] std::io::Error),
}

/// Per-scan options.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Scan identifier; a random UUID when absent.
    pub scan_id: Option<String>,
    /// Cooperative cancellation signal.
    pub cancellation: ScanCancellation,
}

impl ScanOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the scan id.
    #[must_use]
    pub fn scan_id(mut self, id: impl Into<String>) -> Self {
        self.scan_id = Some(id.into());
        self
    }

    /// Sets the cancellation signal.
    #[must_use]
    pub fn cancellation(mut self, cancellation: ScanCancellation) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Outcome of a scan together with its sealed audit trail.
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Decisions, verdict and statistics.
    pub outcome: ScanOutcome,
    /// Every audit entry issued during the scan.
    pub audit: AuditExport,
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    patterns: PatternStore,
    project: Option<ProjectContext>,
    analyzer: Option<Arc<dyn DeepAnalyzer>>,
    root: Option<PathBuf>,
}

impl EngineBuilder {
    /// Creates a builder with default configuration and no patterns.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the pattern store.
    #[must_use]
    pub fn patterns(mut self, patterns: PatternStore) -> Self {
        self.patterns = patterns;
        self
    }

    /// Adds one pattern definition.
    #[must_use]
    pub fn pattern(mut self, definition: PatternDefinition) -> Self {
        self.patterns.insert(definition);
        self
    }

    /// Sets the project context. When absent it is discovered from the root.
    #[must_use]
    pub fn project(mut self, project: ProjectContext) -> Self {
        self.project = Some(project);
        self
    }

    /// Attaches a deep analyzer.
    #[must_use]
    pub fn deep_analyzer(mut self, analyzer: Arc<dyn DeepAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Sets the scan root used for ignore files and manifest discovery.
    #[must_use]
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable or an exclusion
    /// glob is invalid. Invalid layer weights only disable that layer.
    pub fn build(self) -> Result<Engine, EngineError> {
        let report = self.config.validate()?;
        for issue in &report.disabled_layers {
            warn!(layer = %issue.layer, message = %issue.message, "Layer disabled");
        }

        let resolver = ExclusionResolver::new(&self.config.exclusion, self.root.as_deref())?;
        let store = self.patterns.configured(&self.config);
        let project = self
            .project
            .unwrap_or_else(|| {
                self.root
                    .as_deref()
                    .map_or_else(ProjectContext::new, ProjectContext::discover)
            })
            .with_vocabulary(&self.config.context);

        let aggregator = VoteAggregator::new(
            self.config.weights.without(&report.disabled()),
            self.config.thresholds,
        );
        let deep = self
            .analyzer
            .filter(|_| self.config.deep.enabled && !report.is_disabled(LayerKind::Deep))
            .map(|analyzer| DeepInvoker::new(analyzer, self.config.deep.clone()));
        let context = ContextLayer::new(Arc::new(project), self.config.context.clone());

        debug!(
            patterns = store.len(),
            skipped = store.skipped().len(),
            deep = deep.is_some(),
            "Engine built"
        );

        Ok(Engine {
            inner: Arc::new(Inner {
                config: self.config,
                report,
                resolver,
                store,
                context,
                aggregator,
                deep,
            }),
        })
    }
}

/// The analysis engine. Cheap to clone; clones share the deep-analysis cache.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: EngineConfig,
    report: ConfigReport,
    resolver: ExclusionResolver,
    store: PatternStore,
    context: ContextLayer,
    aggregator: VoteAggregator,
    deep: Option<DeepInvoker>,
}

/// A candidate travelling through the layers.
struct Pending {
    candidate: Candidate,
    pattern: Arc<PatternDefinition>,
    verdicts: Vec<LayerVerdict>,
    deep_request: Option<DeepRequest>,
    undecided: bool,
}

struct FileAnalysis {
    stats: ScanStats,
    pending: Vec<Pending>,
    unprocessed: usize,
}

#[derive(Default)]
struct DeepTally {
    invocations: usize,
    cache_hits: usize,
}

impl Engine {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Returns the configuration in force.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns the active patterns.
    #[must_use]
    pub fn patterns(&self) -> &PatternStore {
        &self.inner.store
    }

    /// Returns the project context.
    #[must_use]
    pub fn project(&self) -> &ProjectContext {
        self.inner.context.project()
    }

    /// Scans a change set.
    ///
    /// A cancelled scan still returns: decided candidates keep their
    /// decisions, the rest are recorded as undecided and the outcome is
    /// marked partial.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker fails or an internal invariant is
    /// violated.
    pub async fn scan(
        &self,
        files: Vec<FileInput>,
        options: ScanOptions,
    ) -> Result<ScanReport, EngineError> {
        let scan_id = options
            .scan_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cancellation = options.cancellation;
        let started_at = Utc::now();
        let trail = Arc::new(AuditTrail::new(scan_id.clone()));

        info!(
            scan_id = %scan_id,
            files = files.len(),
            patterns = self.inner.store.len(),
            "Scan started"
        );
        self.inner.record_setup(&trail);

        let analysis = {
            let inner = Arc::clone(&self.inner);
            let trail = Arc::clone(&trail);
            let cancellation = cancellation.clone();
            tokio::task::spawn_blocking(move || inner.analyze_files(files, &trail, &cancellation))
                .await
                .map_err(|e| EngineError::Worker(e.to_string()))?
        };
        let FileAnalysis {
            mut stats,
            mut pending,
            unprocessed,
        } = analysis;

        let tally = self
            .inner
            .run_deep(&mut pending, &trail, &cancellation)
            .await?;
        stats.deep_invocations = tally.invocations;
        stats.deep_cache_hits = tally.cache_hits;

        let decisions = self.inner.aggregate(pending, &trail, &mut stats)?;
        let verdict = scan_verdict(&decisions, &self.inner.config.verdict);
        let partial = cancellation.is_cancelled();

        if partial {
            let counts = [
                ("files_unprocessed".to_string(), unprocessed),
                ("candidates_undecided".to_string(), stats.undecided),
                ("candidates_decided".to_string(), stats.decided),
            ]
            .into_iter()
            .collect();
            trail.record(
                AuditRecord::new(
                    AuditKind::ScanCancelled,
                    "scan cancelled; outcome is partial",
                    AuditSubject::default(),
                )
                .with_payload(AuditPayload::Counts(counts)),
            );
            warn!(
                scan_id = %scan_id,
                unprocessed,
                undecided = stats.undecided,
                "Scan cancelled"
            );
        }

        trail.seal();
        let outcome = ScanOutcome {
            scan_id,
            started_at,
            finished_at: Utc::now(),
            decisions,
            verdict,
            stats,
            partial,
            skipped_patterns: self.inner.store.skipped().to_vec(),
            disabled_layers: self.inner.report.disabled_layers.clone(),
        };
        info!(
            scan_id = %outcome.scan_id,
            verdict = %outcome.verdict,
            decided = outcome.stats.decided,
            partial,
            "Scan finished"
        );

        Ok(ScanReport {
            outcome,
            audit: trail.export(),
        })
    }

    /// Loads `paths` through `accessor` and scans them.
    ///
    /// # Errors
    ///
    /// See [`Engine::scan`].
    pub async fn scan_paths(
        &self,
        accessor: &dyn ContentAccessor,
        paths: &[PathBuf],
        options: ScanOptions,
    ) -> Result<ScanReport, EngineError> {
        self.scan(accessor.load_all(paths), options).await
    }

    /// Runs [`Engine::scan`] on a dedicated runtime.
    ///
    /// Must not be called from within an async context.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot start, or as [`Engine::scan`].
    pub fn scan_blocking(
        &self,
        files: Vec<FileInput>,
        options: ScanOptions,
    ) -> Result<ScanReport, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.scan(files, options))
    }
}

impl Inner {
    fn record_setup(&self, trail: &AuditTrail) {
        let disabled = self.report.disabled_layers.iter().map(|issue| {
            AuditRecord::new(
                AuditKind::LayerDisabled,
                format!("{} layer disabled: {}", issue.layer, issue.message),
                AuditSubject::default(),
            )
            .with_payload(AuditPayload::Layer(issue.clone()))
        });
        let skipped = self.store.skipped().iter().map(|skip| {
            AuditRecord::new(
                AuditKind::PatternSkipped,
                format!("pattern definition skipped: {}", skip.reason),
                AuditSubject::default(),
            )
            .with_payload(AuditPayload::Skipped(skip.clone()))
        });
        trail.record_all(disabled.chain(skipped));
    }

    fn analyze_files(
        &self,
        files: Vec<FileInput>,
        trail: &AuditTrail,
        cancellation: &ScanCancellation,
    ) -> FileAnalysis {
        let files_seen = files.len();
        let resolved = self.resolver.resolve_all(files, trail);
        let mut stats = ScanStats {
            files_seen,
            files_included: resolved.included.len(),
            files_excluded: resolved.excluded.len(),
            excluded_by_source: resolved.counts_by_source(),
            ..ScanStats::default()
        };

        let per_file: Vec<Option<Vec<Pending>>> = resolved
            .included
            .par_iter()
            .map(|file| {
                if cancellation.is_cancelled() {
                    return None;
                }
                let mut batch = trail.batch();
                Some(self.analyze_file(file, &mut batch))
            })
            .collect();

        let unprocessed = per_file.iter().filter(|f| f.is_none()).count();
        let pending: Vec<Pending> = per_file.into_iter().flatten().flatten().collect();
        stats.candidates = pending.len();

        FileAnalysis {
            stats,
            pending,
            unprocessed,
        }
    }

    fn analyze_file(&self, file: &SourceFile, batch: &mut AuditBatch<'_>) -> Vec<Pending> {
        let hits = PatternLayer.match_file(file, &self.store, &self.resolver, batch);
        if hits.is_empty() {
            return Vec::new();
        }
        let snapshot = self.context.snapshot(file);
        hits.into_iter()
            .map(|hit| self.assess(hit, &snapshot, batch))
            .collect()
    }

    fn assess(&self, hit: PatternHit, snapshot: &FileSnapshot, batch: &mut AuditBatch<'_>) -> Pending {
        let PatternHit {
            candidate,
            verdict,
            pattern,
        } = hit;
        batch.push(verdict_record(&candidate, &verdict));
        let mut verdicts = vec![verdict];

        if !self.report.is_disabled(LayerKind::Context) {
            let context = self
                .context
                .evaluate(&candidate, &verdicts[0], &pattern, snapshot);
            batch.push(verdict_record(&candidate, &context));
            verdicts.push(context);
        }

        let deep_request = self.deep.as_ref().and_then(|deep| {
            let score = weighted_score(&verdicts, &self.aggregator.basis().weights)
                .map_or(NEUTRAL_SCORE, |ws| ws.score);
            if !deep.should_invoke(score) {
                return None;
            }
            let config = deep.config();
            Some(DeepRequest {
                window: ContextWindow::around(
                    &snapshot.text,
                    &snapshot.lines,
                    &candidate.location,
                    config.context_lines,
                    config.max_context_bytes,
                ),
                candidate: candidate.clone(),
                pattern_description: pattern.description.clone(),
                prior_verdicts: verdicts.clone(),
            })
        });

        Pending {
            candidate,
            pattern,
            verdicts,
            deep_request,
            undecided: false,
        }
    }

    async fn run_deep(
        self: &Arc<Self>,
        pending: &mut [Pending],
        trail: &Arc<AuditTrail>,
        cancellation: &ScanCancellation,
    ) -> Result<DeepTally, EngineError> {
        let mut tasks = JoinSet::new();
        for (index, p) in pending.iter_mut().enumerate() {
            let Some(request) = p.deep_request.take() else {
                continue;
            };
            let inner = Arc::clone(self);
            let trail = Arc::clone(trail);
            let cancellation = cancellation.clone();
            tasks.spawn(async move {
                let result = inner.deep_one(request, &trail, &cancellation).await;
                (index, result)
            });
        }

        let mut tally = DeepTally::default();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| EngineError::Worker(e.to_string()))?;
            match result {
                Some(result) => {
                    if result.cached {
                        tally.cache_hits += 1;
                    } else {
                        tally.invocations += 1;
                    }
                    pending[index].verdicts.push(result.verdict);
                }
                None => pending[index].undecided = true,
            }
        }
        Ok(tally)
    }

    async fn deep_one(
        self: Arc<Self>,
        request: DeepRequest,
        trail: &AuditTrail,
        cancellation: &ScanCancellation,
    ) -> Option<DeepResult> {
        let candidate = request.candidate.clone();
        let subject = AuditSubject::candidate(
            &candidate.id,
            &candidate.location.file,
            &candidate.pattern,
        );
        let step = trail.step(AuditKind::DeepInvoked, "deep analysis", subject);

        let invoked = {
            let inner = Arc::clone(&self);
            let cancellation = cancellation.clone();
            tokio::spawn(async move {
                match inner.deep.as_ref() {
                    Some(deep) => deep.invoke(&request, &cancellation).await,
                    None => None,
                }
            })
            .await
        };

        let result = match invoked {
            Ok(Some(result)) => result,
            Ok(None) => {
                step.finish(
                    "deep analysis not submitted: scan cancelled",
                    Some(AuditPayload::Deep {
                        outcome: "cancelled".to_string(),
                        cached: false,
                    }),
                );
                return None;
            }
            Err(e) => {
                warn!(candidate = %candidate.id, error = %e, "Deep analyzer panicked; abstaining");
                let deep = self.deep.as_ref()?;
                deep.failure(candidate.id.clone(), format!("analyzer panicked: {e}"))
            }
        };

        let outcome = match (&result.outcome, result.verdict.rationale.code.as_str()) {
            (Some(DeepOutcome::Verdict { .. }), _) => "verdict",
            (Some(DeepOutcome::Abstain { .. }), _) => "abstain",
            (None, "deep-timeout") => "timeout",
            (None, "deep-invalid") => "invalid",
            (None, _) => "error",
        };
        step.finish(
            format!("deep analysis: {outcome}"),
            Some(AuditPayload::Deep {
                outcome: outcome.to_string(),
                cached: result.cached,
            }),
        );
        trail.record(verdict_record(&candidate, &result.verdict));
        Some(result)
    }

    fn aggregate(
        &self,
        pending: Vec<Pending>,
        trail: &AuditTrail,
        stats: &mut ScanStats,
    ) -> Result<Vec<Decision>, EngineError> {
        let mut decisions = Vec::with_capacity(pending.len());
        let mut undecided = Vec::new();
        for p in pending {
            if p.undecided {
                undecided.push(
                    AuditRecord::new(
                        AuditKind::CandidateUndecided,
                        "scan cancelled before a decision was reached",
                        AuditSubject::candidate(
                            &p.candidate.id,
                            &p.candidate.location.file,
                            &p.candidate.pattern,
                        ),
                    )
                    .mark_partial(),
                );
                continue;
            }
            decisions.push(self.aggregator.decide(p.candidate, &p.pattern, p.verdicts)?);
        }
        stats.undecided = undecided.len();
        trail.record_all(undecided);

        decisions.sort_by(|a, b| {
            let (la, lb) = (&a.candidate.location, &b.candidate.location);
            la.file
                .cmp(&lb.file)
                .then(la.line.cmp(&lb.line))
                .then(la.column.cmp(&lb.column))
                .then_with(|| a.candidate.pattern.cmp(&b.candidate.pattern))
                .then_with(|| a.id().cmp(b.id()))
        });
        let decisions = mark_duplicates(decisions);

        trail.record_all(decisions.iter().map(|d| {
            stats.count_decision(d);
            aggregation_record(d)
        }));
        Ok(decisions)
    }
}

fn verdict_record(candidate: &Candidate, verdict: &LayerVerdict) -> AuditRecord {
    AuditRecord::new(
        AuditKind::VerdictEmitted,
        format!("{} verdict: {}", verdict.layer, verdict.rationale.code),
        AuditSubject::candidate(&candidate.id, &candidate.location.file, &candidate.pattern),
    )
    .with_payload(AuditPayload::Verdict(verdict.clone()))
}

fn aggregation_record(decision: &Decision) -> AuditRecord {
    let candidate = &decision.candidate;
    AuditRecord::new(
        AuditKind::AggregationComplete,
        format!("{} (score {:.3})", decision.classification, decision.score),
        AuditSubject::candidate(&candidate.id, &candidate.location.file, &candidate.pattern),
    )
    .with_payload(AuditPayload::Aggregation {
        score: decision.score,
        confidence: decision.confidence,
        classification: decision.classification,
        basis: decision.basis,
        verdicts: decision.verdicts.iter().map(LayerVerdict::reference).collect(),
        duplicate_of: decision.duplicate_of.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Matcher, PatternId};
    use crate::types::{Classification, Severity};

    fn cors_pattern() -> PatternDefinition {
        PatternDefinition::new(
            PatternId::new("wildcard-cors").unwrap(),
            Severity::Error,
            "security",
            Matcher::regex(r#"["']\*(?:\.[\w*]+)?["']"#, None).unwrap(),
        )
        .with_description("wildcard origin in a CORS setting")
    }

    fn engine() -> Engine {
        Engine::builder()
            .pattern(cors_pattern())
            .project(ProjectContext::new())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_scan_classifies_by_context() {
        let files = vec![
            FileInput::text("settings.py", "CORS_ALLOWED_ORIGINS = [\"*\"]\n"),
            FileInput::text("build.py", "files = glob.glob(\"*.py\")\n"),
        ];
        let report = engine().scan(files, ScanOptions::new()).await.unwrap();
        let outcome = &report.outcome;

        assert_eq!(outcome.decisions.len(), 2);
        assert_eq!(outcome.decisions[0].candidate.location.file, PathBuf::from("build.py"));
        assert_eq!(outcome.decisions[0].classification, Classification::Dismissed);
        assert_eq!(
            outcome.decisions[1].classification,
            Classification::ConfirmedViolation
        );
        assert!(outcome.verdict.is_block());
        assert!(!outcome.partial);
        assert!(report.audit.sealed);
    }

    #[tokio::test]
    async fn test_every_decision_is_audited() {
        let files = vec![FileInput::text("a.py", "origins = ['*']\nsep = \"*\"\n")];
        let report = engine().scan(files, ScanOptions::new()).await.unwrap();

        let aggregated = report.audit.by_kind(AuditKind::AggregationComplete);
        assert_eq!(aggregated.len(), report.outcome.decisions.len());
        let replayed = report.audit.replay().unwrap();
        assert_eq!(replayed.len(), report.outcome.decisions.len());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_partial() {
        let cancellation = ScanCancellation::new();
        cancellation.cancel();
        let files = vec![FileInput::text("settings.py", "ORIGINS = [\"*\"]\n")];
        let report = engine()
            .scan(files, ScanOptions::new().cancellation(cancellation))
            .await
            .unwrap();

        assert!(report.outcome.partial);
        assert!(report.outcome.decisions.is_empty());
        assert_eq!(report.audit.by_kind(AuditKind::ScanCancelled).len(), 1);
    }

    #[test]
    fn test_scan_blocking() {
        let files = vec![FileInput::text("settings.py", "ORIGINS = [\"*\"]\n")];
        let report = engine()
            .scan_blocking(files, ScanOptions::new().scan_id("fixed"))
            .unwrap();
        assert_eq!(report.outcome.scan_id, "fixed");
        assert_eq!(report.audit.scan_id, "fixed");
    }
}
