//! Deep-analysis boundary: invocation contract for an external analyzer.
//!
//! The analyzer itself lives outside this crate. [`DeepInvoker`] decides
//! when to call it, bounds concurrency and latency, and caches outcomes so
//! identical candidates are submitted at most once per layer version.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::cancel::ScanCancellation;
use crate::config::DeepConfig;
use crate::source::LineIndex;
use crate::types::{Candidate, CandidateId, LayerKind, LayerVerdict, Location, Rationale, Vote};

/// Source text surrounding a candidate, bounded in lines and bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWindow {
    /// First line included (1-indexed).
    pub start_line: usize,
    /// Last line included (1-indexed).
    pub end_line: usize,
    /// The window text.
    pub text: String,
    /// True if the byte cap removed lines or cut the match line.
    pub truncated: bool,
}

impl ContextWindow {
    /// Builds the window of `context_lines` on each side of `location`,
    /// capped at `max_bytes`.
    ///
    /// Lines are added alternately below and above the match line while they
    /// fit. A match line longer than the cap is cut around the match.
    #[must_use]
    pub fn around(
        text: &str,
        lines: &LineIndex,
        location: &Location,
        context_lines: usize,
        max_bytes: usize,
    ) -> Self {
        let line_text = |n: usize| &text[lines.line_start(n)..lines.line_end(n)];
        let line = location.line.clamp(1, lines.line_count());
        let own = line_text(line);

        if own.len() > max_bytes {
            let column = location.offset.saturating_sub(lines.line_start(line));
            let mut start = column.saturating_sub(max_bytes / 2);
            let mut end = (start + max_bytes).min(own.len());
            while !own.is_char_boundary(start) {
                start -= 1;
            }
            while end > start && !own.is_char_boundary(end) {
                end -= 1;
            }
            return Self {
                start_line: line,
                end_line: line,
                text: own[start..end].to_string(),
                truncated: true,
            };
        }

        let first = line.saturating_sub(context_lines).max(1);
        let last = (line + context_lines).min(lines.line_count());
        let (mut lo, mut hi) = (line, line);
        let mut size = own.len();
        let mut truncated = false;
        loop {
            let mut grew = false;
            if hi < last {
                let extra = line_text(hi + 1).len() + 1;
                if size + extra <= max_bytes {
                    hi += 1;
                    size += extra;
                    grew = true;
                } else {
                    truncated = true;
                }
            }
            if lo > first {
                let extra = line_text(lo - 1).len() + 1;
                if size + extra <= max_bytes {
                    lo -= 1;
                    size += extra;
                    grew = true;
                } else {
                    truncated = true;
                }
            }
            if !grew {
                break;
            }
        }

        Self {
            start_line: lo,
            end_line: hi,
            text: text[lines.line_start(lo)..lines.line_end(hi)].to_string(),
            truncated,
        }
    }
}

/// What the deep analyzer is asked to judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepRequest {
    /// The candidate.
    pub candidate: Candidate,
    /// Description of the originating pattern.
    pub pattern_description: String,
    /// Verdicts emitted so far, pattern first.
    pub prior_verdicts: Vec<LayerVerdict>,
    /// Bounded surrounding source.
    pub window: ContextWindow,
}

/// Result returned by a deep analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum DeepOutcome {
    /// A scored judgment.
    Verdict {
        /// Benign-ness score in `[0, 1]`.
        score: f64,
        /// Confidence in `[0, 1]`.
        confidence: f64,
        /// Why.
        rationale: Rationale,
    },
    /// The analyzer declined to judge.
    Abstain {
        /// Why.
        reason: String,
    },
}

/// Deep analyzer failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeepError {
    /// A failure that may succeed on retry; never cached.
    #[error("transient deep-analysis failure: {0}")]
    Transient(String),

    /// A failure that will repeat for the same input; cached as abstention.
    #[error("deep-analysis failure: {0}")]
    Failed(String),
}

/// External deep analyzer.
#[async_trait]
pub trait DeepAnalyzer: Send + Sync {
    /// Version tag; outcomes are cached per version.
    fn version(&self) -> &str;

    /// Judges one candidate.
    async fn analyze(&self, request: &DeepRequest) -> Result<DeepOutcome, DeepError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    content: u64,
    version: String,
}

enum Skip {
    Cancelled,
    Timeout,
    Transient(String),
    Invalid(String),
}

/// Result of one invocation.
#[derive(Debug, Clone)]
pub struct DeepResult {
    /// The deep-layer verdict (possibly an abstention).
    pub verdict: LayerVerdict,
    /// The analyzer outcome, when one was obtained or cached.
    pub outcome: Option<DeepOutcome>,
    /// True if the outcome came from the cache.
    pub cached: bool,
}

/// Bounded, cached invoker of a [`DeepAnalyzer`].
pub struct DeepInvoker {
    analyzer: Arc<dyn DeepAnalyzer>,
    config: DeepConfig,
    version: String,
    semaphore: Semaphore,
    cache: Mutex<HashMap<CacheKey, Arc<OnceCell<DeepOutcome>>>>,
    submitted: AtomicUsize,
    cache_hits: AtomicUsize,
}

impl std::fmt::Debug for DeepInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepInvoker")
            .field("version", &self.version)
            .field("config", &self.config)
            .field("submitted", &self.submitted())
            .field("cache_hits", &self.cache_hits())
            .finish_non_exhaustive()
    }
}

impl DeepInvoker {
    /// Creates an invoker. `config.layer_version` overrides the analyzer's
    /// own version tag in cache keys.
    #[must_use]
    pub fn new(analyzer: Arc<dyn DeepAnalyzer>, config: DeepConfig) -> Self {
        let version = config
            .layer_version
            .clone()
            .unwrap_or_else(|| analyzer.version().to_string());
        Self {
            semaphore: Semaphore::new(config.max_concurrency.max(1)),
            analyzer,
            config,
            version,
            cache: Mutex::new(HashMap::new()),
            submitted: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
        }
    }

    /// Returns true if a candidate with this post-context score is routed
    /// to deep analysis.
    #[must_use]
    pub fn should_invoke(&self, score: f64) -> bool {
        self.config.enabled && self.config.in_band(score)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DeepConfig {
        &self.config
    }

    /// Number of requests actually sent to the analyzer.
    #[must_use]
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Number of requests answered from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::Relaxed)
    }

    fn cache_key(&self, request: &DeepRequest) -> CacheKey {
        let mut hasher = Xxh3::new();
        hasher.update(request.candidate.pattern.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(request.candidate.matched_text.as_bytes());
        hasher.update(&[0]);
        hasher.update(request.window.text.as_bytes());
        CacheKey {
            content: hasher.digest(),
            version: self.version.clone(),
        }
    }

    fn cell(&self, key: CacheKey) -> Arc<OnceCell<DeepOutcome>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cache.entry(key).or_default())
    }

    /// Submits one request, or answers it from the cache.
    ///
    /// Returns `None` if the scan was cancelled before the request could be
    /// submitted; the candidate then stays undecided. Timeouts and analyzer
    /// errors resolve to an abstained verdict.
    pub async fn invoke(
        &self,
        request: &DeepRequest,
        cancellation: &ScanCancellation,
    ) -> Option<DeepResult> {
        let candidate = request.candidate.id.clone();
        let cell = self.cell(self.cache_key(request));

        if let Some(outcome) = cell.get() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Some(self.result(candidate, outcome.clone(), true));
        }
        if cancellation.is_cancelled() {
            return None;
        }

        let ran = AtomicBool::new(false);
        let initialized = cell
            .get_or_try_init(|| async {
                ran.store(true, Ordering::Relaxed);
                self.submit(request, cancellation).await
            })
            .await;

        match initialized {
            Ok(outcome) => {
                let cached = !ran.load(Ordering::Relaxed);
                if cached {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                }
                Some(self.result(candidate, outcome.clone(), cached))
            }
            Err(Skip::Cancelled) => None,
            Err(Skip::Timeout) => {
                warn!(candidate = %candidate, timeout_ms = self.config.timeout_ms, "Deep analysis timed out; abstaining");
                Some(self.abstention(
                    candidate,
                    "deep-timeout",
                    format!("no answer within {}ms", self.config.timeout_ms),
                ))
            }
            Err(Skip::Transient(message)) => {
                warn!(candidate = %candidate, error = %message, "Deep analysis failed; abstaining");
                Some(self.abstention(candidate, "deep-error", message))
            }
            Err(Skip::Invalid(message)) => {
                warn!(candidate = %candidate, error = %message, "Deep analysis answer rejected; abstaining");
                Some(self.abstention(candidate, "deep-invalid", message))
            }
        }
    }

    async fn submit(
        &self,
        request: &DeepRequest,
        cancellation: &ScanCancellation,
    ) -> Result<DeepOutcome, Skip> {
        let _permit = self.semaphore.acquire().await.map_err(|_| Skip::Cancelled)?;
        if cancellation.is_cancelled() {
            return Err(Skip::Cancelled);
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(candidate = %request.candidate.id, "Submitting to deep analysis");

        match tokio::time::timeout(self.config.timeout(), self.analyzer.analyze(request)).await {
            Err(_) => Err(Skip::Timeout),
            Ok(Err(DeepError::Transient(message))) => Err(Skip::Transient(message)),
            Ok(Err(DeepError::Failed(message))) => Ok(DeepOutcome::Abstain { reason: message }),
            Ok(Ok(outcome)) => validate(outcome),
        }
    }

    fn result(&self, candidate: CandidateId, outcome: DeepOutcome, cached: bool) -> DeepResult {
        let (vote, rationale) = match &outcome {
            DeepOutcome::Verdict {
                score,
                confidence,
                rationale,
            } => (Vote::cast(*score, *confidence), rationale.clone()),
            DeepOutcome::Abstain { reason } => (
                Vote::abstain(reason.clone()),
                Rationale::new("deep-abstain", reason.clone()),
            ),
        };
        let rationale = rationale.with_signal("layer_version", self.version.clone());
        DeepResult {
            verdict: LayerVerdict::new(candidate, LayerKind::Deep, vote, rationale),
            outcome: Some(outcome),
            cached,
        }
    }

    /// Abstained result for a failure outside the analyzer's own error path.
    pub(crate) fn failure(&self, candidate: CandidateId, reason: String) -> DeepResult {
        self.abstention(candidate, "deep-error", reason)
    }

    fn abstention(&self, candidate: CandidateId, code: &str, reason: String) -> DeepResult {
        let rationale = Rationale::new(code, reason.clone())
            .with_signal("layer_version", self.version.clone());
        DeepResult {
            verdict: LayerVerdict::new(candidate, LayerKind::Deep, Vote::abstain(reason), rationale),
            outcome: None,
            cached: false,
        }
    }
}

// Non-finite numbers would otherwise be clamped into a definite vote.
fn validate(outcome: DeepOutcome) -> Result<DeepOutcome, Skip> {
    match &outcome {
        DeepOutcome::Verdict {
            score, confidence, ..
        } if !score.is_finite() || !confidence.is_finite() => Err(Skip::Invalid(format!(
            "non-finite answer (score {score}, confidence {confidence})"
        ))),
        _ => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternId;
    use std::path::PathBuf;
    use std::time::Duration;

    struct FakeAnalyzer {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        result: Result<DeepOutcome, DeepError>,
    }

    impl FakeAnalyzer {
        fn new(result: Result<DeepOutcome, DeepError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::from_millis(10),
                result,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl DeepAnalyzer for FakeAnalyzer {
        fn version(&self) -> &str {
            "fake-1"
        }

        async fn analyze(&self, _request: &DeepRequest) -> Result<DeepOutcome, DeepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn benign() -> DeepOutcome {
        DeepOutcome::Verdict {
            score: 0.9,
            confidence: 0.8,
            rationale: Rationale::new("fake", "looks fine"),
        }
    }

    fn request(file: &str, text: &str) -> DeepRequest {
        let location = Location::new(PathBuf::from(file), 1, 1).with_span(0, text.len());
        let candidate = Candidate::new(PatternId::new("wildcard-cors").unwrap(), location, text);
        DeepRequest {
            candidate,
            pattern_description: "test".to_string(),
            prior_verdicts: Vec::new(),
            window: ContextWindow {
                start_line: 1,
                end_line: 1,
                text: format!("x = {text}"),
                truncated: false,
            },
        }
    }

    fn invoker(analyzer: Arc<FakeAnalyzer>, config: DeepConfig) -> DeepInvoker {
        DeepInvoker::new(analyzer, config)
    }

    #[tokio::test]
    async fn test_identical_candidates_submitted_once() {
        let analyzer = Arc::new(FakeAnalyzer::new(Ok(benign())));
        let deep = invoker(Arc::clone(&analyzer), DeepConfig::default());
        let cancel = ScanCancellation::new();

        // Same content in two files: same cache key, distinct candidates.
        let a = request("a.py", "\"*\"");
        let b = request("b.py", "\"*\"");
        let (ra, rb) = tokio::join!(deep.invoke(&a, &cancel), deep.invoke(&b, &cancel));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(deep.submitted(), 1);
        assert_eq!(deep.cache_hits(), 1);
        assert!(ra.cached != rb.cached);
        assert_eq!(ra.verdict.vote.scored(), Some((0.9, 0.8)));
        assert_eq!(rb.verdict.candidate, b.candidate.id);
    }

    #[tokio::test]
    async fn test_version_change_misses_cache() {
        let analyzer = Arc::new(FakeAnalyzer::new(Ok(benign())));
        let cancel = ScanCancellation::new();
        let first = invoker(Arc::clone(&analyzer), DeepConfig::default());
        first.invoke(&request("a.py", "\"*\""), &cancel).await.unwrap();

        let config = DeepConfig {
            layer_version: Some("2".to_string()),
            ..DeepConfig::default()
        };
        let second = invoker(Arc::clone(&analyzer), config);
        let result = second.invoke(&request("a.py", "\"*\""), &cancel).await.unwrap();
        assert!(!result.cached);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_abstains_and_is_not_cached() {
        let analyzer =
            Arc::new(FakeAnalyzer::new(Ok(benign())).with_delay(Duration::from_millis(500)));
        let config = DeepConfig {
            timeout_ms: 20,
            ..DeepConfig::default()
        };
        let deep = invoker(Arc::clone(&analyzer), config);
        let cancel = ScanCancellation::new();
        let req = request("a.py", "\"*\"");

        let first = deep.invoke(&req, &cancel).await.unwrap();
        assert!(first.verdict.vote.is_abstain());
        assert_eq!(first.verdict.rationale.code, "deep-timeout");

        deep.invoke(&req, &cancel).await.unwrap();
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors() {
        let cancel = ScanCancellation::new();
        let req = request("a.py", "\"*\"");

        let transient = Arc::new(FakeAnalyzer::new(Err(DeepError::Transient("busy".into()))));
        let deep = invoker(Arc::clone(&transient), DeepConfig::default());
        assert!(deep.invoke(&req, &cancel).await.unwrap().verdict.vote.is_abstain());
        deep.invoke(&req, &cancel).await.unwrap();
        assert_eq!(transient.calls.load(Ordering::SeqCst), 2);

        let failed = Arc::new(FakeAnalyzer::new(Err(DeepError::Failed("bad input".into()))));
        let deep = invoker(Arc::clone(&failed), DeepConfig::default());
        assert!(deep.invoke(&req, &cancel).await.unwrap().verdict.vote.is_abstain());
        let again = deep.invoke(&req, &cancel).await.unwrap();
        assert!(again.cached);
        assert_eq!(failed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_finite_answer_abstains_and_is_not_cached() {
        let cancel = ScanCancellation::new();
        let req = request("a.py", "\"*\"");
        for (score, confidence) in [(f64::NAN, 0.9), (0.2, f64::INFINITY), (f64::NEG_INFINITY, 1.0)] {
            let analyzer = Arc::new(FakeAnalyzer::new(Ok(DeepOutcome::Verdict {
                score,
                confidence,
                rationale: Rationale::new("fake", "broken"),
            })));
            let deep = invoker(Arc::clone(&analyzer), DeepConfig::default());

            let first = deep.invoke(&req, &cancel).await.unwrap();
            assert!(first.verdict.vote.is_abstain());
            assert_eq!(first.verdict.rationale.code, "deep-invalid");
            assert!(first.outcome.is_none());

            let second = deep.invoke(&req, &cancel).await.unwrap();
            assert!(!second.cached);
            assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
        }
    }

    #[tokio::test]
    async fn test_cancelled_scan_submits_nothing() {
        let analyzer = Arc::new(FakeAnalyzer::new(Ok(benign())));
        let deep = invoker(Arc::clone(&analyzer), DeepConfig::default());
        let cancel = ScanCancellation::new();
        cancel.cancel();
        assert!(deep.invoke(&request("a.py", "\"*\""), &cancel).await.is_none());
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let analyzer =
            Arc::new(FakeAnalyzer::new(Ok(benign())).with_delay(Duration::from_millis(30)));
        let config = DeepConfig {
            max_concurrency: 2,
            ..DeepConfig::default()
        };
        let deep = Arc::new(invoker(Arc::clone(&analyzer), config));
        let cancel = ScanCancellation::new();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let deep = Arc::clone(&deep);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let req = request("a.py", &format!("\"{i}\""));
                deep.invoke(&req, &cancel).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            assert!(joined.unwrap().is_some());
        }
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 8);
        assert!(analyzer.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_should_invoke_band_is_inclusive() {
        let analyzer = Arc::new(FakeAnalyzer::new(Ok(benign())));
        let deep = invoker(analyzer, DeepConfig::default());
        assert!(deep.should_invoke(0.3));
        assert!(deep.should_invoke(0.7));
        assert!(!deep.should_invoke(0.29));
        assert!(!deep.should_invoke(0.71));
    }

    #[test]
    fn test_context_window() {
        let text = "l1\nl2\nl3\nmatch here\nl5\nl6\nl7\n";
        let lines = LineIndex::new(text);
        let offset = text.find("match").unwrap();
        let location = Location::new(PathBuf::from("a.py"), 4, 1).with_span(offset, 5);

        let window = ContextWindow::around(text, &lines, &location, 2, 4096);
        assert_eq!((window.start_line, window.end_line), (2, 6));
        assert_eq!(window.text, "l2\nl3\nmatch here\nl5\nl6");
        assert!(!window.truncated);

        let window = ContextWindow::around(text, &lines, &location, 2, 16);
        assert_eq!(window.text, "l3\nmatch here\nl5");
        assert!(window.truncated);

        let window = ContextWindow::around(text, &lines, &location, 2, 4);
        assert_eq!(window.text, "matc");
        assert!(window.truncated);
    }
}
