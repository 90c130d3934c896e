//! Integration test: scanning a project directory through the runner.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tribunal::patterns::Preset;
use tribunal::{
    AuditExport, AuditKind, AuditPayload, Classification, Decision, DeepAnalyzer, DeepError, DeepOutcome,
    DeepRequest, Rationale, Runner, ScanOutcome,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn write(root: &Path, path: &str, content: &str) {
    let full = root.join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(full, content).expect("write fixture");
}

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    write(root, "tribunal.toml", "preset = \"recommended\"\n");
    write(root, ".gitignore", "build/\n");
    write(
        root,
        "app/settings.py",
        "DEBUG = False\nCORS_ALLOWED_ORIGINS = [\"*\"]\n",
    );
    write(
        root,
        "scripts/collect.py",
        "import glob\nfiles = glob.glob(\"*.py\")\n",
    );
    write(root, "build/generated.py", "ORIGINS = [\"*\"]\n");
    write(root, "node_modules/cors/index.js", "origin: '*'\n");
    dir
}

fn decision_in<'a>(outcome: &'a ScanOutcome, file: &str) -> Vec<&'a Decision> {
    outcome
        .decisions
        .iter()
        .filter(|d| d.candidate.location.file == PathBuf::from(file))
        .collect()
}

#[test]
fn scans_a_project_directory() {
    init_tracing();
    let dir = project();
    let report = Runner::new(dir.path())
        .run_blocking()
        .expect("scan should succeed");
    let outcome = &report.outcome;

    let settings = decision_in(outcome, "app/settings.py");
    assert_eq!(settings.len(), 1);
    assert_eq!(settings[0].classification, Classification::ConfirmedViolation);
    assert_eq!(settings[0].candidate.pattern.as_str(), "wildcard-cors");
    assert!(settings[0]
        .fix
        .as_deref()
        .is_some_and(|fix| fix.contains("trusted origins")));

    let collect = decision_in(outcome, "scripts/collect.py");
    assert_eq!(collect.len(), 1);
    assert_eq!(collect[0].classification, Classification::Dismissed);

    assert!(decision_in(outcome, "build/generated.py").is_empty());
    assert_eq!(outcome.stats.excluded_by_source.get("vcs-ignore"), Some(&1));
    assert_eq!(outcome.stats.excluded_by_source.get("config-exclude"), Some(&1));
    assert!(outcome.verdict.is_block());
    assert!(!outcome.partial);
}

#[test]
fn allow_directive_with_reason_dismisses() {
    init_tracing();
    let dir = project();
    write(
        dir.path(),
        "app/settings.py",
        "# tribunal: allow(wildcard-cors) reason=\"local development only\"\nCORS_ALLOWED_ORIGINS = [\"*\"]\n",
    );
    let report = Runner::new(dir.path())
        .run_blocking()
        .expect("scan should succeed");

    let settings = decision_in(&report.outcome, "app/settings.py");
    assert_eq!(settings[0].classification, Classification::Dismissed);
    assert_eq!(settings[0].verdicts[1].rationale.code, "allow-directive");
    assert!(!report.outcome.verdict.is_block());
}

#[test]
fn inline_patterns_and_overrides_apply() {
    init_tracing();
    let dir = project();
    write(
        dir.path(),
        "tribunal.toml",
        r#"
preset = "minimal"

[patterns.wildcard-cors]
enabled = false

[[pattern]]
id = "internal-host"
kind = "literal"
text = "corp.internal"
severity = "warning"
category = "privacy"

[[pattern]]
id = "Broken Id"
kind = "literal"
text = "x"
"#,
    );
    write(dir.path(), "app/client.py", "BASE = \"https://api.corp.internal\"\n");

    let runner = Runner::new(dir.path());
    let engine = runner.engine().expect("engine should build");
    let ids: Vec<&str> = engine.patterns().iter().map(|p| p.id.as_str()).collect();
    assert!(ids.contains(&"internal-host"));
    assert!(!ids.contains(&"wildcard-cors"));
    assert!(!ids.contains(&"eval-call"));

    let report = runner.run_blocking().expect("scan should succeed");
    let outcome = &report.outcome;
    assert_eq!(outcome.skipped_patterns.len(), 1);
    assert_eq!(outcome.skipped_patterns[0].id.as_deref(), Some("Broken Id"));
    let skipped = report.audit.by_kind(AuditKind::PatternSkipped);
    assert_eq!(skipped.len(), 1);
    assert!(matches!(
        &skipped[0].payload,
        Some(AuditPayload::Skipped(skip)) if skip.id.as_deref() == Some("Broken Id")
    ));
    assert!(outcome
        .decisions
        .iter()
        .all(|d| d.candidate.pattern.as_str() == "internal-host"));
    assert_eq!(decision_in(outcome, "app/client.py").len(), 1);
}

#[test]
fn explicit_preset_overrides_config() {
    init_tracing();
    let dir = project();
    let engine = Runner::new(dir.path())
        .preset(Preset::Strict)
        .engine()
        .expect("engine should build");
    assert_eq!(engine.patterns().len(), Preset::Strict.pattern_ids().len());
}

#[test]
fn outcome_and_audit_are_separate_artifacts() {
    init_tracing();
    let dir = project();
    let report = Runner::new(dir.path())
        .run_blocking()
        .expect("scan should succeed");

    let json = serde_json::to_string(&report.outcome).expect("serialize outcome");
    let restored: ScanOutcome = serde_json::from_str(&json).expect("deserialize outcome");
    assert_eq!(restored, report.outcome);

    let out = tempfile::tempdir().expect("tempdir");
    let path = out.path().join("audit.jsonl");
    report
        .audit
        .write_jsonl(std::fs::File::create(&path).expect("create"))
        .expect("write audit");
    let reader = std::io::BufReader::new(std::fs::File::open(&path).expect("open"));
    let audit = AuditExport::read_jsonl(reader).expect("read audit");

    assert_eq!(audit.scan_id, report.outcome.scan_id);
    assert_eq!(
        audit.replay().expect("replay").len(),
        report.outcome.decisions.len()
    );
    assert_eq!(
        audit.by_kind(AuditKind::FileExcluded).len(),
        report.outcome.stats.files_excluded
    );
}

struct CountingAnalyzer {
    calls: AtomicUsize,
}

#[async_trait]
impl DeepAnalyzer for CountingAnalyzer {
    fn version(&self) -> &str {
        "counting-1"
    }

    async fn analyze(&self, request: &DeepRequest) -> Result<DeepOutcome, DeepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(request.window.text.contains(&request.candidate.matched_text));
        Ok(DeepOutcome::Verdict {
            score: 1.0,
            confidence: 1.0,
            rationale: Rationale::new("separator", "wildcard used as a separator"),
        })
    }
}

#[tokio::test]
async fn deep_analyzer_resolves_uncertain_candidates() {
    init_tracing();
    let dir = project();
    write(dir.path(), "app/util.py", "sep = \"*\"\n");
    let analyzer = Arc::new(CountingAnalyzer {
        calls: AtomicUsize::new(0),
    });

    let report = Runner::new(dir.path())
        .deep_analyzer(analyzer.clone())
        .run()
        .await
        .expect("scan should succeed");

    assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    let util = decision_in(&report.outcome, "app/util.py");
    assert_eq!(util.len(), 1);
    assert_eq!(util[0].classification, Classification::Dismissed);
    assert_eq!(util[0].verdicts.len(), 3);
}
