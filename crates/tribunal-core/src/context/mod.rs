//! Context-analysis layer: situates each candidate in its surroundings.
//!
//! Signals are consulted in priority order:
//!
//! 1. an inline allow directive on the match line or the line above,
//! 2. a decisive syntactic role (comment, glob call, security key),
//! 3. the file role (documentation, test code),
//! 4. the remaining syntactic roles, relative to the pattern's prior.
//!
//! A pattern that needs a dependency the project does not declare is then
//! moved halfway toward dismissal.

pub mod project;
pub mod role;
pub mod rust_regions;

use std::sync::Arc;
use tracing::debug;

use crate::config::ContextConfig;
use crate::exclusion::SourceFile;
use crate::pattern::PatternDefinition;
use crate::types::{Candidate, LayerKind, LayerVerdict, Rationale, Vote};
use crate::utils::allowance::{check_allow_with_reason, AllowCheck};

pub use project::{
    normalize_dependency, parse_cargo_manifest, parse_package_json, parse_pyproject,
    parse_requirements, FileRole, FileSnapshot, ProjectContext, DEFAULT_GLOB_CALLEES,
    DEFAULT_SECURITY_KEYS,
};
pub use role::{RoleDetector, SyntacticRole};

/// The context-analysis layer.
#[derive(Debug, Clone)]
pub struct ContextLayer {
    project: Arc<ProjectContext>,
    config: ContextConfig,
}

struct Signal {
    score: f64,
    confidence: f64,
    code: &'static str,
    detail: String,
}

impl Signal {
    fn new(score: f64, confidence: f64, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            score,
            confidence,
            code,
            detail: detail.into(),
        }
    }
}

impl ContextLayer {
    /// Creates the layer over a project snapshot.
    #[must_use]
    pub fn new(project: Arc<ProjectContext>, config: ContextConfig) -> Self {
        Self { project, config }
    }

    /// Returns the project snapshot.
    #[must_use]
    pub fn project(&self) -> &ProjectContext {
        &self.project
    }

    /// Builds the per-file snapshot shared by a file's candidates.
    #[must_use]
    pub fn snapshot(&self, file: &SourceFile) -> FileSnapshot {
        FileSnapshot::new(file.path.clone(), Arc::clone(&file.text))
    }

    /// Produces the context verdict for one candidate.
    #[must_use]
    pub fn evaluate(
        &self,
        candidate: &Candidate,
        pattern_verdict: &LayerVerdict,
        pattern: &PatternDefinition,
        file: &FileSnapshot,
    ) -> LayerVerdict {
        let prior = pattern_verdict
            .vote
            .scored()
            .map_or_else(|| pattern.prior_score(), |(score, _)| score);
        let line = candidate.location.line;

        let role = RoleDetector::new(&self.project, self.config.lookback_lines)
            .detect(file, candidate.location.offset);

        let allow = check_allow_with_reason(&file.text, line, pattern.id.as_str());
        let allowed = allow.is_allowed();
        let mut signal = match allow {
            AllowCheck::Allowed {
                reason: Some(reason),
                line,
            } => Signal::new(
                1.0,
                0.95,
                "allow-directive",
                format!("allowed on line {line}: {reason}"),
            ),
            AllowCheck::Allowed { reason: None, line } => Signal::new(
                0.8,
                0.6,
                "allow-directive-unexplained",
                format!("allowed on line {line} without a reason"),
            ),
            AllowCheck::Denied => self.role_signal(&role, prior, file, line),
        };

        let mut rationale_signals = vec![
            ("role", role.to_string()),
            ("file_role", format!("{:?}", file.role).to_ascii_lowercase()),
        ];

        if let Some(dependency) = pattern.requires_dependency.as_ref().filter(|_| !allowed) {
            match self.project.declares(dependency) {
                Some(false) => {
                    signal.score += (1.0 - signal.score) * 0.5;
                    rationale_signals.push(("dependency", format!("{dependency} absent")));
                }
                Some(true) => {
                    rationale_signals.push(("dependency", format!("{dependency} declared")));
                }
                None => rationale_signals.push(("dependency", "unknown".to_string())),
            }
        }

        debug!(
            candidate = %candidate.id,
            role = %role,
            code = signal.code,
            score = signal.score,
            "Context verdict"
        );

        let rationale = rationale_signals.into_iter().fold(
            Rationale::new(signal.code, signal.detail),
            |r, (name, value)| r.with_signal(name, value),
        );
        LayerVerdict::new(
            candidate.id.clone(),
            LayerKind::Context,
            Vote::cast(signal.score, signal.confidence),
            rationale,
        )
    }

    fn role_signal(
        &self,
        role: &SyntacticRole,
        prior: f64,
        file: &FileSnapshot,
        line: usize,
    ) -> Signal {
        match role {
            SyntacticRole::Comment => Signal::new(0.9, 0.85, "comment", "match is inside a comment"),
            SyntacticRole::GlobCall { callee } => Signal::new(
                0.95,
                0.95,
                "glob-call",
                format!("match is a glob expression passed to `{callee}`"),
            ),
            SyntacticRole::SecurityKey { key } if file.role == FileRole::Config => Signal::new(
                0.05,
                0.95,
                "security-key",
                format!("configuration document sets security-relevant `{key}`"),
            ),
            SyntacticRole::SecurityKey { key } => Signal::new(
                0.05,
                0.9,
                "security-key",
                format!("match configures security-relevant `{key}`"),
            ),
            _ if file.role == FileRole::Docs => {
                Signal::new(0.9, 0.8, "docs-file", "match is in documentation")
            }
            _ if file.is_test_line(line) => Signal::new(0.75, 0.7, "test-code", "match is in test code"),
            SyntacticRole::Assignment { key } => Signal::new(
                prior + 0.25,
                0.6,
                "assignment",
                format!("match is assigned to `{key}`"),
            ),
            SyntacticRole::CallArgument { callee } => Signal::new(
                prior,
                0.6,
                "call-argument",
                format!("match is an argument to `{callee}`"),
            ),
            SyntacticRole::StringConstant => Signal::new(
                prior + 0.3,
                0.6,
                "string-constant",
                "match is a free-standing string",
            ),
            SyntacticRole::Code => Signal::new(prior, 0.7, "code", "match is plain code"),
            SyntacticRole::Unknown => Signal::new(
                0.5,
                self.config.confidence_floor * 0.5,
                "role-undetermined",
                "enclosing construct could not be determined",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Matcher, PatternId};
    use crate::types::{Location, Severity};
    use std::path::PathBuf;

    fn pattern(id: &str) -> PatternDefinition {
        PatternDefinition::new(
            PatternId::new(id).unwrap(),
            Severity::Error,
            "security",
            Matcher::regex(r#"["']\*(?:\.[\w*]+)?["']"#, None).unwrap(),
        )
    }

    fn verdict_for(
        layer: &ContextLayer,
        pattern: &PatternDefinition,
        path: &str,
        text: &str,
        needle: &str,
    ) -> LayerVerdict {
        let offset = text.find(needle).unwrap();
        let file = FileSnapshot::new(PathBuf::from(path), Arc::from(text));
        let (line, column) = file.lines.line_col(offset);
        let location = Location::new(PathBuf::from(path), line, column)
            .with_span(offset, needle.len());
        let candidate = Candidate::new(pattern.id.clone(), location, needle);
        let pattern_verdict = LayerVerdict::new(
            candidate.id.clone(),
            LayerKind::Pattern,
            Vote::cast(pattern.prior_score(), 0.7),
            Rationale::new("regex-match", "test"),
        );
        layer.evaluate(&candidate, &pattern_verdict, pattern, &file)
    }

    fn layer() -> ContextLayer {
        ContextLayer::new(Arc::new(ProjectContext::new()), ContextConfig::default())
    }

    fn scored(v: &LayerVerdict) -> (f64, f64) {
        v.vote.scored().unwrap()
    }

    #[test]
    fn test_security_key_leans_toward_violation() {
        let p = pattern("wildcard-cors");
        let v = verdict_for(&layer(), &p, "settings.py", "CORS_ALLOWED_ORIGINS = [\"*\"]\n", "\"*\"");
        assert_eq!(scored(&v), (0.05, 0.9));
        assert_eq!(v.rationale.code, "security-key");
        assert_eq!(v.layer, LayerKind::Context);
    }

    #[test]
    fn test_config_document_backs_security_key() {
        let p = pattern("wildcard-cors");
        let text = "[server.cors]\nallow = [\"*\"]\n";
        let v = verdict_for(&layer(), &p, "config/app.toml", text, "\"*\"");
        assert_eq!(scored(&v), (0.05, 0.95));
        assert_eq!(v.rationale.code, "security-key");
        assert_eq!(v.rationale.signals["file_role"], "config");
    }

    #[test]
    fn test_glob_call_leans_toward_dismissal() {
        let p = pattern("wildcard-cors");
        let v = verdict_for(&layer(), &p, "build.py", "files = glob.glob(\"*.py\")\n", "\"*.py\"");
        assert_eq!(scored(&v), (0.95, 0.95));
    }

    #[test]
    fn test_allow_directive() {
        let p = pattern("wildcard-cors");
        let text = "# tribunal: allow(wildcard-cors) reason=\"local dev server\"\norigins = [\"*\"]\n";
        let v = verdict_for(&layer(), &p, "dev.py", text, "\"*\"");
        assert_eq!(scored(&v), (1.0, 0.95));
        assert!(v.rationale.detail.contains("local dev server"));

        let text = "origins = [\"*\"]  # tribunal: allow(wildcard-cors)\n";
        let v = verdict_for(&layer(), &p, "dev.py", text, "\"*\"");
        assert_eq!(scored(&v), (0.8, 0.6));

        let text = "origins = [\"*\"]  # tribunal: allow(other-pattern) reason=\"x\"\n";
        let v = verdict_for(&layer(), &p, "dev.py", text, "\"*\"");
        assert_eq!(v.rationale.code, "security-key");
    }

    #[test]
    fn test_file_roles() {
        let p = pattern("wildcard-cors");
        let v = verdict_for(&layer(), &p, "docs/setup.md", "Use `sep = \"*\"` here.\n", "\"*\"");
        assert_eq!(v.rationale.code, "docs-file");

        let text = "fn f() {}\n\n#[cfg(test)]\nmod tests {\n    const S: &str = \"*\";\n}\n";
        let v = verdict_for(&layer(), &p, "src/lib.rs", text, "\"*\"");
        assert_eq!(scored(&v), (0.75, 0.7));
    }

    #[test]
    fn test_weak_roles_are_relative_to_prior() {
        let p = pattern("wildcard-cors");
        let prior = p.prior_score();
        let v = verdict_for(&layer(), &p, "a.py", "sep = \"*\"\n", "\"*\"");
        let (score, confidence) = scored(&v);
        assert!((score - (prior + 0.25)).abs() < 1e-12);
        assert_eq!(confidence, 0.6);
    }

    #[test]
    fn test_unknown_role_is_below_floor() {
        let p = pattern("wildcard-cors");
        let v = verdict_for(&layer(), &p, "notes.xyz", "value '*'\n", "'*'");
        let (score, confidence) = scored(&v);
        assert_eq!(score, 0.5);
        assert!(confidence < ContextConfig::default().confidence_floor);
    }

    #[test]
    fn test_absent_dependency_lowers_likelihood() {
        let p = pattern("wildcard-cors").with_dependency("flask-cors");
        let project = ProjectContext::new().with_dependencies(["django"]);
        let layer = ContextLayer::new(Arc::new(project), ContextConfig::default());
        let v = verdict_for(&layer, &p, "app.py", "sep = \"*\"\n", "\"*\"");
        let (score, _) = scored(&v);
        let base = p.prior_score() + 0.25;
        assert!((score - (base + (1.0 - base) * 0.5)).abs() < 1e-12);
        assert_eq!(
            v.rationale.signals.get("dependency").map(String::as_str),
            Some("flask-cors absent")
        );
    }
}
