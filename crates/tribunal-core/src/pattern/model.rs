//! Pure domain model for pattern definitions.
//!
//! Invariants are enforced at construction time via validated newtypes; a
//! [`PatternDefinition`] that exists is always usable by the matching layer.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::types::{Candidate, Severity};

/// Default precision of a pattern when none is configured.
pub const DEFAULT_PRECISION: f64 = 0.85;

/// A validated pattern identifier (non-empty, `[a-z0-9-]` only).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PatternId(String);

impl PatternId {
    /// Creates a new pattern id.
    ///
    /// # Errors
    ///
    /// Returns error if the id is empty or contains invalid characters.
    pub fn new(id: &str) -> Result<Self, ModelError> {
        if id.is_empty() {
            return Err(ModelError::EmptyPatternId);
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ModelError::InvalidPatternId { id: id.to_string() });
        }
        Ok(Self(id.to_string()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PatternId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<PatternId> for String {
    fn from(id: PatternId) -> Self {
        id.0
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated glob pattern for file path matching.
///
/// The glob is compiled once at construction and reused for all match calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    raw: String,
    compiled: glob::Pattern,
}

impl GlobPattern {
    /// Creates a new glob pattern.
    ///
    /// # Errors
    ///
    /// Returns error if the pattern is empty or has invalid glob syntax.
    pub fn new(pattern: &str) -> Result<Self, ModelError> {
        if pattern.is_empty() {
            return Err(ModelError::EmptyGlobPattern);
        }
        let compiled = glob::Pattern::new(pattern).map_err(|e| ModelError::InvalidGlobPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            raw: pattern.to_string(),
            compiled,
        })
    }

    /// Tests whether a relative file path matches this pattern.
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        if self.compiled.matches(&path_str) {
            return true;
        }
        // `**/dir/**` must also match `dir/...` at the root, and `dir/**`
        // must match on a component boundary.
        let raw = self.raw.strip_prefix("**/").unwrap_or(&self.raw);
        if let Some(prefix) = raw.strip_suffix("/**") {
            let normalized = prefix.trim_end_matches('/');
            if path_str.starts_with(normalized)
                && path_str
                    .as_bytes()
                    .get(normalized.len())
                    .is_some_and(|&b| b == b'/')
            {
                return true;
            }
        }
        false
    }

    /// Returns the pattern as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Kind of matcher, used for the pattern layer's confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    /// Plain text.
    Literal,
    /// Regular expression.
    Regex,
    /// Syntax-aware structural matcher.
    Structural,
}

impl MatcherKind {
    /// Confidence of a pattern-layer verdict produced by this kind of matcher.
    #[must_use]
    pub fn confidence(self) -> f64 {
        match self {
            Self::Literal => 0.6,
            Self::Regex => 0.7,
            Self::Structural => 0.85,
        }
    }
}

impl fmt::Display for MatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal => write!(f, "literal"),
            Self::Regex => write!(f, "regex"),
            Self::Structural => write!(f, "structural"),
        }
    }
}

/// A closed set of matchers.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Finds every occurrence of a literal string.
    Literal {
        /// Text to find.
        text: String,
        /// Whether matching is case sensitive.
        case_sensitive: bool,
    },
    /// Finds every match of a regular expression.
    Regex {
        /// Compiled expression.
        regex: Regex,
        /// Capture group whose span becomes the candidate span.
        capture: Option<usize>,
    },
    /// Syntax-aware matching of assignments and calls.
    Structural(StructuralMatcher),
}

impl Matcher {
    /// Creates a case-sensitive literal matcher.
    ///
    /// # Errors
    ///
    /// Returns error if `text` is empty.
    pub fn literal(text: &str) -> Result<Self, ModelError> {
        if text.is_empty() {
            return Err(ModelError::EmptyLiteral);
        }
        Ok(Self::Literal {
            text: text.to_string(),
            case_sensitive: true,
        })
    }

    /// Creates a regex matcher, validating the capture group.
    ///
    /// # Errors
    ///
    /// Returns error if the expression does not compile or the capture group
    /// does not exist.
    pub fn regex(pattern: &str, capture: Option<usize>) -> Result<Self, ModelError> {
        let regex = compile(pattern)?;
        if let Some(group) = capture {
            if group >= regex.captures_len() {
                return Err(ModelError::InvalidCapture {
                    group,
                    pattern: pattern.to_string(),
                });
            }
        }
        Ok(Self::Regex { regex, capture })
    }

    /// Returns the matcher kind.
    #[must_use]
    pub fn kind(&self) -> MatcherKind {
        match self {
            Self::Literal { .. } => MatcherKind::Literal,
            Self::Regex { .. } => MatcherKind::Regex,
            Self::Structural(_) => MatcherKind::Structural,
        }
    }
}

/// Structural matchers evaluated by a comment- and string-aware scanner.
#[derive(Debug, Clone)]
pub enum StructuralMatcher {
    /// `key = value` or `key: value` where the key contains one of `keys`.
    Assignment {
        /// Lowercase key fragments (`-` normalized to `_`).
        keys: Vec<String>,
        /// Optional expression the assigned value must match.
        value: Option<Regex>,
    },
    /// A call to one of `callees`.
    Call {
        /// Callee names, matched exactly or as a `.name` / `::name` suffix.
        callees: Vec<String>,
        /// Optional expression the argument list must match.
        argument: Option<Regex>,
    },
}

impl StructuralMatcher {
    /// Creates an assignment matcher.
    ///
    /// # Errors
    ///
    /// Returns error if no keys are given or the value expression is invalid.
    pub fn assignment(keys: &[&str], value: Option<&str>) -> Result<Self, ModelError> {
        if keys.is_empty() {
            return Err(ModelError::EmptyStructural { what: "keys" });
        }
        Ok(Self::Assignment {
            keys: keys.iter().map(|k| normalize_key(k)).collect(),
            value: value.map(compile).transpose()?,
        })
    }

    /// Creates a call matcher.
    ///
    /// # Errors
    ///
    /// Returns error if no callees are given or the argument expression is
    /// invalid.
    pub fn call(callees: &[&str], argument: Option<&str>) -> Result<Self, ModelError> {
        if callees.is_empty() {
            return Err(ModelError::EmptyStructural { what: "callees" });
        }
        Ok(Self::Call {
            callees: callees.iter().map(|c| (*c).to_string()).collect(),
            argument: argument.map(compile).transpose()?,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex, ModelError> {
    Regex::new(pattern).map_err(|e| ModelError::InvalidRegex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Normalizes a configuration key for vocabulary lookups.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    key.trim_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace())
        .to_ascii_lowercase()
        .replace('-', "_")
}

/// Returns true if `callee` is `name` or ends with `.name` / `::name`.
#[must_use]
pub fn callee_matches(callee: &str, name: &str) -> bool {
    callee == name
        || callee
            .strip_suffix(name)
            .is_some_and(|head| head.ends_with('.') || head.ends_with("::"))
}

/// A fix suggestion with `{matched}`, `{file}`, `{line}` and `{pattern}`
/// placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixTemplate(String);

impl FixTemplate {
    /// Creates a template.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Renders the template for a candidate.
    #[must_use]
    pub fn render(&self, candidate: &Candidate) -> String {
        self.0
            .replace("{matched}", &candidate.matched_text)
            .replace("{file}", &candidate.location.file.to_string_lossy())
            .replace("{line}", &candidate.location.line.to_string())
            .replace("{pattern}", candidate.pattern.as_str())
    }
}

/// A complete, validated pattern definition.
#[derive(Debug, Clone)]
pub struct PatternDefinition {
    /// Unique identifier.
    pub id: PatternId,
    /// Short human-readable description.
    pub description: String,
    /// Severity of a confirmed violation.
    pub severity: Severity,
    /// Category used for statistics (e.g., "security").
    pub category: String,
    /// How candidates are found.
    pub matcher: Matcher,
    /// Historical fraction of matches that are real violations.
    pub precision: f64,
    /// File extensions this pattern applies to (empty means all).
    pub extensions: Vec<String>,
    /// Paths this pattern never applies to.
    pub exclude_paths: Vec<GlobPattern>,
    /// Dependency whose absence makes a violation less likely.
    pub requires_dependency: Option<String>,
    /// Optional fix suggestion.
    pub fix: Option<FixTemplate>,
}

impl PatternDefinition {
    /// Creates a definition with default precision and no restrictions.
    #[must_use]
    pub fn new(id: PatternId, severity: Severity, category: &str, matcher: Matcher) -> Self {
        Self {
            id,
            description: String::new(),
            severity,
            category: category.to_string(),
            matcher,
            precision: DEFAULT_PRECISION,
            extensions: Vec::new(),
            exclude_paths: Vec::new(),
            requires_dependency: None,
            fix: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Sets the precision.
    ///
    /// # Errors
    ///
    /// Returns error if `precision` is outside `[0, 1]`.
    pub fn with_precision(mut self, precision: f64) -> Result<Self, ModelError> {
        if !precision.is_finite() || !(0.0..=1.0).contains(&precision) {
            return Err(ModelError::InvalidPrecision { value: precision });
        }
        self.precision = precision;
        Ok(self)
    }

    /// Restricts the pattern to file extensions (without the dot).
    #[must_use]
    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    /// Adds excluded path globs.
    #[must_use]
    pub fn with_exclude_paths(mut self, globs: Vec<GlobPattern>) -> Self {
        self.exclude_paths.extend(globs);
        self
    }

    /// Sets the dependency the pattern is about.
    #[must_use]
    pub fn with_dependency(mut self, dependency: &str) -> Self {
        self.requires_dependency = Some(dependency.to_string());
        self
    }

    /// Sets the fix template.
    #[must_use]
    pub fn with_fix(mut self, template: &str) -> Self {
        self.fix = Some(FixTemplate::new(template));
        self
    }

    /// Returns true if the pattern applies to files with this path's extension.
    #[must_use]
    pub fn applies_to(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    /// Returns the first exclude glob matching `path`, if any.
    #[must_use]
    pub fn excluded_by(&self, path: &Path) -> Option<&GlobPattern> {
        self.exclude_paths.iter().find(|g| g.matches(path))
    }

    /// Score of the pattern layer's originating verdict.
    #[must_use]
    pub fn prior_score(&self) -> f64 {
        1.0 - self.precision
    }
}

/// Validation errors in the pattern model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// Pattern id is empty.
    #[error("pattern id must not be empty")]
    EmptyPatternId,

    /// Pattern id contains invalid characters.
    #[error("invalid pattern id `{id}`: must contain only [a-z0-9-]")]
    InvalidPatternId {
        /// The invalid id.
        id: String,
    },

    /// Glob pattern is empty.
    #[error("glob pattern must not be empty")]
    EmptyGlobPattern,

    /// Glob pattern has invalid syntax.
    #[error("invalid glob pattern `{pattern}`: {reason}")]
    InvalidGlobPattern {
        /// The invalid pattern.
        pattern: String,
        /// Why it is invalid.
        reason: String,
    },

    /// Regular expression does not compile.
    #[error("invalid regex `{pattern}`: {reason}")]
    InvalidRegex {
        /// The invalid expression.
        pattern: String,
        /// Why it is invalid.
        reason: String,
    },

    /// Capture group does not exist.
    #[error("capture group {group} does not exist in `{pattern}`")]
    InvalidCapture {
        /// Requested group.
        group: usize,
        /// The expression.
        pattern: String,
    },

    /// Literal text is empty.
    #[error("literal text must not be empty")]
    EmptyLiteral,

    /// Structural matcher has nothing to match.
    #[error("structural matcher needs at least one entry in `{what}`")]
    EmptyStructural {
        /// The empty field.
        what: &'static str,
    },

    /// Precision outside `[0, 1]`.
    #[error("precision {value} is outside [0, 1]")]
    InvalidPrecision {
        /// The invalid value.
        value: f64,
    },
}
