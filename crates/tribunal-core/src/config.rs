//! Configuration types for tribunal.
//!
//! One [`EngineConfig`] is built per scan and passed explicitly to every
//! component. Nothing in the engine reads configuration from globals.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{LayerKind, Severity};

/// Top-level configuration for a scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Preset of built-in patterns (e.g., "recommended", "strict", "minimal").
    #[serde(default)]
    pub preset: Option<String>,

    /// Per-layer vote weights.
    #[serde(default)]
    pub weights: LayerWeights,

    /// Classification thresholds.
    #[serde(default)]
    pub thresholds: Thresholds,

    /// Deep-analysis invocation settings.
    #[serde(default)]
    pub deep: DeepConfig,

    /// Context-analysis settings.
    #[serde(default)]
    pub context: ContextConfig,

    /// Exclusion sources.
    #[serde(default)]
    pub exclusion: ExclusionConfig,

    /// Admit/block policy.
    #[serde(default)]
    pub verdict: VerdictPolicy,

    /// Per-pattern overrides keyed by pattern id.
    #[serde(default)]
    pub patterns: BTreeMap<String, PatternConfig>,
}

impl EngineConfig {
    /// Creates a new default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// Sections this type does not know about (such as `[[pattern]]`
    /// definitions) are ignored here and read by the pattern loader.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Validates the configuration.
    ///
    /// Threshold, band and concurrency problems are fatal. An unusable layer
    /// weight only disables that layer and is reported in the returned
    /// [`ConfigReport`].
    ///
    /// # Errors
    ///
    /// Returns an error for problems that affect the whole scan.
    pub fn validate(&self) -> Result<ConfigReport, ConfigError> {
        let Thresholds { commit, block } = self.thresholds;
        if !in_unit(commit) || !in_unit(block) || block >= commit {
            return Err(ConfigError::InvalidThresholds { commit, block });
        }

        let (lower, upper) = self.deep.band;
        if !in_unit(lower) || !in_unit(upper) || lower > upper {
            return Err(ConfigError::InvalidBand { lower, upper });
        }

        if !in_unit(self.context.confidence_floor) {
            return Err(ConfigError::InvalidValue {
                field: "context.confidence_floor".to_string(),
                message: format!("{} is outside [0, 1]", self.context.confidence_floor),
            });
        }

        if self.deep.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "deep.max_concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let disabled_layers = LayerKind::ALL
            .into_iter()
            .filter_map(|layer| {
                let weight = self.weights.weight(layer);
                if weight.is_finite() && weight >= 0.0 {
                    None
                } else {
                    Some(LayerIssue {
                        layer,
                        message: format!("weight {weight} is not a finite non-negative number"),
                    })
                }
            })
            .collect();

        Ok(ConfigReport { disabled_layers })
    }

    /// Checks if a pattern is enabled.
    #[must_use]
    pub fn is_pattern_enabled(&self, pattern_id: &str) -> bool {
        self.patterns
            .get(pattern_id)
            .map_or(true, |c| c.enabled.unwrap_or(true))
    }

    /// Gets the severity override for a pattern.
    #[must_use]
    pub fn pattern_severity(&self, pattern_id: &str) -> Option<Severity> {
        self.patterns.get(pattern_id).and_then(|c| c.severity)
    }
}

fn in_unit(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// Vote weight per layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerWeights {
    /// Weight of the pattern-matching layer.
    #[serde(default = "default_pattern_weight")]
    pub pattern: f64,
    /// Weight of the context-analysis layer.
    #[serde(default = "default_context_weight")]
    pub context: f64,
    /// Weight of the deep-analysis layer.
    #[serde(default = "default_deep_weight")]
    pub deep: f64,
}

impl LayerWeights {
    /// Creates explicit weights.
    #[must_use]
    pub fn new(pattern: f64, context: f64, deep: f64) -> Self {
        Self {
            pattern,
            context,
            deep,
        }
    }

    /// Returns the weight for a layer.
    #[must_use]
    pub fn weight(&self, layer: LayerKind) -> f64 {
        match layer {
            LayerKind::Pattern => self.pattern,
            LayerKind::Context => self.context,
            LayerKind::Deep => self.deep,
        }
    }

    /// Returns a copy with the given layers weighted zero.
    #[must_use]
    pub fn without(mut self, layers: &[LayerKind]) -> Self {
        for layer in layers {
            match layer {
                LayerKind::Pattern => self.pattern = 0.0,
                LayerKind::Context => self.context = 0.0,
                LayerKind::Deep => self.deep = 0.0,
            }
        }
        self
    }
}

impl Default for LayerWeights {
    fn default() -> Self {
        Self {
            pattern: default_pattern_weight(),
            context: default_context_weight(),
            deep: default_deep_weight(),
        }
    }
}

fn default_pattern_weight() -> f64 {
    0.4
}

fn default_context_weight() -> f64 {
    0.8
}

fn default_deep_weight() -> f64 {
    1.0
}

/// Classification thresholds.
///
/// `score >= commit` dismisses a candidate, `score <= block` confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Scores at or above this are dismissed.
    #[serde(default = "default_commit")]
    pub commit: f64,
    /// Scores at or below this are confirmed violations.
    #[serde(default = "default_block")]
    pub block: f64,
}

impl Thresholds {
    /// Creates explicit thresholds.
    #[must_use]
    pub fn new(commit: f64, block: f64) -> Self {
        Self { commit, block }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            commit: default_commit(),
            block: default_block(),
        }
    }
}

fn default_commit() -> f64 {
    0.7
}

fn default_block() -> f64 {
    0.3
}

/// Deep-analysis invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepConfig {
    /// Whether deep analysis runs when an analyzer is attached.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Inclusive `(lower, upper)` bounds of the uncertain band.
    #[serde(default = "default_band")]
    pub band: (f64, f64),

    /// Per-call timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum concurrent invocations.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Lines of context sent on each side of the match.
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,

    /// Upper bound on the context window size in bytes.
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,

    /// Version tag of the attached analyzer, part of the cache key.
    #[serde(default)]
    pub layer_version: Option<String>,
}

impl DeepConfig {
    /// Returns the per-call timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns true if the score lies inside the uncertain band.
    #[must_use]
    pub fn in_band(&self, score: f64) -> bool {
        let (lower, upper) = self.band;
        score >= lower && score <= upper
    }
}

impl Default for DeepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            band: default_band(),
            timeout_ms: default_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            context_lines: default_context_lines(),
            max_context_bytes: default_max_context_bytes(),
            layer_version: None,
        }
    }
}

fn default_band() -> (f64, f64) {
    (0.3, 0.7)
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_concurrency() -> usize {
    5
}

fn default_context_lines() -> usize {
    8
}

fn default_max_context_bytes() -> usize {
    4_096
}

fn default_true() -> bool {
    true
}

/// Context-analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Confidence below which a verdict counts as "role undetermined".
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,

    /// Extra security-relevant configuration key terms.
    #[serde(default)]
    pub security_keys: Vec<String>,

    /// Extra callee names that take glob expressions.
    #[serde(default)]
    pub glob_callees: Vec<String>,

    /// Lines scanned backwards when resolving the enclosing construct.
    #[serde(default = "default_lookback_lines")]
    pub lookback_lines: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            confidence_floor: default_confidence_floor(),
            security_keys: Vec::new(),
            glob_callees: Vec::new(),
            lookback_lines: default_lookback_lines(),
        }
    }
}

fn default_confidence_floor() -> f64 {
    0.5
}

fn default_lookback_lines() -> usize {
    6
}

/// Exclusion source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExclusionConfig {
    /// Files larger than this are excluded.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Glob patterns to exclude.
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,

    /// Whether to honour `.gitignore` at the scan root.
    #[serde(default = "default_true")]
    pub vcs_ignore: bool,

    /// Extra gitignore-syntax lines treated as version-control ignores.
    #[serde(default)]
    pub vcs_ignore_lines: Vec<String>,

    /// Name of the tool-specific ignore file at the scan root.
    #[serde(default = "default_tool_ignore_file")]
    pub tool_ignore_file: String,

    /// Extra gitignore-syntax lines treated as tool ignores.
    #[serde(default)]
    pub tool_ignore_lines: Vec<String>,
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            exclude: default_excludes(),
            vcs_ignore: true,
            vcs_ignore_lines: Vec::new(),
            tool_ignore_file: default_tool_ignore_file(),
            tool_ignore_lines: Vec::new(),
        }
    }
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

fn default_excludes() -> Vec<String> {
    vec![
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/.git/**".to_string(),
    ]
}

fn default_tool_ignore_file() -> String {
    ".tribunalignore".to_string()
}

/// What a needs-review decision does to the scan verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeedsReviewPolicy {
    /// Needs-review decisions count as warnings.
    #[default]
    Admit,
    /// Any needs-review decision blocks the change set.
    Block,
}

/// Admit/block policy for the whole scan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VerdictPolicy {
    /// Confirmed violations at or above this severity block.
    #[serde(default = "default_block_on")]
    pub block_on: Severity,

    /// Treatment of needs-review decisions.
    #[serde(default)]
    pub needs_review: NeedsReviewPolicy,
}

impl Default for VerdictPolicy {
    fn default() -> Self {
        Self {
            block_on: default_block_on(),
            needs_review: NeedsReviewPolicy::Admit,
        }
    }
}

fn default_block_on() -> Severity {
    Severity::Error
}

/// Per-pattern overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Whether this pattern is enabled.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Severity override.
    #[serde(default)]
    pub severity: Option<Severity>,

    /// Precision override in `[0, 1]`.
    #[serde(default)]
    pub precision: Option<f64>,

    /// Additional path globs this pattern never applies to.
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

/// A layer disabled by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerIssue {
    /// The affected layer.
    pub layer: LayerKind,
    /// What is wrong.
    pub message: String,
}

/// Non-fatal findings from [`EngineConfig::validate`].
#[derive(Debug, Clone, Default)]
pub struct ConfigReport {
    /// Layers whose weight was unusable.
    pub disabled_layers: Vec<LayerIssue>,
}

impl ConfigReport {
    /// Returns true if the layer was disabled.
    #[must_use]
    pub fn is_disabled(&self, layer: LayerKind) -> bool {
        self.disabled_layers.iter().any(|i| i.layer == layer)
    }

    /// Returns the disabled layers.
    #[must_use]
    pub fn disabled(&self) -> Vec<LayerKind> {
        self.disabled_layers.iter().map(|i| i.layer).collect()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("Failed to read config file {path}: {source}")]
    #[diagnostic(code(tribunal::config::io))]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Parse error in config file.
    #[error("Failed to parse config: {message}")]
    #[diagnostic(code(tribunal::config::parse))]
    Parse {
        /// Parse error message.
        message: String,
    },

    /// Thresholds out of range or in the wrong order.
    #[error("invalid thresholds: commit={commit}, block={block}")]
    #[diagnostic(
        code(tribunal::config::thresholds),
        help("both thresholds must lie in [0, 1] and block must be below commit")
    )]
    InvalidThresholds {
        /// Configured commit threshold.
        commit: f64,
        /// Configured block threshold.
        block: f64,
    },

    /// Uncertain band out of range or inverted.
    #[error("invalid uncertain band: [{lower}, {upper}]")]
    #[diagnostic(
        code(tribunal::config::band),
        help("band bounds must lie in [0, 1] with lower <= upper")
    )]
    InvalidBand {
        /// Lower bound.
        lower: f64,
        /// Upper bound.
        upper: f64,
    },

    /// Any other invalid value.
    #[error("invalid value for `{field}`: {message}")]
    #[diagnostic(code(tribunal::config::value))]
    InvalidValue {
        /// Dotted field path.
        field: String,
        /// What is wrong.
        message: String,
    },

    /// An exclusion source could not be built.
    #[error("invalid exclusion source: {message}")]
    #[diagnostic(code(tribunal::config::exclusion))]
    Exclusion {
        /// What is wrong.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.exclusion.vcs_ignore);
        assert!(config.patterns.is_empty());
        assert_eq!(config.thresholds, Thresholds::new(0.7, 0.3));
        let report = config.validate().expect("defaults validate");
        assert!(report.disabled_layers.is_empty());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[weights]
pattern = 0.5
context = 0.9

[thresholds]
commit = 0.8
block = 0.2

[deep]
band = [0.25, 0.75]
timeout_ms = 250
max_concurrency = 2

[verdict]
block_on = "critical"
needs_review = "block"

[patterns.wildcard-cors]
enabled = true
severity = "warning"

[patterns.eval-call]
enabled = false
"#;

        let config = EngineConfig::parse(toml).expect("Failed to parse");
        assert!((config.weights.pattern - 0.5).abs() < f64::EPSILON);
        assert!((config.weights.deep - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.deep.band, (0.25, 0.75));
        assert_eq!(config.deep.timeout(), Duration::from_millis(250));
        assert_eq!(config.verdict.block_on, Severity::Critical);
        assert_eq!(config.verdict.needs_review, NeedsReviewPolicy::Block);
        assert!(config.is_pattern_enabled("wildcard-cors"));
        assert!(!config.is_pattern_enabled("eval-call"));
        assert_eq!(
            config.pattern_severity("wildcard-cors"),
            Some(Severity::Warning)
        );
    }

    #[test]
    fn test_parse_ignores_pattern_definitions() {
        let toml = r#"
[[pattern]]
id = "x"
"#;
        assert!(EngineConfig::parse(toml).is_ok());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = EngineConfig::default();
        config.thresholds = Thresholds::new(0.3, 0.7);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidThresholds { .. })
        ));
    }

    #[test]
    fn test_invalid_band_rejected() {
        let mut config = EngineConfig::default();
        config.deep.band = (0.8, 0.2);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBand { .. })));
    }

    #[test]
    fn test_negative_weight_disables_only_that_layer() {
        let mut config = EngineConfig::default();
        config.weights.deep = -1.0;
        let report = config.validate().expect("weight issues are not fatal");
        assert!(report.is_disabled(LayerKind::Deep));
        assert!(!report.is_disabled(LayerKind::Context));
        let effective = config.weights.without(&report.disabled());
        assert!(effective.deep.abs() < f64::EPSILON);
    }

    #[test]
    fn test_band_membership_is_inclusive() {
        let deep = DeepConfig::default();
        assert!(deep.in_band(0.3));
        assert!(deep.in_band(0.7));
        assert!(!deep.in_band(0.71));
    }
}
