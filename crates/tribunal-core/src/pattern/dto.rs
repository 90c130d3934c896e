//! TOML deserialization types (DTO layer).
//!
//! These types exist solely for serde deserialization. They are converted to
//! domain model types via the loader.

use serde::Deserialize;

/// Raw TOML representation of one `[[pattern]]` entry.
///
/// ```toml
/// [[pattern]]
/// id = "wildcard-cors"
/// kind = "regex"
/// regex = '''["']\*["']'''
/// severity = "error"
/// category = "security"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternDto {
    /// Pattern id.
    pub id: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Severity (default: "warning").
    #[serde(default = "default_severity_str")]
    pub severity: String,
    /// Category (default: "general").
    #[serde(default = "default_category")]
    pub category: String,
    /// Matcher kind: "literal", "regex", "assignment" or "call".
    pub kind: String,

    /// Literal text.
    #[serde(default)]
    pub text: Option<String>,
    /// Literal case sensitivity.
    #[serde(default = "default_true")]
    pub case_sensitive: bool,

    /// Regular expression.
    #[serde(default)]
    pub regex: Option<String>,
    /// Capture group for the candidate span.
    #[serde(default)]
    pub capture: Option<usize>,

    /// Assignment key fragments.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Assignment value expression.
    #[serde(default)]
    pub value: Option<String>,

    /// Call callee names.
    #[serde(default)]
    pub callees: Vec<String>,
    /// Call argument expression.
    #[serde(default)]
    pub argument: Option<String>,

    /// Precision in `[0, 1]`.
    #[serde(default)]
    pub precision: Option<f64>,
    /// File extensions the pattern applies to.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Path globs the pattern never applies to.
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    /// Dependency the pattern is about.
    #[serde(default)]
    pub requires_dependency: Option<String>,
    /// Fix template.
    #[serde(default)]
    pub fix: Option<String>,
}

fn default_severity_str() -> String {
    "warning".to_string()
}

fn default_category() -> String {
    "general".to_string()
}

fn default_true() -> bool {
    true
}
