//! DTO → domain model conversion with validation.
//!
//! A malformed definition never fails the whole load: it becomes a
//! [`SkippedPattern`] and the remaining definitions are still returned.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::dto::PatternDto;
use super::model::{
    GlobPattern, Matcher, ModelError, PatternDefinition, PatternId, StructuralMatcher,
};
use crate::types::Severity;

/// Errors during DTO → domain conversion of a single pattern.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// A field-level validation error.
    #[error("{context}: {source}")]
    Validation {
        /// Where the error occurred (e.g., "pattern[0].regex").
        context: String,
        /// The underlying model error.
        source: ModelError,
    },

    /// Unknown severity string.
    #[error("{context}: unknown severity `{value}`, expected: info, warning, error, critical")]
    UnknownSeverity {
        /// Where the error occurred.
        context: String,
        /// The invalid value.
        value: String,
    },

    /// Unknown matcher kind.
    #[error("{context}: unknown kind `{value}`, expected: literal, regex, assignment, call")]
    UnknownKind {
        /// Where the error occurred.
        context: String,
        /// The invalid value.
        value: String,
    },

    /// A field required by the matcher kind is missing.
    #[error("{context}: `{kind}` pattern requires `{field}`")]
    MissingField {
        /// Where the error occurred.
        context: String,
        /// Matcher kind.
        kind: String,
        /// Missing field.
        field: &'static str,
    },

    /// The entry is not a valid pattern table.
    #[error("{context}: {message}")]
    Shape {
        /// Where the error occurred.
        context: String,
        /// Deserializer message.
        message: String,
    },
}

/// A pattern definition that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPattern {
    /// Declared id, if one could be read.
    pub id: Option<String>,
    /// Position in the source list.
    pub index: usize,
    /// Why the pattern was skipped.
    pub reason: String,
}

/// Result of loading pattern definitions.
#[derive(Debug, Default)]
pub struct PatternLoad {
    /// Valid definitions in source order.
    pub patterns: Vec<PatternDefinition>,
    /// Definitions that were rejected.
    pub skipped: Vec<SkippedPattern>,
}

/// Errors that prevent reading any definitions at all.
#[derive(Debug, thiserror::Error)]
pub enum LoadPatternsError {
    /// TOML deserialization failed.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `pattern` is present but not an array of tables.
    #[error("`pattern` must be an array of tables")]
    NotAnArray,
}

/// Loads every `[[pattern]]` entry from TOML content.
///
/// Returns an empty load if the document has no `pattern` key.
///
/// # Errors
///
/// Returns an error only if the document itself is not valid TOML.
pub fn load_patterns_from_toml(content: &str) -> Result<PatternLoad, LoadPatternsError> {
    let table: toml::Table = toml::from_str(content)?;
    let Some(entries) = table.get("pattern") else {
        return Ok(PatternLoad::default());
    };
    let entries = entries.as_array().ok_or(LoadPatternsError::NotAnArray)?;
    Ok(load_entries(entries))
}

/// Converts raw TOML values into definitions, skipping malformed ones.
#[must_use]
pub fn load_entries(entries: &[toml::Value]) -> PatternLoad {
    let mut load = PatternLoad::default();

    for (index, value) in entries.iter().enumerate() {
        let declared_id = value
            .get("id")
            .and_then(toml::Value::as_str)
            .map(str::to_string);

        let result = PatternDto::deserialize(value.clone())
            .map_err(|e| LoadError::Shape {
                context: format!("pattern[{index}]"),
                message: e.to_string(),
            })
            .and_then(|dto| convert(dto, index));

        match result {
            Ok(definition) => load.patterns.push(definition),
            Err(e) => {
                warn!(index, id = ?declared_id, error = %e, "Skipping malformed pattern");
                load.skipped.push(SkippedPattern {
                    id: declared_id,
                    index,
                    reason: e.to_string(),
                });
            }
        }
    }

    load
}

/// Converts one DTO into a validated definition.
///
/// # Errors
///
/// Returns the first validation error encountered.
pub fn convert(dto: PatternDto, index: usize) -> Result<PatternDefinition, LoadError> {
    let ctx = format!("pattern[{index}]");
    let validation = |field: &str| {
        let context = format!("{ctx}.{field}");
        move |source| LoadError::Validation { context, source }
    };

    let id = PatternId::new(&dto.id).map_err(validation("id"))?;
    let severity = parse_severity(&dto.severity, &format!("{ctx}.severity"))?;
    let matcher = convert_matcher(&dto, &ctx)?;

    let exclude_paths = dto
        .exclude_paths
        .iter()
        .enumerate()
        .map(|(j, p)| GlobPattern::new(p).map_err(validation(&format!("exclude_paths[{j}]"))))
        .collect::<Result<Vec<_>, _>>()?;

    let extensions: Vec<&str> = dto.extensions.iter().map(String::as_str).collect();
    let mut definition = PatternDefinition::new(id, severity, &dto.category, matcher)
        .with_description(&dto.description)
        .with_extensions(&extensions)
        .with_exclude_paths(exclude_paths);

    if let Some(precision) = dto.precision {
        definition = definition
            .with_precision(precision)
            .map_err(validation("precision"))?;
    }
    if let Some(dep) = &dto.requires_dependency {
        definition = definition.with_dependency(dep);
    }
    if let Some(fix) = &dto.fix {
        definition = definition.with_fix(fix);
    }

    Ok(definition)
}

fn convert_matcher(dto: &PatternDto, ctx: &str) -> Result<Matcher, LoadError> {
    let missing = |field: &'static str| LoadError::MissingField {
        context: ctx.to_string(),
        kind: dto.kind.clone(),
        field,
    };
    let invalid = |field: &str| {
        let context = format!("{ctx}.{field}");
        move |source| LoadError::Validation { context, source }
    };

    match dto.kind.as_str() {
        "literal" => {
            let text = dto.text.as_deref().ok_or_else(|| missing("text"))?;
            let mut matcher = Matcher::literal(text).map_err(invalid("text"))?;
            if let Matcher::Literal { case_sensitive, .. } = &mut matcher {
                *case_sensitive = dto.case_sensitive;
            }
            Ok(matcher)
        }
        "regex" => {
            let regex = dto.regex.as_deref().ok_or_else(|| missing("regex"))?;
            Matcher::regex(regex, dto.capture).map_err(invalid("regex"))
        }
        "assignment" => {
            if dto.keys.is_empty() {
                return Err(missing("keys"));
            }
            let keys: Vec<&str> = dto.keys.iter().map(String::as_str).collect();
            StructuralMatcher::assignment(&keys, dto.value.as_deref())
                .map(Matcher::Structural)
                .map_err(invalid("value"))
        }
        "call" => {
            if dto.callees.is_empty() {
                return Err(missing("callees"));
            }
            let callees: Vec<&str> = dto.callees.iter().map(String::as_str).collect();
            StructuralMatcher::call(&callees, dto.argument.as_deref())
                .map(Matcher::Structural)
                .map_err(invalid("argument"))
        }
        other => Err(LoadError::UnknownKind {
            context: format!("{ctx}.kind"),
            value: other.to_string(),
        }),
    }
}

fn parse_severity(s: &str, context: &str) -> Result<Severity, LoadError> {
    Severity::parse(s).ok_or_else(|| LoadError::UnknownSeverity {
        context: context.to_string(),
        value: s.to_string(),
    })
}
