//! Read-only snapshot of pattern definitions.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::loader::{PatternLoad, SkippedPattern};
use super::model::{GlobPattern, PatternDefinition, PatternId};
use crate::config::EngineConfig;

/// An immutable set of pattern definitions keyed by id.
///
/// The engine takes one snapshot at scan start; the store is never mutated
/// while a scan runs.
#[derive(Debug, Clone, Default)]
pub struct PatternStore {
    patterns: BTreeMap<PatternId, Arc<PatternDefinition>>,
    skipped: Vec<SkippedPattern>,
}

impl PatternStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store from definitions. Later duplicates replace earlier ones.
    #[must_use]
    pub fn from_definitions(definitions: impl IntoIterator<Item = PatternDefinition>) -> Self {
        let mut store = Self::new();
        for definition in definitions {
            store.insert(definition);
        }
        store
    }

    /// Adds or replaces a definition.
    pub fn insert(&mut self, definition: PatternDefinition) {
        if self.patterns.contains_key(&definition.id) {
            debug!(pattern = %definition.id, "Replacing pattern definition");
        }
        self.patterns
            .insert(definition.id.clone(), Arc::new(definition));
    }

    /// Adds loaded definitions and remembers the skipped ones.
    pub fn extend(&mut self, load: PatternLoad) {
        for definition in load.patterns {
            self.insert(definition);
        }
        self.skipped.extend(load.skipped);
    }

    /// Returns a definition by id.
    #[must_use]
    pub fn get(&self, id: &PatternId) -> Option<&Arc<PatternDefinition>> {
        self.patterns.get(id)
    }

    /// Iterates definitions in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PatternDefinition>> {
        self.patterns.values()
    }

    /// Returns the number of active definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns true if there are no active definitions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns the definitions that were rejected while building this store.
    #[must_use]
    pub fn skipped(&self) -> &[SkippedPattern] {
        &self.skipped
    }

    /// Applies `[patterns.<id>]` overrides from configuration.
    ///
    /// Disabled patterns are removed. An override that cannot be applied
    /// (precision out of range, invalid exclude glob) skips that pattern.
    #[must_use]
    pub fn configured(&self, config: &EngineConfig) -> Self {
        let mut result = Self {
            patterns: BTreeMap::new(),
            skipped: self.skipped.clone(),
        };

        for (index, definition) in self.patterns.values().enumerate() {
            let id = definition.id.as_str();
            if !config.is_pattern_enabled(id) {
                debug!(pattern = id, "Pattern disabled by configuration");
                continue;
            }
            let Some(overrides) = config.patterns.get(id) else {
                result
                    .patterns
                    .insert(definition.id.clone(), Arc::clone(definition));
                continue;
            };

            match apply_overrides(definition, overrides) {
                Ok(updated) => {
                    result.patterns.insert(updated.id.clone(), Arc::new(updated));
                }
                Err(reason) => {
                    warn!(pattern = id, %reason, "Skipping pattern with invalid override");
                    result.skipped.push(SkippedPattern {
                        id: Some(id.to_string()),
                        index,
                        reason,
                    });
                }
            }
        }

        result
    }
}

fn apply_overrides(
    definition: &PatternDefinition,
    overrides: &crate::config::PatternConfig,
) -> Result<PatternDefinition, String> {
    let mut updated = definition.clone();
    if let Some(severity) = overrides.severity {
        updated.severity = severity;
    }
    if let Some(precision) = overrides.precision {
        updated = updated.with_precision(precision).map_err(|e| e.to_string())?;
    }
    let globs = overrides
        .exclude_paths
        .iter()
        .map(|p| GlobPattern::new(p).map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(updated.with_exclude_paths(globs))
}
