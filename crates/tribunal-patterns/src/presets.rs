//! Pattern presets for common configurations.

use std::fmt;
use std::str::FromStr;
use tribunal_core::pattern::PatternLoad;
use tribunal_core::PatternStore;

use crate::catalog::catalog;

/// Preset selections of the built-in catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Preset {
    /// Security and injection patterns with a high hit rate.
    #[default]
    Recommended,
    /// Every built-in pattern.
    Strict,
    /// Only the most precise security patterns, for gradual adoption.
    Minimal,
}

impl Preset {
    /// All presets.
    pub const ALL: [Self; 3] = [Self::Recommended, Self::Strict, Self::Minimal];

    /// Returns the preset name as used in configuration.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Recommended => "recommended",
            Self::Strict => "strict",
            Self::Minimal => "minimal",
        }
    }

    /// Returns the ids of the patterns in this preset.
    ///
    /// Includes:
    /// - minimal: `wildcard-cors`, `hardcoded-secret`, `tls-verify-disabled`
    /// - recommended: minimal plus `eval-call`, `sql-string-format`, `debug-enabled`
    /// - strict: recommended plus `permissive-file-mode`, `unwrap-in-production`
    #[must_use]
    pub fn pattern_ids(self) -> &'static [&'static str] {
        const MINIMAL: &[&str] = &["wildcard-cors", "hardcoded-secret", "tls-verify-disabled"];
        const RECOMMENDED: &[&str] = &[
            "wildcard-cors",
            "hardcoded-secret",
            "tls-verify-disabled",
            "eval-call",
            "sql-string-format",
            "debug-enabled",
        ];
        const STRICT: &[&str] = &[
            "wildcard-cors",
            "hardcoded-secret",
            "tls-verify-disabled",
            "eval-call",
            "sql-string-format",
            "debug-enabled",
            "permissive-file-mode",
            "unwrap-in-production",
        ];
        match self {
            Self::Recommended => RECOMMENDED,
            Self::Strict => STRICT,
            Self::Minimal => MINIMAL,
        }
    }

    /// Returns a store with this preset's patterns.
    #[must_use]
    pub fn store(self) -> PatternStore {
        let PatternLoad { patterns, skipped } = catalog();
        let ids = self.pattern_ids();
        let mut store = PatternStore::new();
        store.extend(PatternLoad {
            patterns: patterns
                .into_iter()
                .filter(|p| ids.contains(&p.id.as_str()))
                .collect(),
            skipped,
        });
        store
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A preset name that is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown preset `{0}` (expected recommended, strict or minimal)")]
pub struct UnknownPreset(pub String);

impl FromStr for Preset {
    type Err = UnknownPreset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownPreset(s.to_string()))
    }
}
