//! # tribunal-patterns
//!
//! Built-in pattern catalog and presets for tribunal.
//!
//! ## Available Patterns
//!
//! | Id | Category | Severity | Matcher |
//! |----|----------|----------|---------|
//! | `wildcard-cors` | security | error | regex |
//! | `hardcoded-secret` | security | error | assignment |
//! | `tls-verify-disabled` | security | error | regex |
//! | `eval-call` | injection | error | call |
//! | `sql-string-format` | injection | error | regex |
//! | `debug-enabled` | configuration | warning | assignment |
//! | `permissive-file-mode` | filesystem | warning | regex |
//! | `unwrap-in-production` | reliability | warning | regex |
//!
//! ## Usage
//!
//! ```ignore
//! use tribunal_core::Engine;
//! use tribunal_patterns::Preset;
//!
//! let engine = Engine::builder()
//!     .root(".")
//!     .patterns(Preset::Recommended.store())
//!     .build()?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod presets;

pub use catalog::{all_patterns, catalog, CATALOG_TOML};
pub use presets::{Preset, UnknownPreset};

/// Re-export core types for convenience.
pub use tribunal_core::{PatternDefinition, PatternStore, Severity};
