//! Pattern definitions and the pattern store.
//!
//! # Architecture
//!
//! ```text
//! TOML text ([[pattern]] entries)
//!   ↓ serde (DTO layer)
//! dto::PatternDto
//!   ↓ validate + convert (malformed entries → SkippedPattern)
//! model::PatternDefinition
//!   ↓ PatternStore::configured(config)
//! Arc<PatternStore> snapshot used by a scan
//! ```

pub mod dto;
pub mod loader;
pub mod model;
pub mod store;

#[doc(inline)]
pub use loader::{load_patterns_from_toml, LoadPatternsError, PatternLoad, SkippedPattern};
#[doc(inline)]
pub use model::{
    callee_matches, normalize_key, FixTemplate, GlobPattern, Matcher, MatcherKind, ModelError,
    PatternDefinition, PatternId, StructuralMatcher, DEFAULT_PRECISION,
};
#[doc(inline)]
pub use store::PatternStore;
