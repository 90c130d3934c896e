//! # tribunal-core
//!
//! Layered violation analysis and voting engine.
//!
//! A scan takes a change set through independent analysis layers, each of
//! which casts a scored vote on every candidate violation:
//!
//! - the **pattern** layer finds candidates with literal, regex and
//!   structural matchers ([`matching`]),
//! - the **context** layer looks at where the match sits: comments, glob
//!   calls, security-relevant keys, test code, allow directives and project
//!   dependencies ([`context`]),
//! - the optional **deep** layer hands uncertain candidates to an external
//!   [`DeepAnalyzer`] under a concurrency bound, a timeout and a cache
//!   ([`deep`]).
//!
//! The [`VoteAggregator`] merges the votes into a weighted score and a
//! classification; every step is recorded in an append-only [`AuditTrail`]
//! from which decisions can be replayed.
//!
//! ## Example
//!
//! ```ignore
//! use tribunal_core::{Engine, FileInput, ScanOptions};
//!
//! let engine = Engine::builder()
//!     .root(".")
//!     .patterns(store)
//!     .build()?;
//!
//! let report = engine.scan(files, ScanOptions::new()).await?;
//! println!("{}", report.outcome);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod audit;
mod cancel;
pub mod config;
pub mod context;
mod decision;
pub mod deep;
mod engine;
pub mod exclusion;
pub mod matching;
pub mod pattern;
mod source;
mod types;

/// Lexical and syntactic helpers shared by the layers.
pub mod utils;

pub use aggregate::{AggregationError, VoteAggregator};
pub use audit::{AuditEntry, AuditError, AuditExport, AuditKind, AuditPayload, AuditTrail};
pub use cancel::ScanCancellation;
pub use config::{ConfigError, EngineConfig, LayerWeights, Thresholds};
pub use context::{FileRole, ProjectContext, SyntacticRole};
pub use decision::{Decision, DecisionBasis, ScanOutcome, ScanStats, ScanVerdict};
pub use deep::{DeepAnalyzer, DeepError, DeepOutcome, DeepRequest};
pub use engine::{Engine, EngineBuilder, EngineError, ScanOptions, ScanReport};
pub use exclusion::ExclusionSource;
pub use pattern::{
    load_patterns_from_toml, Matcher, PatternDefinition, PatternId, PatternStore,
    StructuralMatcher,
};
pub use source::{ContentAccessor, FileContent, FileInput, FsAccessor, LineIndex};
pub use types::{
    Candidate, CandidateId, Classification, LayerKind, LayerVerdict, Location, Rationale,
    Severity, Vote,
};
pub use utils::allowance::AllowCheck;
