//! # tribunal
//!
//! Layered violation analysis with weighted voting and a replayable audit
//! trail.
//!
//! This is the facade crate: it re-exports the engine, the built-in
//! patterns, and a [`Runner`] that scans a directory on disk.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tribunal::Runner;
//!
//! let report = Runner::new(".").run().await?;
//! println!("{}", report.outcome);
//! if report.outcome.verdict.is_block() {
//!     std::process::exit(1);
//! }
//! ```
//!
//! ## Configuration
//!
//! The runner reads `tribunal.toml` (or `.tribunal.toml`) from the scan
//! root, falling back to `$TRIBUNAL_CONFIG_DIR/config.toml` and then
//! `~/.tribunal/config.toml`:
//!
//! ```toml
//! preset = "recommended"
//!
//! [thresholds]
//! commit = 0.7
//! block = 0.3
//!
//! [verdict]
//! needs_review = "block"
//!
//! [[pattern]]
//! id = "internal-host"
//! kind = "literal"
//! text = "corp.internal"
//! ```
//!
//! ## Suppression
//!
//! An inline directive on the match line or the line above votes toward
//! dismissal:
//!
//! ```python
//! # tribunal: allow(wildcard-cors) reason="local development server"
//! CORS_ALLOWED_ORIGINS = ["*"]
//! ```

#![forbid(unsafe_code)]

// Re-export core types and traits
pub use tribunal_core::*;

/// Built-in patterns and presets.
pub mod patterns {
    pub use tribunal_patterns::*;
}

mod runner;

pub use runner::{
    discover_files, load_config, resolve_config_path, LoadedConfig, Runner, RunnerError,
    CONFIG_CANDIDATES, CONFIG_DIR_ENV,
};
