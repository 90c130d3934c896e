//! Layered file exclusion.
//!
//! Sources are consulted in a fixed order and evaluation stops at the first
//! source that excludes the file:
//!
//! 1. binary / size / encoding check
//! 2. version-control ignore (`.gitignore` at the scan root, plus config lines)
//! 3. tool ignore file (`.tribunalignore`)
//! 4. configuration excludes
//! 5. pattern-specific path excludes (per file and pattern, see
//!    [`ExclusionResolver::pattern_excluded`])

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::Match;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::audit::{AuditKind, AuditPayload, AuditRecord, AuditSubject, AuditTrail};
use crate::config::{ConfigError, ExclusionConfig};
use crate::pattern::{GlobPattern, PatternDefinition};
use crate::source::{FileContent, FileInput};

/// Bytes inspected for NUL when detecting binary content.
pub const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// An exclusion source, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExclusionSource {
    /// Unreadable, too large, binary or not UTF-8.
    BinaryOrSize,
    /// Version-control ignore rules.
    VcsIgnore,
    /// Tool-specific ignore file.
    ToolIgnore,
    /// Configuration excludes.
    ConfigExclude,
    /// A pattern's own path excludes.
    PatternExclude,
}

impl ExclusionSource {
    /// All sources in evaluation order.
    pub const ORDER: [Self; 5] = [
        Self::BinaryOrSize,
        Self::VcsIgnore,
        Self::ToolIgnore,
        Self::ConfigExclude,
        Self::PatternExclude,
    ];
}

impl fmt::Display for ExclusionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BinaryOrSize => write!(f, "binary-or-size"),
            Self::VcsIgnore => write!(f, "vcs-ignore"),
            Self::ToolIgnore => write!(f, "tool-ignore"),
            Self::ConfigExclude => write!(f, "config-exclude"),
            Self::PatternExclude => write!(f, "pattern-exclude"),
        }
    }
}

/// A file that passed every file-level source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the scan root.
    pub path: PathBuf,
    /// Decoded content.
    pub text: Arc<str>,
}

/// A file that was excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    /// Path relative to the scan root.
    pub path: PathBuf,
    /// The highest-priority source that matched.
    pub source: ExclusionSource,
    /// Why.
    pub reason: String,
}

/// Result of resolving one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileResolution {
    /// Eligible for analysis.
    Included(SourceFile),
    /// Not eligible.
    Excluded(Exclusion),
}

/// Result of resolving a file set.
#[derive(Debug, Clone, Default)]
pub struct ResolvedFiles {
    /// Included files sorted by path.
    pub included: Vec<SourceFile>,
    /// Excluded files sorted by path.
    pub excluded: Vec<Exclusion>,
}

impl ResolvedFiles {
    /// Exclusion counts per source.
    #[must_use]
    pub fn counts_by_source(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for e in &self.excluded {
            *counts.entry(e.source.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// Decides per file whether it is eligible for analysis.
#[derive(Debug, Clone)]
pub struct ExclusionResolver {
    max_file_bytes: u64,
    vcs: Option<Gitignore>,
    tool: Option<Gitignore>,
    excludes: Vec<GlobPattern>,
}

impl ExclusionResolver {
    /// Builds the resolver.
    ///
    /// When `root` is given, `.gitignore` and the tool ignore file are read
    /// from it; missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured glob or ignore line is invalid.
    pub fn new(config: &ExclusionConfig, root: Option<&Path>) -> Result<Self, ConfigError> {
        let vcs = if config.vcs_ignore {
            build_ignore(root, ".gitignore", &config.vcs_ignore_lines)?
        } else {
            None
        };
        let tool = build_ignore(root, &config.tool_ignore_file, &config.tool_ignore_lines)?;

        let excludes = config
            .exclude
            .iter()
            .map(|p| {
                GlobPattern::new(p).map_err(|e| ConfigError::Exclusion {
                    message: format!("exclusion.exclude: {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            max_file_bytes: config.max_file_bytes,
            vcs,
            tool,
            excludes,
        })
    }

    /// Resolves one file against the file-level sources.
    #[must_use]
    pub fn resolve(&self, input: FileInput) -> FileResolution {
        let path = input.path;
        let exclude = |source, reason: String| {
            FileResolution::Excluded(Exclusion {
                path: path.clone(),
                source,
                reason,
            })
        };

        let text = match check_content(input.content, self.max_file_bytes) {
            Ok(text) => text,
            Err(reason) => return exclude(ExclusionSource::BinaryOrSize, reason),
        };

        if let Some(reason) = self.vcs.as_ref().and_then(|gi| ignored_by(gi, &path)) {
            return exclude(ExclusionSource::VcsIgnore, reason);
        }
        if let Some(reason) = self.tool.as_ref().and_then(|gi| ignored_by(gi, &path)) {
            return exclude(ExclusionSource::ToolIgnore, reason);
        }
        if let Some(glob) = self.excludes.iter().find(|g| g.matches(&path)) {
            return exclude(
                ExclusionSource::ConfigExclude,
                format!("matches exclude `{}`", glob.as_str()),
            );
        }

        FileResolution::Included(SourceFile {
            path,
            text: Arc::from(text),
        })
    }

    /// Resolves a file set, recording one audit entry per file.
    ///
    /// Duplicate paths keep their first occurrence. Both output lists are
    /// sorted by path, so an unchanged file set yields identical results.
    #[must_use]
    pub fn resolve_all(&self, mut inputs: Vec<FileInput>, audit: &AuditTrail) -> ResolvedFiles {
        inputs.sort_by(|a, b| a.path.cmp(&b.path));
        inputs.dedup_by(|later, first| {
            let dup = later.path == first.path;
            if dup {
                debug!(path = %later.path.display(), "Ignoring duplicate input path");
            }
            dup
        });

        let mut resolved = ResolvedFiles::default();
        let mut batch = audit.batch();
        for input in inputs {
            let started = Instant::now();
            match self.resolve(input) {
                FileResolution::Included(file) => {
                    batch.push(
                        AuditRecord::new(
                            AuditKind::FileIncluded,
                            "passed all exclusion sources",
                            AuditSubject::file(&file.path),
                        )
                        .elapsed_since(started),
                    );
                    resolved.included.push(file);
                }
                FileResolution::Excluded(exclusion) => {
                    debug!(
                        path = %exclusion.path.display(),
                        source = %exclusion.source,
                        reason = %exclusion.reason,
                        "File excluded"
                    );
                    batch.push(
                        AuditRecord::new(
                            AuditKind::FileExcluded,
                            format!(
                                "excluded by {}: {}; lower-priority sources not consulted",
                                exclusion.source, exclusion.reason
                            ),
                            AuditSubject::file(&exclusion.path),
                        )
                        .elapsed_since(started)
                        .with_payload(AuditPayload::Exclusion {
                            source: exclusion.source,
                            reason: exclusion.reason.clone(),
                        }),
                    );
                    resolved.excluded.push(exclusion);
                }
            }
        }

        resolved
    }

    /// Checks the pattern-specific source for an included file.
    #[must_use]
    pub fn pattern_excluded(&self, path: &Path, pattern: &PatternDefinition) -> Option<Exclusion> {
        pattern.excluded_by(path).map(|glob| Exclusion {
            path: path.to_path_buf(),
            source: ExclusionSource::PatternExclude,
            reason: format!(
                "pattern `{}` excludes `{}`",
                pattern.id,
                glob.as_str()
            ),
        })
    }
}

fn check_content(content: FileContent, max_bytes: u64) -> Result<String, String> {
    let len = content.len().unwrap_or(0) as u64;
    if len > max_bytes {
        return Err(format!("file is {len} bytes, limit is {max_bytes}"));
    }
    let bytes = match content {
        FileContent::Unreadable(reason) => return Err(format!("unreadable: {reason}")),
        FileContent::Text(text) => {
            if text.as_bytes().iter().take(BINARY_SNIFF_BYTES).any(|&b| b == 0) {
                return Err("binary content (NUL byte)".to_string());
            }
            return Ok(text);
        }
        FileContent::Bytes(bytes) => bytes,
    };
    if bytes.iter().take(BINARY_SNIFF_BYTES).any(|&b| b == 0) {
        return Err("binary content (NUL byte)".to_string());
    }
    String::from_utf8(bytes).map_err(|e| format!("invalid UTF-8: {}", e.utf8_error()))
}

fn build_ignore(
    root: Option<&Path>,
    file_name: &str,
    lines: &[String],
) -> Result<Option<Gitignore>, ConfigError> {
    let file = root.map(|r| r.join(file_name)).filter(|p| p.is_file());
    if file.is_none() && lines.is_empty() {
        return Ok(None);
    }

    let mut builder = GitignoreBuilder::new(root.unwrap_or_else(|| Path::new(".")));
    if let Some(file) = &file {
        if let Some(err) = builder.add(file) {
            warn!(file = %file.display(), error = %err, "Ignoring invalid lines in ignore file");
        }
    }
    for line in lines {
        builder
            .add_line(None, line)
            .map_err(|e| ConfigError::Exclusion {
                message: format!("ignore line `{line}`: {e}"),
            })?;
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| ConfigError::Exclusion {
            message: format!("{file_name}: {e}"),
        })
}

fn ignored_by(gitignore: &Gitignore, path: &Path) -> Option<String> {
    let matched = if path.is_relative() {
        gitignore.matched_path_or_any_parents(path, false)
    } else {
        gitignore.matched(path, false)
    };
    match matched {
        Match::Ignore(glob) => Some(format!("matches ignore rule `{}`", glob.original())),
        Match::Whitelist(_) | Match::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExclusionConfig {
        ExclusionConfig {
            exclude: vec!["build/**".to_string(), "**/*.min.js".to_string()],
            vcs_ignore_lines: vec!["*.log".to_string(), "build/".to_string()],
            tool_ignore_lines: vec!["fixtures/".to_string()],
            ..ExclusionConfig::default()
        }
    }

    fn source_of(resolution: &FileResolution) -> Option<ExclusionSource> {
        match resolution {
            FileResolution::Included(_) => None,
            FileResolution::Excluded(e) => Some(e.source),
        }
    }

    #[test]
    fn highest_priority_source_wins() {
        let resolver = ExclusionResolver::new(&config(), None).unwrap();
        // Matched by both the vcs ignore and the config exclude.
        let r = resolver.resolve(FileInput::text("build/out.py", "x = 1"));
        assert_eq!(source_of(&r), Some(ExclusionSource::VcsIgnore));

        let r = resolver.resolve(FileInput::text("static/app.min.js", "x"));
        assert_eq!(source_of(&r), Some(ExclusionSource::ConfigExclude));

        let r = resolver.resolve(FileInput::text("fixtures/data.py", "x"));
        assert_eq!(source_of(&r), Some(ExclusionSource::ToolIgnore));

        let r = resolver.resolve(FileInput::text("app/main.py", "x"));
        assert_eq!(source_of(&r), None);
    }

    #[test]
    fn binary_check_precedes_ignore_rules() {
        let resolver = ExclusionResolver::new(&config(), None).unwrap();
        let r = resolver.resolve(FileInput::bytes("debug.log", vec![0x7f, 0x00, 0x01]));
        assert_eq!(source_of(&r), Some(ExclusionSource::BinaryOrSize));
    }

    #[test]
    fn input_errors_exclude_with_reason() {
        let mut cfg = config();
        cfg.max_file_bytes = 4;
        let resolver = ExclusionResolver::new(&cfg, None).unwrap();

        let r = resolver.resolve(FileInput::text("a.py", "12345"));
        assert_eq!(source_of(&r), Some(ExclusionSource::BinaryOrSize));

        let r = resolver.resolve(FileInput::bytes("b.py", vec![0xff, 0xfe]));
        match r {
            FileResolution::Excluded(e) => assert!(e.reason.contains("UTF-8")),
            FileResolution::Included(_) => panic!("invalid UTF-8 must be excluded"),
        }

        let r = resolver.resolve(FileInput {
            path: PathBuf::from("c.py"),
            content: FileContent::Unreadable("permission denied".to_string()),
        });
        assert_eq!(source_of(&r), Some(ExclusionSource::BinaryOrSize));
    }

    #[test]
    fn whitelist_entries_are_honoured() {
        let mut cfg = config();
        cfg.vcs_ignore_lines = vec!["*.py".to_string(), "!keep.py".to_string()];
        let resolver = ExclusionResolver::new(&cfg, None).unwrap();
        assert_eq!(
            source_of(&resolver.resolve(FileInput::text("drop.py", "x"))),
            Some(ExclusionSource::VcsIgnore)
        );
        assert_eq!(
            source_of(&resolver.resolve(FileInput::text("keep.py", "x"))),
            None
        );
    }

    #[test]
    fn reads_ignore_files_from_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "secrets/\n").unwrap();
        std::fs::write(dir.path().join(".tribunalignore"), "vendor/\n").unwrap();

        let resolver =
            ExclusionResolver::new(&ExclusionConfig::default(), Some(dir.path())).unwrap();
        assert_eq!(
            source_of(&resolver.resolve(FileInput::text("secrets/keys.py", "x"))),
            Some(ExclusionSource::VcsIgnore)
        );
        assert_eq!(
            source_of(&resolver.resolve(FileInput::text("vendor/lib.js", "x"))),
            Some(ExclusionSource::ToolIgnore)
        );
    }

    #[test]
    fn resolve_all_is_deterministic_and_audited() {
        let resolver = ExclusionResolver::new(&config(), None).unwrap();
        let inputs = || {
            vec![
                FileInput::text("z.py", "z"),
                FileInput::text("build/a.py", "a"),
                FileInput::text("a.py", "a"),
                FileInput::text("a.py", "duplicate"),
            ]
        };

        let audit = AuditTrail::new("scan");
        let first = resolver.resolve_all(inputs(), &audit);
        let second = resolver.resolve_all(inputs(), &AuditTrail::new("scan"));

        let paths: Vec<_> = first.included.iter().map(|f| f.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("a.py"), PathBuf::from("z.py")]);
        assert_eq!(first.included, second.included);
        assert_eq!(first.excluded, second.excluded);

        let export = audit.export();
        assert_eq!(export.by_kind(AuditKind::FileIncluded).len(), 2);
        let excluded = export.by_kind(AuditKind::FileExcluded);
        assert_eq!(excluded.len(), 1);
        assert!(excluded[0].context.contains("vcs-ignore"));
        assert_eq!(first.counts_by_source()["vcs-ignore"], 1);
    }

    #[test]
    fn invalid_config_glob_is_fatal() {
        let mut cfg = config();
        cfg.exclude = vec!["[".to_string()];
        assert!(matches!(
            ExclusionResolver::new(&cfg, None),
            Err(ConfigError::Exclusion { .. })
        ));
    }
}
