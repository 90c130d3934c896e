//! Runs a scan over a directory on disk.
//!
//! Resolves the configuration file, selects the preset patterns, walks the
//! tree for files and hands everything to the engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tribunal_core::pattern::{LoadPatternsError, PatternLoad};
use tribunal_core::{
    load_patterns_from_toml, ConfigError, ContentAccessor, DeepAnalyzer, Engine, EngineConfig,
    EngineError, FsAccessor, ScanCancellation, ScanOptions, ScanReport,
};
use tribunal_patterns::{Preset, UnknownPreset};
use walkdir::WalkDir;

/// Config file names searched in the project root, in priority order.
pub const CONFIG_CANDIDATES: &[&str] = &["tribunal.toml", ".tribunal.toml"];

/// Environment variable naming a directory that holds `config.toml`.
pub const CONFIG_DIR_ENV: &str = "TRIBUNAL_CONFIG_DIR";

/// Errors raised before or around a scan.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The configuration file could not be read.
    #[error("failed to read config from {path}: {source}")]
    ReadConfig {
        /// Resolved config path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The `[[pattern]]` section could not be read.
    #[error("invalid pattern definitions: {0}")]
    Patterns(#[from] LoadPatternsError),

    /// The configured preset does not exist.
    #[error(transparent)]
    Preset(#[from] UnknownPreset),

    /// The engine failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The directory walk failed.
    #[error("failed to walk {root}: {source}")]
    Walk {
        /// Scan root.
        root: PathBuf,
        /// Underlying walk error.
        source: walkdir::Error,
    },
}

/// Configuration read from the resolved file.
#[derive(Debug, Default)]
pub struct LoadedConfig {
    /// File the configuration came from; `None` means defaults.
    pub path: Option<PathBuf>,
    /// Engine settings.
    pub config: EngineConfig,
    /// Inline `[[pattern]]` definitions.
    pub patterns: PatternLoad,
}

/// Resolves the configuration file for `root`.
///
/// Priority: explicit path > `tribunal.toml` / `.tribunal.toml` in the root >
/// `$TRIBUNAL_CONFIG_DIR/config.toml` > `~/.tribunal/config.toml`.
/// A relative explicit path is taken relative to `root`.
#[must_use]
pub fn resolve_config_path(root: &Path, explicit: Option<&Path>) -> Option<PathBuf> {
    let user_dir = std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .or_else(|| home::home_dir().map(|home| home.join(".tribunal")));
    resolve_with_user_dir(root, explicit, user_dir.as_deref())
}

fn resolve_with_user_dir(
    root: &Path,
    explicit: Option<&Path>,
    user_dir: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        });
    }
    CONFIG_CANDIDATES
        .iter()
        .map(|name| root.join(name))
        .chain(user_dir.map(|dir| dir.join("config.toml")))
        .find(|path| path.is_file())
}

/// Reads the configuration and inline patterns from `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid TOML.
pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig, RunnerError> {
    let Some(path) = path else {
        debug!("No config file found; using defaults");
        return Ok(LoadedConfig::default());
    };
    let content = std::fs::read_to_string(path).map_err(|source| RunnerError::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "Loaded config file");
    Ok(LoadedConfig {
        path: Some(path.to_path_buf()),
        config: EngineConfig::parse(&content)?,
        patterns: load_patterns_from_toml(&content)?,
    })
}

/// Lists every file under `root`, relative to it and sorted.
///
/// `.git` directories are not entered.
///
/// # Errors
///
/// Returns an error if a directory cannot be read.
pub fn discover_files(root: &Path) -> Result<Vec<PathBuf>, RunnerError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|source| RunnerError::Walk {
            root: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// End-to-end scan of a directory.
#[derive(Clone)]
pub struct Runner {
    root: PathBuf,
    config_path: Option<PathBuf>,
    preset: Option<Preset>,
    analyzer: Option<Arc<dyn DeepAnalyzer>>,
    cancellation: ScanCancellation,
}

impl Runner {
    /// Creates a runner for `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config_path: None,
            preset: None,
            analyzer: None,
            cancellation: ScanCancellation::new(),
        }
    }

    /// Uses an explicit configuration file.
    #[must_use]
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Overrides the preset named in the configuration.
    #[must_use]
    pub fn preset(mut self, preset: Preset) -> Self {
        self.preset = Some(preset);
        self
    }

    /// Attaches a deep analyzer.
    #[must_use]
    pub fn deep_analyzer(mut self, analyzer: Arc<dyn DeepAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Uses a caller-held cancellation signal.
    #[must_use]
    pub fn cancellation(mut self, cancellation: ScanCancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Builds the engine from the resolved configuration.
    ///
    /// Patterns are the preset's (builder override > `preset` key >
    /// recommended) followed by the inline `[[pattern]]` definitions, which
    /// replace built-ins with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or names an
    /// unknown preset, or the engine cannot be built.
    pub fn engine(&self) -> Result<Engine, RunnerError> {
        let path = resolve_config_path(&self.root, self.config_path.as_deref());
        let loaded = load_config(path.as_deref())?;

        let preset = match (self.preset, loaded.config.preset.as_deref()) {
            (Some(preset), _) => preset,
            (None, Some(name)) => name.parse()?,
            (None, None) => Preset::default(),
        };
        let mut store = preset.store();
        store.extend(loaded.patterns);
        info!(
            root = %self.root.display(),
            config = ?loaded.path,
            %preset,
            patterns = store.len(),
            "Runner configured"
        );

        let mut builder = Engine::builder()
            .root(&self.root)
            .config(loaded.config)
            .patterns(store);
        if let Some(analyzer) = &self.analyzer {
            builder = builder.deep_analyzer(Arc::clone(analyzer));
        }
        Ok(builder.build()?)
    }

    /// Scans every file under the root.
    ///
    /// # Errors
    ///
    /// See [`Runner::engine`] and [`discover_files`].
    pub async fn run(&self) -> Result<ScanReport, RunnerError> {
        let engine = self.engine()?;
        let paths = discover_files(&self.root)?;
        let accessor = FsAccessor::new(&self.root);
        let options = ScanOptions::new().cancellation(self.cancellation.clone());
        Ok(engine.scan_paths(&accessor, &paths, options).await?)
    }

    /// Runs [`Runner::run`] on a dedicated runtime.
    ///
    /// # Errors
    ///
    /// See [`Runner::run`].
    pub fn run_blocking(&self) -> Result<ScanReport, RunnerError> {
        let engine = self.engine()?;
        let paths = discover_files(&self.root)?;
        let files = FsAccessor::new(&self.root).load_all(&paths);
        let options = ScanOptions::new().cancellation(self.cancellation.clone());
        Ok(engine.scan_blocking(files, options)?)
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("root", &self.root)
            .field("config_path", &self.config_path)
            .field("preset", &self.preset)
            .field("deep", &self.analyzer.is_some())
            .finish_non_exhaustive()
    }
}
