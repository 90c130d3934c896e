//! Project and file snapshots consulted by the context layer.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::rust_regions;
use crate::config::ContextConfig;
use crate::source::LineIndex;
use crate::utils::lexical::{Language, LexMap};

/// Security-relevant key terms known without configuration.
pub const DEFAULT_SECURITY_KEYS: [&str; 16] = [
    "origin",
    "cors",
    "allowed_hosts",
    "access_control",
    "password",
    "passwd",
    "secret",
    "api_key",
    "apikey",
    "auth_token",
    "access_token",
    "private_key",
    "credentials",
    "trusted_hosts",
    "allow_headers",
    "allow_methods",
];

/// Callees whose arguments are glob expressions.
pub const DEFAULT_GLOB_CALLEES: [&str; 11] = [
    "glob",
    "iglob",
    "rglob",
    "fnmatch",
    "fnmatchcase",
    "minimatch",
    "globby",
    "glob.sync",
    "Pattern::new",
    "Glob::new",
    "GlobBuilder::new",
];

/// Normalizes a dependency name: lowercase, `_` folded to `-`.
#[must_use]
pub fn normalize_dependency(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('_', "-")
}

/// Immutable project-level facts shared by every candidate of a scan.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    dependencies: Option<BTreeSet<String>>,
    security_keys: Vec<String>,
    glob_callees: Vec<String>,
}

impl Default for ProjectContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectContext {
    /// Creates a context with the built-in vocabularies and unknown dependencies.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dependencies: None,
            security_keys: DEFAULT_SECURITY_KEYS.iter().map(|s| (*s).to_string()).collect(),
            glob_callees: DEFAULT_GLOB_CALLEES.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Discovers declared dependencies from the manifests found in `root`.
    ///
    /// Reads `Cargo.toml`, `package.json`, `pyproject.toml` and
    /// `requirements.txt`. Unreadable or malformed manifests are skipped.
    /// If no manifest exists, dependencies stay unknown.
    #[must_use]
    pub fn discover(root: &Path) -> Self {
        let mut found: Option<BTreeSet<String>> = None;
        for (file, parse) in MANIFESTS {
            let path = root.join(file);
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            match parse(&content) {
                Ok(names) => {
                    debug!(manifest = %path.display(), count = names.len(), "Read dependencies");
                    found.get_or_insert_with(BTreeSet::new).extend(names);
                }
                Err(reason) => {
                    warn!(manifest = %path.display(), %reason, "Skipping malformed manifest");
                }
            }
        }
        Self {
            dependencies: found,
            ..Self::new()
        }
    }

    /// Sets the declared dependencies explicitly.
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.dependencies = Some(
            names
                .into_iter()
                .map(|n| normalize_dependency(n.as_ref()))
                .collect(),
        );
        self
    }

    /// Extends the vocabularies with configured terms.
    #[must_use]
    pub fn with_vocabulary(mut self, config: &ContextConfig) -> Self {
        for key in &config.security_keys {
            let key = key.to_ascii_lowercase();
            if !self.security_keys.contains(&key) {
                self.security_keys.push(key);
            }
        }
        for callee in &config.glob_callees {
            if !self.glob_callees.contains(callee) {
                self.glob_callees.push(callee.clone());
            }
        }
        self
    }

    /// Returns whether `name` is declared, or `None` if dependencies are unknown.
    #[must_use]
    pub fn declares(&self, name: &str) -> Option<bool> {
        self.dependencies
            .as_ref()
            .map(|deps| deps.contains(&normalize_dependency(name)))
    }

    /// Returns the declared dependencies, if known.
    #[must_use]
    pub fn dependencies(&self) -> Option<&BTreeSet<String>> {
        self.dependencies.as_ref()
    }

    /// Returns the security key vocabulary.
    #[must_use]
    pub fn security_keys(&self) -> &[String] {
        &self.security_keys
    }

    /// Returns the glob callee vocabulary.
    #[must_use]
    pub fn glob_callees(&self) -> &[String] {
        &self.glob_callees
    }

    /// Returns the first security term contained in `text`, if any.
    #[must_use]
    pub fn security_term_in(&self, text: &str) -> Option<&str> {
        let folded = text.to_ascii_lowercase().replace('-', "_");
        self.security_keys
            .iter()
            .find(|k| folded.contains(k.as_str()))
            .map(String::as_str)
    }

    /// Returns true if `callee` names a glob function.
    #[must_use]
    pub fn is_glob_callee(&self, callee: &str) -> bool {
        self.glob_callees
            .iter()
            .any(|g| crate::pattern::callee_matches(callee, g))
    }
}

type ManifestParser = fn(&str) -> Result<Vec<String>, String>;

const MANIFESTS: [(&str, ManifestParser); 4] = [
    ("Cargo.toml", parse_cargo_manifest),
    ("package.json", parse_package_json),
    ("pyproject.toml", parse_pyproject),
    ("requirements.txt", parse_requirements),
];

fn table_keys(value: Option<&toml::Value>) -> impl Iterator<Item = String> + '_ {
    value
        .and_then(toml::Value::as_table)
        .into_iter()
        .flat_map(|t| t.keys().map(|k| normalize_dependency(k)))
}

/// Reads dependency names from a `Cargo.toml`.
///
/// # Errors
///
/// Returns the TOML parse error message.
pub fn parse_cargo_manifest(content: &str) -> Result<Vec<String>, String> {
    let doc: toml::Table = content.parse().map_err(|e: toml::de::Error| e.to_string())?;
    let mut names = Vec::new();
    for section in ["dependencies", "dev-dependencies", "build-dependencies"] {
        names.extend(table_keys(doc.get(section)));
    }
    if let Some(workspace) = doc.get("workspace") {
        names.extend(table_keys(workspace.get("dependencies")));
    }
    if let Some(targets) = doc.get("target").and_then(toml::Value::as_table) {
        for target in targets.values() {
            names.extend(table_keys(target.get("dependencies")));
        }
    }
    Ok(names)
}

/// Reads dependency names from a `package.json`.
///
/// # Errors
///
/// Returns the JSON parse error message.
pub fn parse_package_json(content: &str) -> Result<Vec<String>, String> {
    let doc: serde_json::Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let mut names = Vec::new();
    for section in ["dependencies", "devDependencies", "peerDependencies"] {
        if let Some(map) = doc.get(section).and_then(serde_json::Value::as_object) {
            names.extend(map.keys().map(|k| normalize_dependency(k)));
        }
    }
    Ok(names)
}

/// Reads dependency names from a `pyproject.toml` (PEP 621 and Poetry).
///
/// # Errors
///
/// Returns the TOML parse error message.
pub fn parse_pyproject(content: &str) -> Result<Vec<String>, String> {
    let doc: toml::Table = content.parse().map_err(|e: toml::de::Error| e.to_string())?;
    let mut names = Vec::new();
    if let Some(list) = doc
        .get("project")
        .and_then(|p| p.get("dependencies"))
        .and_then(toml::Value::as_array)
    {
        names.extend(list.iter().filter_map(toml::Value::as_str).filter_map(requirement_name));
    }
    if let Some(poetry) = doc.get("tool").and_then(|t| t.get("poetry")) {
        names.extend(table_keys(poetry.get("dependencies")).filter(|n| n != "python"));
    }
    Ok(names)
}

/// Reads dependency names from a `requirements.txt`.
///
/// # Errors
///
/// Never fails; the signature matches the other manifest parsers.
#[allow(clippy::unnecessary_wraps)]
pub fn parse_requirements(content: &str) -> Result<Vec<String>, String> {
    Ok(content.lines().filter_map(requirement_name).collect())
}

fn requirement_name(line: &str) -> Option<String> {
    let line = line.split('#').next().unwrap_or_default().trim();
    if line.is_empty() || line.starts_with('-') {
        return None;
    }
    let end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(line.len());
    let name = &line[..end];
    (!name.is_empty()).then(|| normalize_dependency(name))
}

/// Role of a file within the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileRole {
    /// Test sources.
    Test,
    /// Configuration documents.
    Config,
    /// Documentation.
    Docs,
    /// Everything else.
    Library,
}

impl FileRole {
    /// Infers the role from path conventions.
    #[must_use]
    pub fn detect(path: &Path) -> Self {
        let components: Vec<String> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().to_ascii_lowercase()),
                _ => None,
            })
            .collect();
        let file_name = components.last().map(String::as_str).unwrap_or_default();
        let dirs = &components[..components.len().saturating_sub(1)];

        if dirs.iter().any(|d| matches!(d.as_str(), "tests" | "test" | "benches" | "__tests__"))
            || file_name.contains("_test.")
            || file_name.starts_with("test_")
            || file_name.contains(".spec.")
            || file_name.contains(".test.")
            || file_name == "tests.rs"
            || file_name == "conftest.py"
        {
            return Self::Test;
        }

        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        if matches!(ext, "md" | "markdown" | "rst" | "txt" | "adoc")
            || dirs.iter().any(|d| d == "docs" || d == "doc")
        {
            return Self::Docs;
        }
        if matches!(ext, "toml" | "yaml" | "yml" | "json" | "ini" | "cfg" | "conf" | "env")
            || file_name.starts_with(".env")
        {
            return Self::Config;
        }
        Self::Library
    }
}

/// Per-file facts computed once and shared by the file's candidates.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    /// Path relative to the scan root.
    pub path: PathBuf,
    /// Path-derived role.
    pub role: FileRole,
    /// Language family.
    pub language: Language,
    /// File content.
    pub text: Arc<str>,
    /// Lexical classes of the content.
    pub lex: LexMap,
    /// Line offsets.
    pub lines: LineIndex,
    /// Line ranges of Rust test code (`#[cfg(test)]` modules, `#[test]` functions).
    pub test_regions: Vec<RangeInclusive<usize>>,
}

impl FileSnapshot {
    /// Builds the snapshot of one file.
    #[must_use]
    pub fn new(path: PathBuf, text: Arc<str>) -> Self {
        let role = FileRole::detect(&path);
        let language = Language::from_path(&path);
        let lex = LexMap::scan(&text, language);
        let lines = LineIndex::new(&text);
        let test_regions = if language == Language::Rust && role != FileRole::Test {
            rust_regions::test_regions(&text)
        } else {
            Vec::new()
        };
        Self {
            path,
            role,
            language,
            text,
            lex,
            lines,
            test_regions,
        }
    }

    /// Returns true if `line` lies inside test code.
    #[must_use]
    pub fn is_test_line(&self, line: usize) -> bool {
        self.role == FileRole::Test || self.test_regions.iter().any(|r| r.contains(&line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_file_role_detection() {
        assert_eq!(FileRole::detect(Path::new("tests/api.rs")), FileRole::Test);
        assert_eq!(FileRole::detect(Path::new("src/foo_test.go")), FileRole::Test);
        assert_eq!(FileRole::detect(Path::new("web/app.spec.ts")), FileRole::Test);
        assert_eq!(FileRole::detect(Path::new("pkg/test_views.py")), FileRole::Test);
        assert_eq!(FileRole::detect(Path::new("README.md")), FileRole::Docs);
        assert_eq!(FileRole::detect(Path::new("docs/guide/setup.py")), FileRole::Docs);
        assert_eq!(FileRole::detect(Path::new("config/app.yaml")), FileRole::Config);
        assert_eq!(FileRole::detect(Path::new(".env.local")), FileRole::Config);
        assert_eq!(FileRole::detect(Path::new("src/main.rs")), FileRole::Library);
        assert_eq!(FileRole::detect(Path::new("src/lib.rs")), FileRole::Library);
        assert_eq!(FileRole::detect(Path::new("src/testing.rs")), FileRole::Library);
    }

    #[test]
    fn test_discover_manifests() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"x\"\n[dependencies]\nserde_json = \"1\"\n[dev-dependencies]\ntempfile = \"3\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"cors": "^2"}, "devDependencies": {"jest": "29"}}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("requirements.txt"),
            "# web\nDjango>=4.2\nflask_cors==4.0 ; python_version > '3.8'\n-r base.txt\n",
        )
        .unwrap();

        let project = ProjectContext::discover(dir.path());
        let deps = project.dependencies().unwrap();
        for name in ["serde-json", "tempfile", "cors", "jest", "django", "flask-cors"] {
            assert!(deps.contains(name), "missing {name}");
        }
        assert_eq!(project.declares("Flask_CORS"), Some(true));
        assert_eq!(project.declares("requests"), Some(false));
    }

    #[test]
    fn test_malformed_manifest_is_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Cargo.toml"), "[dependencies\n").unwrap();
        fs::write(dir.path().join("requirements.txt"), "requests\n").unwrap();
        let project = ProjectContext::discover(dir.path());
        assert_eq!(project.declares("requests"), Some(true));
    }

    #[test]
    fn test_unknown_dependencies() {
        let dir = TempDir::new().unwrap();
        let project = ProjectContext::discover(dir.path());
        assert_eq!(project.declares("anything"), None);
    }

    #[test]
    fn test_pyproject() {
        let names = parse_pyproject(
            "[project]\ndependencies = [\"fastapi>=0.100\", \"uvicorn[standard]\"]\n\
             [tool.poetry.dependencies]\npython = \"^3.11\"\nhttpx = \"*\"\n",
        )
        .unwrap();
        assert_eq!(names, vec!["fastapi", "uvicorn", "httpx"]);
    }

    #[test]
    fn test_vocabulary_extension() {
        let config = ContextConfig {
            security_keys: vec!["Session_Key".to_string()],
            glob_callees: vec!["wcmatch.glob".to_string()],
            ..ContextConfig::default()
        };
        let project = ProjectContext::new().with_vocabulary(&config);
        assert_eq!(project.security_term_in("SESSION_KEY"), Some("session_key"));
        assert_eq!(project.security_term_in("allowed-hosts"), Some("allowed_hosts"));
        assert!(project.is_glob_callee("wcmatch.glob"));
        assert!(project.is_glob_callee("glob.glob"));
        assert!(!project.is_glob_callee("globals"));
    }

    #[test]
    fn test_snapshot_test_regions() {
        let text: Arc<str> = Arc::from(
            "fn run() {}\n\n#[cfg(test)]\nmod tests {\n    #[test]\n    fn t() {}\n}\n",
        );
        let snapshot = FileSnapshot::new(PathBuf::from("src/lib.rs"), text);
        assert!(!snapshot.is_test_line(1));
        assert!(snapshot.is_test_line(3));
        assert!(snapshot.is_test_line(6));
    }
}
