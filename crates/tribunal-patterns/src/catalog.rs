//! The built-in catalog, embedded as `[[pattern]]` TOML.

use tracing::{error, warn};
use tribunal_core::pattern::PatternLoad;
use tribunal_core::{load_patterns_from_toml, PatternStore};

/// Source of the built-in catalog.
pub const CATALOG_TOML: &str = include_str!("catalog.toml");

/// Loads the built-in catalog.
///
/// Entries that fail validation are reported in [`PatternLoad::skipped`].
#[must_use]
pub fn catalog() -> PatternLoad {
    match load_patterns_from_toml(CATALOG_TOML) {
        Ok(load) => {
            for skipped in &load.skipped {
                warn!(id = ?skipped.id, reason = %skipped.reason, "Built-in pattern skipped");
            }
            load
        }
        Err(e) => {
            error!(error = %e, "Built-in catalog is not valid TOML");
            PatternLoad::default()
        }
    }
}

/// Returns a store with every built-in pattern.
#[must_use]
pub fn all_patterns() -> PatternStore {
    let mut store = PatternStore::new();
    store.extend(catalog());
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::OnceCell;
    use std::path::Path;
    use tribunal_core::matching::find_spans;
    use tribunal_core::utils::lexical::Language;
    use tribunal_core::PatternId;

    fn matches(id: &str, path: &str, text: &str) -> Vec<String> {
        let store = all_patterns();
        let pattern = store
            .get(&PatternId::new(id).unwrap())
            .unwrap_or_else(|| panic!("missing pattern {id}"));
        let path = Path::new(path);
        if !pattern.applies_to(path) {
            return Vec::new();
        }
        find_spans(&pattern.matcher, text, Language::from_path(path), &OnceCell::new())
            .into_iter()
            .map(|r| text[r].to_string())
            .collect()
    }

    #[test]
    fn test_catalog_loads_cleanly() {
        let load = catalog();
        assert!(load.skipped.is_empty(), "{:?}", load.skipped);
        assert_eq!(load.patterns.len(), 8);
        assert!(load.patterns.iter().all(|p| !p.description.is_empty()));
    }

    #[test]
    fn test_wildcard_cors() {
        assert_eq!(
            matches("wildcard-cors", "settings.py", "CORS_ORIGINS = [\"*\"]\n"),
            vec!["\"*\""]
        );
        assert_eq!(
            matches("wildcard-cors", "build.py", "glob.glob('*.py')\n"),
            vec!["'*.py'"]
        );
        assert!(matches("wildcard-cors", "a.py", "x = a * b\n").is_empty());
    }

    #[test]
    fn test_hardcoded_secret() {
        assert_eq!(
            matches("hardcoded-secret", "config.py", "DB_PASSWORD = \"hunter2hunter2\"\n"),
            vec!["\"hunter2hunter2\""]
        );
        assert!(matches("hardcoded-secret", "config.py", "DB_PASSWORD = os.environ[\"PW\"]\n").is_empty());
        assert!(matches("hardcoded-secret", "config.py", "password = \"\"\n").is_empty());
    }

    #[test]
    fn test_tls_verify_disabled() {
        assert_eq!(
            matches("tls-verify-disabled", "client.py", "requests.get(url, verify=False)\n"),
            vec!["verify=False"]
        );
        assert_eq!(
            matches("tls-verify-disabled", "agent.js", "new Agent({ rejectUnauthorized: false })\n"),
            vec!["rejectUnauthorized: false"]
        );
        assert!(matches("tls-verify-disabled", "client.py", "requests.get(url, verify=True)\n").is_empty());
    }

    #[test]
    fn test_eval_call() {
        assert_eq!(
            matches("eval-call", "run.py", "result = eval(user_input)\n"),
            vec!["eval(user_input)"]
        );
        assert!(matches("eval-call", "run.py", "def eval(expr):\n    pass\n").is_empty());
        assert!(matches("eval-call", "main.rs", "eval(x);\n").is_empty());
    }

    #[test]
    fn test_sql_string_format() {
        let text = "cur.execute(\"SELECT * FROM users WHERE id = %s\" % user_id)\n";
        assert_eq!(matches("sql-string-format", "db.py", text).len(), 1);
        let safe = "cur.execute(\"SELECT * FROM users WHERE id = %s\", (user_id,))\n";
        assert!(matches("sql-string-format", "db.py", safe).is_empty());
    }

    #[test]
    fn test_debug_enabled() {
        assert_eq!(matches("debug-enabled", "settings.py", "DEBUG = True\n"), vec!["True"]);
        assert_eq!(matches("debug-enabled", "app.yaml", "debug: true\n"), vec!["true"]);
        assert!(matches("debug-enabled", "settings.py", "DEBUG = False\n").is_empty());
    }

    #[test]
    fn test_permissive_file_mode() {
        assert_eq!(
            matches("permissive-file-mode", "setup.py", "os.chmod(path, 0o777)\n"),
            vec!["0o777"]
        );
        assert!(matches("permissive-file-mode", "setup.py", "os.chmod(path, 0o755)\n").is_empty());
    }

    #[test]
    fn test_unwrap_in_production() {
        assert_eq!(
            matches("unwrap-in-production", "src/lib.rs", "let x = parse(s).unwrap();\n"),
            vec![".unwrap()"]
        );
        assert!(matches("unwrap-in-production", "src/lib.py", "x.unwrap()\n").is_empty());
    }
}
