//! Comment-based allowance directives.
//!
//! Supports directives in any line-comment syntax, on the match line or the
//! line above it:
//! ```text
//! // tribunal: allow(unwrap-in-production) reason="startup initialization"
//! origins = ["*"]  # tribunal: allow(wildcard-cors) reason="local dev server"
//! ```

use std::collections::BTreeSet;

const DIRECTIVE: &str = "tribunal:";
const COMMENT_MARKERS: [&str; 4] = ["//", "#", "--", "/*"];

/// Result of checking for an allow directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowCheck {
    /// No directive covers the pattern.
    Denied,
    /// The pattern is allowed with optional reason.
    Allowed {
        /// The reason provided (if any).
        reason: Option<String>,
        /// 1-indexed line carrying the directive.
        line: usize,
    },
}

impl AllowCheck {
    /// Returns true if allowed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Returns the reason if allowed.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allowed { reason, .. } => reason.as_deref(),
            Self::Denied => None,
        }
    }
}

/// Parsed allowance directive.
#[derive(Debug, Clone)]
pub struct AllowDirective {
    /// Pattern ids that are allowed (`all` allows every pattern).
    pub patterns: BTreeSet<String>,
    /// Optional reason for the allowance.
    pub reason: Option<String>,
}

/// Checks source code for an allowance directive covering `pattern_id`.
///
/// # Arguments
///
/// * `content` - Source code content
/// * `line` - Line number of the match (1-indexed)
/// * `pattern_id` - Pattern to check for
#[must_use]
pub fn check_allow_with_reason(content: &str, line: usize, pattern_id: &str) -> AllowCheck {
    let lines: Vec<&str> = content.lines().collect();

    for check_line in [line, line.saturating_sub(1)] {
        if check_line == 0 || check_line > lines.len() {
            continue;
        }

        if let Some(directive) = parse_allow_directive(lines[check_line - 1]) {
            if directive.patterns.contains(pattern_id) || directive.patterns.contains("all") {
                return AllowCheck::Allowed {
                    reason: directive.reason,
                    line: check_line,
                };
            }
        }
    }

    AllowCheck::Denied
}

/// Parses an allowance directive from a source line.
///
/// The directive must follow a comment marker on the same line.
#[must_use]
pub fn parse_allow_directive(line: &str) -> Option<AllowDirective> {
    let start = line.find(DIRECTIVE)?;
    let before = &line[..start];
    if !COMMENT_MARKERS.iter().any(|m| before.contains(m)) {
        return None;
    }

    let directive = line[start + DIRECTIVE.len()..].trim();
    let allow_content = directive.strip_prefix("allow(")?.trim();
    let paren_end = allow_content.find(')')?;

    let patterns: BTreeSet<String> = allow_content[..paren_end]
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if patterns.is_empty() {
        return None;
    }

    let rest = allow_content[paren_end + 1..].trim();
    let reason = rest
        .strip_prefix("reason=")
        .map(str::trim)
        .and_then(|r| r.strip_prefix('"'))
        .and_then(|r| r.find('"').map(|end| r[..end].trim().to_string()))
        .filter(|r| !r.is_empty());

    Some(AllowDirective { patterns, reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allow_directive() {
        let directive = parse_allow_directive("// tribunal: allow(unwrap-in-production)").unwrap();
        assert!(directive.patterns.contains("unwrap-in-production"));
        assert!(directive.reason.is_none());
    }

    #[test]
    fn test_parse_hash_comment_with_reason() {
        let directive =
            parse_allow_directive("# tribunal: allow(wildcard-cors) reason=\"local dev only\"")
                .unwrap();
        assert!(directive.patterns.contains("wildcard-cors"));
        assert_eq!(directive.reason.as_deref(), Some("local dev only"));
    }

    #[test]
    fn test_parse_multiple_patterns() {
        let directive = parse_allow_directive("// tribunal: allow(a, b, c)").unwrap();
        assert_eq!(directive.patterns.len(), 3);
    }

    #[test]
    fn test_directive_outside_comment_is_ignored() {
        assert!(parse_allow_directive("let s = \"tribunal: allow(x)\";").is_none());
        assert!(parse_allow_directive("// tribunal: allow()").is_none());
    }

    #[test]
    fn test_trailing_directive_on_match_line() {
        let content = "origins = [\"*\"]  # tribunal: allow(wildcard-cors) reason=\"dev\"\n";
        let result = check_allow_with_reason(content, 1, "wildcard-cors");
        assert!(result.is_allowed());
        assert_eq!(result.reason(), Some("dev"));
    }

    #[test]
    fn test_directive_on_previous_line() {
        let content = r#"fn foo() {
    // tribunal: allow(unwrap-in-production)
    value.unwrap();
}"#;

        let result = check_allow_with_reason(content, 3, "unwrap-in-production");
        assert_eq!(
            result,
            AllowCheck::Allowed {
                reason: None,
                line: 2
            }
        );
        assert!(!check_allow_with_reason(content, 3, "eval-call").is_allowed());
    }

    #[test]
    fn test_check_allow_denied() {
        let content = "fn foo() {\n    value.unwrap();\n}";
        let result = check_allow_with_reason(content, 2, "unwrap-in-production");
        assert!(!result.is_allowed());
        assert_eq!(result.reason(), None);
    }
}
