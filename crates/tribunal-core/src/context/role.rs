//! Syntactic role of a match, resolved by a bounded backward scan.
//!
//! The scan starts `lookback_lines` above the match and walks forward to it,
//! tracking open brackets. Each open bracket is a frame carrying the callee
//! before `(`, the key assigned in it and the string literals seen in it.
//! Closing a frame hands its literals to the parent, so
//! `headers.set("Access-Control-Allow-Origin", "*")` still sees the header
//! name when the match is the second argument.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::project::{FileSnapshot, ProjectContext};
use crate::matching::structural::{assignment_op_at, key_before};
use crate::utils::lexical::{is_keyword, name_before, LexClass, Language};

/// Syntactic role of the text at a match location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "kebab-case")]
pub enum SyntacticRole {
    /// Inside a comment.
    Comment,
    /// Value of a security-relevant key, or argument next to one.
    SecurityKey {
        /// The key, callee or literal carrying the security term.
        key: String,
    },
    /// Argument of a glob-expanding call.
    GlobCall {
        /// The glob callee.
        callee: String,
    },
    /// Value assigned to an ordinary key.
    Assignment {
        /// The assigned key.
        key: String,
    },
    /// Argument of an ordinary call.
    CallArgument {
        /// The callee.
        callee: String,
    },
    /// A free-standing string constant.
    StringConstant,
    /// Plain code.
    Code,
    /// The enclosing construct could not be determined.
    Unknown,
}

impl SyntacticRole {
    /// Short kebab-case name used in rationale codes.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::SecurityKey { .. } => "security-key",
            Self::GlobCall { .. } => "glob-call",
            Self::Assignment { .. } => "assignment",
            Self::CallArgument { .. } => "call-argument",
            Self::StringConstant => "string-constant",
            Self::Code => "code",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SyntacticRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecurityKey { key } | Self::Assignment { key } => {
                write!(f, "{} `{key}`", self.name())
            }
            Self::GlobCall { callee } | Self::CallArgument { callee } => {
                write!(f, "{} `{callee}`", self.name())
            }
            _ => f.write_str(self.name()),
        }
    }
}

#[derive(Debug, Default)]
struct Frame {
    paren: bool,
    callee: Option<String>,
    key: Option<String>,
    literals: Vec<String>,
}

impl Frame {
    fn reset(&mut self) {
        self.key = None;
        self.literals.clear();
    }

    // Call arguments share the call's literals; collection entries do not.
    fn separate(&mut self) {
        self.key = None;
        if !self.paren {
            self.literals.clear();
        }
    }
}

#[derive(Debug, Default)]
struct Scope {
    base: Frame,
    nested: Vec<Frame>,
    underflow: bool,
}

impl Scope {
    fn top(&mut self) -> &mut Frame {
        self.nested.last_mut().unwrap_or(&mut self.base)
    }

    fn open(&mut self, paren: bool, callee: Option<String>) {
        self.nested.push(Frame {
            paren,
            callee,
            ..Frame::default()
        });
    }

    fn close(&mut self) {
        match self.nested.pop() {
            Some(frame) => self.top().literals.extend(frame.literals),
            None => {
                self.base.reset();
                self.underflow = true;
            }
        }
    }

    /// Frames from innermost to outermost.
    fn inner_to_outer(&self) -> impl Iterator<Item = &Frame> {
        self.nested.iter().rev().chain(std::iter::once(&self.base))
    }
}

/// Resolves the syntactic role of match offsets within a file.
#[derive(Debug, Clone, Copy)]
pub struct RoleDetector<'a> {
    project: &'a ProjectContext,
    lookback_lines: usize,
}

impl<'a> RoleDetector<'a> {
    /// Creates a detector using the project's vocabularies.
    #[must_use]
    pub fn new(project: &'a ProjectContext, lookback_lines: usize) -> Self {
        Self {
            project,
            lookback_lines,
        }
    }

    /// Returns the role of the byte at `offset`.
    #[must_use]
    pub fn detect(&self, file: &FileSnapshot, offset: usize) -> SyntacticRole {
        let text: &str = &file.text;
        if offset >= text.len() {
            return SyntacticRole::Unknown;
        }
        let lex = &file.lex;
        if lex.class_at(offset) == LexClass::Comment {
            return SyntacticRole::Comment;
        }

        let (line, _) = file.lines.line_col(offset);
        let first = line.saturating_sub(self.lookback_lines).max(1);
        let start = file.lines.line_start(first);
        let bytes = text.as_bytes();

        let mut scope = Scope::default();
        // Body start of the string literal being read; a closing delimiter
        // without an opening one (scan started inside a string) is ignored.
        let mut string_body: Option<usize> = None;

        for i in start..offset {
            match lex.class_at(i) {
                LexClass::Comment | LexClass::Str => continue,
                LexClass::Open => {
                    string_body = Some(i + 1);
                    continue;
                }
                LexClass::Close => {
                    if let Some(body) = string_body.take() {
                        scope.top().literals.push(text[body..i].to_string());
                    }
                    continue;
                }
                LexClass::Code => {}
            }
            match bytes[i] {
                b'\n' => {
                    string_body = None;
                    if scope.nested.is_empty() {
                        scope.base.reset();
                    }
                }
                b'(' => {
                    let callee = name_before(text, i).filter(|n| !is_keyword(n));
                    scope.open(true, callee);
                }
                b'[' | b'{' => scope.open(false, None),
                b')' | b']' | b'}' => scope.close(),
                b',' | b';' => scope.top().separate(),
                _ => {
                    if assignment_op_at(bytes, i).is_some() {
                        let frame = scope.top();
                        if frame.key.is_none() {
                            frame.key = key_before(text, lex, i).map(|(_, key)| key);
                        }
                    }
                }
            }
        }

        let in_string = string_body.is_some() || lex.in_string(offset);
        let outer_keys = match file.language {
            Language::Yaml => yaml_parent_keys(file, line),
            Language::Toml => toml_section(file, line).into_iter().collect(),
            _ => Vec::new(),
        };
        self.classify(&scope, &outer_keys, in_string, file.language)
    }

    fn classify(
        &self,
        scope: &Scope,
        outer_keys: &[String],
        in_string: bool,
        language: Language,
    ) -> SyntacticRole {
        if let Some(callee) = scope
            .inner_to_outer()
            .filter_map(|f| f.callee.as_deref())
            .find(|c| self.project.is_glob_callee(c))
        {
            return SyntacticRole::GlobCall {
                callee: callee.to_string(),
            };
        }

        let frame_terms = scope.inner_to_outer().flat_map(|f| {
            f.key
                .iter()
                .chain(f.callee.iter())
                .chain(f.literals.iter())
        });
        if let Some(term) = frame_terms
            .chain(outer_keys.iter())
            .find(|t| self.project.security_term_in(t).is_some())
        {
            return SyntacticRole::SecurityKey { key: term.clone() };
        }

        if let Some(callee) = scope.inner_to_outer().find_map(|f| f.callee.clone()) {
            return SyntacticRole::CallArgument { callee };
        }
        if let Some(key) = scope
            .inner_to_outer()
            .find_map(|f| f.key.clone())
            .or_else(|| outer_keys.first().cloned())
        {
            return SyntacticRole::Assignment { key };
        }
        if scope.underflow || matches!(language, Language::Other | Language::Markdown) {
            return SyntacticRole::Unknown;
        }
        if in_string {
            return SyntacticRole::StringConstant;
        }
        SyntacticRole::Code
    }
}

fn indentation(line: &str) -> usize {
    line.len() - line.trim_start_matches([' ', '-']).len()
}

/// Keys of the YAML mappings enclosing `line`, nearest first.
fn yaml_parent_keys(file: &FileSnapshot, line: usize) -> Vec<String> {
    let text: &str = &file.text;
    let line_text = |n: usize| &text[file.lines.line_start(n)..file.lines.line_end(n)];

    let mut current = indentation(line_text(line));
    let mut keys = Vec::new();
    for n in (1..line).rev() {
        if current == 0 {
            break;
        }
        let raw = line_text(n);
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = indentation(raw);
        if indent >= current {
            continue;
        }
        let entry = trimmed.trim_start_matches(['-', ' ']);
        if let Some((key, _)) = entry.split_once(':') {
            let key = key.trim().trim_matches(['"', '\'']);
            if !key.is_empty() {
                keys.push(key.to_string());
            }
        }
        current = indent;
    }
    keys
}

/// The nearest `[section]` header above `line`.
fn toml_section(file: &FileSnapshot, line: usize) -> Option<String> {
    let text: &str = &file.text;
    (1..=line).rev().find_map(|n| {
        let trimmed = text[file.lines.line_start(n)..file.lines.line_end(n)].trim();
        trimmed
            .strip_prefix('[')
            .map(|s| s.trim_matches(['[', ']']).trim().to_string())
    })
}
