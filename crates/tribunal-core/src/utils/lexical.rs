//! Per-byte lexical classification of source text.
//!
//! The classifier is deliberately shallow: it knows each language's comment
//! markers and string delimiters and nothing else. Line comments and
//! single-line strings end at the line break; block comments, Python and
//! TOML triple-quoted strings, JS and Go backtick strings and Rust strings
//! (raw strings included) carry their state across lines.

use std::ops::Range;
use std::path::Path;

/// Language family inferred from a file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    /// Rust sources.
    Rust,
    /// Python sources.
    Python,
    /// JavaScript and TypeScript sources.
    JavaScript,
    /// Go sources.
    Go,
    /// Other C-family languages (C, C++, Java, Kotlin, C#, Swift).
    CLike,
    /// YAML documents.
    Yaml,
    /// TOML documents.
    Toml,
    /// JSON documents.
    Json,
    /// Shell scripts, env and ini files.
    Shell,
    /// Markdown and reStructuredText.
    Markdown,
    /// Anything else.
    Other,
}

impl Language {
    /// Infers the language from a path's extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "rs" => Self::Rust,
            "py" | "pyi" => Self::Python,
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Self::JavaScript,
            "go" => Self::Go,
            "c" | "h" | "cc" | "cpp" | "hpp" | "java" | "kt" | "kts" | "cs" | "swift"
            | "scala" => Self::CLike,
            "yaml" | "yml" => Self::Yaml,
            "toml" => Self::Toml,
            "json" => Self::Json,
            "sh" | "bash" | "zsh" | "env" | "ini" | "cfg" | "conf" | "rb" => Self::Shell,
            "md" | "markdown" | "rst" => Self::Markdown,
            _ => Self::Other,
        }
    }

    fn line_comments(self) -> &'static [&'static str] {
        match self {
            Self::Rust | Self::JavaScript | Self::Go | Self::CLike => &["//"],
            Self::Python | Self::Yaml | Self::Toml | Self::Shell => &["#"],
            Self::Json | Self::Markdown => &[],
            Self::Other => &["//", "#"],
        }
    }

    fn block_comment(self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Rust | Self::JavaScript | Self::Go | Self::CLike => Some(("/*", "*/")),
            _ => None,
        }
    }

    fn quotes(self) -> &'static [u8] {
        match self {
            Self::Rust | Self::Json | Self::Markdown => b"\"",
            Self::JavaScript | Self::Go => b"\"'`",
            _ => b"\"'",
        }
    }

    fn triple_quotes(self) -> bool {
        matches!(self, Self::Python | Self::Toml)
    }
}

/// Lexical class of one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexClass {
    /// Executable code or markup.
    Code,
    /// Opening string delimiter, including any prefix such as `r#`.
    Open,
    /// Closing string delimiter.
    Close,
    /// Inside a string literal.
    Str,
    /// Inside a comment.
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Delimiter {
    quote: u8,
    /// Quote bytes in the closing delimiter (1, or 3 for triple quotes).
    width: usize,
    /// `#` bytes following the closing quote of a Rust raw string.
    hashes: usize,
    escapes: bool,
    multiline: bool,
}

impl Delimiter {
    fn single(quote: u8) -> Self {
        Self {
            quote,
            width: 1,
            hashes: 0,
            escapes: true,
            multiline: false,
        }
    }

    /// Length of the closing delimiter at the start of `rest`, if any.
    fn closes(&self, rest: &[u8]) -> Option<usize> {
        let len = self.width + self.hashes;
        let matches = rest.len() >= len
            && rest[..self.width].iter().all(|&b| b == self.quote)
            && rest[self.width..len].iter().all(|&b| b == b'#');
        matches.then_some(len)
    }
}

/// Recognizes a string opening at `i`, returning its delimiter and the length
/// of the opening sequence.
fn open_string(language: Language, bytes: &[u8], i: usize) -> Option<(Delimiter, usize)> {
    let b = bytes[i];
    let rest = &bytes[i..];
    match language {
        Language::Rust => {
            if b == b'"' {
                return Some((
                    Delimiter {
                        multiline: true,
                        ..Delimiter::single(b'"')
                    },
                    1,
                ));
            }
            let prefix = if rest.starts_with(b"br") { 2 } else { usize::from(b == b'r') };
            if prefix == 0 || (i > 0 && is_ident_byte(bytes[i - 1])) {
                return None;
            }
            let hashes = rest[prefix..].iter().take_while(|&&h| h == b'#').count();
            (rest.get(prefix + hashes) == Some(&b'"')).then_some((
                Delimiter {
                    quote: b'"',
                    width: 1,
                    hashes,
                    escapes: false,
                    multiline: true,
                },
                prefix + hashes + 1,
            ))
        }
        _ if !language.quotes().contains(&b) => None,
        _ if language.triple_quotes() && rest.len() >= 3 && rest[1] == b && rest[2] == b => Some((
            Delimiter {
                width: 3,
                multiline: true,
                ..Delimiter::single(b)
            },
            3,
        )),
        Language::JavaScript | Language::Go if b == b'`' => Some((
            Delimiter {
                escapes: language == Language::JavaScript,
                multiline: true,
                ..Delimiter::single(b)
            },
            1,
        )),
        _ => Some((Delimiter::single(b), 1)),
    }
}

/// Length of a Rust char literal starting at `rest[0] == '\''`, or `None`
/// for a lifetime or label.
fn rust_char_len(rest: &[u8]) -> Option<usize> {
    match rest.get(1)? {
        b'\\' => rest
            .iter()
            .skip(3)
            .take(10)
            .position(|&b| b == b'\'')
            .map(|pos| pos + 4),
        &lead => {
            let width = match lead {
                0x00..=0x7f => 1,
                0xc0..=0xdf => 2,
                0xe0..=0xef => 3,
                _ => 4,
            };
            (rest.get(1 + width) == Some(&b'\'')).then_some(width + 2)
        }
    }
}

#[derive(Clone, Copy)]
enum State {
    Code,
    Str(Delimiter),
    LineComment,
    BlockComment,
}

/// Lexical classes for every byte of a file.
#[derive(Debug, Clone)]
pub struct LexMap {
    classes: Vec<LexClass>,
}

impl LexMap {
    /// Classifies every byte of `content`.
    #[must_use]
    pub fn scan(content: &str, language: Language) -> Self {
        let bytes = content.as_bytes();
        let mut classes = vec![LexClass::Code; bytes.len()];
        let comments = language.line_comments();
        let block = language.block_comment();
        let mut state = State::Code;
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];
            if b == b'\n' {
                state = match state {
                    State::Str(delim) if delim.multiline => {
                        classes[i] = LexClass::Str;
                        state
                    }
                    State::BlockComment => {
                        classes[i] = LexClass::Comment;
                        state
                    }
                    _ => State::Code,
                };
                i += 1;
                continue;
            }
            match state {
                State::Code => {
                    let rest = &bytes[i..];
                    if comments.iter().any(|m| rest.starts_with(m.as_bytes()))
                        && comment_allowed(language, bytes, i)
                    {
                        state = State::LineComment;
                        classes[i] = LexClass::Comment;
                    } else if block.is_some_and(|(open, _)| rest.starts_with(open.as_bytes())) {
                        state = State::BlockComment;
                        classes[i] = LexClass::Comment;
                        classes[i + 1] = LexClass::Comment;
                        i += 1;
                    } else if let Some(len) = (language == Language::Rust && b == b'\'')
                        .then(|| rust_char_len(rest))
                        .flatten()
                    {
                        classes[i] = LexClass::Open;
                        classes[i + 1..i + len - 1].fill(LexClass::Str);
                        classes[i + len - 1] = LexClass::Close;
                        i += len - 1;
                    } else if let Some((delim, len)) = open_string(language, bytes, i) {
                        state = State::Str(delim);
                        classes[i..i + len].fill(LexClass::Open);
                        i += len - 1;
                    }
                }
                State::Str(delim) => {
                    if delim.escapes && b == b'\\' && i + 1 < bytes.len() {
                        classes[i] = LexClass::Str;
                        classes[i + 1] = LexClass::Str;
                        i += 1;
                    } else if let Some(len) = delim.closes(&bytes[i..]) {
                        classes[i..i + len].fill(LexClass::Close);
                        state = State::Code;
                        i += len - 1;
                    } else {
                        classes[i] = LexClass::Str;
                    }
                }
                State::LineComment => classes[i] = LexClass::Comment,
                State::BlockComment => {
                    classes[i] = LexClass::Comment;
                    if let Some((_, close)) = block {
                        if bytes[i..].starts_with(close.as_bytes()) {
                            classes[i + 1] = LexClass::Comment;
                            i += 1;
                            state = State::Code;
                        }
                    }
                }
            }
            i += 1;
        }

        Self { classes }
    }

    /// Returns the class of the byte at `offset`, or `Code` past the end.
    #[must_use]
    pub fn class_at(&self, offset: usize) -> LexClass {
        self.classes.get(offset).copied().unwrap_or(LexClass::Code)
    }

    /// Returns true if the byte at `offset` is code.
    #[must_use]
    pub fn is_code(&self, offset: usize) -> bool {
        self.class_at(offset) == LexClass::Code
    }

    /// Returns true if the byte at `offset` belongs to a string literal.
    #[must_use]
    pub fn in_string(&self, offset: usize) -> bool {
        matches!(
            self.class_at(offset),
            LexClass::Str | LexClass::Open | LexClass::Close
        )
    }
}

// YAML only treats `#` as a comment at line start or after whitespace.
fn comment_allowed(language: Language, bytes: &[u8], i: usize) -> bool {
    if language != Language::Yaml || i == 0 {
        return true;
    }
    bytes[i - 1].is_ascii_whitespace()
}

/// Returns true for bytes that can appear in an identifier.
#[must_use]
pub fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Words that precede `(` without being a call.
const KEYWORDS: [&str; 18] = [
    "if", "elif", "while", "for", "switch", "return", "match", "and", "or", "not", "in", "catch",
    "with", "assert", "yield", "await", "typeof", "sizeof",
];

/// Returns true if `name` is a control-flow keyword rather than a callee.
#[must_use]
pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// Finds a dotted or `::`-separated name ending right before `end`.
///
/// Whitespace between the name and `end` is skipped. A trailing `!` (Rust
/// macro call) is kept as part of the name. Returns `None` if no identifier
/// precedes `end`.
#[must_use]
pub fn name_span_before(content: &str, end: usize) -> Option<Range<usize>> {
    let bytes = content.as_bytes();
    let mut j = end.min(bytes.len());
    while j > 0 && matches!(bytes[j - 1], b' ' | b'\t') {
        j -= 1;
    }
    let stop = j;
    if j > 0 && bytes[j - 1] == b'!' {
        j -= 1;
    }
    while j > 0 && (is_ident_byte(bytes[j - 1]) || matches!(bytes[j - 1], b'.' | b':')) {
        j -= 1;
    }
    while j < stop && matches!(bytes[j], b'.' | b':') {
        j += 1;
    }
    let name = content.get(j..stop)?;
    if name.bytes().any(is_ident_byte) {
        Some(j..stop)
    } else {
        None
    }
}

/// Reads the name ending right before `end`, see [`name_span_before`].
#[must_use]
pub fn name_before(content: &str, end: usize) -> Option<String> {
    name_span_before(content, end).map(|r| content[r].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes(content: &str, lang: Language) -> String {
        let map = LexMap::scan(content, lang);
        (0..content.len())
            .map(|i| match map.class_at(i) {
                LexClass::Code => 'c',
                LexClass::Open => 'o',
                LexClass::Close => 'q',
                LexClass::Str => 's',
                LexClass::Comment => '#',
            })
            .collect()
    }

    #[test]
    fn test_python_string_and_comment() {
        assert_eq!(classes("a = \"*\" # x", Language::Python), "ccccosqc###");
    }

    #[test]
    fn test_rust_escape_and_line_comment() {
        assert_eq!(classes(r#""\"" // c"#, Language::Rust), "ossqc####");
    }

    #[test]
    fn test_block_comment_closes() {
        assert_eq!(classes("a /* b */ c", Language::JavaScript), "cc#######cc");
    }

    #[test]
    fn test_state_resets_at_line_end() {
        let map = LexMap::scan("x = \"open\ny = 1", Language::Python);
        assert!(map.in_string(6));
        assert!(map.is_code(10));
    }

    #[test]
    fn test_python_triple_quotes_span_lines() {
        let src = "def f():\n    \"\"\"Example:\n\n    origins = [\"*\"]\n    \"\"\"\nx = 1\n";
        let map = LexMap::scan(src, Language::Python);
        let star = src.find('*').unwrap();
        assert!(map.in_string(star));
        assert_eq!(map.class_at(src.find("[\"").unwrap() + 1), LexClass::Str);
        assert!(map.is_code(src.find("x = 1").unwrap()));

        let src = "s = '''a\n'b'\n'''\ny = 2";
        let map = LexMap::scan(src, Language::Python);
        assert!(map.in_string(src.find("'b'").unwrap()));
        assert!(map.is_code(src.find("y = 2").unwrap()));
    }

    #[test]
    fn test_empty_python_string_is_not_triple() {
        assert_eq!(classes("a = \"\" + b", Language::Python), "ccccoqcccc");
    }

    #[test]
    fn test_backtick_strings_span_lines() {
        let src = "const doc = `\n  origins: ['*']\n`;\nlet y = 1;";
        let map = LexMap::scan(src, Language::JavaScript);
        assert_eq!(map.class_at(src.find("'*'").unwrap()), LexClass::Str);
        assert!(map.is_code(src.find("let y").unwrap()));

        let src = "var q = `a\\\nb`\nz := 1";
        let map = LexMap::scan(src, Language::Go);
        assert!(map.in_string(src.find('b').unwrap()));
        assert!(map.is_code(src.find("z :=").unwrap()));
    }

    #[test]
    fn test_rust_strings_span_lines() {
        let src = "let s = \"a\n\\\"*\\\"\n\";\nlet t = 1;";
        let map = LexMap::scan(src, Language::Rust);
        assert!(map.in_string(src.find('*').unwrap()));
        assert!(map.is_code(src.find("let t").unwrap()));

        let src = "let r = r#\"\n\"*\"\n\"#;\nlet u = 2;";
        let map = LexMap::scan(src, Language::Rust);
        let open = src.find("r#").unwrap();
        assert_eq!(map.class_at(open), LexClass::Open);
        assert_eq!(map.class_at(open + 2), LexClass::Open);
        assert_eq!(map.class_at(src.find("\"*").unwrap()), LexClass::Str);
        assert!(map.is_code(src.find("let u").unwrap()));
        assert!(map.is_code(src.find("r =").unwrap()));
    }

    #[test]
    fn test_rust_char_literals_and_lifetimes() {
        assert_eq!(classes("'\"' x", Language::Rust), "osqcc");
        assert_eq!(classes("'\\'' x", Language::Rust), "ossqcc");
        let src = "fn f<'a>(s: &'a str) { let q = '\"'; }\nlet v = 1;";
        let map = LexMap::scan(src, Language::Rust);
        assert!(map.is_code(src.find("'a>").unwrap()));
        assert!(map.is_code(src.find("let v").unwrap()));
    }

    #[test]
    fn test_block_comment_spans_lines() {
        let src = "/* a\n\"*\"\n*/ x";
        let map = LexMap::scan(src, Language::CLike);
        assert_eq!(map.class_at(src.find("\"*").unwrap()), LexClass::Comment);
        assert!(map.is_code(src.len() - 1));
    }

    #[test]
    fn test_yaml_hash_inside_value() {
        let map = LexMap::scan("color: a#b # note", Language::Yaml);
        assert!(map.is_code(8));
        assert_eq!(map.class_at(11), LexClass::Comment);
    }

    #[test]
    fn test_language_from_path() {
        assert_eq!(Language::from_path(Path::new("a/b.tsx")), Language::JavaScript);
        assert_eq!(Language::from_path(Path::new("settings.YML")), Language::Yaml);
        assert_eq!(Language::from_path(Path::new("Makefile")), Language::Other);
    }

    #[test]
    fn test_name_before() {
        let src = "glob.glob (";
        assert_eq!(name_before(src, 10).as_deref(), Some("glob.glob"));
        let src = "let v = vec![";
        assert_eq!(name_before(src, 12).as_deref(), Some("vec!"));
        let src = "x = (";
        assert_eq!(name_before(src, 4), None);
        let src = "  glob::Pattern::new(";
        assert_eq!(name_span_before(src, 20), Some(2..20));
        assert!(is_keyword("if"));
    }
}
