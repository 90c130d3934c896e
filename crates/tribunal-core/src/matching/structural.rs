//! Structural matchers: assignments and calls found by a lexical scan.

use regex::Regex;
use std::ops::Range;

use crate::pattern::{callee_matches, normalize_key, StructuralMatcher};
use crate::utils::lexical::{is_keyword, name_span_before, LexClass, LexMap};

/// Upper bound on the argument text inspected for a call.
const MAX_ARGUMENT_BYTES: usize = 4096;

/// Finds structural matches in `text`.
#[must_use]
pub fn find(matcher: &StructuralMatcher, text: &str, lex: &LexMap) -> Vec<Range<usize>> {
    match matcher {
        StructuralMatcher::Assignment { keys, value } => {
            find_assignments(text, lex, keys, value.as_ref())
        }
        StructuralMatcher::Call { callees, argument } => {
            find_calls(text, lex, callees, argument.as_ref())
        }
    }
}

/// Returns the assignment operator length at `i`, if `i` starts one.
///
/// Comparison operators, `=>`, `::` and `:` inside `::` do not count.
pub(crate) fn assignment_op_at(bytes: &[u8], i: usize) -> Option<usize> {
    let prev = i.checked_sub(1).map(|p| bytes[p]);
    let next = bytes.get(i + 1).copied();
    match bytes[i] {
        b'=' => {
            if matches!(prev, Some(b'=' | b'!' | b'<' | b'>' | b':' | b'+' | b'-' | b'*' | b'/'))
                || matches!(next, Some(b'=' | b'>' | b'~'))
            {
                None
            } else {
                Some(1)
            }
        }
        b':' => {
            if prev == Some(b':') || next == Some(b':') {
                None
            } else if next == Some(b'=') {
                Some(2)
            } else {
                Some(1)
            }
        }
        _ => None,
    }
}

/// Reads the key ending before the operator at `op`: an identifier path or a
/// quoted string.
pub(crate) fn key_before(text: &str, lex: &LexMap, op: usize) -> Option<(Range<usize>, String)> {
    let bytes = text.as_bytes();
    let mut j = op;
    while j > 0 && matches!(bytes[j - 1], b' ' | b'\t') {
        j -= 1;
    }
    if j > 0 && lex.class_at(j - 1) == LexClass::Close {
        let mut close = j - 1;
        while close > 0 && lex.class_at(close - 1) == LexClass::Close {
            close -= 1;
        }
        let mut k = close;
        while k > 0 && lex.class_at(k - 1) == LexClass::Str {
            k -= 1;
        }
        if k == 0 || lex.class_at(k - 1) != LexClass::Open {
            return None;
        }
        let key = text.get(k..close)?.to_string();
        let mut open = k - 1;
        while open > 0 && lex.class_at(open - 1) == LexClass::Open {
            open -= 1;
        }
        return Some((open..j, key));
    }
    let span = name_span_before(text, j)?;
    let key = text[span.clone()].trim_end_matches('!').to_string();
    Some((span, key))
}

fn value_end(text: &str, lex: &LexMap, start: usize) -> usize {
    let bytes = text.as_bytes();
    let mut end = start;
    while end < bytes.len() && bytes[end] != b'\n' && lex.class_at(end) != LexClass::Comment {
        end += 1;
    }
    while end > start && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    end
}

fn find_assignments(
    text: &str,
    lex: &LexMap,
    keys: &[String],
    value: Option<&Regex>,
) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if !lex.is_code(i) {
            i += 1;
            continue;
        }
        let Some(op_len) = assignment_op_at(bytes, i) else {
            i += 1;
            continue;
        };
        let op = i;
        i += op_len;

        let Some((_, key)) = key_before(text, lex, op) else {
            continue;
        };
        let normalized = normalize_key(&key);
        if !keys.iter().any(|k| normalized.contains(k.as_str())) {
            continue;
        }

        let mut start = op + op_len;
        while start < bytes.len() && matches!(bytes[start], b' ' | b'\t') {
            start += 1;
        }
        let end = value_end(text, lex, start);
        if end <= start {
            continue;
        }

        match value {
            Some(re) => {
                if let Some(m) = re.find(&text[start..end]) {
                    if !m.is_empty() {
                        spans.push(start + m.start()..start + m.end());
                    }
                }
            }
            None => spans.push(start..end),
        }
    }

    spans
}

fn closing_paren(text: &str, lex: &LexMap, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let limit = (open + MAX_ARGUMENT_BYTES).min(bytes.len());
    let mut depth = 0usize;
    for i in open..limit {
        if !lex.is_code(i) {
            continue;
        }
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn find_calls(
    text: &str,
    lex: &LexMap,
    callees: &[String],
    argument: Option<&Regex>,
) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();

    for open in (0..bytes.len()).filter(|&i| bytes[i] == b'(' && lex.is_code(i)) {
        let Some(name) = name_span_before(text, open) else {
            continue;
        };
        let callee = &text[name.clone()];
        if is_keyword(callee) || !callees.iter().any(|c| callee_matches(callee, c)) {
            continue;
        }
        // `def eval(` and `fn eval(` are definitions, not calls.
        let line_start = text[..name.start].rfind('\n').map_or(0, |p| p + 1);
        let prefix = text[line_start..name.start].trim_end();
        if prefix.ends_with("def") || prefix.ends_with("fn") || prefix.ends_with("function") {
            continue;
        }

        let close = closing_paren(text, lex, open);
        let args_end = close.unwrap_or_else(|| value_end(text, lex, open + 1));
        if let Some(re) = argument {
            if !re.is_match(&text[open + 1..args_end]) {
                continue;
            }
        }
        let end = close.map_or(args_end, |c| c + 1);
        spans.push(name.start..end);
    }

    spans
}
