//! Pattern-matching layer: deterministic candidate detection.
//!
//! Matching is a pure function of (pattern, file content). Overlapping
//! matches from different patterns are all kept; deduplication happens at
//! decision time.

pub mod structural;

use std::cell::OnceCell;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::audit::{AuditBatch, AuditKind, AuditPayload, AuditRecord, AuditSubject};
use crate::exclusion::{ExclusionResolver, SourceFile};
use crate::pattern::{Matcher, PatternDefinition, PatternStore};
use crate::source::LineIndex;
use crate::types::{Candidate, LayerKind, LayerVerdict, Location, Rationale, Vote};
use crate::utils::lexical::{Language, LexMap};

/// A candidate with its originating pattern verdict.
#[derive(Debug, Clone)]
pub struct PatternHit {
    /// The candidate.
    pub candidate: Candidate,
    /// Its pattern-layer verdict.
    pub verdict: LayerVerdict,
    /// The originating pattern.
    pub pattern: Arc<PatternDefinition>,
}

/// Finds byte spans of a matcher in `text`.
///
/// The lexical map in `lex` is only computed when a structural matcher
/// needs it.
#[must_use]
pub fn find_spans(
    matcher: &Matcher,
    text: &str,
    language: Language,
    lex: &OnceCell<LexMap>,
) -> Vec<Range<usize>> {
    match matcher {
        Matcher::Literal {
            text: needle,
            case_sensitive,
        } => {
            if *case_sensitive {
                text.match_indices(needle.as_str())
                    .map(|(i, m)| i..i + m.len())
                    .collect()
            } else {
                let haystack = text.to_ascii_lowercase();
                let needle = needle.to_ascii_lowercase();
                haystack
                    .match_indices(needle.as_str())
                    .map(|(i, m)| i..i + m.len())
                    .collect()
            }
        }
        Matcher::Regex { regex, capture } => match capture {
            None => regex
                .find_iter(text)
                .filter(|m| !m.is_empty())
                .map(|m| m.range())
                .collect(),
            Some(group) => regex
                .captures_iter(text)
                .filter_map(|c| c.get(*group))
                .filter(|m| !m.is_empty())
                .map(|m| m.range())
                .collect(),
        },
        Matcher::Structural(s) => {
            structural::find(s, text, lex.get_or_init(|| LexMap::scan(text, language)))
        }
    }
}

/// The pattern-matching layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternLayer;

impl PatternLayer {
    /// Evaluates every active pattern against one included file.
    ///
    /// Records one audit entry per (file, pattern): matched, checked without
    /// a match, or skipped.
    #[must_use]
    pub fn match_file(
        &self,
        file: &SourceFile,
        store: &PatternStore,
        resolver: &ExclusionResolver,
        audit: &mut AuditBatch<'_>,
    ) -> Vec<PatternHit> {
        let text: &str = &file.text;
        let index = LineIndex::new(text);
        let language = Language::from_path(&file.path);
        let lex = OnceCell::new();

        let mut hits = Vec::new();
        for pattern in store.iter() {
            let started = Instant::now();
            let subject = AuditSubject::file_pattern(&file.path, &pattern.id);

            if !pattern.applies_to(&file.path) {
                audit.push(
                    AuditRecord::new(
                        AuditKind::PatternSkipped,
                        "pattern does not apply to this file type",
                        subject,
                    )
                    .elapsed_since(started),
                );
                continue;
            }
            if let Some(exclusion) = resolver.pattern_excluded(&file.path, pattern) {
                audit.push(
                    AuditRecord::new(AuditKind::PatternSkipped, exclusion.reason.clone(), subject)
                        .elapsed_since(started)
                        .with_payload(AuditPayload::Exclusion {
                            source: exclusion.source,
                            reason: exclusion.reason,
                        }),
                );
                continue;
            }

            let spans = find_spans(&pattern.matcher, text, language, &lex);
            let found = self.hits(file, &index, pattern, spans);
            if found.is_empty() {
                audit.push(
                    AuditRecord::new(AuditKind::PatternChecked, "no match", subject)
                        .elapsed_since(started),
                );
                continue;
            }

            debug!(
                file = %file.path.display(),
                pattern = %pattern.id,
                count = found.len(),
                "Pattern matched"
            );
            audit.push(
                AuditRecord::new(
                    AuditKind::PatternMatched,
                    format!("{} candidate(s)", found.len()),
                    subject,
                )
                .elapsed_since(started)
                .with_payload(AuditPayload::Matches {
                    candidates: found.iter().map(|h| h.candidate.id.clone()).collect(),
                }),
            );
            hits.extend(found);
        }

        hits
    }

    fn hits(
        &self,
        file: &SourceFile,
        index: &LineIndex,
        pattern: &Arc<PatternDefinition>,
        mut spans: Vec<Range<usize>>,
    ) -> Vec<PatternHit> {
        let text: &str = &file.text;
        let kind = pattern.matcher.kind();
        spans.sort_by_key(|r| (r.start, r.end));
        spans.dedup();

        spans
            .into_iter()
            .map(|span| {
                let (line, column) = index.line_col(span.start);
                let (end_line, end_column) = index.line_col(span.end);
                let location = Location::new(file.path.clone(), line, column)
                    .with_end(end_line, end_column)
                    .with_span(span.start, span.len());
                let matched = &text[span];
                let candidate = Candidate::new(pattern.id.clone(), location, matched);
                let verdict = LayerVerdict::new(
                    candidate.id.clone(),
                    LayerKind::Pattern,
                    Vote::cast(pattern.prior_score(), kind.confidence()),
                    Rationale::new(
                        format!("{kind}-match"),
                        format!("pattern `{}` matched `{}`", pattern.id, preview(matched)),
                    )
                    .with_signal("matcher", kind.to_string())
                    .with_signal("precision", format!("{:.3}", pattern.precision)),
                );
                PatternHit {
                    candidate,
                    verdict,
                    pattern: Arc::clone(pattern),
                }
            })
            .collect()
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 60;
    let line = text.lines().next().unwrap_or_default();
    if line.len() <= MAX && line.len() == text.len() {
        return line.to_string();
    }
    let mut end = MAX.min(line.len());
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditTrail;
    use crate::config::ExclusionConfig;
    use crate::exclusion::FileResolution;
    use crate::pattern::{load_patterns_from_toml, GlobPattern, PatternId};
    use crate::source::FileInput;
    use crate::types::Severity;

    fn store() -> PatternStore {
        let load = load_patterns_from_toml(
            r#"
[[pattern]]
id = "wildcard-cors"
kind = "regex"
regex = '''["']\*[^"'\s]*["']'''
severity = "error"
category = "security"

[[pattern]]
id = "star-literal"
kind = "literal"
text = "*"
extensions = ["py"]

[[pattern]]
id = "eval-call"
kind = "call"
callees = ["eval"]
exclude_paths = ["scripts/**"]
"#,
        )
        .unwrap();
        let mut store = PatternStore::new();
        store.extend(load);
        store
    }

    fn source(path: &str, text: &str) -> SourceFile {
        let resolver = ExclusionResolver::new(&ExclusionConfig::default(), None).unwrap();
        match resolver.resolve(FileInput::text(path, text)) {
            FileResolution::Included(f) => f,
            FileResolution::Excluded(e) => panic!("unexpected exclusion: {e:?}"),
        }
    }

    fn run(file: &SourceFile) -> (Vec<PatternHit>, crate::audit::AuditExport) {
        let resolver = ExclusionResolver::new(&ExclusionConfig::default(), None).unwrap();
        let trail = AuditTrail::new("scan");
        let hits = {
            let mut batch = trail.batch();
            PatternLayer.match_file(file, &store(), &resolver, &mut batch)
        };
        (hits, trail.export())
    }

    #[test]
    fn overlapping_matches_from_different_patterns_are_kept() {
        let file = source("app/settings.py", "origins = [\"*\"]\n");
        let (hits, _) = run(&file);
        let ids: Vec<&str> = hits.iter().map(|h| h.candidate.pattern.as_str()).collect();
        assert_eq!(ids, vec!["star-literal", "wildcard-cors"]);
        assert!(hits[0].candidate.location.overlaps(&hits[1].candidate.location));

        let cors = &hits[1];
        assert_eq!(cors.candidate.matched_text, "\"*\"");
        assert_eq!(cors.candidate.location.line, 1);
        assert_eq!(cors.candidate.location.column, 12);
        assert_eq!(cors.candidate.location.end_column, 15);
        assert_eq!(cors.verdict.vote.scored(), Some((1.0 - 0.85, 0.7)));
        assert_eq!(cors.verdict.layer, LayerKind::Pattern);
    }

    #[test]
    fn one_audit_entry_per_file_and_pattern() {
        let file = source("scripts/run.js", "eval(code); x = '*.js';\n");
        let (hits, export) = run(&file);
        assert_eq!(hits.len(), 1);
        assert_eq!(export.entries.len(), 3);
        assert_eq!(export.by_kind(AuditKind::PatternSkipped).len(), 2);
        assert_eq!(export.by_kind(AuditKind::PatternMatched).len(), 1);
    }

    #[test]
    fn matching_is_deterministic() {
        let file = source("a.py", "x = eval('*')\ny = \"*\"\n");
        let (a, _) = run(&file);
        let (b, _) = run(&file);
        let ids_a: Vec<_> = a.iter().map(|h| h.candidate.id.clone()).collect();
        let ids_b: Vec<_> = b.iter().map(|h| h.candidate.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(ids_a.len(), 5);
    }

    #[test]
    fn case_insensitive_literal() {
        let matcher = Matcher::Literal {
            text: "todo".to_string(),
            case_sensitive: false,
        };
        let spans = find_spans(
            &matcher,
            "// TODO and todo",
            Language::Other,
            &OnceCell::new(),
        );
        assert_eq!(spans, vec![3..7, 12..16]);
    }

    #[test]
    fn structural_pattern_uses_high_confidence() {
        let def = PatternDefinition::new(
            PatternId::new("eval-call").unwrap(),
            Severity::Error,
            "security",
            Matcher::Structural(
                crate::pattern::StructuralMatcher::call(&["eval"], None).unwrap(),
            ),
        )
        .with_exclude_paths(vec![GlobPattern::new("vendor/**").unwrap()]);
        let store = PatternStore::from_definitions([def]);
        let resolver = ExclusionResolver::new(&ExclusionConfig::default(), None).unwrap();
        let trail = AuditTrail::new("scan");
        let mut batch = trail.batch();
        let hits = PatternLayer.match_file(
            &source("a.js", "eval(x)\n"),
            &store,
            &resolver,
            &mut batch,
        );
        assert_eq!(hits[0].verdict.vote.scored(), Some((1.0 - 0.85, 0.85)));
    }
}
