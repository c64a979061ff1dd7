//! Position normalization.
//!
//! The model reasons over the sampled view but its findings must point into
//! the original file. [`Normalizer`] turns whatever position a finding
//! carries into a verified 1-based line/column of the original content,
//! scored by how well the finding's quoted text matches there.
//!
//! # Priority
//!
//! 1. `line` (with or without `column`): range check, then snippet
//!    verification on the reported line and up to 3 lines either side
//! 2. `position` only: mapped through the [`TruncationMap`], converted to a
//!    line/column, then verified the same way
//! 3. nothing: `line`/`column` null, confidence 0
//!
//! # Snippet scoring
//!
//! | match | confidence |
//! |-------|------------|
//! | case-insensitive substring on the reported line | 1.0 |
//! | substring `d` lines away (d ≤ 3) | `max(0.5, 1 − 0.2·d)` |
//! | ≥ 60% of the snippet's words longer than 3 chars, `d` lines away | `max(0.4, ratio·(1 − 0.15·d))` |
//! | no match | 0.6, approximate |
//! | no snippet, line + column | 0.8 |
//! | no snippet, line only | 0.7 |
//!
//! A line past the end of the file yields null/null at 0.2; a position in an
//! omitted region yields null/null at 0.1. The final confidence is the
//! position confidence times the model's own confidence, when it gave one.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::{Finding, NormalizedFinding, TruncationMap};
use crate::sampler::{map_to_original, MappedOffset, SampledContent};
use crate::text::LineIndex;

static QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"`([^`\n]+)`|"([^"\n]+)"|(?:^|[^\w'])'([^'\n]+)'"#).expect("static regex")
});

const SEARCH_RADIUS: usize = 3;
const WORD_OVERLAP_MIN: f64 = 0.6;

/// Text to look for in the original content: an explicit `snippet`, else the
/// first backticked or quoted substring of the explanation.
pub fn extract_snippet(finding: &Finding) -> Option<String> {
    if let Some(s) = finding.snippet.as_deref().map(str::trim) {
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    QUOTED.captures(&finding.explanation).and_then(|c| {
        (1..=3)
            .find_map(|i| c.get(i))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

fn significant_words(text: &str) -> Vec<String> {
    let mut words: Vec<String> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() > 3)
        .map(|w| w.to_lowercase())
        .collect();
    words.sort();
    words.dedup();
    words
}

#[derive(Debug, Clone, PartialEq)]
struct SnippetMatch {
    line: usize,
    column: Option<usize>,
    confidence: f64,
    by_words: bool,
}

/// Lines at distance `d` from `line`, nearest-above first.
fn lines_at(index: &LineIndex<'_>, line: usize, d: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(2);
    if d == 0 {
        out.push(line);
        return out;
    }
    if line > d {
        out.push(line - d);
    }
    if line + d <= index.line_count() {
        out.push(line + d);
    }
    out
}

fn locate_snippet(
    index: &LineIndex<'_>,
    line: usize,
    column: Option<usize>,
    snippet: &str,
) -> Option<SnippetMatch> {
    let needle = fold(snippet.lines().map(str::trim).find(|l| !l.is_empty())?);

    for d in 0..=SEARCH_RADIUS {
        for candidate in lines_at(index, line, d) {
            let Some(text) = index.line(candidate) else {
                continue;
            };
            let folded = fold(text);
            let Some(found) = find_folded(&folded, &needle) else {
                continue;
            };
            let first_col = found + 1;
            let col = match column {
                Some(c) if candidate == line && points_at(&folded, c, &needle) => c,
                _ => first_col,
            };
            let confidence = if d == 0 {
                1.0
            } else {
                (1.0 - 0.2 * d as f64).max(0.5)
            };
            return Some(SnippetMatch {
                line: candidate,
                column: Some(col),
                confidence,
                by_words: false,
            });
        }
    }

    let words = significant_words(snippet);
    if words.is_empty() {
        return None;
    }
    let mut best: Option<SnippetMatch> = None;
    for d in 0..=SEARCH_RADIUS {
        for candidate in lines_at(index, line, d) {
            let Some(text) = index.line(candidate) else {
                continue;
            };
            let lower = text.to_lowercase();
            let hits = words.iter().filter(|w| lower.contains(w.as_str())).count();
            let ratio = hits as f64 / words.len() as f64;
            if ratio < WORD_OVERLAP_MIN {
                continue;
            }
            let confidence = (ratio * (1.0 - 0.15 * d as f64)).max(0.4);
            if best.as_ref().map_or(true, |b| confidence > b.confidence) {
                best = Some(SnippetMatch {
                    line: candidate,
                    column: None,
                    confidence,
                    by_words: true,
                });
            }
        }
    }
    best
}

/// Case-folds one char to one char, so indexes stay aligned with the
/// original text. Chars whose lowercase form expands (`İ`) keep only the
/// first char of it.
fn fold(text: &str) -> Vec<char> {
    text.chars()
        .map(|c| c.to_lowercase().next().unwrap_or(c))
        .collect()
}

/// Char index of the first occurrence of `needle` in `haystack`.
fn find_folded(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// True when the 1-based `column` of `folded` starts an occurrence of `needle`.
fn points_at(folded: &[char], column: usize, needle: &[char]) -> bool {
    column >= 1 && folded.get(column - 1..).is_some_and(|rest| rest.starts_with(needle))
}

/// Where a finding ends up, before the model's confidence is applied.
#[derive(Debug, Clone, PartialEq)]
struct Placement {
    line: Option<usize>,
    column: Option<usize>,
    confidence: f64,
    approximate: bool,
    note: Option<String>,
    /// A snippet was found at the placed line.
    verified: bool,
}

impl Placement {
    fn unplaced(confidence: f64, note: impl Into<String>) -> Self {
        Self {
            line: None,
            column: None,
            confidence,
            approximate: true,
            note: Some(note.into()),
            verified: false,
        }
    }
}

/// Maps findings onto the original content.
pub struct Normalizer<'a> {
    original: LineIndex<'a>,
    /// Present only when the model saw a truncated view.
    sampled: Option<(&'a TruncationMap, LineIndex<'a>)>,
}

impl<'a> Normalizer<'a> {
    pub fn new(content: &'a str, sampled: Option<&'a SampledContent>) -> Self {
        Self {
            original: LineIndex::new(content),
            sampled: sampled
                .filter(|s| s.map.was_truncated)
                .map(|s| (&s.map, LineIndex::new(&s.content))),
        }
    }

    pub fn normalize_all(&self, findings: &[Finding]) -> Vec<NormalizedFinding> {
        findings.iter().map(|f| self.normalize(f)).collect()
    }

    pub fn normalize(&self, finding: &Finding) -> NormalizedFinding {
        let snippet = extract_snippet(finding);
        let placement = match (finding.line, finding.position) {
            (Some(line), _) => self.place_line(line, finding.column, snippet.as_deref()),
            (None, Some(pos)) => self.place_position(pos, snippet.as_deref()),
            (None, None) => Placement::unplaced(0.0, "no position reported"),
        };

        let model_confidence = finding.confidence.unwrap_or(1.0).clamp(0.0, 1.0);
        let position = placement
            .line
            .and_then(|l| self.original.line_col_to_offset(l, placement.column));

        NormalizedFinding {
            line: placement.line,
            column: placement.column,
            position,
            message: finding.message.clone(),
            finding_type: finding.finding_type,
            category: finding.category.clone(),
            severity: finding.severity,
            confidence: (placement.confidence * model_confidence).clamp(0.0, 1.0),
            explanation: finding.explanation.clone(),
            suggestions: finding.suggestions.clone(),
            is_approximate: placement.approximate,
            position_note: placement.note,
        }
    }

    fn out_of_range(&self, line: usize) -> Placement {
        Placement::unplaced(
            0.2,
            format!(
                "reported line {} is beyond the end of the file ({} lines)",
                line,
                self.original.line_count()
            ),
        )
    }

    /// Column raised to 1 and clamped to one past the end of the line.
    fn clamp_column(&self, line: usize, column: Option<usize>) -> (usize, bool) {
        let len = self.original.line_len(line).unwrap_or(0);
        let col = column.unwrap_or(1).max(1);
        if col > len + 1 {
            (len + 1, true)
        } else {
            (col, false)
        }
    }

    fn place_line(&self, line: usize, column: Option<usize>, snippet: Option<&str>) -> Placement {
        if line == 0 || line > self.original.line_count() {
            return self.out_of_range(line);
        }
        let no_snippet = if column.is_some() { 0.8 } else { 0.7 };
        let placement = self.verify_at(line, column, snippet, no_snippet);
        if placement.verified || snippet.is_none() {
            return placement;
        }
        match self.reinterpret_sampled_line(line, column, snippet) {
            Some(alt) if alt.confidence > placement.confidence => alt,
            _ => placement,
        }
    }

    fn place_position(&self, pos: usize, snippet: Option<&str>) -> Placement {
        let mapped = match &self.sampled {
            Some((map, _)) => map_to_original(map, pos),
            None => MappedOffset::Exact(pos),
        };
        let (offset, exact) = match mapped {
            MappedOffset::Exact(o) => (o, true),
            MappedOffset::Approximate(o) => (o, false),
            MappedOffset::Omitted => {
                return Placement::unplaced(
                    0.1,
                    format!("position {} falls in a region omitted from the sampled content", pos),
                )
            }
        };
        let Some((line, col)) = self.original.offset_to_line_col(offset) else {
            return Placement::unplaced(
                0.2,
                format!(
                    "position {} is beyond the end of the file ({} chars)",
                    offset,
                    self.original.char_len()
                ),
            );
        };

        let mut placement = self.verify_at(line, Some(col), snippet, if exact { 0.8 } else { 0.5 });
        if !exact && !placement.verified {
            placement.confidence = placement.confidence.min(0.5);
            placement.approximate = true;
            placement.note = Some(format!(
                "position {} points into error-context markers; using the window start",
                pos
            ));
        }
        placement
    }

    /// Snippet verification around an in-range line of the original content.
    fn verify_at(
        &self,
        line: usize,
        column: Option<usize>,
        snippet: Option<&str>,
        no_snippet_confidence: f64,
    ) -> Placement {
        let (col, clamped) = self.clamp_column(line, column);
        let clamp_note = || {
            format!(
                "column {} is past the end of line {}; clamped to {}",
                column.unwrap_or(col),
                line,
                col
            )
        };

        let Some(snippet) = snippet else {
            return Placement {
                line: Some(line),
                column: Some(col),
                confidence: no_snippet_confidence,
                approximate: clamped,
                note: clamped.then(clamp_note),
                verified: false,
            };
        };

        match locate_snippet(&self.original, line, column, snippet) {
            Some(m) => {
                let column = match m.column {
                    Some(c) => c,
                    None => self.clamp_column(m.line, column).0,
                };
                let note = if m.by_words {
                    Some(format!("matched line {} by word overlap with the quoted text", m.line))
                } else if m.line != line {
                    Some(format!("line adjusted from {} to {} where the quoted text occurs", line, m.line))
                } else {
                    None
                };
                Placement {
                    line: Some(m.line),
                    column: Some(column),
                    confidence: m.confidence,
                    approximate: m.by_words,
                    note,
                    verified: true,
                }
            }
            None => Placement {
                line: Some(line),
                column: Some(col),
                confidence: 0.6,
                approximate: true,
                note: Some(if clamped {
                    clamp_note()
                } else {
                    format!("quoted text not found near line {}", line)
                }),
                verified: false,
            },
        }
    }

    /// Reads `line` as a line of the sampled view and maps it back.
    fn reinterpret_sampled_line(
        &self,
        line: usize,
        column: Option<usize>,
        snippet: Option<&str>,
    ) -> Option<Placement> {
        let (map, sampled_index) = self.sampled.as_ref()?;
        let sampled_offset = sampled_index.line_col_to_offset(line, column)?;
        let original_offset = match map_to_original(map, sampled_offset) {
            MappedOffset::Exact(o) | MappedOffset::Approximate(o) => o,
            MappedOffset::Omitted => return None,
        };
        let (orig_line, orig_col) = self.original.offset_to_line_col(original_offset)?;
        let mut placement = self.verify_at(orig_line, column.map(|_| orig_col), snippet, 0.0);
        if !placement.verified {
            return None;
        }
        placement.note = Some(format!(
            "line {} of the sampled view corresponds to line {} of the file",
            line, orig_line
        ));
        Some(placement)
    }
}
