//! Content sampling for bounded prompts.
//!
//! Files at or under `max_chars` pass through untouched. Larger files are
//! reduced to:
//!
//! ```text
//! ┌────────────┐ ┌─────────┐ ┌──────────────────────────┐ ┌─────────┐ ┌────────────┐
//! │ head 6000  │→│ omitted │→│ <ERROR CONTEXT at pos P> │→│ omitted │→│ tail 4000  │
//! └────────────┘ └─────────┘ │  ±500 chars around hint  │ └─────────┘ └────────────┘
//!                            └──────────────────────────┘
//! ```
//!
//! Every kept and dropped range is recorded in a [`TruncationMap`] so that
//! offsets the model reports against the sampled view can be mapped back
//! with [`map_to_original`].

use crate::models::{ErrorWindow, OmittedRange, ParserHint, TruncationMap};
use crate::text::{clip, slice_chars, LineIndex};

const END_MARKER: &str = "\n<END>";

/// Sampling limits, in chars.
#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub max_chars: usize,
    pub head_chars: usize,
    pub tail_chars: usize,
    pub window_radius: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_chars: 12_000,
            head_chars: 6_000,
            tail_chars: 4_000,
            window_radius: 500,
        }
    }
}

/// The prompt body plus the record of how it was produced.
#[derive(Debug, Clone)]
pub struct SampledContent {
    pub content: String,
    pub map: TruncationMap,
    /// Human-readable note for the model; `None` when nothing was cut.
    pub note: Option<String>,
}

/// Where a sampled-view offset lands in the original content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedOffset {
    /// Head, tail or the body of an error window.
    Exact(usize),
    /// Marker text around an error window; best guess is the window start.
    Approximate(usize),
    /// Falls between kept regions.
    Omitted,
}

fn open_marker(anchor: usize) -> String {
    format!("<ERROR CONTEXT at position {}>\n", anchor)
}

fn omission(start: usize, end: usize) -> String {
    format!(
        "\n\n[... {} characters omitted ({}-{}) ...]\n\n",
        end - start,
        start,
        end
    )
}

/// Offset anchoring a hint: its position, or its line/column converted.
fn hint_anchor(idx: &LineIndex<'_>, hint: &ParserHint) -> Option<usize> {
    hint.position
        .or_else(|| hint.line.and_then(|l| idx.line_col_to_offset(l, hint.column)))
}

/// Samples `content` for the prompt, splicing in a window around every hint
/// that falls strictly between head and tail.
pub fn truncate_content(content: &str, hints: &[ParserHint], cfg: &SamplerConfig) -> SampledContent {
    let idx = LineIndex::new(content);
    let len = idx.char_len();

    if len <= cfg.max_chars {
        return SampledContent {
            content: content.to_string(),
            map: TruncationMap::passthrough(len),
            note: None,
        };
    }

    let head_end = cfg.head_chars.min(len);
    let tail_start = len.saturating_sub(cfg.tail_chars).max(head_end);

    // Candidate windows, deduplicated on (start, end), inside the gap only.
    let mut candidates: Vec<(usize, usize, usize, String)> = Vec::new();
    for hint in hints {
        let Some(anchor) = hint_anchor(&idx, hint) else {
            continue;
        };
        let anchor = anchor.min(len);
        let start = anchor.saturating_sub(cfg.window_radius);
        let end = (anchor + cfg.window_radius).min(len);
        if start < head_end || end > tail_start {
            continue;
        }
        if candidates.iter().any(|c| c.0 == start && c.1 == end) {
            continue;
        }
        candidates.push((start, end, anchor, clip(&hint.message, 120)));
    }
    candidates.sort_by_key(|c| c.0);

    // Overlapping windows are merged so no text appears twice.
    let mut merged: Vec<(usize, usize, usize, String)> = Vec::new();
    for c in candidates {
        match merged.last_mut() {
            Some(last) if c.0 <= last.1 => {
                last.1 = last.1.max(c.1);
                last.3 = format!("{}; {}", last.3, c.3);
            }
            _ => merged.push(c),
        }
    }

    let mut out = String::new();
    let mut out_len = 0usize;
    let mut push = |out: &mut String, s: &str| {
        out.push_str(s);
        out_len += s.chars().count();
        out_len
    };

    let mut omitted = Vec::new();
    let mut windows = Vec::new();

    push(&mut out, slice_chars(content, 0, head_end));
    let mut cursor = head_end;

    for (start, end, anchor, reason) in merged {
        if start > cursor {
            omitted.push(OmittedRange { start: cursor, end: start });
            push(&mut out, &omission(cursor, start));
        } else {
            push(&mut out, "\n");
        }
        let sampled_start = push(&mut out, &open_marker(anchor));
        push(&mut out, slice_chars(content, start, end));
        push(&mut out, END_MARKER);
        windows.push(ErrorWindow {
            start,
            end,
            reason,
            anchor,
            sampled_start,
        });
        cursor = end;
    }

    if tail_start > cursor {
        omitted.push(OmittedRange {
            start: cursor,
            end: tail_start,
        });
        push(&mut out, &omission(cursor, tail_start));
    } else if !windows.is_empty() {
        push(&mut out, "\n");
    }
    let tail_sampled_start = push(&mut out, "");
    let truncated_length = push(&mut out, slice_chars(content, tail_start, len));

    let map = TruncationMap {
        was_truncated: true,
        original_length: len,
        truncated_length,
        head_chars: head_end,
        tail_chars: len - tail_start,
        error_windows: windows,
        omitted_ranges: omitted,
        tail_sampled_start,
    };
    let note = Some(build_note(&map));

    log::debug!(
        "sampled {} chars down to {} ({} error window(s))",
        len,
        truncated_length,
        map.error_windows.len()
    );

    SampledContent {
        content: out,
        map,
        note,
    }
}

fn build_note(map: &TruncationMap) -> String {
    let mut included = vec![format!("characters 0-{} (start of file)", map.head_chars)];
    for w in &map.error_windows {
        included.push(format!(
            "characters {}-{} (context around a detected problem at position {})",
            w.start, w.end, w.anchor
        ));
    }
    included.push(format!(
        "characters {}-{} (end of file)",
        map.original_length - map.tail_chars,
        map.original_length
    ));
    let omitted: Vec<String> = map
        .omitted_ranges
        .iter()
        .map(|r| format!("{}-{}", r.start, r.end))
        .collect();

    format!(
        "NOTE: This file is {} characters long and was sampled down to {} characters.\n\
         Included: {}.\n\
         Omitted: {}.\n\
         Line numbers in this view are DISCONTINUOUS: text between the included regions is \
         missing, so do not count lines across an omission. Quote the exact offending text \
         in backticks in every explanation so each finding can be located in the original file.",
        map.original_length,
        map.truncated_length,
        included.join(", "),
        if omitted.is_empty() {
            "nothing".to_string()
        } else {
            omitted.join(", ")
        }
    )
}

/// Maps a char offset in the sampled view back to the original content.
pub fn map_to_original(map: &TruncationMap, offset: usize) -> MappedOffset {
    if !map.was_truncated || offset < map.head_chars {
        return MappedOffset::Exact(offset);
    }

    if offset >= map.tail_sampled_start {
        let tail_origin = map.original_length - map.tail_chars;
        let mapped = tail_origin + (offset - map.tail_sampled_start);
        return MappedOffset::Exact(mapped.min(map.original_length));
    }

    for w in &map.error_windows {
        let body_end = w.sampled_start + (w.end - w.start);
        if (w.sampled_start..body_end).contains(&offset) {
            return MappedOffset::Exact(w.start + (offset - w.sampled_start));
        }
        let marker_start = w.sampled_start - open_marker(w.anchor).chars().count();
        let marker_end = body_end + END_MARKER.chars().count();
        if (marker_start..marker_end).contains(&offset) {
            return MappedOffset::Approximate(w.start);
        }
    }

    MappedOffset::Omitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HintKind;

    fn numbered_lines(n: usize) -> String {
        (0..n).map(|i| format!("line-{:05}\n", i)).collect()
    }

    fn hint_at(pos: usize) -> ParserHint {
        let mut h = ParserHint::new(HintKind::SyntaxError, "broken here");
        h.position = Some(pos);
        h
    }

    #[test]
    fn test_small_content_passes_through() {
        let content = "x".repeat(12_000);
        let sampled = truncate_content(&content, &[], &SamplerConfig::default());
        assert!(!sampled.map.was_truncated);
        assert_eq!(sampled.content, content);
        assert!(sampled.note.is_none());
        assert_eq!(sampled.map.original_length, 12_000);
    }

    #[test]
    fn test_head_and_tail_kept_verbatim() {
        let content = numbered_lines(3_000); // 33_000 chars
        let sampled = truncate_content(&content, &[], &SamplerConfig::default());
        assert!(sampled.map.was_truncated);
        assert!(sampled.content.starts_with(slice_chars(&content, 0, 6_000)));
        assert!(sampled.content.ends_with(slice_chars(&content, 29_000, 33_000)));
        assert_eq!(sampled.map.omitted_ranges, vec![OmittedRange { start: 6_000, end: 29_000 }]);
        assert_eq!(sampled.map.truncated_length, sampled.content.chars().count());
        assert!(sampled.note.unwrap().contains("DISCONTINUOUS"));
    }

    #[test]
    fn test_error_window_spliced_between_head_and_tail() {
        let content = numbered_lines(3_000);
        let sampled = truncate_content(&content, &[hint_at(15_000)], &SamplerConfig::default());
        let map = &sampled.map;
        assert_eq!(map.error_windows.len(), 1);
        let w = &map.error_windows[0];
        assert_eq!((w.start, w.end), (14_500, 15_500));
        assert!(sampled.content.contains("<ERROR CONTEXT at position 15000>"));
        assert!(sampled.content.contains(slice_chars(&content, 14_500, 15_500)));
        assert_eq!(
            map.omitted_ranges,
            vec![
                OmittedRange { start: 6_000, end: 14_500 },
                OmittedRange { start: 15_500, end: 29_000 }
            ]
        );
    }

    #[test]
    fn test_windows_overlapping_head_or_tail_are_skipped() {
        let content = numbered_lines(3_000);
        let hints = vec![hint_at(6_200), hint_at(28_800)];
        let sampled = truncate_content(&content, &hints, &SamplerConfig::default());
        assert!(sampled.map.error_windows.is_empty());
        assert!(!sampled.content.contains("ERROR CONTEXT"));
    }

    #[test]
    fn test_duplicate_and_overlapping_windows() {
        let content = numbered_lines(3_000);
        let hints = vec![hint_at(15_000), hint_at(15_000), hint_at(15_300)];
        let sampled = truncate_content(&content, &hints, &SamplerConfig::default());
        assert_eq!(sampled.map.error_windows.len(), 1);
        let w = &sampled.map.error_windows[0];
        assert_eq!((w.start, w.end), (14_500, 15_800));
    }

    #[test]
    fn test_line_hint_anchors_window() {
        let content = numbered_lines(3_000);
        let mut h = ParserHint::new(HintKind::StructureError, "row mismatch");
        h.line = Some(1_501); // 1_500 lines of 11 chars
        let sampled = truncate_content(&content, &[h], &SamplerConfig::default());
        assert_eq!(sampled.map.error_windows[0].anchor, 16_500);
    }

    #[test]
    fn test_map_to_original_round_trip() {
        let content = numbered_lines(3_000);
        let sampled = truncate_content(&content, &[hint_at(15_000)], &SamplerConfig::default());
        let map = &sampled.map;
        let sampled_chars: Vec<char> = sampled.content.chars().collect();
        let original_chars: Vec<char> = content.chars().collect();

        for offset in [0, 5_999, map.error_windows[0].sampled_start + 37, map.tail_sampled_start + 11] {
            match map_to_original(map, offset) {
                MappedOffset::Exact(orig) => assert_eq!(sampled_chars[offset], original_chars[orig]),
                other => panic!("offset {} mapped to {:?}", offset, other),
            }
        }
    }

    #[test]
    fn test_map_to_original_marker_and_gap() {
        let content = numbered_lines(3_000);
        let sampled = truncate_content(&content, &[hint_at(15_000)], &SamplerConfig::default());
        let map = &sampled.map;
        let w = &map.error_windows[0];
        assert_eq!(map_to_original(map, w.sampled_start - 3), MappedOffset::Approximate(14_500));
        assert_eq!(map_to_original(map, 6_005), MappedOffset::Omitted);
    }

    #[test]
    fn test_map_identity_without_truncation() {
        let map = TruncationMap::passthrough(100);
        assert_eq!(map_to_original(&map, 42), MappedOffset::Exact(42));
    }
}
