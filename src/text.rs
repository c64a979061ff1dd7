//! Line table and char-offset helpers.
//!
//! Every position in structlint (hint offsets, truncation-map ranges,
//! normalized columns) is counted in Unicode scalar values, never bytes.
//! Lines are split on `\n` and numbered from 1, as are columns.

/// A line table over borrowed content.
///
/// Built once per request and shared by the sampler (line → offset for hint
/// anchoring) and the position normalizer (offset → line/column, snippet
/// search).
#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    lines: Vec<&'a str>,
    /// Char offset at which each line starts.
    starts: Vec<usize>,
    char_len: usize,
}

impl<'a> LineIndex<'a> {
    pub fn new(content: &'a str) -> Self {
        let mut lines = Vec::new();
        let mut starts = Vec::new();
        let mut offset = 0usize;
        for line in content.split('\n') {
            starts.push(offset);
            lines.push(line);
            // +1 for the '\n' consumed by split
            offset += line.chars().count() + 1;
        }
        Self {
            lines,
            starts,
            char_len: offset.saturating_sub(1),
        }
    }

    /// Number of lines (`"a\nb\n"` has three).
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Total content length in chars.
    pub fn char_len(&self) -> usize {
        self.char_len
    }

    /// Text of a 1-based line, without its newline.
    pub fn line(&self, line: usize) -> Option<&'a str> {
        if line == 0 {
            return None;
        }
        self.lines.get(line - 1).copied()
    }

    /// Length of a 1-based line in chars.
    pub fn line_len(&self, line: usize) -> Option<usize> {
        self.line(line).map(|l| l.chars().count())
    }

    /// Converts a char offset into a 1-based `(line, column)`.
    ///
    /// An offset equal to the content length maps to the position just past
    /// the last char. Offsets beyond that return `None`.
    pub fn offset_to_line_col(&self, offset: usize) -> Option<(usize, usize)> {
        if offset > self.char_len {
            return None;
        }
        let idx = match self.starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        Some((idx + 1, offset - self.starts[idx] + 1))
    }

    /// Converts a 1-based line (and optional 1-based column) into a char offset.
    pub fn line_col_to_offset(&self, line: usize, column: Option<usize>) -> Option<usize> {
        if line == 0 || line > self.lines.len() {
            return None;
        }
        let start = self.starts[line - 1];
        let col = column.unwrap_or(1).max(1);
        let len = self.line_len(line).unwrap_or(0);
        Some(start + (col - 1).min(len))
    }
}

/// Byte index of the `char_idx`-th char, clamped to the end of `s`.
pub fn byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(b, _)| b)
        .unwrap_or(s.len())
}

/// Char offset of a byte index. Indices inside a multi-byte char round down.
pub fn char_offset(s: &str, byte_idx: usize) -> usize {
    let mut b = byte_idx.min(s.len());
    while !s.is_char_boundary(b) {
        b -= 1;
    }
    s[..b].chars().count()
}

/// Slices `s` by char offsets `[start, end)`.
pub fn slice_chars(s: &str, start: usize, end: usize) -> &str {
    let b_start = byte_index(s, start);
    let b_end = byte_index(s, end.max(start));
    &s[b_start..b_end]
}

/// Truncates to at most `max` chars, appending `…` when cut.
pub fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_table_basic() {
        let idx = LineIndex::new("ab\ncde\n");
        assert_eq!(idx.line_count(), 3);
        assert_eq!(idx.char_len(), 7);
        assert_eq!(idx.line(2), Some("cde"));
        assert_eq!(idx.line(3), Some(""));
        assert_eq!(idx.line(4), None);
        assert_eq!(idx.line(0), None);
    }

    #[test]
    fn test_offset_to_line_col() {
        let idx = LineIndex::new("ab\ncde");
        assert_eq!(idx.offset_to_line_col(0), Some((1, 1)));
        assert_eq!(idx.offset_to_line_col(2), Some((1, 3)));
        assert_eq!(idx.offset_to_line_col(3), Some((2, 1)));
        assert_eq!(idx.offset_to_line_col(6), Some((2, 4)));
        assert_eq!(idx.offset_to_line_col(7), None);
    }

    #[test]
    fn test_line_col_to_offset_clamps_column() {
        let idx = LineIndex::new("ab\ncde");
        assert_eq!(idx.line_col_to_offset(2, Some(2)), Some(4));
        assert_eq!(idx.line_col_to_offset(2, None), Some(3));
        assert_eq!(idx.line_col_to_offset(1, Some(99)), Some(2));
        assert_eq!(idx.line_col_to_offset(3, None), None);
    }

    #[test]
    fn test_multibyte_offsets_are_chars() {
        let idx = LineIndex::new("héllo\nwörld");
        assert_eq!(idx.char_len(), 11);
        assert_eq!(idx.offset_to_line_col(7), Some((2, 2)));
        assert_eq!(slice_chars("héllo", 1, 3), "él");
        assert_eq!(char_offset("héllo", 3), 2);
        assert_eq!(char_offset("héllo", 2), 1);
        assert_eq!(char_offset("héllo", 99), 5);
    }

    #[test]
    fn test_clip() {
        assert_eq!(clip("abc", 5), "abc");
        assert_eq!(clip("abcdef", 3), "abc…");
    }
}
