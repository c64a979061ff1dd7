//! Heuristic format detection.
//!
//! [`detect_file_type`] classifies raw text as JSON, CSV, XML or YAML
//! without invoking any parser. It is total over all inputs (including
//! binary garbage decoded lossily) and defaults to JSON when nothing else
//! matches.
//!
//! Rules, first match wins:
//!
//! 1. empty or whitespace-only → JSON
//! 2. first non-space char is `{` or `[` → JSON
//! 3. starts with `<?xml` or `<` → XML
//! 4. first line is `---`, or one of the first two non-empty lines looks
//!    like `key:` or `- item` → YAML
//! 5. first line has ≥ 2 commas and at least half of the next (up to 4)
//!    lines have a comma count within ±1 of it → CSV
//! 6. otherwise → JSON

use regex::Regex;
use std::sync::LazyLock;

use crate::models::FileType;

static YAML_DOC_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^---\s*$").expect("static regex"));
static YAML_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*[A-Za-z0-9_."'\-]+\s*:(\s|$)"#).expect("static regex"));
static YAML_LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*-\s+\S").expect("static regex"));

/// Number of lines after the first CSV line that are compared against it.
const CSV_LOOKAHEAD: usize = 4;

pub fn detect_file_type(content: &str) -> FileType {
    let trimmed = content.trim_start();
    if trimmed.trim_end().is_empty() {
        return FileType::Json;
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return FileType::Json;
    }

    if trimmed.starts_with("<?xml") || trimmed.starts_with('<') {
        return FileType::Xml;
    }

    let first_line = trimmed.lines().next().unwrap_or("");
    if YAML_DOC_START.is_match(first_line) {
        return FileType::Yaml;
    }

    let non_empty: Vec<&str> = trimmed.lines().filter(|l| !l.trim().is_empty()).collect();

    if non_empty
        .iter()
        .take(2)
        .any(|l| YAML_KEY.is_match(l) || YAML_LIST_ITEM.is_match(l))
    {
        return FileType::Yaml;
    }

    if looks_like_csv(&non_empty) {
        return FileType::Csv;
    }

    FileType::Json
}

fn looks_like_csv(lines: &[&str]) -> bool {
    let Some(first) = lines.first() else {
        return false;
    };
    let header_commas = count_commas(first);
    if header_commas < 2 {
        return false;
    }

    let next: Vec<&str> = lines.iter().skip(1).take(CSV_LOOKAHEAD).copied().collect();
    let consistent = next
        .iter()
        .filter(|l| count_commas(l).abs_diff(header_commas) <= 1)
        .count();

    consistent * 2 >= next.len()
}

fn count_commas(line: &str) -> usize {
    line.chars().filter(|c| *c == ',').count()
}
