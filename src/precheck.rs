//! Local, model-free syntax prechecks.
//!
//! Runs a format-specific parser against the **original, untruncated**
//! content and turns whatever it rejects into [`ParserHint`]s. These hints
//! are the only ground-truth positions the pipeline has without the model,
//! and they double as the fallback finding set when the model call fails.
//!
//! | Format | Parser |
//! |--------|--------|
//! | JSON | `serde_json` (location parsed from the error message) |
//! | YAML | `serde_yaml`, every document of a multi-document stream |
//! | CSV | strict RFC 4180 tokenizer + per-row column-count scan |
//! | XML | `quick-xml` event reader + element stack |
//!
//! At most [`MAX_HINTS`] hints are returned per file.

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

use crate::models::{FileType, HintKind, ParserHint};
use crate::text::{char_offset, LineIndex};

pub const MAX_HINTS: usize = 3;

static POSITION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bposition (\d+)").expect("static regex"));
static LINE_COLUMN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bline (\d+)[, ]+column (\d+)").expect("static regex"));
static LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bline (\d+)").expect("static regex"));
static COLUMN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcolumn (\d+)").expect("static regex"));

/// Location fragments recovered from a parser's error text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorLocation {
    pub position: Option<usize>,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

/// Pulls `position N`, `line N, column M`, `line N` and `column N` out of an
/// error message.
pub fn extract_location(message: &str) -> ErrorLocation {
    let num = |re: &Regex, group: usize| -> Option<usize> {
        re.captures(message)
            .and_then(|c| c.get(group))
            .and_then(|m| m.as_str().parse().ok())
    };

    let position = num(&POSITION_RE, 1);
    let (line, column) = match LINE_COLUMN_RE.captures(message) {
        Some(c) => (
            c.get(1).and_then(|m| m.as_str().parse().ok()),
            c.get(2).and_then(|m| m.as_str().parse().ok()),
        ),
        None => (num(&LINE_RE, 1), num(&COLUMN_RE, 1)),
    };

    ErrorLocation {
        position,
        line,
        column,
    }
}

/// Runs the precheck for `file_type` and returns at most [`MAX_HINTS`] hints.
pub fn run_precheck(content: &str, file_type: FileType) -> Vec<ParserHint> {
    let mut hints = match file_type {
        FileType::Json => check_json(content),
        FileType::Yaml => check_yaml(content),
        FileType::Csv => check_csv(content),
        FileType::Xml => check_xml(content),
    };
    hints.truncate(MAX_HINTS);
    log::debug!("precheck {}: {} hint(s)", file_type, hints.len());
    hints
}

// ============ JSON ============

fn check_json(content: &str) -> Vec<ParserHint> {
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(_) => Vec::new(),
        Err(e) => {
            let message = e.to_string();
            let loc = extract_location(&message);
            let idx = LineIndex::new(content);
            // serde_json reports byte columns
            let column = match (loc.line, loc.column) {
                (Some(line), Some(col)) => idx
                    .line(line)
                    .map(|text| char_offset(text, col.saturating_sub(1)) + 1),
                _ => loc.column,
            };
            let loc = ErrorLocation { column, ..loc };
            vec![hint_at(
                &idx,
                HintKind::SyntaxError,
                format!("Invalid JSON: {}", message),
                loc,
            )]
        }
    }
}

// ============ YAML ============

fn check_yaml(content: &str) -> Vec<ParserHint> {
    let idx = LineIndex::new(content);
    for document in serde_yaml::Deserializer::from_str(content) {
        if let Err(e) = serde_yaml::Value::deserialize(document) {
            let message = e.to_string();
            let mut loc = extract_location(&message);
            if loc.line.is_none() {
                if let Some(l) = e.location() {
                    loc.line = Some(l.line());
                    loc.column = Some(l.column());
                    loc.position = Some(char_offset(content, l.index()));
                }
            }
            return vec![hint_at(
                &idx,
                HintKind::SyntaxError,
                format!("Invalid YAML: {}", message),
                loc,
            )];
        }
    }
    Vec::new()
}

// ============ CSV ============

/// One parsed CSV record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CsvRecord {
    /// 1-based record number; the header is row 1.
    row: usize,
    line: usize,
    offset: usize,
    fields: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CsvSyntaxError {
    message: String,
    row: usize,
    line: usize,
    column: usize,
    offset: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CsvState {
    FieldStart,
    Unquoted,
    Quoted,
    QuoteInQuoted,
}

fn guess_delimiter(content: &str) -> char {
    let first = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut best = (',', first.matches(',').count());
    for d in [';', '\t', '|'] {
        let n = first.matches(d).count();
        if n > best.1 {
            best = (d, n);
        }
    }
    best.0
}

/// Strict tokenizer: a quote inside an unquoted field, anything but a
/// delimiter or newline after a closing quote, and an unterminated quoted
/// field are all syntax errors. Blank lines are skipped.
fn tokenize_csv(content: &str, delim: char) -> Result<Vec<CsvRecord>, CsvSyntaxError> {
    let chars: Vec<char> = content.chars().collect();
    let mut records = Vec::new();
    let mut state = CsvState::FieldStart;
    let mut fields = 0usize;
    let mut has_content = false;
    let (mut line, mut col) = (1usize, 1usize);
    let (mut rec_line, mut rec_offset) = (1usize, 0usize);
    let mut quote_open = (1usize, 1usize, 0usize);

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next_is_lf = chars.get(i + 1) == Some(&'\n');
        let mut end_record = false;

        let fail = |message: &str, records: &Vec<CsvRecord>| CsvSyntaxError {
            message: message.to_string(),
            row: records.len() + 1,
            line,
            column: col,
            offset: i,
        };

        match state {
            CsvState::FieldStart => {
                if c == '"' {
                    state = CsvState::Quoted;
                    has_content = true;
                    quote_open = (line, col, i);
                } else if c == delim {
                    fields += 1;
                    has_content = true;
                } else if c == '\n' {
                    end_record = true;
                } else if !(c == '\r' && next_is_lf) {
                    state = CsvState::Unquoted;
                    has_content = true;
                }
            }
            CsvState::Unquoted => {
                if c == '"' {
                    return Err(fail("Invalid quote in unquoted field", &records));
                } else if c == delim {
                    fields += 1;
                    state = CsvState::FieldStart;
                } else if c == '\n' {
                    end_record = true;
                }
            }
            CsvState::Quoted => {
                if c == '"' {
                    state = CsvState::QuoteInQuoted;
                }
            }
            CsvState::QuoteInQuoted => {
                if c == '"' {
                    state = CsvState::Quoted;
                } else if c == delim {
                    fields += 1;
                    state = CsvState::FieldStart;
                } else if c == '\n' {
                    end_record = true;
                } else if !(c == '\r' && next_is_lf) {
                    return Err(fail("Unexpected character after closing quote", &records));
                }
            }
        }

        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
        i += 1;

        if end_record {
            if has_content {
                records.push(CsvRecord {
                    row: records.len() + 1,
                    line: rec_line,
                    offset: rec_offset,
                    fields: fields + 1,
                });
            }
            fields = 0;
            has_content = false;
            state = CsvState::FieldStart;
            rec_line = line;
            rec_offset = i;
        }
    }

    if state == CsvState::Quoted {
        let (q_line, q_col, q_offset) = quote_open;
        return Err(CsvSyntaxError {
            message: "Unterminated quoted field".to_string(),
            row: records.len() + 1,
            line: q_line,
            column: q_col,
            offset: q_offset,
        });
    }
    if has_content {
        records.push(CsvRecord {
            row: records.len() + 1,
            line: rec_line,
            offset: rec_offset,
            fields: fields + 1,
        });
    }
    Ok(records)
}

fn check_csv(content: &str) -> Vec<ParserHint> {
    let delim = guess_delimiter(content);
    let records = match tokenize_csv(content, delim) {
        Ok(r) => r,
        Err(e) => {
            let mut hint = ParserHint::new(
                HintKind::SyntaxError,
                format!("Invalid CSV: {} (row {})", e.message, e.row),
            );
            hint.position = Some(e.offset);
            hint.line = Some(e.line);
            hint.column = Some(e.column);
            hint.row = Some(e.row);
            hint.category = Some("syntax".to_string());
            return vec![hint];
        }
    };

    let Some(header) = records.first() else {
        return Vec::new();
    };

    records
        .iter()
        .skip(1)
        .filter(|r| r.fields != header.fields)
        .take(MAX_HINTS)
        .map(|r| {
            let mut hint = ParserHint::new(
                HintKind::StructureError,
                format!(
                    "Row {} has {} column(s) but the header has {}",
                    r.row, r.fields, header.fields
                ),
            );
            hint.position = Some(r.offset);
            hint.line = Some(r.line);
            hint.column = Some(1);
            hint.row = Some(r.row);
            hint.category = Some("structure".to_string());
            hint
        })
        .collect()
}

// ============ XML ============

fn check_xml(content: &str) -> Vec<ParserHint> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let idx = LineIndex::new(content);
    let mut reader = Reader::from_str(content);
    reader.config_mut().check_end_names = true;

    // (name, byte offset of the start tag)
    let mut open: Vec<(String, usize)> = Vec::new();
    let mut root_seen = false;
    let mut hints = Vec::new();

    let at_byte = |kind: HintKind, message: String, byte: usize| {
        let loc = ErrorLocation {
            position: Some(char_offset(content, byte)),
            line: None,
            column: None,
        };
        hint_at(&idx, kind, message, loc)
    };

    loop {
        let before = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if open.is_empty() && root_seen {
                    hints.push(at_byte(
                        HintKind::SyntaxError,
                        format!("Extra content at the end of the document: <{}>", name),
                        before,
                    ));
                    break;
                }
                root_seen = true;
                open.push((name, before));
            }
            Ok(Event::Empty(e)) => {
                if open.is_empty() && root_seen {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    hints.push(at_byte(
                        HintKind::SyntaxError,
                        format!("Extra content at the end of the document: <{}/>", name),
                        before,
                    ));
                    break;
                }
                root_seen = true;
            }
            Ok(Event::End(_)) => {
                open.pop();
            }
            Ok(Event::Text(t)) => {
                if open.is_empty() && t.iter().any(|b| !b.is_ascii_whitespace()) {
                    hints.push(at_byte(
                        HintKind::SyntaxError,
                        "Text content outside of the root element".to_string(),
                        before,
                    ));
                    break;
                }
            }
            Ok(Event::Eof) => {
                if let Some((name, start)) = open.last() {
                    hints.push(at_byte(
                        HintKind::SyntaxError,
                        format!("Unclosed element <{}>", name),
                        *start,
                    ));
                } else if !root_seen {
                    hints.push(at_byte(
                        HintKind::StructureError,
                        "Document has no root element".to_string(),
                        0,
                    ));
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let byte = reader.error_position() as usize;
                hints.push(at_byte(
                    HintKind::SyntaxError,
                    format!("Invalid XML: {}", e),
                    byte,
                ));
                break;
            }
        }
    }

    hints
}

// ============ shared ============

/// Builds a hint, filling in whichever of position/line/column the parser
/// did not report from the ones it did.
fn hint_at(idx: &LineIndex<'_>, kind: HintKind, message: String, loc: ErrorLocation) -> ParserHint {
    let mut hint = ParserHint::new(kind, message);
    hint.category = Some(match kind {
        HintKind::SyntaxError => "syntax".to_string(),
        HintKind::StructureError => "structure".to_string(),
        HintKind::Warning => "format".to_string(),
    });

    match (loc.position, loc.line) {
        (Some(pos), _) => {
            let pos = pos.min(idx.char_len());
            hint.position = Some(pos);
            if let Some((line, col)) = idx.offset_to_line_col(pos) {
                hint.line = Some(loc.line.unwrap_or(line));
                hint.column = Some(loc.column.unwrap_or(col));
            }
        }
        (None, Some(line)) => {
            let line = line.clamp(1, idx.line_count());
            let col = loc.column.map(|c| c.max(1));
            hint.line = Some(line);
            hint.column = col;
            hint.position = idx.line_col_to_offset(line, col);
        }
        (None, None) => {}
    }
    hint
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_location_patterns() {
        let loc = extract_location("Unexpected token } in JSON at position 8");
        assert_eq!(loc.position, Some(8));
        assert_eq!(loc.line, None);

        let loc = extract_location("trailing comma at line 3 column 9");
        assert_eq!((loc.line, loc.column), (Some(3), Some(9)));

        let loc = extract_location("bad indentation at line 4, column 2");
        assert_eq!((loc.line, loc.column), (Some(4), Some(2)));

        let loc = extract_location("something odd on line 7");
        assert_eq!((loc.line, loc.column), (Some(7), None));

        let loc = extract_location("unexpected value in column 5");
        assert_eq!((loc.line, loc.column), (None, Some(5)));

        assert_eq!(extract_location("no location here"), ErrorLocation::default());
    }

    #[test]
    fn test_json_trailing_comma_hint() {
        let hints = run_precheck("{\"a\": 1,}", FileType::Json);
        assert_eq!(hints.len(), 1);
        let h = &hints[0];
        assert_eq!(h.kind, HintKind::SyntaxError);
        assert_eq!(h.line, Some(1));
        let pos = h.position.unwrap();
        assert!((7..=9).contains(&pos), "position {} not near 8", pos);
        assert_eq!(h.category.as_deref(), Some("syntax"));
    }

    #[test]
    fn test_valid_json_has_no_hints() {
        assert!(run_precheck("{\"a\": [1, 2, {\"b\": null}]}", FileType::Json).is_empty());
    }

    #[test]
    fn test_json_multiline_position() {
        let content = "{\n  \"a\": 1\n  \"b\": 2\n}";
        let hints = run_precheck(content, FileType::Json);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].line, Some(3));
        let idx = LineIndex::new(content);
        let (line, _) = idx.offset_to_line_col(hints[0].position.unwrap()).unwrap();
        assert_eq!(line, 3);
    }

    #[test]
    fn test_yaml_error_has_line() {
        let content = "a: 1\nb: [1, 2\nc: 3\n";
        let hints = run_precheck(content, FileType::Yaml);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].kind, HintKind::SyntaxError);
        assert!(hints[0].line.is_some());
        assert!(hints[0].position.is_some());
    }

    #[test]
    fn test_yaml_multi_document_ok() {
        let content = "---\na: 1\n---\nb: 2\n";
        assert!(run_precheck(content, FileType::Yaml).is_empty());
    }

    #[test]
    fn test_csv_column_mismatch_capped() {
        let content = "a,b,c\n1,2\n3,4,5\n6\n7,8,9,10\n1,2\n";
        let hints = run_precheck(content, FileType::Csv);
        assert_eq!(hints.len(), 3);
        assert!(hints.iter().all(|h| h.kind == HintKind::StructureError));
        assert_eq!(hints[0].row, Some(2));
        assert_eq!(hints[0].line, Some(2));
        assert_eq!(hints[0].position, Some(6));
        assert_eq!(hints[1].row, Some(4));
        assert_eq!(hints[2].row, Some(5));
    }

    #[test]
    fn test_csv_quoted_fields_and_crlf() {
        let content = "name,note\r\n\"Smith, J\",\"said \"\"hi\"\"\"\r\nx,\"multi\nline\"\r\n";
        assert!(run_precheck(content, FileType::Csv).is_empty());
    }

    #[test]
    fn test_csv_unterminated_quote_is_syntax_error() {
        let content = "a,b\n1,\"open\n2,3\n";
        let hints = run_precheck(content, FileType::Csv);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].kind, HintKind::SyntaxError);
        assert_eq!(hints[0].row, Some(2));
        assert_eq!(hints[0].line, Some(2));
        assert_eq!(hints[0].column, Some(3));
    }

    #[test]
    fn test_csv_bare_quote_is_syntax_error() {
        let hints = run_precheck("a,b\n1,2\"x\n", FileType::Csv);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].kind, HintKind::SyntaxError);
        assert!(hints[0].message.contains("row 2"));
    }

    #[test]
    fn test_csv_semicolon_delimiter() {
        let content = "a;b;c\n1;2;3\n4;5\n";
        let hints = run_precheck(content, FileType::Csv);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].row, Some(3));
    }

    #[test]
    fn test_xml_mismatched_end_tag() {
        let content = "<root>\n  <a></b>\n</root>";
        let hints = run_precheck(content, FileType::Xml);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].kind, HintKind::SyntaxError);
        assert_eq!(hints[0].line, Some(2));
    }

    #[test]
    fn test_xml_unclosed_element() {
        let content = "<root>\n  <item>";
        let hints = run_precheck(content, FileType::Xml);
        assert_eq!(hints.len(), 1);
        assert!(hints[0].message.contains("<item>"));
        assert_eq!(hints[0].line, Some(2));
        assert_eq!(hints[0].column, Some(3));
    }

    #[test]
    fn test_xml_multiple_roots() {
        let hints = run_precheck("<a/><b/>", FileType::Xml);
        assert_eq!(hints.len(), 1);
        assert!(hints[0].message.contains("Extra content"));
        assert_eq!(hints[0].position, Some(4));
    }

    #[test]
    fn test_xml_well_formed() {
        let content = "<?xml version=\"1.0\"?>\n<root a=\"1\"><b>text</b><c/></root>\n";
        assert!(run_precheck(content, FileType::Xml).is_empty());
    }
}
