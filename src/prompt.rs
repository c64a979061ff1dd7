//! Prompt construction and the response contract.
//!
//! [`build_prompt`] assembles sampled content, parser hints, reference
//! snippets and the sampling note into a single user message.
//! [`response_schema`] is the JSON shape the model is told to return; the
//! recovery stage repairs and validates against the same shape.

use serde_json::{json, Value};

use crate::models::{FileType, ParserHint};
use crate::references::ReferenceSnippet;
use crate::sampler::SampledContent;

/// Everything that goes into one prompt.
pub struct PromptInput<'a> {
    pub file_type: FileType,
    pub file_name: Option<&'a str>,
    pub max_errors: u32,
    pub sampled: &'a SampledContent,
    pub hints: &'a [ParserHint],
    pub references: &'a [ReferenceSnippet],
}

/// The response shape requested from the model.
pub fn response_schema() -> Value {
    json!({
        "errors": [{
            "line": "integer, 1-based line in the file",
            "column": "integer, 1-based column (optional)",
            "position": "integer, 0-based character offset (optional)",
            "message": "string, one-sentence description of the defect",
            "type": "\"error\" | \"warning\"",
            "category": "string, e.g. syntax, structure, type, consistency, format",
            "severity": "\"critical\" | \"high\" | \"medium\" | \"low\"",
            "confidence": "number between 0 and 1",
            "explanation": "string, why this is a defect; quote the offending text in backticks",
            "suggestions": [{
                "description": "string, how to fix it",
                "safety": "\"safe\" | \"risky\" | \"manual_review\""
            }]
        }],
        "analysis_confidence": "number between 0 and 1"
    })
}

/// Shortest backtick fence that does not occur in `content`.
fn fence_for(content: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for c in content.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat((longest + 1).max(3))
}

fn format_hint(i: usize, hint: &ParserHint) -> String {
    let kind = serde_json::to_value(hint.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let mut loc = Vec::new();
    if let Some(l) = hint.line {
        loc.push(format!("line {}", l));
    }
    if let Some(c) = hint.column {
        loc.push(format!("column {}", c));
    }
    if let Some(r) = hint.row {
        loc.push(format!("row {}", r));
    }
    if let Some(p) = hint.position {
        loc.push(format!("position {}", p));
    }
    if loc.is_empty() {
        format!("{}. [{}] {}", i + 1, kind, hint.message)
    } else {
        format!("{}. [{}] {} ({})", i + 1, kind, hint.message, loc.join(", "))
    }
}

pub fn build_prompt(input: &PromptInput<'_>) -> String {
    let ft = input.file_type.as_str();
    let mut p = String::new();

    p.push_str(&format!(
        "You are a meticulous data-quality reviewer. Analyze the following {} file{} and \
         report up to {} concrete defects: syntax errors, structural inconsistencies, type \
         mismatches and suspicious values. Do not report stylistic preferences.\n\n",
        ft.to_uppercase(),
        input
            .file_name
            .map(|n| format!(" (`{}`)", n))
            .unwrap_or_default(),
        input.max_errors
    ));

    if !input.references.is_empty() {
        p.push_str("## Reference material\n\n");
        for r in input.references {
            p.push_str(&format!("### {}\n{}\n\n", r.title, r.text));
        }
    }

    if !input.hints.is_empty() {
        p.push_str("## Parser findings (exact positions in the original file)\n\n");
        for (i, h) in input.hints.iter().enumerate() {
            p.push_str(&format_hint(i, h));
            p.push('\n');
        }
        p.push('\n');
    }

    if let Some(note) = &input.sampled.note {
        p.push_str("## Sampling\n\n");
        p.push_str(note);
        p.push_str("\n\n");
    }

    let fence = fence_for(&input.sampled.content);
    p.push_str("## File content\n\n");
    p.push_str(&format!("{}{}\n{}\n{}\n\n", fence, ft, input.sampled.content, fence));

    p.push_str("## Response format\n\n");
    p.push_str(
        "Respond with ONLY a JSON object (no prose, no markdown) of this shape:\n",
    );
    p.push_str(
        &serde_json::to_string_pretty(&response_schema()).unwrap_or_else(|_| "{}".to_string()),
    );
    p.push_str(
        "\n\nRules:\n\
         - `line` and `column` are 1-based and refer to the file as shown.\n\
         - `confidence` reflects how sure you are the defect is real.\n\
         - Quote the exact offending text in backticks inside `explanation`.\n\
         - If the file has no defects, return {\"errors\": [], \"analysis_confidence\": 1.0}.\n",
    );
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HintKind, TruncationMap};

    fn sampled(content: &str) -> SampledContent {
        SampledContent {
            content: content.to_string(),
            map: TruncationMap::passthrough(content.chars().count()),
            note: None,
        }
    }

    #[test]
    fn test_prompt_contains_content_hints_and_schema() {
        let s = sampled("{\"a\": 1,}");
        let mut hint = ParserHint::new(HintKind::SyntaxError, "trailing comma");
        hint.line = Some(1);
        hint.position = Some(8);
        let hints = vec![hint];
        let refs = vec![ReferenceSnippet {
            title: "JSON defect checklist".into(),
            text: "- trailing commas".into(),
        }];
        let prompt = build_prompt(&PromptInput {
            file_type: FileType::Json,
            file_name: Some("data.json"),
            max_errors: 10,
            sampled: &s,
            hints: &hints,
            references: &refs,
        });
        assert!(prompt.contains("`data.json`"));
        assert!(prompt.contains("up to 10"));
        assert!(prompt.contains("1. [syntax_error] trailing comma (line 1, position 8)"));
        assert!(prompt.contains("```json\n{\"a\": 1,}\n```"));
        assert!(prompt.contains("\"analysis_confidence\""));
        assert!(prompt.contains("JSON defect checklist"));
        assert!(!prompt.contains("## Sampling"));
    }

    #[test]
    fn test_fence_longer_than_content_backticks() {
        assert_eq!(fence_for("plain"), "```");
        assert_eq!(fence_for("has ``` inside"), "````");
    }

    #[test]
    fn test_sampling_note_included() {
        let mut s = sampled("abc");
        s.note = Some("NOTE: sampled".into());
        let prompt = build_prompt(&PromptInput {
            file_type: FileType::Csv,
            file_name: None,
            max_errors: 5,
            sampled: &s,
            hints: &[],
            references: &[],
        });
        assert!(prompt.contains("## Sampling\n\nNOTE: sampled"));
        assert!(!prompt.contains("## Parser findings"));
    }
}
