//! Recovery of structured findings from raw model text.
//!
//! Three separate stages:
//!
//! 1. **extract**: an ordered list of strategies, each a pure
//!    `fn(&str) -> Option<Value>`; the first that yields a JSON object or
//!    array wins. None succeeding is [`RecoveryError::LlmParse`].
//! 2. **repair**: schema-directed coercion of near-miss shapes
//!    (stringified numbers, missing optional fields, bare-string
//!    suggestions) into the response contract.
//! 3. **validate**: strict check of the repaired value, then conversion to
//!    typed [`Finding`]s. Any violation is [`RecoveryError::SchemaValidation`]
//!    carrying the repaired value and every violation found.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::error::RecoveryError;
use crate::models::Finding;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*(?:json|JSON|jsonc)?[ \t]*\r?\n?(.*?)```").expect("static regex")
});

static FLAT_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").expect("static regex")
});

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("static regex"));

const SEVERITIES: [&str; 4] = ["critical", "high", "medium", "low"];
const SAFETIES: [&str; 3] = ["safe", "risky", "manual_review"];

/// Findings and overall confidence recovered from one model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReport {
    pub findings: Vec<Finding>,
    pub analysis_confidence: Option<f64>,
    /// Name of the extraction strategy that succeeded.
    pub strategy: &'static str,
}

type Strategy = fn(&str) -> Option<Value>;

/// Extraction strategies in the order they are tried.
pub const STRATEGIES: [(&str, Strategy); 6] = [
    ("direct", parse_direct),
    ("fenced_block", parse_fenced_block),
    ("brace_slice", parse_brace_slice),
    ("balanced_braces", parse_balanced_braces),
    ("bracket_slice", parse_bracket_slice),
    ("flat_object", parse_flat_object),
];

fn parse_structured(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(v @ (Value::Object(_) | Value::Array(_))) => Some(v),
        _ => None,
    }
}

fn parse_direct(raw: &str) -> Option<Value> {
    parse_structured(raw)
}

fn parse_fenced_block(raw: &str) -> Option<Value> {
    FENCED_BLOCK
        .captures_iter(raw)
        .find_map(|c| c.get(1).and_then(|m| parse_structured(m.as_str())))
}

fn slice_between(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    (end > start).then(|| &raw[start..=end])
}

fn parse_brace_slice(raw: &str) -> Option<Value> {
    parse_structured(slice_between(raw, '{', '}')?)
}

fn parse_balanced_braces(raw: &str) -> Option<Value> {
    parse_structured(extract_balanced_json(raw)?)
}

fn parse_bracket_slice(raw: &str) -> Option<Value> {
    parse_structured(slice_between(raw, '[', ']')?)
}

fn parse_flat_object(raw: &str) -> Option<Value> {
    FLAT_OBJECT
        .find_iter(raw)
        .find_map(|m| parse_structured(m.as_str()))
}

/// The brace-balanced substring starting at the first `{`.
///
/// Braces inside string literals (including escaped quotes) are ignored.
pub fn extract_balanced_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Runs the extraction strategies in order.
pub fn extract_json(raw: &str) -> Result<(Value, &'static str), RecoveryError> {
    for (name, strategy) in STRATEGIES {
        if let Some(v) = strategy(raw) {
            log::debug!("extracted model JSON with strategy {}", name);
            return Ok((v, name));
        }
    }
    Err(RecoveryError::LlmParse {
        raw: raw.to_string(),
    })
}

// ============ Repair ============

fn coerce_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if let Some(pct) = s.strip_suffix('%') {
                return pct.trim().parse::<f64>().ok().map(|p| p / 100.0);
            }
            s.parse::<f64>()
                .ok()
                .or_else(|| NUMBER.find(s).and_then(|m| m.as_str().parse().ok()))
        }
        _ => None,
    };
    n.filter(|f| f.is_finite())
}

/// Integer field coerced and raised to at least `min`; unusable values become null.
fn repair_integer(obj: &mut Map<String, Value>, key: &str, min: u64) {
    let Some(v) = obj.get(key) else {
        return;
    };
    if v.is_null() {
        return;
    }
    let repaired = match coerce_number(v) {
        Some(f) => Value::from((f.floor().max(0.0) as u64).max(min)),
        None => Value::Null,
    };
    obj.insert(key.to_string(), repaired);
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn repair_suggestion(v: &Value) -> Option<Value> {
    let (description, safety) = match v {
        Value::String(s) => (s.trim().to_string(), None),
        Value::Object(o) => {
            let description = ["description", "fix", "text", "suggestion"]
                .iter()
                .find_map(|k| string_field(o, k))
                .unwrap_or_default();
            (description, string_field(o, "safety"))
        }
        _ => return None,
    };
    if description.is_empty() {
        return None;
    }
    let safety = safety
        .map(|s| s.to_ascii_lowercase().replace([' ', '-'], "_"))
        .filter(|s| SAFETIES.contains(&s.as_str()))
        .unwrap_or_else(|| "manual_review".to_string());
    Some(serde_json::json!({ "description": description, "safety": safety }))
}

fn repair_finding(obj: &mut Map<String, Value>) {
    if let Some(c) = obj.get("confidence") {
        let repaired = coerce_number(c)
            .map(|f| Value::from(f.clamp(0.0, 1.0)))
            .unwrap_or(Value::Null);
        obj.insert("confidence".into(), repaired);
    }
    repair_integer(obj, "line", 1);
    repair_integer(obj, "column", 1);
    repair_integer(obj, "position", 0);

    let finding_type = match string_field(obj, "type").map(|t| t.to_ascii_lowercase()) {
        Some(t) if t.starts_with("warn") => "warning",
        _ => "error",
    };
    obj.insert("type".into(), Value::from(finding_type));

    let severity = string_field(obj, "severity")
        .map(|s| s.to_ascii_lowercase())
        .filter(|s| SEVERITIES.contains(&s.as_str()))
        .unwrap_or_else(|| {
            let inferred = if finding_type == "warning" { "low" } else { "medium" };
            inferred.to_string()
        });
    obj.insert("severity".into(), Value::from(severity));

    let category = string_field(obj, "category")
        .map(|c| c.to_ascii_lowercase())
        .unwrap_or_else(|| "general".to_string());
    obj.insert("category".into(), Value::from(category.clone()));

    let message = string_field(obj, "message")
        .or_else(|| string_field(obj, "description"))
        .or_else(|| string_field(obj, "explanation"))
        .unwrap_or_else(|| match obj.get("line").and_then(Value::as_u64) {
            Some(line) => format!("Unspecified {} issue on line {}", category, line),
            None => format!("Unspecified {} issue", category),
        });
    obj.insert("message".into(), Value::from(message.clone()));
    let explanation = string_field(obj, "explanation").unwrap_or(message);
    obj.insert("explanation".into(), Value::from(explanation));

    let suggestions: Vec<Value> = match obj.get("suggestions") {
        Some(Value::Array(items)) => items.iter().filter_map(repair_suggestion).collect(),
        Some(v @ Value::String(_)) => repair_suggestion(v).into_iter().collect(),
        _ => Vec::new(),
    };
    obj.insert("suggestions".into(), Value::Array(suggestions));

    if let Some(s) = obj.get("snippet") {
        if !s.is_string() {
            obj.remove("snippet");
        }
    }
}

/// Coerces a parsed reply toward the response contract.
///
/// A top-level array is taken as the findings list; `findings` and `issues`
/// are accepted as aliases of `errors`.
pub fn repair(value: Value) -> Value {
    let mut root = match value {
        Value::Array(items) => {
            let mut m = Map::new();
            m.insert("errors".into(), Value::Array(items));
            m
        }
        Value::Object(m) => m,
        other => return other,
    };

    if !root.contains_key("errors") {
        if let Some(alias) = ["findings", "issues"].iter().find(|k| root.contains_key(**k)) {
            if let Some(v) = root.remove(*alias) {
                root.insert("errors".into(), v);
            }
        }
    }

    if let Some(Value::Array(items)) = root.get_mut("errors") {
        for item in items.iter_mut() {
            if let Value::Object(obj) = item {
                repair_finding(obj);
            }
        }
    }

    if let Some(c) = root.get("analysis_confidence") {
        let repaired = coerce_number(c)
            .map(|f| Value::from(f.clamp(0.0, 1.0)))
            .unwrap_or(Value::Null);
        root.insert("analysis_confidence".into(), repaired);
    }

    Value::Object(root)
}

// ============ Validate ============

fn check_finding(i: usize, item: &Value, violations: &mut Vec<String>) {
    let Some(obj) = item.as_object() else {
        violations.push(format!("errors[{}]: must be an object", i));
        return;
    };
    if string_field(obj, "message").is_none() {
        violations.push(format!("errors[{}].message: must be a non-empty string", i));
    }
    match obj.get("type").and_then(|v| v.as_str()) {
        Some("error") | Some("warning") => {}
        _ => violations.push(format!("errors[{}].type: must be \"error\" or \"warning\"", i)),
    }
    match obj.get("severity").and_then(|v| v.as_str()) {
        Some(s) if SEVERITIES.contains(&s) => {}
        _ => violations.push(format!(
            "errors[{}].severity: must be one of {}",
            i,
            SEVERITIES.join("|")
        )),
    }
    for (key, min) in [("line", 1), ("column", 1), ("position", 0)] {
        match obj.get(key) {
            None | Some(Value::Null) => {}
            Some(v) if v.as_u64().is_some_and(|n| n >= min) => {}
            Some(_) => violations.push(format!(
                "errors[{}].{}: must be an integer >= {}",
                i, key, min
            )),
        }
    }
    match obj.get("confidence") {
        None | Some(Value::Null) => {}
        Some(v) if v.as_f64().is_some_and(|f| (0.0..=1.0).contains(&f)) => {}
        Some(_) => violations.push(format!("errors[{}].confidence: must be within [0, 1]", i)),
    }
    if !obj.get("suggestions").is_some_and(|v| v.is_array()) {
        violations.push(format!("errors[{}].suggestions: must be an array", i));
    }
}

/// Validates a repaired reply and converts it into typed findings.
pub fn validate(value: &Value) -> Result<(Vec<Finding>, Option<f64>), RecoveryError> {
    let fail = |violations: Vec<String>| RecoveryError::SchemaValidation {
        parsed: value.clone(),
        violations,
    };

    let Some(root) = value.as_object() else {
        return Err(fail(vec!["root: must be an object".to_string()]));
    };
    let Some(items) = root.get("errors").and_then(|v| v.as_array()) else {
        return Err(fail(vec!["errors: must be an array".to_string()]));
    };

    let mut violations = Vec::new();
    for (i, item) in items.iter().enumerate() {
        check_finding(i, item, &mut violations);
    }
    let analysis_confidence = match root.get("analysis_confidence") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_f64().filter(|f| (0.0..=1.0).contains(f)) {
            Some(f) => Some(f),
            None => {
                violations.push("analysis_confidence: must be within [0, 1]".to_string());
                None
            }
        },
    };
    if !violations.is_empty() {
        return Err(fail(violations));
    }

    let mut findings = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match serde_json::from_value::<Finding>(item.clone()) {
            Ok(f) => findings.push(f),
            Err(e) => violations.push(format!("errors[{}]: {}", i, e)),
        }
    }
    if !violations.is_empty() {
        return Err(fail(violations));
    }
    Ok((findings, analysis_confidence))
}

/// Extract, repair and validate in sequence.
pub fn recover(raw: &str) -> Result<ModelReport, RecoveryError> {
    let (value, strategy) = extract_json(raw)?;
    let repaired = repair(value);
    let (findings, analysis_confidence) = validate(&repaired)?;
    Ok(ModelReport {
        findings,
        analysis_confidence,
        strategy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FindingType, Safety, Severity};
    use serde_json::json;

    #[test]
    fn test_balanced_ignores_braces_in_strings() {
        assert_eq!(
            extract_balanced_json(r#"noise {"a": "}"} trailing"#),
            Some(r#"{"a": "}"}"#)
        );
        assert_eq!(
            extract_balanced_json(r#"x {"a": "\"}", "b": {"c": 1}} y }"#),
            Some(r#"{"a": "\"}", "b": {"c": 1}}"#)
        );
        assert_eq!(extract_balanced_json("{ never closed"), None);
        assert_eq!(extract_balanced_json("no braces"), None);
    }

    #[test]
    fn test_strategy_order() {
        let (_, s) = extract_json(r#"{"errors": []}"#).unwrap();
        assert_eq!(s, "direct");

        let (v, s) = extract_json("Here you go:\n```json\n{\"errors\": []}\n```\nDone.").unwrap();
        assert_eq!(s, "fenced_block");
        assert_eq!(v, json!({"errors": []}));

        let (_, s) = extract_json(r#"Result: {"errors": []} hope that helps"#).unwrap();
        assert_eq!(s, "brace_slice");

        // A stray closing brace after the object defeats the first/last slice.
        let (v, s) = extract_json(r#"Result: {"errors": []} and also }"#).unwrap();
        assert_eq!(s, "balanced_braces");
        assert_eq!(v, json!({"errors": []}));

        let (_, s) = extract_json(r#"codes: ["E1", "E2"]"#).unwrap();
        assert_eq!(s, "bracket_slice");
    }

    #[test]
    fn test_flat_object_last_resort() {
        // The first `{` never balances, so only the regex finds the object.
        let raw = r#"{ broken preamble ... {"ok": true, "analysis_confidence": 0.9} tail"#;
        let (v, s) = extract_json(raw).unwrap();
        assert_eq!(s, "flat_object");
        assert_eq!(v["analysis_confidence"], 0.9);
    }

    #[test]
    fn test_unparseable_output_is_llm_parse_error() {
        let err = recover("I could not analyze this file, sorry.").unwrap_err();
        assert_eq!(err.code(), "llm_parse_error");
        match err {
            RecoveryError::LlmParse { raw } => assert!(raw.contains("sorry")),
            _ => panic!("expected LlmParse"),
        }
        // Bare scalars are not a usable reply.
        assert!(recover("42").is_err());
    }

    #[test]
    fn test_repair_coerces_stringified_fields() {
        let raw = r#"{"errors": [{
            "line": "12", "column": 0, "position": "-3",
            "message": "Trailing comma", "confidence": "1.7",
            "suggestions": ["Remove the comma"]
        }], "analysis_confidence": "85%"}"#;
        let report = recover(raw).unwrap();
        let f = &report.findings[0];
        assert_eq!(f.line, Some(12));
        assert_eq!(f.column, Some(1));
        assert_eq!(f.position, Some(0));
        assert_eq!(f.confidence, Some(1.0));
        assert_eq!(f.finding_type, FindingType::Error);
        assert_eq!(f.severity, Severity::Medium);
        assert_eq!(f.category, "general");
        assert_eq!(f.explanation, "Trailing comma");
        assert_eq!(f.suggestions[0].safety, Safety::ManualReview);
        assert_eq!(report.analysis_confidence, Some(0.85));
    }

    #[test]
    fn test_repair_infers_severity_from_type() {
        let raw = json!([{"message": "odd value", "type": "Warn", "severity": "urgent"}]);
        let repaired = repair(raw);
        assert_eq!(repaired["errors"][0]["type"], "warning");
        assert_eq!(repaired["errors"][0]["severity"], "low");
    }

    #[test]
    fn test_repair_accepts_findings_alias_and_suggestion_objects() {
        let raw = json!({"findings": [{
            "message": "m",
            "severity": "HIGH",
            "suggestions": [{"fix": "do x", "safety": "Manual Review"}, {"safety": "safe"}, 3]
        }]});
        let (findings, _) = validate(&repair(raw)).unwrap();
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].suggestions.len(), 1);
        assert_eq!(findings[0].suggestions[0].description, "do x");
        assert_eq!(findings[0].suggestions[0].safety, Safety::ManualReview);
    }

    #[test]
    fn test_unusable_line_becomes_null() {
        let (findings, _) =
            validate(&repair(json!({"errors": [{"message": "m", "line": "near the end"}]})))
                .unwrap();
        assert_eq!(findings[0].line, None);
    }

    #[test]
    fn test_schema_violations_are_collected() {
        let err = recover(r#"{"errors": [{"line": 3}, "nope"]}"#).unwrap_err();
        assert_eq!(err.code(), "schema_validation_error");
        match err {
            RecoveryError::SchemaValidation { parsed, violations } => {
                assert!(parsed["errors"].is_array());
                assert_eq!(violations, vec!["errors[1]: must be an object".to_string()]);
            }
            _ => panic!("expected SchemaValidation"),
        }
    }

    #[test]
    fn test_missing_message_is_defaulted() {
        let report = recover(r#"{"errors": [{"line": 2}]}"#).unwrap();
        assert_eq!(report.findings.len(), 1);
        let f = &report.findings[0];
        assert_eq!(f.message, "Unspecified general issue on line 2");
        assert_eq!(f.explanation, f.message);

        let report =
            recover(r#"{"errors": [{"line": 2, "explanation": "", "type": "error", "category": "Syntax"}]}"#)
                .unwrap();
        assert_eq!(report.findings[0].message, "Unspecified syntax issue on line 2");

        let report = recover(r#"{"errors": [{}]}"#).unwrap();
        assert_eq!(report.findings[0].message, "Unspecified general issue");
    }

    #[test]
    fn test_missing_errors_array() {
        let err = recover(r#"{"result": "ok"}"#).unwrap_err();
        match err {
            RecoveryError::SchemaValidation { violations, .. } => {
                assert_eq!(violations, vec!["errors: must be an array".to_string()]);
            }
            _ => panic!("expected SchemaValidation"),
        }
    }

    #[test]
    fn test_snippet_kept_when_string() {
        let report = recover(r#"{"errors": [{"message": "m", "snippet": "\"a\": 1,"}]}"#).unwrap();
        assert_eq!(report.findings[0].snippet.as_deref(), Some("\"a\": 1,"));
    }
}
