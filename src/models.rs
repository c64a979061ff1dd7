//! Core data models used throughout structlint.
//!
//! These types represent the hints, truncation maps, findings and responses
//! that flow through the analysis pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured-data formats the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Json,
    Csv,
    Xml,
    Yaml,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Json => "json",
            FileType::Csv => "csv",
            FileType::Xml => "xml",
            FileType::Yaml => "yaml",
        }
    }

    /// Parses a format name. `yml` is accepted as an alias for `yaml`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(FileType::Json),
            "csv" => Some(FileType::Csv),
            "xml" => Some(FileType::Xml),
            "yaml" | "yml" => Some(FileType::Yaml),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a locally detected defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintKind {
    SyntaxError,
    StructureError,
    Warning,
}

/// A defect found by a native parser on the original content.
///
/// Line, column and position are always ground truth: hints are produced
/// from the untruncated file and never rewritten afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserHint {
    pub kind: HintKind,
    pub message: String,
    /// Char offset into the original content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    /// 1-based data row (CSV only; the header is row 1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ParserHint {
    pub fn new(kind: HintKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            position: None,
            line: None,
            column: None,
            row: None,
            category: None,
        }
    }
}

/// A region of the original content spliced into the sampled view because a
/// hint points into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorWindow {
    /// Original-content char range `[start, end)`.
    pub start: usize,
    pub end: usize,
    pub reason: String,
    /// The hint offset the window was carved around.
    pub anchor: usize,
    /// Char offset in the sampled text where the window body begins.
    pub sampled_start: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmittedRange {
    pub start: usize,
    pub end: usize,
}

/// Record of what the sampler kept and dropped.
///
/// The only bridge from an offset in the sampled text back to an offset in
/// the original content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncationMap {
    pub was_truncated: bool,
    pub original_length: usize,
    pub truncated_length: usize,
    pub head_chars: usize,
    pub tail_chars: usize,
    pub error_windows: Vec<ErrorWindow>,
    pub omitted_ranges: Vec<OmittedRange>,
    /// Char offset in the sampled text where the tail begins.
    pub tail_sampled_start: usize,
}

impl TruncationMap {
    /// Map for content passed through unchanged.
    pub fn passthrough(len: usize) -> Self {
        Self {
            was_truncated: false,
            original_length: len,
            truncated_length: len,
            head_chars: len,
            tail_chars: 0,
            error_windows: Vec::new(),
            omitted_ranges: Vec::new(),
            tail_sampled_start: len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingType {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Safety {
    Safe,
    Risky,
    ManualReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub description: String,
    pub safety: Safety,
}

/// A validated model finding, before position normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub column: Option<usize>,
    #[serde(default)]
    pub position: Option<usize>,
    pub message: String,
    #[serde(rename = "type")]
    pub finding_type: FindingType,
    pub category: String,
    pub severity: Severity,
    /// Model's self-reported confidence, already clamped to `[0, 1]`.
    #[serde(default)]
    pub confidence: Option<f64>,
    pub explanation: String,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
    /// Text the model quoted as evidence, if it supplied one explicitly.
    #[serde(default)]
    pub snippet: Option<String>,
}

/// A finding whose position has been verified against the original content.
///
/// `line` and `column` are either both `None` or both valid for the
/// original file's line table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFinding {
    pub line: Option<usize>,
    pub column: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    pub message: String,
    #[serde(rename = "type")]
    pub finding_type: FindingType,
    pub category: String,
    pub severity: Severity,
    /// Position confidence multiplied by the model's self-reported confidence.
    pub confidence: f64,
    pub explanation: String,
    pub suggestions: Vec<Suggestion>,
    pub is_approximate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_note: Option<String>,
}

/// Inbound analysis request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub content: String,
    /// `auto`, `json`, `csv`, `xml` or `yaml`; absent means `auto`.
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub max_errors: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// True when counts were estimated locally rather than reported.
    #[serde(default)]
    pub estimated: bool,
}

/// Pipeline bookkeeping returned alongside the findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetadata {
    pub request_id: String,
    pub file_type: FileType,
    pub detected_file_type: FileType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub was_truncated: bool,
    pub provider: String,
    pub model: String,
    pub model_version: String,
    pub rag_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub retry_count: u32,
    pub latency_ms: u64,
    pub sanity_checks_passed: usize,
    pub sanity_checks_failed: usize,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,
    pub created_at: String,
}

/// The response handed back to the calling layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub errors: Vec<NormalizedFinding>,
    pub total_errors: usize,
    pub analysis_confidence: f64,
    pub metadata: PipelineMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_parse() {
        assert_eq!(FileType::parse("JSON"), Some(FileType::Json));
        assert_eq!(FileType::parse("yml"), Some(FileType::Yaml));
        assert_eq!(FileType::parse("auto"), None);
    }

    #[test]
    fn test_hint_serializes_without_empty_fields() {
        let mut hint = ParserHint::new(HintKind::SyntaxError, "bad");
        hint.position = Some(8);
        let v = serde_json::to_value(&hint).unwrap();
        assert_eq!(v["kind"], "syntax_error");
        assert_eq!(v["position"], 8);
        assert!(v.get("line").is_none());
    }

    #[test]
    fn test_finding_type_field_name() {
        let v = serde_json::to_value(FindingType::Warning).unwrap();
        assert_eq!(v, "warning");
        let s = serde_json::to_value(Safety::ManualReview).unwrap();
        assert_eq!(s, "manual_review");
    }
}
