//! The analysis pipeline.
//!
//! ```text
//! request ─▶ detect ─▶ precheck ─▶ sample ─▶ cache? ──hit──▶ cached body
//!                                              │
//!                                             miss
//!                                              ▼
//!            prompt ─▶ invoke ─▶ recover ─▶ normalize ─▶ sanity/dedup/sort/cap ─▶ cache store
//! ```
//!
//! Stages run strictly in sequence for one request; only the cache is
//! shared across requests.
//!
//! # Fallback
//!
//! When the model call fails (after retries) or its output cannot be
//! recovered, the precheck hints become the finding set. Such degraded
//! responses carry `metadata.degraded = true`, a `fallback_reason` and
//! `diagnostics`, and are never cached.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use crate::cache::sqlite::SqliteBackend;
use crate::cache::{CacheBackend, CacheKey, ResultCache};
use crate::config::Config;
use crate::detect::detect_file_type;
use crate::error::{AnalysisError, InvokeError, RecoveryError};
use crate::llm::{Completion, ModelInvoker};
use crate::models::{
    AnalysisResponse, AnalyzeRequest, FileType, FindingType, HintKind, NormalizedFinding,
    ParserHint, PipelineMetadata, Severity,
};
use crate::normalize::Normalizer;
use crate::precheck::run_precheck;
use crate::prompt::{build_prompt, PromptInput};
use crate::recovery::recover;
use crate::references::{ReferenceProvider, StaticReferences};
use crate::sampler::truncate_content;
use crate::text::{clip, LineIndex};

/// Upper bound on `max_errors` in a request.
pub const MAX_ERRORS_LIMIT: u32 = 1000;

const RAW_DIAGNOSTIC_CHARS: usize = 2000;

/// A finished analysis.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub response: AnalysisResponse,
    /// The serialized response; byte-identical for a cache hit.
    pub body: String,
    pub cache_hit: bool,
}

/// Why the model's answer could not be used.
enum ModelFailure {
    Invoke(InvokeError),
    Recovery(RecoveryError),
}

impl ModelFailure {
    fn reason(&self) -> String {
        match self {
            ModelFailure::Invoke(e) => format!("model_unavailable: {}", e),
            ModelFailure::Recovery(e) => format!("{}: {}", e.code(), e),
        }
    }

    fn diagnostics(&self, retry_count: u32) -> serde_json::Value {
        match self {
            ModelFailure::Invoke(e) => json!({
                "code": "model_unavailable",
                "message": e.to_string(),
                "retryable": e.is_retryable(),
                "retry_count": retry_count,
            }),
            ModelFailure::Recovery(RecoveryError::LlmParse { raw }) => json!({
                "code": "llm_parse_error",
                "raw_output": clip(raw, RAW_DIAGNOSTIC_CHARS),
            }),
            ModelFailure::Recovery(RecoveryError::SchemaValidation { parsed, violations }) => json!({
                "code": "schema_validation_error",
                "violations": violations,
                "parsed": parsed,
            }),
        }
    }
}

/// Results of the post-normalization checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalized {
    pub findings: Vec<NormalizedFinding>,
    pub passed: usize,
    pub failed: usize,
}

/// Checks, de-duplicates, orders and caps normalized findings.
///
/// A finding passes when its message is non-empty, its confidence lies in
/// `[0, 1]`, and its line/column are both null or both valid for `content`.
pub fn finalize_findings(
    findings: Vec<NormalizedFinding>,
    content: &str,
    max_errors: u32,
) -> Finalized {
    let index = LineIndex::new(content);
    let sane = |f: &NormalizedFinding| {
        let position_ok = match (f.line, f.column) {
            (None, None) => true,
            (Some(l), Some(c)) => index
                .line_len(l)
                .is_some_and(|len| c >= 1 && c <= len + 1),
            _ => false,
        };
        !f.message.trim().is_empty()
            && f.confidence.is_finite()
            && (0.0..=1.0).contains(&f.confidence)
            && position_ok
    };

    let total = findings.len();
    let mut seen = HashSet::new();
    let mut kept: Vec<NormalizedFinding> = Vec::with_capacity(total);
    let mut failed = 0;
    for f in findings {
        if !sane(&f) {
            log::debug!("dropping finding that failed sanity checks: {:?}", f.message);
            failed += 1;
            continue;
        }
        if seen.insert((f.line, f.column, f.message.trim().to_lowercase())) {
            kept.push(f);
        }
    }

    kept.sort_by_key(|f| (f.line.is_none(), f.line, f.column));
    kept.truncate(max_errors as usize);

    Finalized {
        findings: kept,
        passed: total - failed,
        failed,
    }
}

/// Turns a precheck hint into a ground-truth finding.
pub fn hint_to_finding(hint: &ParserHint, index: &LineIndex<'_>) -> NormalizedFinding {
    let (line, column) = match (hint.line, hint.position) {
        (Some(l), _) if l >= 1 && l <= index.line_count() => {
            let len = index.line_len(l).unwrap_or(0);
            (Some(l), Some(hint.column.unwrap_or(1).clamp(1, len + 1)))
        }
        (_, Some(p)) => match index.offset_to_line_col(p) {
            Some((l, c)) => (Some(l), Some(c)),
            None => (None, None),
        },
        _ => (None, None),
    };
    let (finding_type, severity, default_category) = match hint.kind {
        HintKind::SyntaxError => (FindingType::Error, Severity::High, "syntax"),
        HintKind::StructureError => (FindingType::Error, Severity::Medium, "structure"),
        HintKind::Warning => (FindingType::Warning, Severity::Low, "format"),
    };
    let position = line.and_then(|l| index.line_col_to_offset(l, column));

    NormalizedFinding {
        line,
        column,
        position: hint.position.or(position),
        message: hint.message.clone(),
        finding_type,
        category: hint
            .category
            .clone()
            .unwrap_or_else(|| default_category.to_string()),
        severity,
        confidence: 1.0,
        explanation: "Detected by strict local parsing of the original file.".to_string(),
        suggestions: Vec::new(),
        is_approximate: false,
        position_note: None,
    }
}

/// Runs the whole pipeline for one request.
pub struct Analyzer {
    config: Config,
    invoker: ModelInvoker,
    references: Arc<dyn ReferenceProvider>,
    cache: Option<Arc<ResultCache>>,
}

impl Analyzer {
    pub fn new(
        config: Config,
        invoker: ModelInvoker,
        references: Arc<dyn ReferenceProvider>,
        cache: Option<Arc<ResultCache>>,
    ) -> Self {
        Self {
            config,
            invoker,
            references,
            cache,
        }
    }

    /// Builds an analyzer with the HTTP model transport, the built-in
    /// references and the configured cache.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let invoker = ModelInvoker::from_config(&config.model)?;
        let references: Arc<dyn ReferenceProvider> =
            Arc::new(StaticReferences::new(config.analysis.rag_version.clone()));
        let cache = if config.cache.enabled {
            Some(Arc::new(open_cache(&config, references.version()).await))
        } else {
            None
        };
        Ok(Self::new(config, invoker, references, cache))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    pub async fn analyze(&self, request: AnalyzeRequest) -> Result<AnalysisOutcome, AnalysisError> {
        self.analyze_with(request, true).await
    }

    /// Like [`analyze`](Self::analyze); `use_cache = false` neither reads nor
    /// writes the cache.
    pub async fn analyze_with(
        &self,
        request: AnalyzeRequest,
        use_cache: bool,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let started = Instant::now();
        let content = request.content.as_str();
        if content.trim().is_empty() {
            return Err(AnalysisError::BadRequest("content must not be empty".to_string()));
        }

        let max_errors = request
            .max_errors
            .unwrap_or(self.config.analysis.default_max_errors);
        if !(1..=MAX_ERRORS_LIMIT).contains(&max_errors) {
            return Err(AnalysisError::BadRequest(format!(
                "max_errors must be between 1 and {}",
                MAX_ERRORS_LIMIT
            )));
        }

        let detected = detect_file_type(content);
        let file_type = match request.file_type.as_deref().map(str::trim) {
            None | Some("") => detected,
            Some(name) if name.eq_ignore_ascii_case("auto") => detected,
            Some(name) => FileType::parse(name).ok_or_else(|| {
                AnalysisError::BadRequest(format!(
                    "unsupported file_type '{}' (expected auto, json, csv, xml or yaml)",
                    name
                ))
            })?,
        };

        let hints = run_precheck(content, file_type);
        let sampled = truncate_content(content, &hints, &self.config.sampling.sampler());
        log::debug!(
            "{} file: {} chars, {} hint(s), truncated={}",
            file_type,
            sampled.map.original_length,
            hints.len(),
            sampled.map.was_truncated
        );

        let cache = self.cache.as_ref().filter(|_| use_cache);
        let key = CacheKey::new(content, file_type, max_errors);
        if let Some(cache) = cache {
            if let Some(entry) = cache.lookup(&key).await {
                match serde_json::from_str::<AnalysisResponse>(&entry.response) {
                    Ok(response) => {
                        log::info!("cache hit for {} ({})", key.storage_key(), entry.request_id);
                        return Ok(AnalysisOutcome {
                            response,
                            body: entry.response,
                            cache_hit: true,
                        });
                    }
                    Err(e) => log::warn!("ignoring unreadable cached response: {}", e),
                }
            }
        }

        let references = self.references.snippets(file_type, &hints);
        let prompt = build_prompt(&PromptInput {
            file_type,
            file_name: request.file_name.as_deref(),
            max_errors,
            sampled: &sampled,
            hints: &hints,
            references: &references,
        });

        let stream = request.stream.unwrap_or(self.config.model.stream);
        let invocation = self
            .invoker
            .invoke(&prompt, self.config.model.max_tokens, stream)
            .await;
        let retry_count = invocation.retry_count;

        let (usage, result) = match invocation.outcome {
            Ok(Completion { text, usage }) => (usage, recover(&text).map_err(ModelFailure::Recovery)),
            Err(e) => (None, Err(ModelFailure::Invoke(e))),
        };

        let index = LineIndex::new(content);
        let (normalized, analysis_confidence, failure) = match result {
            Ok(report) => {
                log::debug!(
                    "model returned {} finding(s) via {}",
                    report.findings.len(),
                    report.strategy
                );
                let normalizer = Normalizer::new(content, Some(&sampled));
                (
                    normalizer.normalize_all(&report.findings),
                    report.analysis_confidence,
                    None,
                )
            }
            Err(failure) => {
                log::warn!("falling back to precheck results: {}", failure.reason());
                if let ModelFailure::Recovery(RecoveryError::LlmParse { raw }) = &failure {
                    log::debug!("unparseable model output: {}", clip(raw, RAW_DIAGNOSTIC_CHARS));
                }
                let findings: Vec<NormalizedFinding> =
                    hints.iter().map(|h| hint_to_finding(h, &index)).collect();
                let confidence = if hints.is_empty() { 0.0 } else { 0.5 };
                (findings, Some(confidence), Some(failure))
            }
        };

        let finalized = finalize_findings(normalized, content, max_errors);
        let analysis_confidence = analysis_confidence
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or_else(|| mean_confidence(&finalized.findings));

        let request_id = uuid::Uuid::new_v4().to_string();
        let degraded = failure.is_some();
        let response = AnalysisResponse {
            total_errors: finalized.findings.len(),
            errors: finalized.findings,
            analysis_confidence,
            metadata: PipelineMetadata {
                request_id: request_id.clone(),
                file_type,
                detected_file_type: detected,
                file_name: request.file_name.clone(),
                was_truncated: sampled.map.was_truncated,
                provider: self.config.model.provider.clone(),
                model: self.invoker.model().to_string(),
                model_version: self.config.model.model_version.clone(),
                rag_version: self.references.version().to_string(),
                usage,
                retry_count,
                latency_ms: started.elapsed().as_millis() as u64,
                sanity_checks_passed: finalized.passed,
                sanity_checks_failed: finalized.failed,
                degraded,
                fallback_reason: failure.as_ref().map(ModelFailure::reason),
                diagnostics: failure.as_ref().map(|f| f.diagnostics(retry_count)),
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        };

        let body = serde_json::to_string(&response)
            .map_err(|e| AnalysisError::Internal(format!("serializing response: {}", e)))?;

        if let Some(cache) = cache.filter(|_| !degraded) {
            if let Err(e) = cache
                .store(&key, &request_id, self.invoker.model(), &body)
                .await
            {
                log::warn!("could not cache analysis {}: {}", request_id, e);
            }
        }

        log::info!(
            "analyzed {} {} file: {} finding(s), degraded={}, {} ms",
            request.file_name.as_deref().unwrap_or("<inline>"),
            file_type,
            response.total_errors,
            degraded,
            response.metadata.latency_ms
        );

        Ok(AnalysisOutcome {
            response,
            body,
            cache_hit: false,
        })
    }
}

fn mean_confidence(findings: &[NormalizedFinding]) -> f64 {
    if findings.is_empty() {
        return 1.0;
    }
    findings.iter().map(|f| f.confidence).sum::<f64>() / findings.len() as f64
}

/// Opens the configured cache. A primary that cannot be opened leaves the
/// cache running on its in-memory fallback.
pub async fn open_cache(config: &Config, rag_version: &str) -> ResultCache {
    let primary: Option<Arc<dyn CacheBackend>> = match config.cache.primary.as_str() {
        "sqlite" => match SqliteBackend::open(&config.cache.path).await {
            Ok(b) => Some(Arc::new(b)),
            Err(e) => {
                log::warn!(
                    "cache database {} unavailable ({:#}); using in-memory cache",
                    config.cache.path.display(),
                    e
                );
                None
            }
        },
        _ => None,
    };
    ResultCache::new(
        primary,
        config.cache.ttl_secs,
        &config.model.model_version,
        rag_version,
    )
}
