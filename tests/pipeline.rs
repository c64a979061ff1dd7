//! End-to-end pipeline tests with a scripted model transport.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use structlint::cache::ResultCache;
use structlint::config::Config;
use structlint::error::InvokeError;
use structlint::llm::{ChatRequest, Completion, CompletionTransport, ModelInvoker};
use structlint::models::{AnalyzeRequest, FileType, FindingType};
use structlint::pipeline::Analyzer;
use structlint::precheck::run_precheck;
use structlint::references::StaticReferences;
use structlint::sampler::truncate_content;

// ─── Test Fixtures ──────────────────────────────────────────────────

/// Answers every request with the same reply and remembers the last prompt.
struct FakeModel {
    reply: Result<String, InvokeError>,
    calls: AtomicU32,
    last_prompt: Mutex<Option<String>>,
}

impl FakeModel {
    fn answering(text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.into()),
            calls: AtomicU32::new(0),
            last_prompt: Mutex::new(None),
        })
    }

    fn failing(err: InvokeError) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(err),
            calls: AtomicU32::new(0),
            last_prompt: Mutex::new(None),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionTransport for FakeModel {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(request.messages[0].content.clone());
        self.reply.clone().map(|text| Completion { text, usage: None })
    }
}

fn analyzer(model: Arc<FakeModel>, max_retries: u32) -> Analyzer {
    let config = Config::minimal();
    let invoker = ModelInvoker::with_transport(model, "fake-model", max_retries, 5);
    let cache = ResultCache::in_memory(
        config.cache.ttl_secs,
        &config.model.model_version,
        &config.analysis.rag_version,
    );
    let references = Arc::new(StaticReferences::new(config.analysis.rag_version.clone()));
    Analyzer::new(config, invoker, references, Some(Arc::new(cache)))
}

fn request(content: &str, file_type: &str) -> AnalyzeRequest {
    AnalyzeRequest {
        content: content.to_string(),
        file_type: Some(file_type.to_string()),
        file_name: Some("input".to_string()),
        max_errors: None,
        stream: None,
    }
}

const PROFILE: &str = "{\n  \"name\": \"Ada\",\n  \"email\": null\n}";

fn email_report() -> String {
    json!({
        "errors": [{
            "line": 2,
            "column": 3,
            "message": "email must not be null",
            "type": "error",
            "category": "data",
            "severity": "medium",
            "confidence": 0.9,
            "explanation": "The email field is required.",
            "suggestions": [{"description": "Provide an email address", "safety": "manual_review"}],
            "snippet": "\"email\": null"
        }],
        "analysis_confidence": 0.8
    })
    .to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_model_finding_is_moved_to_verified_line() {
    let model = FakeModel::answering(format!("Here is the report:\n```json\n{}\n```", email_report()));
    let analyzer = analyzer(model.clone(), 0);

    let outcome = analyzer.analyze(request(PROFILE, "auto")).await.unwrap();
    assert!(!outcome.cache_hit);

    let response = &outcome.response;
    assert_eq!(response.metadata.file_type, FileType::Json);
    assert!(!response.metadata.degraded);
    assert_eq!(response.total_errors, 1);
    let f = &response.errors[0];
    assert_eq!(f.line, Some(3));
    assert_eq!(f.column, Some(3));
    assert!(!f.is_approximate);
    // one line away from the reported line, times the model's 0.9
    assert!((f.confidence - 0.8 * 0.9).abs() < 1e-9);
    assert!((response.analysis_confidence - 0.8).abs() < 1e-9);
    assert!(response.metadata.usage.unwrap().estimated);
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn test_repeat_request_is_byte_identical_cache_hit() {
    let model = FakeModel::answering(email_report());
    let analyzer = analyzer(model.clone(), 0);

    let first = analyzer.analyze(request(PROFILE, "json")).await.unwrap();
    let second = analyzer.analyze(request(PROFILE, "json")).await.unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.body, second.body);
    assert_eq!(model.calls(), 1, "a cache hit must not call the model");

    // max_errors is part of the key
    let mut other = request(PROFILE, "json");
    other.max_errors = Some(5);
    let third = analyzer.analyze(other).await.unwrap();
    assert!(!third.cache_hit);
    assert_eq!(model.calls(), 2);

    let stats = analyzer.cache().unwrap().stats(true).await;
    assert_eq!(stats.fallback.hits, 1);
    assert_eq!(stats.fallback.misses, 2);
    assert_eq!(stats.fallback.total_requests, 3);
}

#[tokio::test]
async fn test_model_failure_falls_back_to_precheck_hint() {
    let model = FakeModel::failing(InvokeError::Http {
        status: 503,
        body: "overloaded".into(),
    });
    let analyzer = analyzer(model.clone(), 0);

    let outcome = analyzer.analyze(request("{\"a\": 1,}", "auto")).await.unwrap();
    let response = &outcome.response;

    assert_eq!(response.total_errors, 1);
    let f = &response.errors[0];
    assert_eq!(f.finding_type, FindingType::Error);
    assert_eq!(f.category, "syntax");
    assert_eq!(f.line, Some(1));
    let pos = f.position.unwrap();
    assert!((7..=9).contains(&pos), "position {} not near 8", pos);

    assert!(response.metadata.degraded);
    assert!(response
        .metadata
        .fallback_reason
        .as_deref()
        .unwrap()
        .starts_with("model_unavailable"));
    assert_eq!(response.analysis_confidence, 0.5);

    // Degraded responses are not cached.
    let again = analyzer.analyze(request("{\"a\": 1,}", "auto")).await.unwrap();
    assert!(!again.cache_hit);
    assert_eq!(model.calls(), 2);
}

#[tokio::test]
async fn test_transient_failure_is_retried_once() {
    let model = FakeModel::failing(InvokeError::Timeout(30));
    let analyzer = analyzer(model.clone(), 1);

    let outcome = analyzer.analyze(request("{\"a\": 1,}", "json")).await.unwrap();
    assert_eq!(model.calls(), 2);
    assert_eq!(outcome.response.metadata.retry_count, 1);
    assert!(outcome.response.metadata.degraded);
}

#[tokio::test]
async fn test_unparseable_output_reports_diagnostics() {
    let model = FakeModel::answering("I could not find any problems, sorry!");
    let analyzer = analyzer(model, 0);

    let outcome = analyzer.analyze(request(PROFILE, "json")).await.unwrap();
    let meta = &outcome.response.metadata;
    assert!(meta.degraded);
    let diagnostics: &Value = meta.diagnostics.as_ref().unwrap();
    assert_eq!(diagnostics["code"], "llm_parse_error");
    assert!(diagnostics["raw_output"].as_str().unwrap().contains("sorry"));
    // No hints for valid JSON, so nothing is reported.
    assert_eq!(outcome.response.total_errors, 0);
    assert_eq!(outcome.response.analysis_confidence, 0.0);
}

#[tokio::test]
async fn test_bad_requests_are_rejected() {
    let analyzer = analyzer(FakeModel::answering(email_report()), 0);

    assert!(analyzer.analyze(request("   ", "json")).await.is_err());
    assert!(analyzer.analyze(request(PROFILE, "toml")).await.is_err());

    let mut too_many = request(PROFILE, "json");
    too_many.max_errors = Some(1001);
    assert!(analyzer.analyze(too_many).await.is_err());
}

#[tokio::test]
async fn test_sampled_line_is_mapped_back_to_original() {
    let mut content = String::from("id,name,value\n");
    for i in 1..=1500 {
        if i == 700 {
            content.push_str("700,name700,700,EXTRA\n");
        } else {
            content.push_str(&format!("{},name{},{}\n", i, i, i));
        }
    }

    // The model sees the sampled view, so it reports the sampled line number.
    let config = Config::minimal();
    let hints = run_precheck(&content, FileType::Csv);
    assert_eq!(hints.len(), 1);
    let sampled = truncate_content(&content, &hints, &config.sampling.sampler());
    assert!(sampled.map.was_truncated);
    let sampled_line = sampled
        .content
        .split('\n')
        .position(|l| l == "700,name700,700,EXTRA")
        .expect("error row kept in a window")
        + 1;
    assert_ne!(sampled_line, 701);

    let report = json!({
        "errors": [{
            "line": sampled_line,
            "column": 1,
            "message": "Row 700 has 4 columns but the header has 3",
            "type": "error",
            "category": "structure",
            "severity": "medium",
            "confidence": 1.0,
            "explanation": "Extra trailing field.",
            "suggestions": [],
            "snippet": "700,name700,700,EXTRA"
        }]
    })
    .to_string();
    let model = FakeModel::answering(report);
    let analyzer = analyzer(model.clone(), 0);

    let outcome = analyzer.analyze(request(&content, "csv")).await.unwrap();
    let response = &outcome.response;
    assert!(response.metadata.was_truncated);
    assert_eq!(response.total_errors, 1);
    assert_eq!(response.errors[0].line, Some(701));
    assert_eq!(response.errors[0].column, Some(1));

    let prompt = model.last_prompt.lock().unwrap().clone().unwrap();
    assert!(prompt.contains("700,name700,700,EXTRA"));
    assert!(prompt.chars().count() < content.chars().count());
}
