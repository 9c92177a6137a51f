//! Provider adapters against a local stand-in vendor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use dualtrans::translate::providers::{
    ChatMessage, ChatOptions, ChatProvider, HttpProviderFactory, ProviderFactory, ProviderKind, RetryPolicy,
};
use dualtrans::translate::TranslateError;

#[derive(Clone)]
struct Script {
    statuses: Arc<Vec<u16>>,
    hits: Arc<AtomicUsize>,
}

impl Script {
    fn new(statuses: &[u16]) -> Self {
        Self {
            statuses: Arc::new(statuses.to_vec()),
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Status for the next call; 200 once the script runs out.
    fn next(&self) -> StatusCode {
        let n = self.hits.fetch_add(1, Ordering::SeqCst);
        let code = self.statuses.get(n).copied().unwrap_or(200);
        StatusCode::from_u16(code).unwrap()
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn completions(State(script): State<Script>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sk-test") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
    }
    let status = script.next();
    if status != StatusCode::OK {
        return (status, Json(json!({"error": {"message": "scripted failure"}})));
    }
    (
        status,
        Json(json!({
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Bonjour"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        })),
    )
}

async fn messages(State(script): State<Script>, headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    script.next();
    assert_eq!(headers.get("x-api-key").unwrap(), "sk-test");
    assert!(headers.get("anthropic-version").is_some());
    assert_eq!(body["system"], "be brief");
    (
        StatusCode::OK,
        Json(json!({
            "model": "claude-3-5-haiku-latest",
            "content": [{"type": "text", "text": "Hallo"}],
            "usage": {"input_tokens": 9, "output_tokens": 2}
        })),
    )
}

async fn generate(
    State(script): State<Script>,
    Path(target): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    script.next();
    assert_eq!(target, "gemini-1.5-flash:generateContent");
    assert_eq!(headers.get("x-goog-api-key").unwrap(), "sk-test");
    (
        StatusCode::OK,
        Json(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Ciao"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 1, "totalTokenCount": 8},
            "modelVersion": "gemini-1.5-flash"
        })),
    )
}

async fn spawn_vendor(script: Script) -> String {
    let app = Router::new()
        .route("/chat/completions", post(completions))
        .route("/v1/messages", post(messages))
        .route("/v1beta/models/:target", post(generate))
        .with_state(script);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn factory(kind: ProviderKind, base_url: String) -> HttpProviderFactory {
    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
    };
    HttpProviderFactory::new(reqwest::Client::new(), retry).with_base_url(kind, base_url)
}

async fn chat_once(kind: ProviderKind, script: &Script) -> Result<dualtrans::translate::providers::ChatResponse, TranslateError> {
    let base = spawn_vendor(script.clone()).await;
    let provider = factory(kind, base).build(kind, "sk-test")?;
    let messages = [ChatMessage::system("be brief"), ChatMessage::user("Hello")];
    provider
        .chat(&messages, &ChatOptions::default(), &CancellationToken::new())
        .await
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let script = Script::new(&[503, 429]);
    let response = chat_once(ProviderKind::OpenAi, &script).await.unwrap();
    assert_eq!(response.content, "Bonjour");
    assert_eq!(response.tokens_used.total, 15);
    assert_eq!(script.hits(), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let script = Script::new(&[400]);
    let err = chat_once(ProviderKind::OpenAi, &script).await.unwrap_err();
    match err {
        TranslateError::ProviderTerminal { provider, status, message } => {
            assert_eq!(provider, "openai");
            assert_eq!(status, 400);
            assert!(message.contains("scripted failure"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(script.hits(), 1);
}

#[tokio::test]
async fn persistent_server_errors_exhaust_attempts() {
    let script = Script::new(&[500, 502, 500, 500]);
    let err = chat_once(ProviderKind::OpenAi, &script).await.unwrap_err();
    assert!(matches!(err, TranslateError::ProviderTransient { attempts: 3, .. }));
    assert_eq!(script.hits(), 3);
}

#[tokio::test]
async fn compatible_vendors_share_the_openai_wire() {
    let script = Script::new(&[]);
    let response = chat_once(ProviderKind::DeepSeek, &script).await.unwrap();
    assert_eq!(response.content, "Bonjour");
}

#[tokio::test]
async fn anthropic_adapter_speaks_messages_api() {
    let script = Script::new(&[]);
    let response = chat_once(ProviderKind::Anthropic, &script).await.unwrap();
    assert_eq!(response.content, "Hallo");
    assert_eq!(response.tokens_used.total, 11);
    assert_eq!(script.hits(), 1);
}

#[tokio::test]
async fn gemini_adapter_speaks_generate_content() {
    let script = Script::new(&[]);
    let response = chat_once(ProviderKind::Gemini, &script).await.unwrap();
    assert_eq!(response.content, "Ciao");
    assert_eq!(response.model, "gemini-1.5-flash");
}

#[tokio::test]
async fn cancellation_stops_the_retry_loop() {
    let script = Script::new(&[503, 503, 503]);
    let base = spawn_vendor(script.clone()).await;
    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_secs(30),
    };
    let provider = HttpProviderFactory::new(reqwest::Client::new(), retry)
        .with_base_url(ProviderKind::OpenAi, base)
        .build(ProviderKind::OpenAi, "sk-test")
        .unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });
    let err = provider
        .chat(&[ChatMessage::user("Hello")], &ChatOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, TranslateError::Cancelled));
    assert_eq!(script.hits(), 1);
}
