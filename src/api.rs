//! HTTP surface: JSON handlers over the translation service and memory store.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::cancellation::GenerationGuard;
use crate::memory::{MemoryEntry, MemoryError, MemoryQuery, MemoryStats, NewMemoryEntry};
use crate::metrics::MetricsSnapshot;
use crate::translate::providers::{ApiKeys, ChatMessage};
use crate::translate::racer::Detection;
use crate::translate::service::{BatchRequest, ProviderCatalog, RefineRequest, TranslateOptions};
use crate::translate::{
    BatchOutcome, ContextType, DualResult, EngineChoice, PageContext, RefineOutcome, TranslateError,
    TranslationFragment, TranslationOutcome,
};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: code.to_string(),
            message: message.into(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    error(StatusCode::BAD_REQUEST, "invalid_request", message)
}

fn translate_error(err: TranslateError) -> ApiError {
    let status = match &err {
        TranslateError::InvalidRequest(_) | TranslateError::NoCredentials(_) => StatusCode::BAD_REQUEST,
        TranslateError::ProviderTerminal { .. }
        | TranslateError::MalformedResponse { .. }
        | TranslateError::AllBackendsFailed(_) => StatusCode::BAD_GATEWAY,
        TranslateError::ProviderTransient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        TranslateError::Cancelled => StatusCode::CONFLICT,
    };
    error(status, err.code(), err.to_string())
}

fn memory_error(err: MemoryError) -> ApiError {
    match err {
        MemoryError::NotFound(_) => error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        MemoryError::InvalidQuality(_) => bad_request(err.to_string()),
        MemoryError::Sqlite(_) => {
            warn!(error = %err, "memory store failure");
            error(StatusCode::INTERNAL_SERVER_ERROR, "memory_unavailable", err.to_string())
        }
    }
}

/// Unwrap a JSON body, turning every rejection into a 400.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| bad_request(rejection.body_text()))
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| bad_request(format!("{field} is required")))
}

/// `context` is either a content category name or a page-context object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContextField {
    Name(String),
    Object(ContextObject),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ContextObject {
    #[serde(alias = "type")]
    context_type: Option<ContextType>,
    #[serde(flatten)]
    page: PageContext,
}

/// Fields shared by every translation request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CommonFields {
    context: Option<ContextField>,
    context_type: Option<ContextType>,
    model: Option<String>,
    model_id: Option<String>,
    api_keys: Option<ApiKeys>,
    use_cache: Option<bool>,
    use_memory: Option<bool>,
}

impl CommonFields {
    fn into_options(self) -> Result<(TranslateOptions, Option<ContextType>), ApiError> {
        let engine = EngineChoice::parse(self.model.as_deref()).map_err(translate_error)?;
        let (from_context, page) = match self.context {
            None => (None, PageContext::default()),
            Some(ContextField::Object(obj)) => (obj.context_type, obj.page),
            Some(ContextField::Name(name)) => {
                let parsed: Option<ContextType> =
                    serde_json::from_value(serde_json::Value::String(name.trim().to_ascii_lowercase())).ok();
                match parsed {
                    Some(kind) => (Some(kind), PageContext::default()),
                    // free-form context reads as a subject domain
                    None => (
                        None,
                        PageContext {
                            domain: Some(name),
                            ..Default::default()
                        },
                    ),
                }
            }
        };
        let options = TranslateOptions {
            engine,
            model_id: self.model_id.filter(|m| !m.trim().is_empty()),
            api_keys: self.api_keys.unwrap_or_default(),
            page,
            use_cache: self.use_cache.unwrap_or(true),
            use_memory: self.use_memory.unwrap_or(true),
        };
        Ok((options, self.context_type.or(from_context)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateBody {
    text: Option<String>,
    target_lang: Option<String>,
    source_lang: Option<String>,
    #[serde(flatten)]
    common: CommonFields,
}

impl TranslateBody {
    fn into_parts(self) -> Result<(TranslationFragment, TranslateOptions), ApiError> {
        let text = required(self.text, "text")?;
        let target_lang = required(self.target_lang, "targetLang")?;
        let (options, context_type) = self.common.into_options()?;
        let fragment = TranslationFragment {
            text,
            source_lang: self.source_lang.filter(|l| !l.trim().is_empty()),
            target_lang,
            context_type,
        };
        Ok((fragment, options))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchBody {
    texts: Option<Vec<String>>,
    target_lang: Option<String>,
    source_lang: Option<String>,
    session_id: Option<String>,
    #[serde(flatten)]
    common: CommonFields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectBody {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefineBody {
    original_text: Option<String>,
    current_translation: Option<String>,
    instruction: Option<String>,
    source_lang: Option<String>,
    target_lang: Option<String>,
    #[serde(default)]
    history: Vec<ChatMessage>,
    #[serde(flatten)]
    common: CommonFields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryBody {
    source_text: Option<String>,
    target_text: Option<String>,
    source_lang: Option<String>,
    target_lang: Option<String>,
    context_type: Option<ContextType>,
    model_used: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityBody {
    #[serde(alias = "qualityScore")]
    score: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MemoryList {
    entries: Vec<MemoryEntry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/translate", post(translate))
        .route("/translate/dual", post(dual_translate))
        .route("/translate/batch", post(batch_translate))
        .route("/translate/free", post(free_translate))
        .route("/translate/detect", post(detect))
        .route("/translate/providers", get(providers))
        .route("/translate/refine", post(refine))
        .route("/translate/sessions/:id", delete(cancel_session))
        .route("/memory", get(list_memory).post(create_memory))
        .route("/memory/stats", get(memory_stats))
        .route("/memory/:id", get(get_memory).delete(delete_memory))
        .route("/memory/:id/quality", put(rate_memory))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn translate(
    State(state): State<AppState>,
    payload: Result<Json<TranslateBody>, JsonRejection>,
) -> ApiResult<TranslationOutcome> {
    let (fragment, options) = json_body(payload)?.into_parts()?;
    state
        .service
        .translate(fragment, &options)
        .await
        .map(Json)
        .map_err(translate_error)
}

async fn dual_translate(
    State(state): State<AppState>,
    payload: Result<Json<TranslateBody>, JsonRejection>,
) -> ApiResult<DualResult> {
    let (fragment, options) = json_body(payload)?.into_parts()?;
    state
        .service
        .dual_translate(fragment, &options)
        .await
        .map(Json)
        .map_err(translate_error)
}

async fn free_translate(
    State(state): State<AppState>,
    payload: Result<Json<TranslateBody>, JsonRejection>,
) -> ApiResult<TranslationOutcome> {
    let (fragment, options) = json_body(payload)?.into_parts()?;
    state
        .service
        .free_translate(fragment, &options)
        .await
        .map(Json)
        .map_err(translate_error)
}

async fn batch_translate(
    State(state): State<AppState>,
    payload: Result<Json<BatchBody>, JsonRejection>,
) -> ApiResult<BatchOutcome> {
    let body = json_body(payload)?;
    let texts = body.texts.ok_or_else(|| bad_request("texts is required"))?;
    let target_lang = required(body.target_lang, "targetLang")?;
    let (options, context_type) = body.common.into_options()?;
    let request = BatchRequest {
        texts,
        source_lang: body.source_lang,
        target_lang,
        context_type,
    };

    // The lease finishes the session on drop, including client disconnects.
    let lease = body
        .session_id
        .filter(|s| !s.trim().is_empty())
        .map(|id| state.sessions.lease(&id));
    let detached;
    let guard = match &lease {
        Some(lease) => lease.guard(),
        None => {
            detached = GenerationGuard::detached();
            &detached
        }
    };
    state
        .service
        .batch_translate(request, &options, guard)
        .await
        .map(Json)
        .map_err(translate_error)
}

async fn detect(
    State(state): State<AppState>,
    payload: Result<Json<DetectBody>, JsonRejection>,
) -> ApiResult<Detection> {
    let text = required(json_body(payload)?.text, "text")?;
    state
        .service
        .detect_language(&text)
        .await
        .map(Json)
        .map_err(translate_error)
}

async fn providers(State(state): State<AppState>) -> Json<ProviderCatalog> {
    Json(state.service.providers())
}

async fn refine(
    State(state): State<AppState>,
    payload: Result<Json<RefineBody>, JsonRejection>,
) -> ApiResult<RefineOutcome> {
    let body = json_body(payload)?;
    let request = RefineRequest {
        original_text: required(body.original_text, "originalText")?,
        current_translation: required(body.current_translation, "currentTranslation")?,
        instruction: required(body.instruction, "instruction")?,
        source_lang: body.source_lang,
        target_lang: required(body.target_lang, "targetLang")?,
        history: body.history,
    };
    let (options, _) = body.common.into_options()?;
    state
        .service
        .refine(request, &options)
        .await
        .map(Json)
        .map_err(translate_error)
}

async fn cancel_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.sessions.cancel(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn list_memory(
    State(state): State<AppState>,
    Query(query): Query<MemoryQuery>,
) -> ApiResult<MemoryList> {
    let entries = state.memory.list(&query).map_err(memory_error)?;
    Ok(Json(MemoryList { entries }))
}

async fn create_memory(
    State(state): State<AppState>,
    payload: Result<Json<MemoryBody>, JsonRejection>,
) -> Result<(StatusCode, Json<MemoryEntry>), ApiError> {
    let body = json_body(payload)?;
    let source_text = required(body.source_text, "sourceText")?;
    let target_text = required(body.target_text, "targetText")?;
    let source_lang = required(body.source_lang, "sourceLang")?;
    let target_lang = required(body.target_lang, "targetLang")?;

    let mut fragment = TranslationFragment::new(source_text, target_lang).with_source(source_lang.clone());
    fragment.context_type = body.context_type;
    let entry = NewMemoryEntry::from_fragment(
        &fragment,
        &source_lang,
        target_text,
        body.model_used.unwrap_or_else(|| "manual".to_string()),
    );
    let stored = state.memory.upsert_now(&entry).map_err(memory_error)?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn memory_stats(State(state): State<AppState>) -> ApiResult<MemoryStats> {
    state.memory.stats().map(Json).map_err(memory_error)
}

async fn get_memory(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<MemoryEntry> {
    match state.memory.get(id).map_err(memory_error)? {
        Some(entry) => Ok(Json(entry)),
        None => Err(memory_error(MemoryError::NotFound(id))),
    }
}

async fn delete_memory(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode, ApiError> {
    if state.memory.delete(id).map_err(memory_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(memory_error(MemoryError::NotFound(id)))
    }
}

async fn rate_memory(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<QualityBody>, JsonRejection>,
) -> ApiResult<MemoryEntry> {
    let score = json_body(payload)?
        .score
        .ok_or_else(|| bad_request("score is required"))?;
    state.memory.set_quality(id, score).map(Json).map_err(memory_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(json: serde_json::Value) -> (TranslateOptions, Option<ContextType>) {
        serde_json::from_value::<CommonFields>(json)
            .unwrap()
            .into_options()
            .unwrap()
    }

    #[test]
    fn context_accepts_a_category_name() {
        let (_, kind) = common(serde_json::json!({"context": "Technical"}));
        assert_eq!(kind, Some(ContextType::Technical));
    }

    #[test]
    fn free_form_context_becomes_domain() {
        let (options, kind) = common(serde_json::json!({"context": "kubernetes release notes"}));
        assert_eq!(kind, None);
        assert_eq!(options.page.domain.as_deref(), Some("kubernetes release notes"));
    }

    #[test]
    fn context_object_carries_page_hints() {
        let (options, kind) = common(serde_json::json!({
            "context": {
                "type": "legal",
                "tone": "formal",
                "pageTitle": "Terms of Service",
                "terminology": [{"source": "party", "target": "partie"}]
            },
            "useCache": false
        }));
        assert_eq!(kind, Some(ContextType::Legal));
        assert_eq!(options.page.page_title.as_deref(), Some("Terms of Service"));
        assert_eq!(options.page.terminology.len(), 1);
        assert!(!options.use_cache);
        assert!(options.use_memory);
    }

    #[test]
    fn unknown_model_is_a_bad_request() {
        let err = serde_json::from_value::<CommonFields>(serde_json::json!({"model": "babelfish"}))
            .unwrap()
            .into_options()
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert_eq!(err.1.error, "invalid_request");
    }

    #[test]
    fn error_statuses() {
        let cases = [
            (TranslateError::NoCredentials("openai".into()), StatusCode::BAD_REQUEST),
            (TranslateError::Cancelled, StatusCode::CONFLICT),
            (TranslateError::AllBackendsFailed(Vec::new()), StatusCode::BAD_GATEWAY),
            (
                TranslateError::ProviderTransient {
                    provider: "groq".into(),
                    attempts: 3,
                    message: "status 503".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(translate_error(err).0, status);
        }
    }
}
