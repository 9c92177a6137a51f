//! Free, key-less translation backends raced by `racer::Racer`.
//! Every call honours a cooperative cancel token; being cancelled is
//! reported as `BackendError::Cancelled`, never as a failure message.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::AUTO_LANG;

/// A successful free translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeTranslation {
    pub translated_text: String,
    pub detected_source_lang: Option<String>,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Another backend won the race (or the caller gave up).
    #[error("cancelled")]
    Cancelled,
    #[error("request failed: {0}")]
    Http(String),
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("timed out")]
    Timeout,
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Http(e.to_string())
        }
    }
}

/// A no-key translation endpoint.
#[async_trait]
pub trait FreeBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        cancel: &CancellationToken,
    ) -> Result<FreeTranslation, BackendError>;

    /// Whether `detect` does anything useful.
    fn supports_detection(&self) -> bool {
        false
    }

    async fn detect(
        &self,
        _text: &str,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>, BackendError> {
        Ok(None)
    }
}

/// Build the shared HTTP client for free backends.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(timeout)
        .build()
}

async fn send_cancellable(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<Value, BackendError> {
    let fetch = async {
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        resp.json::<Value>()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackendError::Cancelled),
        result = fetch => result,
    }
}

/// Google's public `translate_a/single?client=gtx` endpoint.
pub struct GoogleGtx {
    http: reqwest::Client,
    base_url: String,
}

impl GoogleGtx {
    pub const DEFAULT_BASE_URL: &'static str = "https://translate.googleapis.com";

    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, text: &str, source_lang: &str, target_lang: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}/translate_a/single", self.base_url))
            .query(&[
                ("client", "gtx"),
                ("sl", google_lang(source_lang)),
                ("tl", google_lang(target_lang)),
                ("dt", "t"),
                ("q", text),
            ])
    }
}

fn google_lang(code: &str) -> &str {
    match code.to_ascii_lowercase().as_str() {
        "zh" | "zh-cn" | "zh-hans" => "zh-CN",
        "zh-tw" | "zh-hant" => "zh-TW",
        _ => code,
    }
}

/// Parse the gtx nested-array reply: `[[[translated, original, ...], ...], null, "detected"]`.
pub fn parse_gtx(body: &Value) -> Result<(String, Option<String>), BackendError> {
    let segments = body
        .get(0)
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::Malformed("missing segment array".into()))?;
    let translated: String = segments
        .iter()
        .filter_map(|seg| seg.get(0).and_then(Value::as_str))
        .collect();
    if translated.is_empty() {
        return Err(BackendError::Malformed("empty translation".into()));
    }
    let detected = body.get(2).and_then(Value::as_str).map(str::to_string);
    Ok((translated, detected))
}

#[async_trait]
impl FreeBackend for GoogleGtx {
    fn name(&self) -> &str {
        "google"
    }

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        cancel: &CancellationToken,
    ) -> Result<FreeTranslation, BackendError> {
        let body = send_cancellable(self.request(text, source_lang, target_lang), cancel).await?;
        let (translated_text, detected_source_lang) = parse_gtx(&body)?;
        Ok(FreeTranslation {
            translated_text,
            detected_source_lang,
            provider: self.name().to_string(),
        })
    }

    fn supports_detection(&self) -> bool {
        true
    }

    async fn detect(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, BackendError> {
        let body = send_cancellable(self.request(text, AUTO_LANG, "en"), cancel).await?;
        Ok(body.get(2).and_then(Value::as_str).map(str::to_string))
    }
}

/// MyMemory's public `get` endpoint.
pub struct MyMemory {
    http: reqwest::Client,
    base_url: String,
}

impl MyMemory {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.mymemory.translated.net";

    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MyMemoryReply {
    response_data: MyMemoryData,
    response_status: Value,
    #[serde(default)]
    response_details: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MyMemoryData {
    translated_text: String,
    #[serde(default)]
    detected_language: Option<String>,
}

pub fn parse_mymemory(body: Value) -> Result<(String, Option<String>), BackendError> {
    let reply: MyMemoryReply =
        serde_json::from_value(body).map_err(|e| BackendError::Malformed(e.to_string()))?;
    // responseStatus is a number on success and sometimes a string on errors
    // out-of-range codes become 0 rather than wrapping onto a real one
    let status: u16 = match &reply.response_status {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()).unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    };
    if status != 200 {
        return Err(BackendError::Status {
            status,
            body: reply
                .response_details
                .unwrap_or(reply.response_data.translated_text),
        });
    }
    if reply.response_data.translated_text.trim().is_empty() {
        return Err(BackendError::Malformed("empty translation".into()));
    }
    Ok((
        reply.response_data.translated_text,
        reply.response_data.detected_language,
    ))
}

#[async_trait]
impl FreeBackend for MyMemory {
    fn name(&self) -> &str {
        "mymemory"
    }

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        cancel: &CancellationToken,
    ) -> Result<FreeTranslation, BackendError> {
        let source = if source_lang == AUTO_LANG {
            "Autodetect"
        } else {
            google_lang(source_lang)
        };
        let langpair = format!("{}|{}", source, google_lang(target_lang));
        let request = self
            .http
            .get(format!("{}/get", self.base_url))
            .query(&[("q", text), ("langpair", langpair.as_str())]);
        let body = send_cancellable(request, cancel).await?;
        let (translated_text, detected_source_lang) = parse_mymemory(body)?;
        Ok(FreeTranslation {
            translated_text,
            detected_source_lang,
            provider: self.name().to_string(),
        })
    }
}

/// Lingva (a Google Translate front-end) REST API.
pub struct Lingva {
    http: reqwest::Client,
    base_url: String,
}

impl Lingva {
    pub const DEFAULT_BASE_URL: &'static str = "https://lingva.ml";

    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, text: &str, source_lang: &str, target_lang: &str) -> Result<reqwest::Url, BackendError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| BackendError::Http(format!("bad lingva base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| BackendError::Http("lingva base url cannot be a base".into()))?
            .pop_if_empty()
            .extend(["api", "v1", source_lang, target_lang, text]);
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
struct LingvaReply {
    translation: String,
    #[serde(default)]
    info: Option<LingvaInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LingvaInfo {
    #[serde(default)]
    detected_source: Option<String>,
}

#[async_trait]
impl FreeBackend for Lingva {
    fn name(&self) -> &str {
        "lingva"
    }

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        cancel: &CancellationToken,
    ) -> Result<FreeTranslation, BackendError> {
        let url = self.url(text, source_lang, target_lang)?;
        let body = send_cancellable(self.http.get(url), cancel).await?;
        let reply: LingvaReply =
            serde_json::from_value(body).map_err(|e| BackendError::Malformed(e.to_string()))?;
        if reply.translation.trim().is_empty() {
            return Err(BackendError::Malformed("empty translation".into()));
        }
        Ok(FreeTranslation {
            translated_text: reply.translation,
            detected_source_lang: reply.info.and_then(|i| i.detected_source),
            provider: self.name().to_string(),
        })
    }
}
