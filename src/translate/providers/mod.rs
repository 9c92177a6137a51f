//! LLM provider adapters behind one `ChatProvider` contract.
//! Vendors are looked up in a static catalog; adding one means adding a
//! catalog row and, for a new wire format, one adapter.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::TranslateError;
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    DeepSeek,
    Qwen,
    Mistral,
    Groq,
    OpenRouter,
}

impl ProviderKind {
    /// Priority order for automatic selection.
    pub const ALL: [ProviderKind; 8] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
        ProviderKind::DeepSeek,
        ProviderKind::Qwen,
        ProviderKind::Mistral,
        ProviderKind::Groq,
        ProviderKind::OpenRouter,
    ];

    pub fn id(self) -> &'static str {
        self.spec().id
    }

    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim().to_ascii_lowercase();
        let id = match id.as_str() {
            "claude" => "anthropic",
            "gpt" | "chatgpt" => "openai",
            "dashscope" | "tongyi" => "qwen",
            other => other,
        };
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    pub fn spec(self) -> &'static ProviderSpec {
        CATALOG
            .iter()
            .find(|spec| spec.kind == self)
            .unwrap_or(&CATALOG[0])
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Request/response dialect spoken by a vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    OpenAiChat,
    AnthropicMessages,
    GeminiGenerate,
}

/// Static description of one vendor.
#[derive(Debug)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    pub id: &'static str,
    pub display_name: &'static str,
    pub wire: WireFormat,
    pub base_url: &'static str,
    pub default_model: &'static str,
    pub models: &'static [&'static str],
}

pub static CATALOG: [ProviderSpec; 8] = [
    ProviderSpec {
        kind: ProviderKind::OpenAi,
        id: "openai",
        display_name: "OpenAI",
        wire: WireFormat::OpenAiChat,
        base_url: "https://api.openai.com/v1",
        default_model: "gpt-4o-mini",
        models: &["gpt-4o-mini", "gpt-4o", "gpt-4.1-mini", "gpt-4.1"],
    },
    ProviderSpec {
        kind: ProviderKind::Anthropic,
        id: "anthropic",
        display_name: "Anthropic",
        wire: WireFormat::AnthropicMessages,
        base_url: "https://api.anthropic.com",
        default_model: "claude-3-5-haiku-latest",
        models: &["claude-3-5-haiku-latest", "claude-3-5-sonnet-latest"],
    },
    ProviderSpec {
        kind: ProviderKind::Gemini,
        id: "gemini",
        display_name: "Google Gemini",
        wire: WireFormat::GeminiGenerate,
        base_url: "https://generativelanguage.googleapis.com",
        default_model: "gemini-1.5-flash",
        models: &["gemini-1.5-flash", "gemini-1.5-pro", "gemini-2.0-flash"],
    },
    ProviderSpec {
        kind: ProviderKind::DeepSeek,
        id: "deepseek",
        display_name: "DeepSeek",
        wire: WireFormat::OpenAiChat,
        base_url: "https://api.deepseek.com/v1",
        default_model: "deepseek-chat",
        models: &["deepseek-chat"],
    },
    ProviderSpec {
        kind: ProviderKind::Qwen,
        id: "qwen",
        display_name: "Qwen (DashScope)",
        wire: WireFormat::OpenAiChat,
        base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1",
        default_model: "qwen-turbo",
        models: &["qwen-turbo", "qwen-plus", "qwen-max"],
    },
    ProviderSpec {
        kind: ProviderKind::Mistral,
        id: "mistral",
        display_name: "Mistral",
        wire: WireFormat::OpenAiChat,
        base_url: "https://api.mistral.ai/v1",
        default_model: "mistral-small-latest",
        models: &["mistral-small-latest", "mistral-large-latest"],
    },
    ProviderSpec {
        kind: ProviderKind::Groq,
        id: "groq",
        display_name: "Groq",
        wire: WireFormat::OpenAiChat,
        base_url: "https://api.groq.com/openai/v1",
        default_model: "llama-3.1-8b-instant",
        models: &["llama-3.1-8b-instant", "llama-3.3-70b-versatile"],
    },
    ProviderSpec {
        kind: ProviderKind::OpenRouter,
        id: "openrouter",
        display_name: "OpenRouter",
        wire: WireFormat::OpenAiChat,
        base_url: "https://openrouter.ai/api/v1",
        default_model: "openai/gpt-4o-mini",
        models: &["openai/gpt-4o-mini", "anthropic/claude-3.5-haiku", "google/gemini-flash-1.5"],
    },
];

/// Caller-supplied provider → secret map. Read-only to the core.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ApiKeys(HashMap<String, String>);

impl ApiKeys {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self(keys)
    }

    /// True when at least one non-blank secret is present.
    pub fn has_any(&self) -> bool {
        self.0.values().any(|v| !v.trim().is_empty())
    }

    /// Non-blank key for `kind`, matching ids case-insensitively.
    pub fn get(&self, kind: ProviderKind) -> Option<&str> {
        self.0
            .iter()
            .filter(|(name, _)| ProviderKind::from_id(name) == Some(kind))
            .map(|(_, key)| key.trim())
            .find(|key| !key.is_empty())
    }
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.0.keys().collect();
        names.sort();
        f.debug_tuple("ApiKeys").field(&names).finish()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for ApiKeys {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// Pick a provider: the requested one if its key is present, otherwise the
/// first keyed provider in priority order.
pub fn select_provider(
    keys: &ApiKeys,
    requested: Option<ProviderKind>,
) -> Result<(ProviderKind, String), TranslateError> {
    match requested {
        Some(kind) => keys
            .get(kind)
            .map(|key| (kind, key.to_string()))
            .ok_or_else(|| TranslateError::NoCredentials(kind.id().to_string())),
        None => ProviderKind::ALL
            .into_iter()
            .find_map(|kind| keys.get(kind).map(|key| (kind, key.to_string())))
            .ok_or_else(|| TranslateError::NoCredentials("any provider".to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResponse {
    pub content: String,
    pub tokens_used: TokenUsage,
    pub model: String,
}

/// Uniform chat contract implemented once per wire format.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, TranslateError>;
}

/// Builds a provider for a given vendor and key.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, kind: ProviderKind, api_key: &str) -> Result<Arc<dyn ChatProvider>, TranslateError>;
}

/// Production factory: real HTTP adapters sharing one connection pool.
pub struct HttpProviderFactory {
    http: reqwest::Client,
    retry: RetryPolicy,
    base_urls: HashMap<ProviderKind, String>,
}

impl HttpProviderFactory {
    pub fn new(http: reqwest::Client, retry: RetryPolicy) -> Self {
        Self {
            http,
            retry,
            base_urls: HashMap::new(),
        }
    }

    /// Point a vendor at a different endpoint (proxies, self-hosted gateways).
    pub fn with_base_url(mut self, kind: ProviderKind, base_url: impl Into<String>) -> Self {
        self.base_urls.insert(kind, base_url.into());
        self
    }

    fn base_url(&self, kind: ProviderKind) -> String {
        self.base_urls
            .get(&kind)
            .map(String::as_str)
            .unwrap_or(kind.spec().base_url)
            .trim_end_matches('/')
            .to_string()
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn build(&self, kind: ProviderKind, api_key: &str) -> Result<Arc<dyn ChatProvider>, TranslateError> {
        if api_key.trim().is_empty() {
            return Err(TranslateError::NoCredentials(kind.id().to_string()));
        }
        let endpoint = HttpEndpoint {
            http: self.http.clone(),
            base_url: self.base_url(kind),
            api_key: api_key.trim().to_string(),
            retry: self.retry,
        };
        let provider: Arc<dyn ChatProvider> = match kind.spec().wire {
            WireFormat::OpenAiChat => Arc::new(openai::OpenAiCompatible::new(kind, endpoint)),
            WireFormat::AnthropicMessages => Arc::new(anthropic::AnthropicProvider::new(endpoint)),
            WireFormat::GeminiGenerate => Arc::new(gemini::GeminiProvider::new(endpoint)),
        };
        Ok(provider)
    }
}

/// Connection details shared by every HTTP adapter.
#[derive(Clone)]
pub struct HttpEndpoint {
    pub http: reqwest::Client,
    pub base_url: String,
    pub api_key: String,
    pub retry: RetryPolicy,
}

/// Model to use: explicit option, else the vendor default.
pub fn resolve_model(kind: ProviderKind, options: &ChatOptions) -> String {
    options
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(kind.spec().default_model)
        .to_string()
}

/// Catalog entry as served by `GET /translate/providers`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub requires_key: bool,
    pub default_model: String,
    pub models: Vec<String>,
}

pub fn provider_catalog() -> Vec<ProviderInfo> {
    CATALOG
        .iter()
        .map(|spec| ProviderInfo {
            id: spec.id.to_string(),
            name: spec.display_name.to_string(),
            requires_key: true,
            default_model: spec.default_model.to_string(),
            models: spec.models.iter().map(|m| m.to_string()).collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_every_kind_once() {
        for kind in ProviderKind::ALL {
            assert_eq!(CATALOG.iter().filter(|s| s.kind == kind).count(), 1);
            assert_eq!(kind.spec().kind, kind);
            assert!(kind.spec().models.contains(&kind.spec().default_model));
            assert_eq!(ProviderKind::from_id(kind.id()), Some(kind));
        }
    }

    #[test]
    fn explicit_provider_needs_its_own_key() {
        let keys = ApiKeys::from([("openai", "sk-1"), ("anthropic", "  ")]);
        assert!(matches!(
            select_provider(&keys, Some(ProviderKind::Anthropic)),
            Err(TranslateError::NoCredentials(p)) if p == "anthropic"
        ));
        let (kind, key) = select_provider(&keys, Some(ProviderKind::OpenAi)).unwrap();
        assert_eq!((kind, key.as_str()), (ProviderKind::OpenAi, "sk-1"));
    }

    #[test]
    fn automatic_selection_follows_priority() {
        let keys = ApiKeys::from([("groq", "g"), ("deepseek", "d"), ("gemini", "")]);
        let (kind, _) = select_provider(&keys, None).unwrap();
        assert_eq!(kind, ProviderKind::DeepSeek);
    }

    #[test]
    fn no_keys_is_a_distinct_condition() {
        assert!(matches!(
            select_provider(&ApiKeys::default(), None),
            Err(TranslateError::NoCredentials(_))
        ));
    }

    #[test]
    fn has_any_ignores_blank_values() {
        assert!(!ApiKeys::default().has_any());
        assert!(!ApiKeys::from([("openai", ""), ("groq", "   ")]).has_any());
        assert!(ApiKeys::from([("openai", ""), ("groq", "gsk")]).has_any());
    }

    #[test]
    fn key_lookup_is_case_insensitive_and_accepts_aliases() {
        let keys = ApiKeys::from([("OpenAI", "sk"), ("claude", "ak")]);
        assert_eq!(keys.get(ProviderKind::OpenAi), Some("sk"));
        assert_eq!(keys.get(ProviderKind::Anthropic), Some("ak"));
    }

    #[test]
    fn debug_hides_secrets() {
        let keys = ApiKeys::from([("openai", "sk-secret")]);
        assert!(!format!("{keys:?}").contains("sk-secret"));
    }

    #[test]
    fn model_override() {
        let opts = ChatOptions {
            model: Some("gpt-4o".into()),
            ..Default::default()
        };
        assert_eq!(resolve_model(ProviderKind::OpenAi, &opts), "gpt-4o");
        assert_eq!(
            resolve_model(ProviderKind::Groq, &ChatOptions::default()),
            "llama-3.1-8b-instant"
        );
    }
}
