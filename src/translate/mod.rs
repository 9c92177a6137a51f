//! Translation core: fragment types, error taxonomy, and the dual-translation
//! orchestrator with its racer, provider adapters, cache and prompt builder.

pub mod batch;
pub mod cache;
pub mod detect;
pub mod fingerprint;
pub mod free;
pub mod glossary;
pub mod prompt;
pub mod providers;
pub mod racer;
pub mod service;
pub mod sqlite_cache;

use serde::{Deserialize, Serialize};

pub use service::{ServiceSettings, TranslationService};

/// Language value meaning "detect it for me".
pub const AUTO_LANG: &str = "auto";

/// Content category of a fragment. Part of the fingerprint and the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    #[default]
    General,
    Technical,
    Academic,
    Literary,
    Legal,
    Medical,
    Business,
    Casual,
    News,
    Subtitle,
}

impl ContextType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextType::General => "general",
            ContextType::Technical => "technical",
            ContextType::Academic => "academic",
            ContextType::Literary => "literary",
            ContextType::Legal => "legal",
            ContextType::Medical => "medical",
            ContextType::Business => "business",
            ContextType::Casual => "casual",
            ContextType::News => "news",
            ContextType::Subtitle => "subtitle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Formal,
    Neutral,
    Casual,
    Friendly,
}

/// One source → target term pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub source: String,
    pub target: String,
}

/// One unit of translatable text plus its language parameters. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationFragment {
    pub text: String,
    /// `None` or `"auto"` both mean "detect".
    pub source_lang: Option<String>,
    pub target_lang: String,
    pub context_type: Option<ContextType>,
}

impl TranslationFragment {
    pub fn new(text: impl Into<String>, target_lang: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_lang: None,
            target_lang: target_lang.into(),
            context_type: None,
        }
    }

    pub fn with_source(mut self, source_lang: impl Into<String>) -> Self {
        self.source_lang = Some(source_lang.into());
        self
    }

    pub fn with_context_type(mut self, context_type: ContextType) -> Self {
        self.context_type = Some(context_type);
        self
    }

    /// Source language as given, `"auto"` when absent.
    pub fn source_or_auto(&self) -> &str {
        match self.source_lang.as_deref() {
            Some(lang) if !lang.trim().is_empty() => lang,
            _ => AUTO_LANG,
        }
    }

    /// Explicit source language, if the caller supplied one.
    pub fn known_source(&self) -> Option<&str> {
        match self.source_or_auto() {
            AUTO_LANG => None,
            lang => Some(lang),
        }
    }

    pub fn context_type_or_default(&self) -> ContextType {
        self.context_type.unwrap_or_default()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint::fingerprint(
            &self.text,
            self.source_or_auto(),
            &self.target_lang,
            self.context_type,
        )
    }
}

/// Page-level hints that shape the LLM prompt but not the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageContext {
    pub tone: Option<Tone>,
    pub domain: Option<String>,
    pub page_title: Option<String>,
    pub terminology: Vec<GlossaryEntry>,
}

/// Which translator a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineChoice {
    /// LLM when any key is configured, machine otherwise.
    #[default]
    Auto,
    Machine,
    /// A specific provider, or the first available one.
    Llm(Option<providers::ProviderKind>),
}

impl EngineChoice {
    /// Parse the wire `model` field.
    pub fn parse(model: Option<&str>) -> Result<Self, TranslateError> {
        let Some(raw) = model.map(str::trim).filter(|m| !m.is_empty()) else {
            return Ok(EngineChoice::Auto);
        };
        match raw.to_ascii_lowercase().as_str() {
            "auto" => Ok(EngineChoice::Auto),
            "free" | "machine" => Ok(EngineChoice::Machine),
            "llm" | "ai" => Ok(EngineChoice::Llm(None)),
            other => providers::ProviderKind::from_id(other)
                .map(|kind| EngineChoice::Llm(Some(kind)))
                .ok_or_else(|| TranslateError::InvalidRequest(format!("unknown model: {raw}"))),
        }
    }
}

/// A failure reported by one free backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendFailure {
    pub backend: String,
    pub message: String,
}

fn describe_failures(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.backend, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no API key configured for {0}")]
    NoCredentials(String),

    #[error("{provider} unavailable after {attempts} attempt(s): {message}")]
    ProviderTransient {
        provider: String,
        attempts: u32,
        message: String,
    },

    #[error("{provider} rejected the request ({status}): {message}")]
    ProviderTerminal {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider} returned an unusable response: {message}")]
    MalformedResponse { provider: String, message: String },

    #[error("all free translation backends failed: {}", describe_failures(.0))]
    AllBackendsFailed(Vec<BackendFailure>),

    #[error("translation cancelled")]
    Cancelled,
}

impl TranslateError {
    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            TranslateError::InvalidRequest(_) => "invalid_request",
            TranslateError::NoCredentials(_) => "no_credentials",
            TranslateError::ProviderTransient { .. } => "provider_unavailable",
            TranslateError::ProviderTerminal { .. } => "provider_rejected",
            TranslateError::MalformedResponse { .. } => "provider_malformed_response",
            TranslateError::AllBackendsFailed(_) => "free_backends_failed",
            TranslateError::Cancelled => "cancelled",
        }
    }
}

/// Result of the single-provider path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationOutcome {
    pub translated_text: String,
    pub source_lang: String,
    pub target_lang: String,
    /// Free backend name or `provider/model`.
    pub model: String,
    pub cached: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineHalf {
    pub translated_text: Option<String>,
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmHalf {
    pub translated_text: Option<String>,
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub available: bool,
}

/// Both halves of a dual translation. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DualResult {
    pub machine: MachineHalf,
    pub llm: LlmHalf,
    pub source_lang: String,
    pub target_lang: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub translations: Vec<String>,
    pub source_lang: String,
    pub target_lang: String,
    pub model: String,
    pub cached_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefineOutcome {
    pub refined_text: String,
    pub model: String,
}
