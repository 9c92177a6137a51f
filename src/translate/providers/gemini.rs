//! Google Gemini `generateContent` adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::retry::{read_json, send_with_retry};
use super::{
    resolve_model, ChatMessage, ChatOptions, ChatProvider, ChatResponse, ChatRole, HttpEndpoint,
    ProviderKind, TokenUsage,
};
use crate::translate::TranslateError;

pub struct GeminiProvider {
    endpoint: HttpEndpoint,
}

impl GeminiProvider {
    pub fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

fn text_content(role: Option<&str>, text: &str) -> Content {
    Content {
        role: role.map(str::to_string),
        parts: vec![Part {
            text: Some(text.to_string()),
        }],
    }
}

pub(crate) fn build_request(messages: &[ChatMessage], options: &ChatOptions) -> GenerateRequest {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
        .collect();
    let contents = messages
        .iter()
        .filter_map(|m| match m.role {
            ChatRole::System => None,
            ChatRole::User => Some(text_content(Some("user"), &m.content)),
            ChatRole::Assistant => Some(text_content(Some("model"), &m.content)),
        })
        .collect();

    GenerateRequest {
        system_instruction: (!system.is_empty()).then(|| text_content(None, &system.join("\n\n"))),
        contents,
        generation_config: GenerationConfig {
            temperature: options.temperature,
            max_output_tokens: options.max_tokens,
        },
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

pub(crate) fn parse_response(
    requested_model: &str,
    resp: GenerateResponse,
) -> Result<ChatResponse, TranslateError> {
    let malformed = |message: String| TranslateError::MalformedResponse {
        provider: ProviderKind::Gemini.id().to_string(),
        message,
    };

    if let Some(reason) = resp.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(malformed(format!("prompt blocked: {reason}")));
    }

    let candidate = resp
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| malformed("no candidates".into()))?;
    let finish_reason = candidate.finish_reason.unwrap_or_default();
    let text = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let text = text.trim();
    if text.is_empty() {
        return Err(malformed(format!("empty candidate (finishReason: {finish_reason})")));
    }

    let tokens_used = resp
        .usage_metadata
        .map(|u| TokenUsage {
            prompt: u.prompt_token_count,
            completion: u.candidates_token_count,
            total: u.total_token_count,
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content: text.to_string(),
        tokens_used,
        model: resp.model_version.unwrap_or_else(|| requested_model.to_string()),
    })
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, TranslateError> {
        let model = resolve_model(ProviderKind::Gemini, options);
        let body = build_request(messages, options);
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint.base_url, model
        );
        let resp = send_with_retry(ProviderKind::Gemini, &self.endpoint.retry, cancel, || {
            self.endpoint
                .http
                .post(&url)
                .header("x-goog-api-key", &self.endpoint.api_key)
                .json(&body)
        })
        .await?;
        let parsed: GenerateResponse = read_json(ProviderKind::Gemini, resp, cancel).await?;
        parse_response(&model, parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_shape() {
        let messages = [
            ChatMessage::system("translate to German"),
            ChatMessage::user("Hello"),
            ChatMessage::assistant("Hallo"),
            ChatMessage::user("more formal"),
        ];
        let options = ChatOptions {
            max_tokens: Some(512),
            ..Default::default()
        };
        let body = serde_json::to_value(build_request(&messages, &options)).unwrap();
        assert_eq!(
            body,
            json!({
                "systemInstruction": {"parts": [{"text": "translate to German"}]},
                "contents": [
                    {"role": "user", "parts": [{"text": "Hello"}]},
                    {"role": "model", "parts": [{"text": "Hallo"}]},
                    {"role": "user", "parts": [{"text": "more formal"}]}
                ],
                "generationConfig": {"maxOutputTokens": 512}
            })
        );
    }

    #[test]
    fn candidate_text_and_usage() {
        let raw: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Guten "}, {"text": "Tag"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 2, "totalTokenCount": 10},
            "modelVersion": "gemini-1.5-flash-002"
        }))
        .unwrap();
        let parsed = parse_response("gemini-1.5-flash", raw).unwrap();
        assert_eq!(parsed.content, "Guten Tag");
        assert_eq!(parsed.model, "gemini-1.5-flash-002");
        assert_eq!(parsed.tokens_used.total, 10);
    }

    #[test]
    fn blocked_prompt_is_malformed() {
        let raw: GenerateResponse =
            serde_json::from_value(json!({"promptFeedback": {"blockReason": "SAFETY"}})).unwrap();
        let err = parse_response("m", raw).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }
}
