//! OpenAI chat-completions adapter. Also serves every vendor exposing an
//! OpenAI-compatible `/chat/completions` endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::retry::{read_json, send_with_retry};
use super::{
    resolve_model, ChatMessage, ChatOptions, ChatProvider, ChatResponse, HttpEndpoint, ProviderKind,
    TokenUsage,
};
use crate::translate::TranslateError;

pub struct OpenAiCompatible {
    kind: ProviderKind,
    endpoint: HttpEndpoint,
}

impl OpenAiCompatible {
    pub fn new(kind: ProviderKind, endpoint: HttpEndpoint) -> Self {
        Self { kind, endpoint }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CompletionRequest<'a> {
    model: String,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

pub(crate) fn build_request<'a>(
    kind: ProviderKind,
    messages: &'a [ChatMessage],
    options: &ChatOptions,
) -> CompletionRequest<'a> {
    CompletionRequest {
        model: resolve_model(kind, options),
        messages,
        temperature: options.temperature,
        max_tokens: options.max_tokens,
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

pub(crate) fn parse_response(
    kind: ProviderKind,
    requested_model: &str,
    resp: CompletionResponse,
) -> Result<ChatResponse, TranslateError> {
    let content = resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| TranslateError::MalformedResponse {
            provider: kind.id().to_string(),
            message: "no message content in choices".into(),
        })?;

    let tokens_used = resp
        .usage
        .map(|u| TokenUsage {
            prompt: u.prompt_tokens,
            completion: u.completion_tokens,
            total: if u.total_tokens > 0 {
                u.total_tokens
            } else {
                u.prompt_tokens + u.completion_tokens
            },
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        tokens_used,
        model: resp.model.unwrap_or_else(|| requested_model.to_string()),
    })
}

#[async_trait]
impl ChatProvider for OpenAiCompatible {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, TranslateError> {
        let body = build_request(self.kind, messages, options);
        let url = format!("{}/chat/completions", self.endpoint.base_url);
        let resp = send_with_retry(self.kind, &self.endpoint.retry, cancel, || {
            self.endpoint
                .http
                .post(&url)
                .bearer_auth(&self.endpoint.api_key)
                .json(&body)
        })
        .await?;
        let parsed: CompletionResponse = read_json(self.kind, resp, cancel).await?;
        parse_response(self.kind, &body.model, parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_openai_roles_and_default_model() {
        let messages = [ChatMessage::system("be brief"), ChatMessage::user("Hello")];
        let options = ChatOptions {
            temperature: Some(0.3),
            ..Default::default()
        };
        let body = serde_json::to_value(build_request(ProviderKind::DeepSeek, &messages, &options)).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "deepseek-chat",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "Hello"}
                ],
                "temperature": 0.3f32
            })
        );
    }

    #[test]
    fn response_content_and_usage() {
        let raw: CompletionResponse = serde_json::from_value(json!({
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": " Bonjour \n"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }))
        .unwrap();
        let parsed = parse_response(ProviderKind::OpenAi, "gpt-4o-mini", raw).unwrap();
        assert_eq!(parsed.content, "Bonjour");
        assert_eq!(parsed.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(parsed.tokens_used.total, 15);
    }

    #[test]
    fn empty_choices_is_malformed() {
        let raw: CompletionResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            parse_response(ProviderKind::Groq, "m", raw),
            Err(TranslateError::MalformedResponse { .. })
        ));
    }
}
