//! Anthropic messages API adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::retry::{read_json, send_with_retry};
use super::{
    resolve_model, ChatMessage, ChatOptions, ChatProvider, ChatResponse, ChatRole, HttpEndpoint,
    ProviderKind, TokenUsage,
};
use crate::translate::TranslateError;

const API_VERSION: &str = "2023-06-01";
/// The messages API requires `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    endpoint: HttpEndpoint,
}

impl AnthropicProvider {
    pub fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<TurnMessage>,
}

#[derive(Debug, Serialize, PartialEq)]
struct TurnMessage {
    role: &'static str,
    content: String,
}

/// System turns move to the top-level `system` field; consecutive turns of
/// the same role are merged since the API expects strict alternation.
pub(crate) fn build_request(messages: &[ChatMessage], options: &ChatOptions) -> MessagesRequest {
    let mut system: Vec<&str> = Vec::new();
    let mut turns: Vec<TurnMessage> = Vec::new();
    for message in messages {
        let role = match message.role {
            ChatRole::System => {
                system.push(&message.content);
                continue;
            }
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        };
        match turns.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&message.content);
            }
            _ => turns.push(TurnMessage {
                role,
                content: message.content.clone(),
            }),
        }
    }

    MessagesRequest {
        model: resolve_model(ProviderKind::Anthropic, options),
        max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        temperature: options.temperature,
        messages: turns,
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

pub(crate) fn parse_response(
    requested_model: &str,
    resp: MessagesResponse,
) -> Result<ChatResponse, TranslateError> {
    let content = resp
        .content
        .into_iter()
        .filter_map(|block| match block {
            ResponseBlock::Text { text } => Some(text),
            ResponseBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    let content = content.trim();
    if content.is_empty() {
        return Err(TranslateError::MalformedResponse {
            provider: ProviderKind::Anthropic.id().to_string(),
            message: "response missing text content".into(),
        });
    }

    let tokens_used = resp
        .usage
        .map(|u| TokenUsage {
            prompt: u.input_tokens,
            completion: u.output_tokens,
            total: u.input_tokens + u.output_tokens,
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content: content.to_string(),
        tokens_used,
        model: resp.model.unwrap_or_else(|| requested_model.to_string()),
    })
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, TranslateError> {
        let body = build_request(messages, options);
        let url = format!("{}/v1/messages", self.endpoint.base_url);
        let resp = send_with_retry(ProviderKind::Anthropic, &self.endpoint.retry, cancel, || {
            self.endpoint
                .http
                .post(&url)
                .header("x-api-key", &self.endpoint.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body)
        })
        .await?;
        let parsed: MessagesResponse = read_json(ProviderKind::Anthropic, resp, cancel).await?;
        parse_response(&body.model, parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_turns_are_lifted_and_roles_alternate() {
        let messages = [
            ChatMessage::system("translate"),
            ChatMessage::user("context"),
            ChatMessage::user("make it shorter"),
            ChatMessage::assistant("ok"),
        ];
        let body = serde_json::to_value(build_request(&messages, &ChatOptions::default())).unwrap();
        assert_eq!(body["system"], "translate");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(
            body["messages"],
            json!([
                {"role": "user", "content": "context\n\nmake it shorter"},
                {"role": "assistant", "content": "ok"}
            ])
        );
    }

    #[test]
    fn text_blocks_are_joined_and_others_skipped() {
        let raw: MessagesResponse = serde_json::from_value(json!({
            "model": "claude-3-5-haiku-20241022",
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "Hallo Welt"}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 4}
        }))
        .unwrap();
        let parsed = parse_response("claude-3-5-haiku-latest", raw).unwrap();
        assert_eq!(parsed.content, "Hallo Welt");
        assert_eq!(parsed.tokens_used.total, 24);
    }

    #[test]
    fn missing_text_is_malformed() {
        let raw: MessagesResponse = serde_json::from_value(json!({"content": []})).unwrap();
        assert!(matches!(
            parse_response("m", raw),
            Err(TranslateError::MalformedResponse { .. })
        ));
    }
}
