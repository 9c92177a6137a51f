//! Shared HTTP send loop for the provider adapters.
//! 429, 5xx and network errors are retried with exponential backoff
//! (base, 2×base, 4×base…); any other non-success status is terminal.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ProviderKind;
use crate::translate::TranslateError;

/// Upper bound for a server-suggested `Retry-After` wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Wait after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << shift)
    }
}

pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Send the request built by `build` until it succeeds, fails terminally,
/// runs out of attempts, or `cancel` fires.
pub async fn send_with_retry<F>(
    provider: ProviderKind,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    build: F,
) -> Result<reqwest::Response, TranslateError>
where
    F: Fn() -> reqwest::RequestBuilder + Send + Sync,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }

        let result = tokio::select! {
            r = build().send() => r,
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
        };

        let (wait, last_error) = match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(%provider, attempt, "provider call succeeded");
                return Ok(resp);
            }
            Ok(resp) if is_transient_status(resp.status()) => {
                let status = resp.status();
                let suggested = retry_after(&resp);
                let body = resp.text().await.unwrap_or_default();
                let wait = suggested.unwrap_or_else(|| policy.backoff(attempt));
                (wait, format!("status {}: {}", status.as_u16(), snippet(&body)))
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                warn!(%provider, status, "provider rejected request");
                return Err(TranslateError::ProviderTerminal {
                    provider: provider.id().to_string(),
                    status,
                    message: snippet(&body),
                });
            }
            Err(e) => (policy.backoff(attempt), e.to_string()),
        };

        if attempt >= max_attempts {
            warn!(%provider, attempt, error = %last_error, "provider retries exhausted");
            return Err(TranslateError::ProviderTransient {
                provider: provider.id().to_string(),
                attempts: attempt,
                message: last_error,
            });
        }

        warn!(
            %provider,
            attempt,
            wait_ms = wait.as_millis() as u64,
            error = %last_error,
            "transient provider failure, retrying"
        );
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
        }
    }
}

/// Read a success body as JSON, mapping decode failures to `MalformedResponse`.
pub async fn read_json<T: DeserializeOwned>(
    provider: ProviderKind,
    resp: reqwest::Response,
    cancel: &CancellationToken,
) -> Result<T, TranslateError> {
    let body = tokio::select! {
        b = resp.text() => b,
        _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
    };
    let body = body.map_err(|e| TranslateError::MalformedResponse {
        provider: provider.id().to_string(),
        message: format!("failed to read body: {e}"),
    })?;
    serde_json::from_str(&body).map_err(|e| TranslateError::MalformedResponse {
        provider: provider.id().to_string(),
        message: format!("{e}; body: {}", snippet(&body)),
    })
}
