//! Free-translation racer: every backend starts at once, the first success
//! wins, and the losers get a cooperative cancel signal.
//! Also hosts the fast language-detection path (heuristics → one backend
//! with a short timeout → heuristic fallback).

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::detect::{guess_language, ScriptGuess};
use super::free::{BackendError, FreeBackend, FreeTranslation};
use super::{BackendFailure, TranslateError};
use crate::cancellation::RaceCancellation;

/// Default timeout of the network language-detection path.
pub const DEFAULT_DETECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How a language was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Heuristic,
    Network,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub language: String,
    pub method: DetectionMethod,
}

pub struct Racer {
    backends: Vec<Arc<dyn FreeBackend>>,
    detect_timeout: Duration,
}

impl Racer {
    pub fn new(backends: Vec<Arc<dyn FreeBackend>>) -> Self {
        Self {
            backends,
            detect_timeout: DEFAULT_DETECT_TIMEOUT,
        }
    }

    pub fn with_detect_timeout(mut self, timeout: Duration) -> Self {
        self.detect_timeout = timeout;
        self
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Race every backend on the same input. Returns the first success.
    /// Fails with `AllBackendsFailed` listing genuine failures only, or with
    /// `Cancelled` when `parent` was cancelled and nothing genuinely failed.
    pub async fn race(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        parent: &CancellationToken,
    ) -> Result<FreeTranslation, TranslateError> {
        if self.backends.is_empty() {
            return Err(TranslateError::AllBackendsFailed(Vec::new()));
        }

        let race = RaceCancellation::new(parent);
        let mut pending = FuturesUnordered::new();
        for backend in &self.backends {
            let backend = Arc::clone(backend);
            let token = race.contender_token();
            let text = text.to_string();
            let source = source_lang.to_string();
            let target = target_lang.to_string();
            // Spawned so losers keep running until they observe the cancel signal.
            pending.push(tokio::spawn(async move {
                let name = backend.name().to_string();
                let outcome = backend.translate(&text, &source, &target, &token).await;
                (name, outcome)
            }));
        }

        let mut failures = Vec::new();
        while let Some(joined) = pending.next().await {
            match joined {
                Ok((name, Ok(found))) => {
                    race.cancel_losers();
                    debug!(winner = %name, "free race decided");
                    return Ok(found);
                }
                Ok((name, Err(BackendError::Cancelled))) => {
                    debug!(backend = %name, "free backend cancelled");
                }
                Ok((name, Err(e))) => {
                    warn!(backend = %name, error = %e, "free backend failed");
                    failures.push(BackendFailure {
                        backend: name,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "free backend task aborted");
                    failures.push(BackendFailure {
                        backend: "unknown".into(),
                        message: format!("task aborted: {e}"),
                    });
                }
            }
        }

        if failures.is_empty() && parent.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }
        Err(TranslateError::AllBackendsFailed(failures))
    }

    /// Detect the language of `text`. Never fails and never waits longer
    /// than the detection timeout.
    pub async fn detect_language(&self, text: &str) -> Detection {
        let guess = guess_language(text);
        if let ScriptGuess::Confident(language) = &guess {
            return Detection {
                language: language.clone(),
                method: DetectionMethod::Heuristic,
            };
        }

        if let Some(backend) = self.backends.iter().find(|b| b.supports_detection()) {
            let cancel = CancellationToken::new();
            let attempt = tokio::time::timeout(self.detect_timeout, backend.detect(text, &cancel)).await;
            cancel.cancel();
            match attempt {
                Ok(Ok(Some(language))) if !language.is_empty() && language != super::AUTO_LANG => {
                    return Detection {
                        language: normalize_code(&language),
                        method: DetectionMethod::Network,
                    };
                }
                Ok(Ok(_)) => debug!(backend = backend.name(), "network detection inconclusive"),
                Ok(Err(e)) => warn!(backend = backend.name(), error = %e, "network detection failed"),
                Err(_) => warn!(backend = backend.name(), "network detection timed out"),
            }
        }

        Detection {
            language: guess.language().to_string(),
            method: DetectionMethod::Fallback,
        }
    }
}

/// Lower-case the primary subtag, keeping Chinese script variants.
fn normalize_code(code: &str) -> String {
    let lower = code.to_ascii_lowercase();
    match lower.as_str() {
        "zh-cn" | "zh-hans" => "zh".into(),
        "zh-tw" | "zh-hant" => "zh-TW".into(),
        _ => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Mock backend: waits `delay`, then returns its canned outcome.
    /// Records whether it observed the cancel signal.
    struct Scripted {
        name: &'static str,
        delay: Duration,
        outcome: Result<&'static str, BackendError>,
        saw_cancel: Arc<AtomicBool>,
        detect_answer: Option<&'static str>,
    }

    impl Scripted {
        fn new(name: &'static str, delay_ms: u64, outcome: Result<&'static str, BackendError>) -> Self {
            Self {
                name,
                delay: Duration::from_millis(delay_ms),
                outcome,
                saw_cancel: Arc::new(AtomicBool::new(false)),
                detect_answer: None,
            }
        }
    }

    #[async_trait]
    impl FreeBackend for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn translate(
            &self,
            _text: &str,
            _source_lang: &str,
            _target_lang: &str,
            cancel: &CancellationToken,
        ) -> Result<FreeTranslation, BackendError> {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    Err(BackendError::Cancelled)
                }
                _ = tokio::time::sleep(self.delay) => {
                    self.outcome.clone().map(|text| FreeTranslation {
                        translated_text: text.to_string(),
                        detected_source_lang: None,
                        provider: self.name.to_string(),
                    })
                }
            }
        }

        fn supports_detection(&self) -> bool {
            self.detect_answer.is_some()
        }

        async fn detect(
            &self,
            _text: &str,
            _cancel: &CancellationToken,
        ) -> Result<Option<String>, BackendError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.detect_answer.map(str::to_string))
        }
    }

    #[tokio::test]
    async fn fastest_success_wins_and_losers_are_cancelled() {
        let a = Scripted::new("a", 300, Ok("from a"));
        let b = Scripted::new("b", 10, Ok("from b"));
        let c = Scripted::new("c", 300, Ok("from c"));
        let (a_cancel, c_cancel) = (a.saw_cancel.clone(), c.saw_cancel.clone());
        let racer = Racer::new(vec![Arc::new(a), Arc::new(b), Arc::new(c)]);

        let win = racer
            .race("hello", "en", "fr", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(win.provider, "b");
        assert_eq!(win.translated_text, "from b");

        // losers run on their own tasks; give them a moment to observe the signal
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_cancel.load(Ordering::SeqCst));
        assert!(c_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn a_failure_does_not_stop_the_race() {
        let racer = Racer::new(vec![
            Arc::new(Scripted::new("fast-fail", 5, Err(BackendError::Timeout))),
            Arc::new(Scripted::new("slow-ok", 40, Ok("ok"))),
        ]);
        let win = racer.race("x", "en", "de", &CancellationToken::new()).await.unwrap();
        assert_eq!(win.provider, "slow-ok");
    }

    #[tokio::test]
    async fn total_failure_aggregates_genuine_errors_only() {
        let racer = Racer::new(vec![
            Arc::new(Scripted::new(
                "a",
                5,
                Err(BackendError::Status {
                    status: 503,
                    body: "busy".into(),
                }),
            )),
            Arc::new(Scripted::new("b", 10, Err(BackendError::Http("connection reset".into())))),
            Arc::new(Scripted::new("c", 15, Err(BackendError::Malformed("not json".into())))),
        ]);
        let err = racer
            .race("x", "en", "de", &CancellationToken::new())
            .await
            .unwrap_err();
        match &err {
            TranslateError::AllBackendsFailed(failures) => {
                assert_eq!(failures.len(), 3);
                assert!(failures.iter().all(|f| f.message != "cancelled"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("a: status 503: busy"));
        assert!(msg.contains("b: request failed: connection reset"));
        assert!(msg.contains("c: malformed response: not json"));
        assert!(!msg.contains("cancelled"));
    }

    #[tokio::test]
    async fn cancelled_contenders_are_not_failures() {
        let racer = Racer::new(vec![
            Arc::new(Scripted::new("a", 5, Err(BackendError::Timeout))),
            Arc::new(Scripted::new("b", 5, Err(BackendError::Cancelled))),
        ]);
        match racer.race("x", "en", "de", &CancellationToken::new()).await {
            Err(TranslateError::AllBackendsFailed(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].backend, "a");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_caller_gets_cancelled() {
        let parent = CancellationToken::new();
        parent.cancel();
        let racer = Racer::new(vec![Arc::new(Scripted::new("a", 200, Ok("late")))]);
        assert!(matches!(
            racer.race("x", "en", "de", &parent).await,
            Err(TranslateError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn detection_prefers_script_heuristics() {
        let mut backend = Scripted::new("g", 0, Ok("unused"));
        backend.detect_answer = Some("xx");
        let racer = Racer::new(vec![Arc::new(backend)]);
        let found = racer.detect_language("这是中文").await;
        assert_eq!(found.language, "zh");
        assert_eq!(found.method, DetectionMethod::Heuristic);
    }

    #[tokio::test]
    async fn ambiguous_text_uses_network_detection() {
        let mut backend = Scripted::new("g", 0, Ok("unused"));
        backend.detect_answer = Some("zh-CN");
        let racer = Racer::new(vec![Arc::new(backend)]);
        let found = racer.detect_language("ok").await;
        assert_eq!(found.language, "zh");
        assert_eq!(found.method, DetectionMethod::Network);
    }

    #[tokio::test]
    async fn slow_network_detection_falls_back() {
        let mut backend = Scripted::new("g", 500, Ok("unused"));
        backend.detect_answer = Some("fr");
        let racer =
            Racer::new(vec![Arc::new(backend)]).with_detect_timeout(Duration::from_millis(20));
        let found = racer.detect_language("ok").await;
        assert_eq!(found.language, "en");
        assert_eq!(found.method, DetectionMethod::Fallback);
    }
}
