//! Translation orchestrator.
//!
//! Every entry point follows the same shape: validate, consult the cache,
//! resolve the source language when needed, run the machine racer and/or an
//! LLM provider, write the cache, and hand the result to the memory store
//! without waiting on it. Cache and memory failures are logged and ignored.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batch::{self, BatchItem};
use super::cache::{now_unix, CachedResult, ResultCache, DEFAULT_TTL};
use super::detect::guess_language;
use super::glossary::Glossary;
use super::prompt;
use super::providers::{
    provider_catalog, resolve_model, select_provider, ApiKeys, ChatMessage, ChatOptions, ChatRole,
    ProviderFactory, ProviderInfo, ProviderKind,
};
use super::racer::{Detection, Racer};
use super::{
    BatchOutcome, ContextType, DualResult, EngineChoice, LlmHalf, MachineHalf, PageContext,
    RefineOutcome, TranslateError, TranslationFragment, TranslationOutcome,
};
use crate::cancellation::GenerationGuard;
use crate::memory::{MemoryStore, NewMemoryEntry};
use crate::metrics::{metric_names, MetricsRegistry, RequestIds};
use crate::state_machine::{PhaseTracker, RequestPhase};

/// Label under which machine results are cached.
const MACHINE_LABEL: &str = "machine";
/// How much text is sampled to detect a batch's language.
const DETECT_SAMPLE_CHARS: usize = 600;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub cache_ttl: Duration,
    pub batch_max_items: usize,
    pub batch_max_chars: usize,
    /// Upper bound on texts accepted by one batch request.
    pub max_batch_texts: usize,
    /// Prior refinement turns replayed to the model.
    pub refine_history_window: usize,
    pub temperature: f32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_TTL,
            batch_max_items: 20,
            batch_max_chars: 4000,
            max_batch_texts: 50,
            refine_history_window: 10,
            temperature: 0.3,
        }
    }
}

/// Per-request knobs supplied by the caller.
#[derive(Debug, Clone)]
pub struct TranslateOptions {
    pub engine: EngineChoice,
    /// Overrides the provider's default model.
    pub model_id: Option<String>,
    pub api_keys: ApiKeys,
    pub page: PageContext,
    pub use_cache: bool,
    pub use_memory: bool,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            engine: EngineChoice::Auto,
            model_id: None,
            api_keys: ApiKeys::default(),
            page: PageContext::default(),
            use_cache: true,
            use_memory: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub texts: Vec<String>,
    pub source_lang: Option<String>,
    pub target_lang: String,
    pub context_type: Option<ContextType>,
}

#[derive(Debug, Clone, Default)]
pub struct RefineRequest {
    pub original_text: String,
    pub current_translation: String,
    pub instruction: String,
    pub source_lang: Option<String>,
    pub target_lang: String,
    /// Earlier turns of the conversation, oldest first.
    pub history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCatalog {
    pub providers: Vec<ProviderInfo>,
    pub free_backends: Vec<String>,
}

/// Translator resolved for one request.
#[derive(Debug, Clone)]
enum Engine {
    Machine,
    Llm {
        kind: ProviderKind,
        key: String,
        model: String,
    },
}

impl Engine {
    fn label(&self) -> String {
        match self {
            Engine::Machine => MACHINE_LABEL.to_string(),
            Engine::Llm { kind, model, .. } => format!("{}/{}", kind.id(), model),
        }
    }

    fn cache_key(&self, fingerprint: &str) -> String {
        format!("{}:{}", self.label(), fingerprint)
    }
}

/// One unit of work for an engine.
struct Job<'a> {
    text: &'a str,
    /// May be `auto` for the machine path only.
    source_lang: &'a str,
    target_lang: &'a str,
    context_type: ContextType,
    page: &'a PageContext,
    numbered: bool,
}

struct EngineOutput {
    text: String,
    /// Winning backend or `provider/model`.
    provider: String,
    detected_source_lang: Option<String>,
}

pub struct TranslationService {
    racer: Racer,
    providers: Arc<dyn ProviderFactory>,
    cache: Arc<dyn ResultCache>,
    memory: Option<Arc<MemoryStore>>,
    glossary: Arc<Glossary>,
    metrics: Arc<MetricsRegistry>,
    settings: ServiceSettings,
}

impl TranslationService {
    pub fn new(
        racer: Racer,
        providers: Arc<dyn ProviderFactory>,
        cache: Arc<dyn ResultCache>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            racer,
            providers,
            cache,
            memory: None,
            glossary: Arc::new(Glossary::empty()),
            metrics,
            settings: ServiceSettings::default(),
        }
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_glossary(mut self, glossary: Arc<Glossary>) -> Self {
        self.glossary = glossary;
        self
    }

    pub fn with_settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Single-translator path. A cache hit returns immediately with `cached = true`.
    pub async fn translate(
        &self,
        fragment: TranslationFragment,
        options: &TranslateOptions,
    ) -> Result<TranslationOutcome, TranslateError> {
        validate_fragment(&fragment)?;
        let ids = RequestIds::new();
        let tracker = PhaseTracker::new(ids.request_id.clone());
        let span = self.metrics.span(metric_names::TRANSLATE_DONE);

        let result = match self.resolve_engine(options) {
            Ok(engine) => {
                self.translate_fragment(&fragment, &engine, options, &tracker, &CancellationToken::new())
                    .await
            }
            Err(e) => Err(e),
        };
        finish_phase(&tracker, result.is_ok());
        span.finish();

        match &result {
            Ok(out) => info!(
                trace_id = %ids.trace_id,
                request_id = %ids.request_id,
                model = %out.model,
                cached = out.cached,
                "translate done"
            ),
            Err(e) => warn!(
                trace_id = %ids.trace_id,
                request_id = %ids.request_id,
                error = %e,
                "translate failed"
            ),
        }
        result
    }

    /// Always the machine racer; no credentials needed.
    pub async fn free_translate(
        &self,
        fragment: TranslationFragment,
        options: &TranslateOptions,
    ) -> Result<TranslationOutcome, TranslateError> {
        let options = TranslateOptions {
            engine: EngineChoice::Machine,
            ..options.clone()
        };
        self.translate(fragment, &options).await
    }

    /// Machine and LLM halves run concurrently; each half's failure stays in
    /// its own slot. Only an invalid request fails the whole call.
    pub async fn dual_translate(
        &self,
        fragment: TranslationFragment,
        options: &TranslateOptions,
    ) -> Result<DualResult, TranslateError> {
        validate_fragment(&fragment)?;
        let ids = RequestIds::new();
        let tracker = PhaseTracker::new(ids.request_id.clone());
        let span = self.metrics.span(metric_names::DUAL_DONE);
        let available = options.api_keys.has_any();
        let _ = tracker.transition(RequestPhase::Translating);

        let machine = async {
            let half = PhaseTracker::new(format!("{}:machine", ids.request_id));
            let out = self
                .translate_fragment(&fragment, &Engine::Machine, options, &half, &CancellationToken::new())
                .await;
            finish_phase(&half, out.is_ok());
            out
        };
        let llm = async {
            let half = PhaseTracker::new(format!("{}:llm", ids.request_id));
            let requested = match options.engine {
                EngineChoice::Llm(kind) => kind,
                _ => None,
            };
            let out = match self.llm_engine(options, requested) {
                Ok(engine) => {
                    self.translate_fragment(&fragment, &engine, options, &half, &CancellationToken::new())
                        .await
                }
                Err(e) => Err(e),
            };
            finish_phase(&half, out.is_ok());
            out
        };
        let (machine, llm) = tokio::join!(machine, llm);
        let _ = tracker.transition(RequestPhase::Merging);

        let source_lang = [&machine, &llm]
            .into_iter()
            .find_map(|r| r.as_ref().ok().map(|o| o.source_lang.clone()))
            .or_else(|| fragment.known_source().map(str::to_string))
            .unwrap_or_else(|| guess_language(&fragment.text).language().to_string());

        let machine = match machine {
            Ok(out) => MachineHalf {
                translated_text: Some(out.translated_text),
                provider: Some(out.model),
                error: None,
            },
            Err(e) => MachineHalf {
                error: Some(e.to_string()),
                ..Default::default()
            },
        };
        let llm = match llm {
            Ok(out) => LlmHalf {
                translated_text: Some(out.translated_text),
                model: Some(out.model),
                error: None,
                available,
            },
            Err(e) => LlmHalf {
                error: Some(e.to_string()),
                available,
                ..Default::default()
            },
        };

        let _ = tracker.transition(RequestPhase::Done);
        span.finish();
        info!(
            trace_id = %ids.trace_id,
            request_id = %ids.request_id,
            machine_ok = machine.error.is_none(),
            llm_ok = llm.error.is_none(),
            llm_available = available,
            "dual translate done"
        );
        Ok(DualResult {
            machine,
            llm,
            source_lang,
            target_lang: fragment.target_lang,
        })
    }

    /// Page-wide translation. Cache hits are resolved first; the misses are
    /// packed into bounded batches and each batch costs one translator call.
    /// A segment missing from the reply falls back to its source text.
    pub async fn batch_translate(
        &self,
        request: BatchRequest,
        options: &TranslateOptions,
        guard: &GenerationGuard,
    ) -> Result<BatchOutcome, TranslateError> {
        if request.texts.is_empty() {
            return Err(TranslateError::InvalidRequest("texts must not be empty".into()));
        }
        if request.texts.len() > self.settings.max_batch_texts {
            return Err(TranslateError::InvalidRequest(format!(
                "batch of {} texts exceeds the limit of {}",
                request.texts.len(),
                self.settings.max_batch_texts
            )));
        }
        if request.target_lang.trim().is_empty() {
            return Err(TranslateError::InvalidRequest("targetLang is required".into()));
        }

        let ids = RequestIds::new();
        let tracker = PhaseTracker::new(ids.request_id.clone());
        let span = self.metrics.span(metric_names::BATCH_DONE);
        let result = self.run_batch(request, options, guard, &tracker).await;
        finish_phase(&tracker, result.is_ok());
        span.finish();

        match &result {
            Ok(out) => info!(
                trace_id = %ids.trace_id,
                request_id = %ids.request_id,
                items = out.translations.len(),
                cached = out.cached_count,
                model = %out.model,
                "batch translate done"
            ),
            Err(e) => warn!(
                trace_id = %ids.trace_id,
                request_id = %ids.request_id,
                error = %e,
                "batch translate failed"
            ),
        }
        result
    }

    async fn run_batch(
        &self,
        request: BatchRequest,
        options: &TranslateOptions,
        guard: &GenerationGuard,
        tracker: &PhaseTracker,
    ) -> Result<BatchOutcome, TranslateError> {
        let engine = self.resolve_engine(options)?;
        let fragments: Vec<TranslationFragment> = request
            .texts
            .iter()
            .map(|text| TranslationFragment {
                text: text.clone(),
                source_lang: request.source_lang.clone(),
                target_lang: request.target_lang.clone(),
                context_type: request.context_type,
            })
            .collect();
        let keys: Vec<String> = fragments
            .iter()
            .map(|f| engine.cache_key(&f.fingerprint()))
            .collect();

        let mut translations: Vec<Option<String>> = vec![None; fragments.len()];
        let mut source_lang = request
            .source_lang
            .clone()
            .filter(|l| !l.trim().is_empty() && l != super::AUTO_LANG);

        let mut cached_count = 0usize;
        if options.use_cache {
            let hits = self.cache.batch_get(&keys).await;
            for (slot, key) in translations.iter_mut().zip(&keys) {
                if let Some(hit) = hits.get(key) {
                    *slot = Some(hit.translated_text.clone());
                    source_lang.get_or_insert_with(|| hit.source_lang.clone());
                    cached_count += 1;
                    self.metrics.incr(metric_names::CACHE_HIT);
                } else {
                    self.metrics.incr(metric_names::CACHE_MISS);
                }
            }
        }
        // Blank texts translate to themselves.
        for (slot, fragment) in translations.iter_mut().zip(&fragments) {
            if slot.is_none() && fragment.text.trim().is_empty() {
                *slot = Some(fragment.text.clone());
            }
        }

        let misses: Vec<BatchItem> = translations
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| BatchItem::new(i, fragments[i].text.clone()))
            .collect();

        if misses.is_empty() {
            let _ = tracker.transition(RequestPhase::Done);
            return Ok(BatchOutcome {
                translations: translations.into_iter().map(Option::unwrap_or_default).collect(),
                source_lang: source_lang.unwrap_or_else(|| self.sample_guess(&fragments)),
                target_lang: request.target_lang,
                model: engine.label(),
                cached_count,
            });
        }

        let sample: String = misses
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
            .chars()
            .take(DETECT_SAMPLE_CHARS)
            .collect();
        let job_source = match (&source_lang, &engine) {
            (Some(lang), _) => lang.clone(),
            (None, Engine::Llm { .. }) => {
                let _ = tracker.transition(RequestPhase::DetectingLanguage);
                let detected = self.detect(&sample).await.language;
                source_lang = Some(detected.clone());
                detected
            }
            (None, Engine::Machine) => super::AUTO_LANG.to_string(),
        };
        let _ = tracker.transition(RequestPhase::Translating);

        let context_type = request.context_type.unwrap_or_default();
        let chunks = batch::split(
            misses,
            self.settings.batch_max_items,
            self.settings.batch_max_chars,
        );
        let chunk_count = chunks.len();
        let results = join_all(chunks.iter().map(|chunk| {
            self.run_chunk(
                chunk,
                &engine,
                &job_source,
                &request.target_lang,
                context_type,
                options,
                guard,
            )
        }))
        .await;

        if !guard.should_continue() {
            info!("batch superseded; discarding results");
            return Err(TranslateError::Cancelled);
        }
        let _ = tracker.transition(RequestPhase::Merging);

        let mut failures = 0usize;
        let mut first_error = None;
        let mut detected = None;
        let mut fresh: Vec<(usize, String)> = Vec::new();
        for (chunk, result) in chunks.iter().zip(results) {
            match result {
                Ok((parsed, output_detected)) => {
                    detected = detected.or(output_detected);
                    for (item, parsed) in chunk.iter().zip(parsed) {
                        match parsed {
                            Some(text) => fresh.push((item.id, text)),
                            None => {
                                debug!(index = item.id, "segment missing from reply; using source text");
                                translations[item.id] = Some(item.text.clone());
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, items = chunk.len(), "batch chunk failed; using source text");
                    failures += 1;
                    first_error.get_or_insert(e);
                    for item in chunk {
                        translations[item.id] = Some(item.text.clone());
                    }
                }
            }
        }
        if failures == chunk_count {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let source_lang = source_lang
            .or(detected)
            .unwrap_or_else(|| guess_language(&sample).language().to_string());
        let label = engine.label();
        for (index, text) in &fresh {
            let fragment = &fragments[*index];
            self.remember(
                fragment,
                &keys[*index],
                &source_lang,
                text,
                &label,
                options,
            )
            .await;
        }
        for (index, text) in fresh {
            translations[index] = Some(text);
        }

        Ok(BatchOutcome {
            translations: translations.into_iter().map(Option::unwrap_or_default).collect(),
            source_lang,
            target_lang: request.target_lang,
            model: label,
            cached_count,
        })
    }

    /// One translator call for a chunk. Returns one slot per item; `None`
    /// means the item's marker was missing from the reply.
    #[allow(clippy::too_many_arguments)]
    async fn run_chunk(
        &self,
        chunk: &[BatchItem],
        engine: &Engine,
        source_lang: &str,
        target_lang: &str,
        context_type: ContextType,
        options: &TranslateOptions,
        guard: &GenerationGuard,
    ) -> Result<(Vec<Option<String>>, Option<String>), TranslateError> {
        if !guard.should_continue() {
            return Err(TranslateError::Cancelled);
        }
        let numbered = chunk.len() > 1;
        let input = if numbered {
            let texts: Vec<&str> = chunk.iter().map(|i| i.text.as_str()).collect();
            batch::number_segments(&texts)
        } else {
            chunk[0].text.clone()
        };
        let job = Job {
            text: &input,
            source_lang,
            target_lang,
            context_type,
            page: &options.page,
            numbered,
        };
        let output = self.run_engine(engine, &job, guard.token()).await?;
        let slots = if numbered {
            batch::parse_numbered(&output.text, chunk.len())
        } else {
            vec![Some(output.text)]
        };
        Ok((slots, output.detected_source_lang))
    }

    /// Refine an existing translation with a natural-language instruction.
    /// Only the last `refine_history_window` user/assistant turns are replayed.
    pub async fn refine(
        &self,
        request: RefineRequest,
        options: &TranslateOptions,
    ) -> Result<RefineOutcome, TranslateError> {
        for (value, field) in [
            (&request.original_text, "originalText"),
            (&request.current_translation, "currentTranslation"),
            (&request.instruction, "instruction"),
            (&request.target_lang, "targetLang"),
        ] {
            if value.trim().is_empty() {
                return Err(TranslateError::InvalidRequest(format!("{field} is required")));
            }
        }

        let span = self.metrics.span(metric_names::REFINE_DONE);
        let requested = match options.engine {
            EngineChoice::Llm(kind) => kind,
            _ => None,
        };
        let Engine::Llm { kind, key, model } = self.llm_engine(options, requested)? else {
            return Err(TranslateError::NoCredentials("any provider".into()));
        };

        let source_lang = request
            .source_lang
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty() && *l != super::AUTO_LANG)
            .map(str::to_string)
            .unwrap_or_else(|| guess_language(&request.original_text).language().to_string());

        let messages = refine_messages(&request, &source_lang, self.settings.refine_history_window);
        let max_tokens = prompt::estimate_max_tokens(&request.current_translation);
        let response = self
            .chat(kind, &key, &model, &messages, max_tokens, &CancellationToken::new())
            .await;
        span.finish();
        let response = response?;

        debug!(provider = %kind, turns = messages.len(), "refine done");
        Ok(RefineOutcome {
            refined_text: response.content,
            model: format!("{}/{}", kind.id(), model),
        })
    }

    pub async fn detect_language(&self, text: &str) -> Result<Detection, TranslateError> {
        if text.trim().is_empty() {
            return Err(TranslateError::InvalidRequest("text is required".into()));
        }
        Ok(self.detect(text).await)
    }

    pub fn providers(&self) -> ProviderCatalog {
        ProviderCatalog {
            providers: provider_catalog(),
            free_backends: self.racer.backend_names(),
        }
    }

    async fn detect(&self, text: &str) -> Detection {
        let span = self.metrics.span(metric_names::DETECT_LANGUAGE);
        let found = self.racer.detect_language(text).await;
        span.finish();
        found
    }

    fn resolve_engine(&self, options: &TranslateOptions) -> Result<Engine, TranslateError> {
        match options.engine {
            EngineChoice::Machine => Ok(Engine::Machine),
            EngineChoice::Llm(kind) => self.llm_engine(options, kind),
            EngineChoice::Auto if options.api_keys.has_any() => {
                Ok(self.llm_engine(options, None).unwrap_or(Engine::Machine))
            }
            EngineChoice::Auto => Ok(Engine::Machine),
        }
    }

    fn llm_engine(
        &self,
        options: &TranslateOptions,
        requested: Option<ProviderKind>,
    ) -> Result<Engine, TranslateError> {
        let (kind, key) = select_provider(&options.api_keys, requested)?;
        let model = resolve_model(
            kind,
            &ChatOptions {
                model: options.model_id.clone(),
                ..Default::default()
            },
        );
        Ok(Engine::Llm { kind, key, model })
    }

    async fn translate_fragment(
        &self,
        fragment: &TranslationFragment,
        engine: &Engine,
        options: &TranslateOptions,
        tracker: &PhaseTracker,
        cancel: &CancellationToken,
    ) -> Result<TranslationOutcome, TranslateError> {
        let key = engine.cache_key(&fragment.fingerprint());

        if options.use_cache {
            let span = self.metrics.span(metric_names::CACHE_LOOKUP);
            let hit = self.cache.get(&key).await;
            span.finish();
            match hit {
                Ok(Some(hit)) => {
                    self.metrics.incr(metric_names::CACHE_HIT);
                    debug!(%key, "cache hit");
                    return Ok(TranslationOutcome {
                        translated_text: hit.translated_text,
                        source_lang: hit.source_lang,
                        target_lang: hit.target_lang,
                        model: hit.provider_or_model,
                        cached: true,
                    });
                }
                Ok(None) => self.metrics.incr(metric_names::CACHE_MISS),
                Err(e) => warn!(error = %e, %key, "cache read failed"),
            }
        }

        // The LLM prompt names the source language; the racer accepts `auto`.
        let source_for_job = match (fragment.known_source(), engine) {
            (Some(lang), _) => lang.to_string(),
            (None, Engine::Llm { .. }) => {
                let _ = tracker.transition(RequestPhase::DetectingLanguage);
                self.detect(&fragment.text).await.language
            }
            (None, Engine::Machine) => super::AUTO_LANG.to_string(),
        };
        let _ = tracker.transition(RequestPhase::Translating);

        let job = Job {
            text: &fragment.text,
            source_lang: &source_for_job,
            target_lang: &fragment.target_lang,
            context_type: fragment.context_type_or_default(),
            page: &options.page,
            numbered: false,
        };
        let output = self.run_engine(engine, &job, cancel).await?;

        let source_lang = if source_for_job != super::AUTO_LANG {
            source_for_job
        } else {
            output
                .detected_source_lang
                .clone()
                .unwrap_or_else(|| guess_language(&fragment.text).language().to_string())
        };
        self.remember(fragment, &key, &source_lang, &output.text, &output.provider, options)
            .await;

        Ok(TranslationOutcome {
            translated_text: output.text,
            source_lang,
            target_lang: fragment.target_lang.clone(),
            model: output.provider,
            cached: false,
        })
    }

    async fn run_engine(
        &self,
        engine: &Engine,
        job: &Job<'_>,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput, TranslateError> {
        match engine {
            Engine::Machine => {
                let span = self.metrics.span(metric_names::RACE_WON);
                let won = self
                    .racer
                    .race(job.text, job.source_lang, job.target_lang, cancel)
                    .await;
                span.finish();
                let won = match won {
                    Ok(won) => won,
                    Err(e) => {
                        if matches!(e, TranslateError::AllBackendsFailed(_)) {
                            self.metrics.incr(metric_names::RACE_EXHAUSTED);
                        }
                        return Err(e);
                    }
                };
                self.metrics
                    .incr(format!("{}{}", metric_names::RACE_WINNER, won.provider));
                Ok(EngineOutput {
                    text: won.translated_text,
                    provider: won.provider,
                    detected_source_lang: won.detected_source_lang,
                })
            }
            Engine::Llm { kind, key, model } => {
                let hints = self.glossary.match_entries(job.text);
                let system = if job.numbered {
                    prompt::build_batch_system_prompt(
                        job.context_type,
                        job.page,
                        &hints,
                        job.source_lang,
                        job.target_lang,
                    )
                } else {
                    prompt::build_system_prompt(
                        job.context_type,
                        job.page,
                        &hints,
                        job.source_lang,
                        job.target_lang,
                    )
                };
                let messages = [ChatMessage::system(system), ChatMessage::user(job.text)];
                let max_tokens = prompt::estimate_max_tokens(job.text);
                let response = self
                    .chat(*kind, key, model, &messages, max_tokens, cancel)
                    .await?;
                Ok(EngineOutput {
                    text: response.content,
                    provider: engine.label(),
                    detected_source_lang: None,
                })
            }
        }
    }

    async fn chat(
        &self,
        kind: ProviderKind,
        key: &str,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<super::providers::ChatResponse, TranslateError> {
        let provider = self.providers.build(kind, key)?;
        let options = ChatOptions {
            temperature: Some(self.settings.temperature),
            max_tokens: Some(max_tokens),
            model: Some(model.to_string()),
        };
        let span = self.metrics.span(metric_names::LLM_CHAT);
        let response = provider.chat(messages, &options, cancel).await;
        span.finish();
        if let Err(e) = &response {
            if !matches!(e, TranslateError::Cancelled) {
                self.metrics
                    .incr(format!("{}{}", metric_names::PROVIDER_ERROR, kind.id()));
            }
        }
        if let Ok(r) = &response {
            debug!(
                provider = %kind,
                model = %r.model,
                tokens = r.tokens_used.total,
                "llm chat done"
            );
        }
        response
    }

    /// Best-effort cache write plus a queued memory upsert.
    async fn remember(
        &self,
        fragment: &TranslationFragment,
        key: &str,
        source_lang: &str,
        text: &str,
        provider: &str,
        options: &TranslateOptions,
    ) {
        if options.use_cache {
            let value = CachedResult {
                translated_text: text.to_string(),
                source_lang: source_lang.to_string(),
                target_lang: fragment.target_lang.clone(),
                provider_or_model: provider.to_string(),
                cached_at: now_unix(),
            };
            if let Err(e) = self.cache.set(key, value, self.settings.cache_ttl).await {
                warn!(error = %e, %key, "cache write failed");
            }
        }
        if options.use_memory {
            if let Some(memory) = &self.memory {
                memory.record(NewMemoryEntry::from_fragment(fragment, source_lang, text, provider));
            }
        }
    }

    fn sample_guess(&self, fragments: &[TranslationFragment]) -> String {
        let sample: String = fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
            .chars()
            .take(DETECT_SAMPLE_CHARS)
            .collect();
        guess_language(&sample).language().to_string()
    }
}

fn validate_fragment(fragment: &TranslationFragment) -> Result<(), TranslateError> {
    if fragment.text.trim().is_empty() {
        return Err(TranslateError::InvalidRequest("text is required".into()));
    }
    if fragment.target_lang.trim().is_empty() {
        return Err(TranslateError::InvalidRequest("targetLang is required".into()));
    }
    Ok(())
}

fn finish_phase(tracker: &PhaseTracker, ok: bool) {
    if ok {
        if !tracker.current().is_terminal() {
            let _ = tracker.transition(RequestPhase::Done);
        }
    } else {
        tracker.fail();
    }
}

/// System prompt, the text under revision, the replayed window, then the
/// new instruction. System turns in caller history are dropped.
fn refine_messages(request: &RefineRequest, source_lang: &str, window: usize) -> Vec<ChatMessage> {
    let history: Vec<&ChatMessage> = request
        .history
        .iter()
        .filter(|m| m.role != ChatRole::System && !m.content.trim().is_empty())
        .collect();
    let skip = history.len().saturating_sub(window);

    let mut messages = Vec::with_capacity(window + 3);
    messages.push(ChatMessage::system(prompt::build_refine_system_prompt(
        source_lang,
        &request.target_lang,
    )));
    messages.push(ChatMessage::user(prompt::build_refine_context(
        &request.original_text,
        &request.current_translation,
    )));
    messages.extend(history.into_iter().skip(skip).cloned());
    messages.push(ChatMessage::user(request.instruction.trim()));
    messages
}
