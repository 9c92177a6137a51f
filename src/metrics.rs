//! Request identifiers, latency windows and event counters.
//!
//! Every service operation opens a [`TimingSpan`]; `/metrics` serves a
//! [`MetricsSnapshot`] with p50/p95/p99 per stage plus plain counters
//! (cache hits, race winners, provider failures).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Correlates log lines of one service call.
#[derive(Debug, Clone)]
pub struct RequestIds {
    pub trace_id: String,
    pub request_id: String,
}

impl RequestIds {
    pub fn new() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Measures one stage. Records into the registry on `finish`, or on drop
/// if the owner bailed out early with `?`.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
    recorded: bool,
}

impl TimingSpan {
    pub fn finish(mut self) -> f64 {
        self.record()
    }

    fn record(&mut self) -> f64 {
        let elapsed_us = self.start.elapsed().as_micros() as f64;
        if !self.recorded {
            self.recorded = true;
            self.registry.observe(self.name, elapsed_us);
        }
        elapsed_us
    }
}

impl Drop for TimingSpan {
    fn drop(&mut self) {
        self.record();
    }
}

/// The most recent `capacity` samples of one stage.
struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    total: u64,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    fn push(&mut self, value_us: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value_us);
        self.total += 1;
    }

    fn summarize(&self) -> LatencySummary {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        LatencySummary {
            p50_us: nearest_rank(&sorted, 50.0),
            p95_us: nearest_rank(&sorted, 95.0),
            p99_us: nearest_rank(&sorted, 99.0),
            max_us: sorted.last().copied().unwrap_or(0.0),
            count: self.total,
        }
    }
}

/// Nearest-rank percentile over an ascending slice; 0 when empty.
fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub max_us: f64,
    /// Samples ever recorded, including those evicted from the window.
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub latencies: BTreeMap<String, LatencySummary>,
    pub counters: BTreeMap<String, u64>,
}

pub struct MetricsRegistry {
    latencies: Mutex<HashMap<&'static str, LatencyWindow>>,
    counters: Mutex<HashMap<String, u64>>,
    window: usize,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_window(1024)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            latencies: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            window: window.max(1),
        }
    }

    pub fn observe(&self, name: &'static str, value_us: f64) {
        self.latencies
            .lock()
            .entry(name)
            .or_insert_with(|| LatencyWindow::new(self.window))
            .push(value_us);
        tracing::trace!(metric = name, value_us, "latency observed");
    }

    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
            recorded: false,
        }
    }

    /// Bump a counter. Names may be dynamic, e.g. `race_won.lingva`.
    pub fn incr(&self, name: impl Into<String>) {
        *self.counters.lock().entry(name.into()).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn latency(&self, name: &str) -> Option<LatencySummary> {
        self.latencies.lock().get(name).map(LatencyWindow::summarize)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latencies = self
            .latencies
            .lock()
            .iter()
            .map(|(&name, window)| (name.to_string(), window.summarize()))
            .collect();
        let counters = self
            .counters
            .lock()
            .iter()
            .map(|(name, &v)| (name.clone(), v))
            .collect();
        MetricsSnapshot { latencies, counters }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub mod metric_names {
    pub const RACE_WON: &str = "t_race_won";
    pub const LLM_CHAT: &str = "t_llm_chat";
    pub const DETECT_LANGUAGE: &str = "t_detect_language";
    pub const TRANSLATE_DONE: &str = "t_translate_done";
    pub const DUAL_DONE: &str = "t_dual_done";
    pub const BATCH_DONE: &str = "t_batch_done";
    pub const REFINE_DONE: &str = "t_refine_done";
    pub const CACHE_LOOKUP: &str = "t_cache_lookup";

    pub const CACHE_HIT: &str = "cache_hit";
    pub const CACHE_MISS: &str = "cache_miss";
    /// Prefix; the winning backend name is appended.
    pub const RACE_WINNER: &str = "race_won.";
    pub const RACE_EXHAUSTED: &str = "race_exhausted";
    /// Prefix; the provider id is appended.
    pub const PROVIDER_ERROR: &str = "provider_error.";
}
