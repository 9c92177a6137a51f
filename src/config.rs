//! Server configuration: command-line flags, each backed by a `DUALTRANS_*`
//! environment variable.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::translate::free::{GoogleGtx, Lingva, MyMemory};
use crate::translate::providers::RetryPolicy;
use crate::translate::ServiceSettings;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dualtrans",
    about = "Dual machine + LLM translation API for the browser extension"
)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "DUALTRANS_BIND", default_value = "127.0.0.1:8787")]
    pub bind: String,

    /// SQLite file for the translation memory. In-memory when unset.
    #[arg(long, env = "DUALTRANS_MEMORY_DB")]
    pub memory_db: Option<PathBuf>,

    /// SQLite file for the persistent result cache. L1-only when unset.
    #[arg(long, env = "DUALTRANS_CACHE_DB")]
    pub cache_db: Option<PathBuf>,

    /// Entries kept in the in-memory result cache.
    #[arg(long, env = "DUALTRANS_CACHE_CAPACITY", default_value_t = 4096)]
    pub cache_capacity: usize,

    /// Result cache TTL in seconds (default 7 days).
    #[arg(long, env = "DUALTRANS_CACHE_TTL_SECS", default_value_t = 7 * 24 * 3600)]
    pub cache_ttl_secs: u64,

    /// JSON glossary file (`{"version": 1, "entries": [...]}`).
    #[arg(long, env = "DUALTRANS_GLOSSARY")]
    pub glossary: Option<PathBuf>,

    #[arg(long, env = "DUALTRANS_GOOGLE_URL", default_value = GoogleGtx::DEFAULT_BASE_URL)]
    pub google_url: String,

    #[arg(long, env = "DUALTRANS_MYMEMORY_URL", default_value = MyMemory::DEFAULT_BASE_URL)]
    pub mymemory_url: String,

    #[arg(long, env = "DUALTRANS_LINGVA_URL", default_value = Lingva::DEFAULT_BASE_URL)]
    pub lingva_url: String,

    /// Per-request timeout for outbound HTTP calls, in seconds.
    #[arg(long, env = "DUALTRANS_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// Attempts per LLM call, including the first.
    #[arg(long, env = "DUALTRANS_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// First backoff delay in milliseconds; doubles on each retry.
    #[arg(long, env = "DUALTRANS_RETRY_BASE_MS", default_value_t = 500)]
    pub retry_base_ms: u64,

    /// Network language-detection timeout in milliseconds.
    #[arg(long, env = "DUALTRANS_DETECT_TIMEOUT_MS", default_value_t = 3000)]
    pub detect_timeout_ms: u64,

    #[arg(long, env = "DUALTRANS_BATCH_MAX_ITEMS", default_value_t = 20)]
    pub batch_max_items: usize,

    #[arg(long, env = "DUALTRANS_BATCH_MAX_CHARS", default_value_t = 4000)]
    pub batch_max_chars: usize,

    /// Maximum texts accepted by one `/translate/batch` request.
    #[arg(long, env = "DUALTRANS_BATCH_CAP", default_value_t = 50)]
    pub batch_cap: usize,

    /// Prior refinement turns replayed to the model.
    #[arg(long, env = "DUALTRANS_REFINE_WINDOW", default_value_t = 10)]
    pub refine_window: usize,

    /// Emit logs as JSON lines.
    #[arg(long, env = "DUALTRANS_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl ServerConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.detect_timeout_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            batch_max_items: self.batch_max_items.max(1),
            batch_max_chars: self.batch_max_chars.max(1),
            max_batch_texts: self.batch_cap.max(1),
            refine_history_window: self.refine_window,
            ..ServiceSettings::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["dualtrans"])
    }
}
