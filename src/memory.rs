//! Durable translation memory on SQLite.
//! Writes from the translation path are queued on a channel and upserted in
//! batches every 300ms, so a request never waits on disk I/O. One row exists
//! per `(fingerprint, source_lang, target_lang)`; repeats bump `use_count`
//! and overwrite the target text.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::translate::cache::now_unix;
use crate::translate::{ContextType, TranslationFragment};

const FLUSH_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_LIST_LIMIT: u32 = 50;
pub const MAX_LIST_LIMIT: u32 = 500;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS translation_memory (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint TEXT NOT NULL,
        source_text TEXT NOT NULL,
        target_text TEXT NOT NULL,
        source_lang TEXT NOT NULL,
        target_lang TEXT NOT NULL,
        context_type TEXT NOT NULL DEFAULT 'general',
        model_used TEXT NOT NULL,
        quality_score INTEGER NOT NULL DEFAULT 0,
        use_count INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (fingerprint, source_lang, target_lang)
    );
    CREATE INDEX IF NOT EXISTS idx_memory_updated ON translation_memory(updated_at);
    CREATE INDEX IF NOT EXISTS idx_memory_langs ON translation_memory(source_lang, target_lang);";

const UPSERT: &str = "INSERT INTO translation_memory
        (fingerprint, source_text, target_text, source_lang, target_lang,
         context_type, model_used, created_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
     ON CONFLICT (fingerprint, source_lang, target_lang) DO UPDATE SET
        target_text = excluded.target_text,
        model_used = excluded.model_used,
        context_type = excluded.context_type,
        use_count = use_count + 1,
        updated_at = excluded.updated_at";

const COLUMNS: &str = "id, fingerprint, source_text, target_text, source_lang, target_lang,
     context_type, model_used, quality_score, use_count, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("memory entry {0} not found")]
    NotFound(i64),
    #[error("quality score must be between 1 and 5, got {0}")]
    InvalidQuality(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: i64,
    pub fingerprint: String,
    pub source_text: String,
    pub target_text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub context_type: String,
    pub model_used: String,
    /// 0 = unrated.
    pub quality_score: i64,
    pub use_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MemoryEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            fingerprint: row.get(1)?,
            source_text: row.get(2)?,
            target_text: row.get(3)?,
            source_lang: row.get(4)?,
            target_lang: row.get(5)?,
            context_type: row.get(6)?,
            model_used: row.get(7)?,
            quality_score: row.get(8)?,
            use_count: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

/// A translation to remember.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMemoryEntry {
    pub fingerprint: String,
    pub source_text: String,
    pub target_text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub context_type: ContextType,
    pub model_used: String,
}

impl NewMemoryEntry {
    /// `source_lang` is the resolved language; the fingerprint keeps the
    /// fragment's own (possibly `auto`) source.
    pub fn from_fragment(
        fragment: &TranslationFragment,
        source_lang: &str,
        target_text: impl Into<String>,
        model_used: impl Into<String>,
    ) -> Self {
        Self {
            fingerprint: fragment.fingerprint(),
            source_text: fragment.text.clone(),
            target_text: target_text.into(),
            source_lang: source_lang.to_string(),
            target_lang: fragment.target_lang.clone(),
            context_type: fragment.context_type_or_default(),
            model_used: model_used.into(),
        }
    }
}

/// Filters for `list`. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryQuery {
    pub source_lang: Option<String>,
    pub target_lang: Option<String>,
    /// Substring of source or target text.
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguagePairCount {
    pub source_lang: String,
    pub target_lang: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCount {
    pub model: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_entries: i64,
    pub total_uses: i64,
    pub rated_entries: i64,
    pub average_quality: Option<f64>,
    pub language_pairs: Vec<LanguagePairCount>,
    pub models: Vec<ModelCount>,
}

enum MemoryCommand {
    Record(NewMemoryEntry),
    Flush(oneshot::Sender<()>),
}

pub struct MemoryStore {
    tx: mpsc::UnboundedSender<MemoryCommand>,
    conn: Arc<Mutex<Connection>>,
}

impl MemoryStore {
    /// Open (or create) the database file and start the batch writer.
    /// Must be called inside a Tokio runtime.
    pub fn open(db_path: &Path) -> Result<Arc<Self>, MemoryError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::with_connection(conn)?;
        info!(path = %db_path.display(), "memory store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Arc<Self>, MemoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Arc<Self>, MemoryError> {
        conn.execute_batch(SCHEMA)?;
        let conn = Arc::new(Mutex::new(conn));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(flush_loop(rx, Arc::clone(&conn)));
        Ok(Arc::new(Self { tx, conn }))
    }

    /// Queue an entry for the batch writer. Never blocks, never fails.
    pub fn record(&self, entry: NewMemoryEntry) {
        if self.tx.send(MemoryCommand::Record(entry)).is_err() {
            warn!("memory writer gone; entry dropped");
        }
    }

    /// Wait until everything queued so far is written.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(MemoryCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Upsert synchronously and return the stored row.
    pub fn upsert_now(&self, entry: &NewMemoryEntry) -> Result<MemoryEntry, MemoryError> {
        let conn = self.conn.lock();
        upsert(&conn, entry, now_unix())?;
        let row = conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM translation_memory
                 WHERE fingerprint = ?1 AND source_lang = ?2 AND target_lang = ?3"
            ),
            params![entry.fingerprint, entry.source_lang, entry.target_lang],
            MemoryEntry::from_row,
        )?;
        Ok(row)
    }

    /// Newest first.
    pub fn list(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>, MemoryError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(lang) = non_blank(&query.source_lang) {
            values.push(Value::Text(lang.to_string()));
            clauses.push(format!("source_lang = ?{}", values.len()));
        }
        if let Some(lang) = non_blank(&query.target_lang) {
            values.push(Value::Text(lang.to_string()));
            clauses.push(format!("target_lang = ?{}", values.len()));
        }
        if let Some(term) = non_blank(&query.search) {
            values.push(Value::Text(format!("%{}%", escape_like(term))));
            let n = values.len();
            clauses.push(format!(
                "(source_text LIKE ?{n} ESCAPE '\\' OR target_text LIKE ?{n} ESCAPE '\\')"
            ));
        }

        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        values.push(Value::Integer(i64::from(limit)));
        let limit_idx = values.len();
        values.push(Value::Integer(i64::from(query.offset.unwrap_or(0))));
        let offset_idx = values.len();

        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM translation_memory {filter}
             ORDER BY updated_at DESC, id DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), MemoryEntry::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get(&self, id: i64) -> Result<Option<MemoryEntry>, MemoryError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM translation_memory WHERE id = ?1"),
                params![id],
                MemoryEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Record a user rating (1..=5).
    pub fn set_quality(&self, id: i64, score: i64) -> Result<MemoryEntry, MemoryError> {
        if !(1..=5).contains(&score) {
            return Err(MemoryError::InvalidQuality(score));
        }
        let changed = self.conn.lock().execute(
            "UPDATE translation_memory SET quality_score = ?1, updated_at = ?2 WHERE id = ?3",
            params![score, now_unix(), id],
        )?;
        if changed == 0 {
            return Err(MemoryError::NotFound(id));
        }
        self.get(id)?.ok_or(MemoryError::NotFound(id))
    }

    pub fn delete(&self, id: i64) -> Result<bool, MemoryError> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM translation_memory WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn stats(&self) -> Result<MemoryStats, MemoryError> {
        let conn = self.conn.lock();
        let (total_entries, total_uses, rated_entries, average_quality) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(use_count), 0),
                    COUNT(CASE WHEN quality_score > 0 THEN 1 END),
                    AVG(CASE WHEN quality_score > 0 THEN quality_score END)
             FROM translation_memory",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT source_lang, target_lang, COUNT(*) AS n FROM translation_memory
             GROUP BY source_lang, target_lang ORDER BY n DESC, source_lang, target_lang",
        )?;
        let language_pairs = stmt
            .query_map([], |row| {
                Ok(LanguagePairCount {
                    source_lang: row.get(0)?,
                    target_lang: row.get(1)?,
                    count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT model_used, COUNT(*) AS n FROM translation_memory
             GROUP BY model_used ORDER BY n DESC, model_used",
        )?;
        let models = stmt
            .query_map([], |row| {
                Ok(ModelCount {
                    model: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MemoryStats {
            total_entries,
            total_uses,
            rated_entries,
            average_quality,
            language_pairs,
            models,
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn upsert(conn: &Connection, entry: &NewMemoryEntry, now: i64) -> rusqlite::Result<usize> {
    conn.prepare_cached(UPSERT)?.execute(params![
        entry.fingerprint,
        entry.source_text,
        entry.target_text,
        entry.source_lang,
        entry.target_lang,
        entry.context_type.as_str(),
        entry.model_used,
        now,
    ])
}

/// Collects queued entries and writes them in one transaction per tick.
async fn flush_loop(mut rx: mpsc::UnboundedReceiver<MemoryCommand>, conn: Arc<Mutex<Connection>>) {
    let mut buffer: Vec<NewMemoryEntry> = Vec::with_capacity(32);
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
            msg = rx.recv() => match msg {
                Some(cmd) => absorb(cmd, &mut buffer, &mut waiters),
                None => {
                    if !buffer.is_empty() {
                        write_batch(&mut conn.lock(), &buffer);
                    }
                    debug!("memory writer exiting");
                    return;
                }
            }
        }

        while let Ok(cmd) = rx.try_recv() {
            absorb(cmd, &mut buffer, &mut waiters);
        }

        if !buffer.is_empty() {
            write_batch(&mut conn.lock(), &buffer);
            buffer.clear();
        }
        for waiter in waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn absorb(cmd: MemoryCommand, buffer: &mut Vec<NewMemoryEntry>, waiters: &mut Vec<oneshot::Sender<()>>) {
    match cmd {
        MemoryCommand::Record(entry) => buffer.push(entry),
        MemoryCommand::Flush(ack) => waiters.push(ack),
    }
}

fn write_batch(conn: &mut Connection, entries: &[NewMemoryEntry]) {
    let start = std::time::Instant::now();
    let now = now_unix();
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            warn!(error = %e, "memory batch begin failed");
            return;
        }
    };
    for entry in entries {
        if let Err(e) = upsert(&tx, entry, now) {
            warn!(error = %e, fingerprint = %entry.fingerprint, "memory upsert failed");
        }
    }
    match tx.commit() {
        Ok(()) => debug!(
            count = entries.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "memory batch flushed"
        ),
        Err(e) => warn!(error = %e, "memory batch commit failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str, target: &str, model: &str) -> NewMemoryEntry {
        let fragment = TranslationFragment::new(text, "fr").with_source("en");
        NewMemoryEntry::from_fragment(&fragment, "en", target, model)
    }

    #[tokio::test]
    async fn repeat_translation_bumps_use_count_and_overwrites() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.record(entry("Hello", "Salut", "google"));
        store.record(entry("Hello", "Bonjour", "openai/gpt-4o-mini"));
        store.flush().await;

        let rows = store.list(&MemoryQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].use_count, 2);
        assert_eq!(rows[0].target_text, "Bonjour");
        assert_eq!(rows[0].model_used, "openai/gpt-4o-mini");
        assert_eq!(rows[0].quality_score, 0);
    }

    #[tokio::test]
    async fn different_target_language_is_a_separate_row() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.upsert_now(&entry("Hello", "Bonjour", "google")).unwrap();
        let german = NewMemoryEntry::from_fragment(
            &TranslationFragment::new("Hello", "de").with_source("en"),
            "en",
            "Hallo",
            "google",
        );
        store.upsert_now(&german).unwrap();
        assert_eq!(store.stats().unwrap().total_entries, 2);
    }

    #[tokio::test]
    async fn quality_rating_is_validated() {
        let store = MemoryStore::open_in_memory().unwrap();
        let row = store.upsert_now(&entry("cat", "chat", "google")).unwrap();

        assert!(matches!(store.set_quality(row.id, 0), Err(MemoryError::InvalidQuality(0))));
        assert!(matches!(store.set_quality(row.id, 6), Err(MemoryError::InvalidQuality(6))));
        assert!(matches!(store.set_quality(9999, 3), Err(MemoryError::NotFound(9999))));

        let rated = store.set_quality(row.id, 4).unwrap();
        assert_eq!(rated.quality_score, 4);
        let stats = store.stats().unwrap();
        assert_eq!(stats.rated_entries, 1);
        assert_eq!(stats.average_quality, Some(4.0));
    }

    #[tokio::test]
    async fn list_filters_and_pagination() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.upsert_now(&entry("good morning", "bonjour", "google")).unwrap();
        store.upsert_now(&entry("good night", "bonne nuit", "google")).unwrap();
        store.upsert_now(&entry("100% sure", "sûr à 100 %", "mymemory")).unwrap();

        let search = |term: &str| MemoryQuery {
            search: Some(term.into()),
            ..Default::default()
        };
        assert_eq!(store.list(&search("good")).unwrap().len(), 2);
        assert_eq!(store.list(&search("nuit")).unwrap().len(), 1);
        assert_eq!(store.list(&search("0%")).unwrap().len(), 1);

        let wrong_pair = MemoryQuery {
            target_lang: Some("de".into()),
            ..Default::default()
        };
        assert!(store.list(&wrong_pair).unwrap().is_empty());

        let page = MemoryQuery {
            limit: Some(2),
            offset: Some(2),
            ..Default::default()
        };
        assert_eq!(store.list(&page).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_and_delete() {
        let store = MemoryStore::open_in_memory().unwrap();
        let row = store.upsert_now(&entry("dog", "chien", "lingva")).unwrap();
        assert_eq!(store.get(row.id).unwrap().unwrap().source_text, "dog");
        assert!(store.delete(row.id).unwrap());
        assert!(!store.delete(row.id).unwrap());
        assert!(store.get(row.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_group_by_pair_and_model() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.upsert_now(&entry("a", "A", "google")).unwrap();
        store.upsert_now(&entry("b", "B", "google")).unwrap();
        store.upsert_now(&entry("b", "B2", "anthropic/claude")).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_uses, 3);
        assert_eq!(
            stats.language_pairs,
            vec![LanguagePairCount {
                source_lang: "en".into(),
                target_lang: "fr".into(),
                count: 2
            }]
        );
        assert_eq!(
            stats.models,
            vec![
                ModelCount { model: "anthropic/claude".into(), count: 1 },
                ModelCount { model: "google".into(), count: 1 },
            ]
        );
    }
}
