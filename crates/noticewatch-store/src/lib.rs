//! # Noticewatch Store
//!
//! Embedded persisted state for the notice pipeline, backed by DuckDB.
//!
//! The store is the single source of truth for everything that must survive a
//! restart: per-source watermarks, the dedup record of accepted events, and the
//! per-asset cooldown index.
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `watermarks` | Highest `(published_at, item_id)` considered per source |
//! | `processed_events` | Accepted events keyed by content hash |
//! | `processed_bases` | Last time any source acted on a base ticker |
//!
//! ## Write discipline
//!
//! Writes are serialized through one process-wide lock and each dedup write is
//! a single `INSERT OR IGNORE` statement. No write path opens a transaction, so
//! concurrent callers can never nest transactions on a shared connection.
//!
//! ```rust,no_run
//! use noticewatch_store::{EventRecord, InsertOutcome, Store, StoreConfig};
//!
//! # fn main() -> Result<(), noticewatch_store::StoreError> {
//! let store = Store::open(StoreConfig::default())?;
//! let record = EventRecord {
//!     event_id: "ab".repeat(32),
//!     source: "notice-api".to_string(),
//!     base: "ABC".to_string(),
//!     url: "https://exchange.test/notice/1".to_string(),
//!     markets: vec!["KRW".to_string()],
//!     trade_time_utc: None,
//!     raw_title: "New listing (ABC)".to_string(),
//!     created_at: 1_700_000_000_000,
//! };
//! assert_eq!(store.try_mark_processed(&record)?, InsertOutcome::Inserted);
//! assert_eq!(store.try_mark_processed(&record)?, InsertOutcome::Duplicate);
//! # Ok(())
//! # }
//! ```

pub mod duckdb;
mod events;
pub mod migrations;
mod watermark;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub use duckdb::{DuckDbPool, PooledConnection};
pub use events::{BaseCooldown, CleanupReport, EventRecord, InsertOutcome};
pub use watermark::{Watermark, WatermarkPosition};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error while preparing the data directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Market list could not be encoded or decoded.
    #[error("market list encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored or supplied timestamp is not representable.
    #[error("invalid timestamp: '{value}'")]
    Timestamp { value: String },

    /// A record failed validation before being written.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Configuration for the store database.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for noticewatch data.
    pub home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle connections kept in the pool.
    pub max_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_dir(resolve_noticewatch_home())
    }
}

impl StoreConfig {
    /// Store rooted in `home`, with the database at `home/state/noticewatch.duckdb`.
    pub fn in_dir(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let db_path = home.join("state").join("noticewatch.duckdb");
        Self {
            home,
            db_path,
            max_pool_size: 4,
        }
    }
}

/// Persisted pipeline state.
#[derive(Clone)]
pub struct Store {
    pool: DuckDbPool,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Open (creating if needed) the store described by `config` and apply the schema.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pool = DuckDbPool::open(config.db_path.clone(), config.max_pool_size)?;
        let store = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        store.initialize()?;
        tracing::debug!(db_path = %config.db_path.display(), "store opened");
        Ok(store)
    }

    /// Apply schema migrations.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let _guard = self.write_guard();
        let connection = self.pool.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        self.pool.db_path()
    }

    pub(crate) fn connection(&self) -> Result<PooledConnection, StoreError> {
        Ok(self.pool.acquire()?)
    }

    pub(crate) fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .expect("store write lock is not poisoned")
    }
}

/// Format epoch milliseconds as a fixed-width UTC ISO-8601 string
/// (`YYYY-MM-DDTHH:MM:SS.mmmZ`). Fixed width keeps the text sortable.
pub fn format_utc_millis(epoch_ms: i64) -> Result<String, StoreError> {
    let at = OffsetDateTime::from_unix_timestamp_nanos(i128::from(epoch_ms) * 1_000_000).map_err(
        |_| StoreError::Timestamp {
            value: epoch_ms.to_string(),
        },
    )?;
    Ok(format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
        at.millisecond()
    ))
}

/// Parse an RFC3339 timestamp into epoch milliseconds.
pub fn parse_utc_millis(text: &str) -> Result<i64, StoreError> {
    let at = OffsetDateTime::parse(text, &Rfc3339).map_err(|_| StoreError::Timestamp {
        value: text.to_owned(),
    })?;
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).map_err(|_| StoreError::Timestamp {
        value: text.to_owned(),
    })
}

fn resolve_noticewatch_home() -> PathBuf {
    if let Some(path) = env::var_os("NOTICEWATCH_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".noticewatch");
    }

    PathBuf::from(".noticewatch")
}
