//! Persistent URL → topic-label cache backed by SQLite.
//!
//! The table is append-only: the primary key on `url` guarantees at most one record per URL,
//! and inserts never overwrite an existing row.

use crate::classifier::LABEL_DELIMITER;
use crate::section::PerSection;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const TABLE: &str = "data";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by the cache store.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// SQLite reported a failure.
    #[error("cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The parent directory of the database could not be created.
    #[error("failed to create cache directory: {0}")]
    CreateDir(#[source] std::io::Error),
    /// A previous holder of the connection lock panicked.
    #[error("cache connection lock poisoned")]
    Poisoned,
}

/// Stored labels for one URL, each section's sequence joined with `,`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    /// Primary key.
    pub url: String,
    /// Comma-joined labels per section.
    pub labels: PerSection<String>,
}

impl CacheRecord {
    /// Joins per-section label sequences into a record.
    pub fn from_labels(url: impl Into<String>, labels: &PerSection<Vec<String>>) -> Self {
        let delimiter = LABEL_DELIMITER.to_string();
        Self {
            url: url.into(),
            labels: labels.clone().map(|_, seq| seq.join(&delimiter)),
        }
    }

    /// Splits the stored strings back into sequences; an empty string yields no labels.
    pub fn split_labels(&self) -> PerSection<Vec<String>> {
        self.labels.clone().map(|_, joined| {
            if joined.is_empty() {
                Vec::new()
            } else {
                joined.split(LABEL_DELIMITER).map(str::to_string).collect()
            }
        })
    }
}

/// Result of [`UrlCache::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was written.
    Inserted,
    /// A record for the URL already existed and was left untouched.
    AlreadyExists,
}

/// SQLite-backed cache table.
pub struct UrlCache {
    conn: Mutex<Connection>,
}

impl UrlCache {
    /// Opens (creating if needed) the database file and ensures the table exists.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(CacheError::CreateDir)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CacheError> {
        ensure_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Fetches the record for `url`, if any.
    pub fn lookup(&self, url: &str) -> Result<Option<CacheRecord>, CacheError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT topics_section1, topics_section2, topics_section3 FROM {TABLE} WHERE url = ?1"
        ))?;
        let labels = stmt
            .query_row(params![url], |row| {
                Ok(PerSection::from_array([row.get(0)?, row.get(1)?, row.get(2)?]))
            })
            .optional()?;
        Ok(labels.map(|labels| CacheRecord {
            url: url.to_string(),
            labels,
        }))
    }

    /// Writes `record` unless a record for the same URL exists. The existing row always wins.
    pub fn insert(&self, record: &CacheRecord) -> Result<InsertOutcome, CacheError> {
        let conn = self.lock()?;
        let [s1, s2, s3] = record.labels.clone().into_array();
        let changed = conn.execute(
            &format!(
                "INSERT INTO {TABLE} (url, topics_section1, topics_section2, topics_section3) \
                 VALUES (?1, ?2, ?3, ?4) ON CONFLICT(url) DO NOTHING"
            ),
            params![record.url, s1, s2, s3],
        )?;
        Ok(if changed == 0 {
            InsertOutcome::AlreadyExists
        } else {
            InsertOutcome::Inserted
        })
    }

    /// Number of cached URLs.
    pub fn len(&self) -> Result<usize, CacheError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {TABLE}"), [], |row| {
            row.get(0)
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Whether the cache holds no records.
    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.conn.lock().map_err(|_| CacheError::Poisoned)
    }
}

fn ensure_table(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {TABLE} (
            url TEXT PRIMARY KEY NOT NULL,
            topics_section1 TEXT NOT NULL,
            topics_section2 TEXT NOT NULL,
            topics_section3 TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS {TABLE}_url_idx ON {TABLE}(url);"
    ))?;
    Ok(())
}
