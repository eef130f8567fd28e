//! SQLite record store implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use backlog_queue::{
    Condition, NewRecord, QueueRecord, RecordId, RecordStatus, RecordStore, RecordUpdate,
    StorageKey, StoreError,
};

/// SQLite connection options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:backlog.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:backlog.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Config for an in-memory database (testing). Single connection, since
    /// every pool connection would otherwise get its own empty database.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }
}

/// Open a connection pool with the configured pragmas.
pub async fn connect(config: &SqliteConfig) -> Result<SqlitePool, StoreError> {
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    options = options.pragma("busy_timeout", config.busy_timeout_secs.to_string());
    if config.wal_mode {
        options = options.pragma("journal_mode", "WAL");
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");
    Ok(pool)
}

/// Durable record store over one named collection (table).
///
/// `open` creates the schema if missing and caches the table handle; the
/// collection name becomes the table name, so it is restricted to
/// `[A-Za-z0-9_]` (table names cannot be bind parameters).
pub struct SqliteRecordStore {
    pool: SqlitePool,
    table: String,
}

impl SqliteRecordStore {
    pub async fn open(pool: SqlitePool, collection: &str) -> Result<Self, StoreError> {
        if collection.is_empty()
            || !collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::Query(format!(
                "Invalid collection name: {collection:?}"
            )));
        }

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {collection} (
                storage_key INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                received_date TEXT NOT NULL,
                processed_date TEXT,
                available_at TEXT,
                retry_count INTEGER,
                failure_reason TEXT,
                data TEXT NOT NULL
            )
            "#
        ))
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        // Covers the eligibility scan in find_eligible
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{collection}_eligible ON {collection} (status, available_at)"
        ))
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        info!(collection, "Opened record collection");
        Ok(Self {
            pool,
            table: collection.to_string(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.table
    }

    const COLUMNS: &'static str = "storage_key, id, status, received_date, processed_date, \
                                   available_at, retry_count, failure_reason, data";
}

fn decode_row(row: &SqliteRow) -> Result<QueueRecord, StoreError> {
    let query_err = |e: sqlx::Error| StoreError::Query(e.to_string());

    let storage_key: i64 = row.try_get("storage_key").map_err(query_err)?;
    let id_str: String = row.try_get("id").map_err(query_err)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|_| StoreError::Serialization(format!("Invalid record id: {id_str}")))?;

    let status_str: String = row.try_get("status").map_err(query_err)?;
    let status = RecordStatus::parse(&status_str)
        .ok_or_else(|| StoreError::Serialization(format!("Unknown status: {status_str}")))?;

    let received_date: DateTime<Utc> = row.try_get("received_date").map_err(query_err)?;
    let processed_date: Option<DateTime<Utc>> = row.try_get("processed_date").map_err(query_err)?;
    let available_at: Option<DateTime<Utc>> = row.try_get("available_at").map_err(query_err)?;
    let retry_count: Option<i64> = row.try_get("retry_count").map_err(query_err)?;

    let failure_reason: Option<String> = row.try_get("failure_reason").map_err(query_err)?;
    let data_str: String = row.try_get("data").map_err(query_err)?;
    let data = serde_json::from_str(&data_str)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(QueueRecord {
        storage_key: StorageKey(storage_key),
        id,
        status,
        received_date,
        processed_date,
        available_at,
        retry_count: retry_count.map(|count| count as u32),
        failure_reason,
        data,
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert(&self, record: NewRecord) -> Result<QueueRecord, StoreError> {
        let data = serde_json::to_string(&record.data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let row = sqlx::query(&format!(
            "INSERT INTO {} (id, status, received_date, available_at, data) \
             VALUES (?, ?, ?, ?, ?) RETURNING storage_key",
            self.table
        ))
        .bind(record.id.to_string())
        .bind(record.status.as_str())
        .bind(record.received_date)
        .bind(record.available_at)
        .bind(data)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let key: i64 = row
            .try_get("storage_key")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(record.into_record(StorageKey(key)))
    }

    async fn find_eligible(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        condition: Option<&Condition>,
    ) -> Result<Vec<QueueRecord>, StoreError> {
        let base = format!(
            "SELECT {} FROM {} \
             WHERE status IN ('received', 'failed', 'skipped') \
               AND available_at IS NOT NULL AND available_at <= ? \
             ORDER BY storage_key",
            Self::COLUMNS,
            self.table
        );

        // The condition predicate runs over decoded rows, so the limit can
        // only be pushed into SQL when there is no condition: it counts
        // matching records, not scanned ones.
        let rows = match condition {
            None => {
                sqlx::query(&format!("{base} LIMIT ?"))
                    .bind(now)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            Some(_) => sqlx::query(&base).bind(now).fetch_all(&self.pool).await,
        }
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut selected = Vec::with_capacity(limit as usize);
        for row in &rows {
            let record = decode_row(row)?;
            if condition.is_none_or(|matches| matches(&record)) {
                selected.push(record);
                if selected.len() == limit as usize {
                    break;
                }
            }
        }
        Ok(selected)
    }

    async fn apply(&self, key: StorageKey, update: RecordUpdate) -> Result<(), StoreError> {
        if update.is_empty() {
            return Ok(());
        }

        // Clears win over sets for the same column, matching
        // RecordUpdate::apply_to
        let mut sets: Vec<&str> = Vec::new();
        if update.status.is_some() {
            sets.push("status = ?");
        }
        if update.processed_date.is_some() {
            sets.push("processed_date = ?");
        }
        if update.clear_available_at {
            sets.push("available_at = NULL");
        } else if update.available_at.is_some() {
            sets.push("available_at = ?");
        }
        if update.clear_failure_reason {
            sets.push("failure_reason = NULL");
        } else if update.failure_reason.is_some() {
            sets.push("failure_reason = ?");
        }
        if update.clear_retry_count {
            sets.push("retry_count = NULL");
        } else if update.bump_retry_count {
            sets.push("retry_count = COALESCE(retry_count, 0) + 1");
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE storage_key = ?",
            self.table,
            sets.join(", ")
        );

        let mut query = sqlx::query(&sql);
        if let Some(status) = update.status {
            query = query.bind(status.as_str());
        }
        if let Some(at) = update.processed_date {
            query = query.bind(at);
        }
        if !update.clear_available_at {
            if let Some(at) = update.available_at {
                query = query.bind(at);
            }
        }
        if !update.clear_failure_reason {
            if let Some(reason) = update.failure_reason {
                query = query.bind(reason);
            }
        }

        let result = query
            .bind(key.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("storage key {key}")));
        }
        Ok(())
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} \
             WHERE status = 'processed' AND processed_date IS NOT NULL AND processed_date <= ?",
            self.table
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn fetch(&self, id: RecordId) -> Result<Option<QueueRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            Self::COLUMNS,
            self.table
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(decode_row(&row)?)),
            None => Ok(None),
        }
    }
}
