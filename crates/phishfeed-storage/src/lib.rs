//! SQLite-backed feed store: the ingestion cursor, the primary record table and
//! the liveness-check queue.

use std::path::{Path, PathBuf};

use phishfeed_core::FeedRecord;
use serde::Deserialize;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "phishfeed-storage";

/// File name the collector has always used for its store under the shard root.
pub const DEFAULT_DATABASE_FILE: &str = "phishing-alive.db";

const CREATE_CURSOR_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS apwg_last_id (
        apwg_id INTEGER
    )
"#;

const CREATE_RECORD_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS apwg_all_urls (
        apwg_id INTEGER PRIMARY KEY,
        url TEXT,
        brand TEXT,
        confidence INTEGER,
        status TEXT,
        discoveredAt INTEGER,
        createdAt INTEGER,
        updatedAt INTEGER,
        ip TEXT,
        asn TEXT,
        metadata TEXT,
        tld TEXT,
        trials INTEGER,
        updated_timestamp TEXT,
        first_failure_timestamp TEXT,
        second_failure_timestamp TEXT,
        third_failure_timestamp TEXT
    )
"#;

const CREATE_QUEUE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS apwg_urls_to_check (
        apwg_id INTEGER PRIMARY KEY,
        apwg_url TEXT,
        trials INTEGER,
        first_failure_timestamp TEXT,
        second_failure_timestamp TEXT,
        third_failure_timestamp TEXT,
        added_timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
    )
"#;

// Liveness columns belong to the checker and are left alone on conflict.
const UPSERT_RECORD: &str = r#"
    INSERT INTO apwg_all_urls (
        apwg_id, url, brand, confidence, status, discoveredAt, createdAt, updatedAt,
        ip, asn, metadata, tld
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(apwg_id) DO UPDATE SET
        url = excluded.url,
        brand = excluded.brand,
        confidence = excluded.confidence,
        status = excluded.status,
        discoveredAt = excluded.discoveredAt,
        createdAt = excluded.createdAt,
        updatedAt = excluded.updatedAt,
        ip = excluded.ip,
        asn = excluded.asn,
        metadata = excluded.metadata,
        tld = excluded.tld
"#;

const QUEUE_KEEP_EXISTING: &str = r#"
    INSERT INTO apwg_urls_to_check (apwg_id, apwg_url, trials)
    VALUES (?, ?, 0)
    ON CONFLICT(apwg_id) DO NOTHING
"#;

const QUEUE_REPLACE: &str = r#"
    INSERT OR REPLACE INTO apwg_urls_to_check (apwg_id, apwg_url, trials)
    VALUES (?, ?, 0)
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("creating store directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("opening store {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("creating schema: {0}")]
    Schema(#[source] sqlx::Error),
    #[error("reading last id: {0}")]
    ReadCursor(#[source] sqlx::Error),
    #[error("updating last id: {0}")]
    WriteCursor(#[source] sqlx::Error),
    #[error("transaction failed: {0}")]
    Transaction(#[source] sqlx::Error),
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),
}

/// What happens when an id is already present in the liveness queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Insert only if absent; the checker's trial state is never reset.
    #[default]
    KeepExisting,
    /// Overwrite the entry, resetting trials to zero.
    Replace,
}

impl QueuePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "keep-existing" | "keep_existing" | "ignore" => Some(Self::KeepExisting),
            "replace" => Some(Self::Replace),
            _ => None,
        }
    }

    fn statement(self) -> &'static str {
        match self {
            Self::KeepExisting => QUEUE_KEEP_EXISTING,
            Self::Replace => QUEUE_REPLACE,
        }
    }
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Binds a feed value the way SQLite would take it from the feed directly:
/// scalars keep their type, while nested arrays and objects become JSON text.
fn bind_scalar<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(flag) => query.bind(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(int) => query.bind(int),
            None => query.bind(number.as_f64()),
        },
        Value::String(text) => query.bind(text.clone()),
        nested => query.bind(nested.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct PersistOptions {
    pub exempt_brand: String,
    pub queue_policy: QueuePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub id: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub upserted: usize,
    pub queued: usize,
    pub already_queued: usize,
    pub exempt: usize,
    pub failures: Vec<RowFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStatus {
    pub last_id: Option<i64>,
    pub records: i64,
    pub queued: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: i64,
    pub url: Option<String>,
    pub trials: Option<i64>,
    pub added_timestamp: Option<String>,
}

/// Scoped handle over the collector database. Call [`FeedStore::close`] when
/// the run is over.
#[derive(Debug)]
pub struct FeedStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl FeedStore {
    /// Opens (creating if needed) the database file and its tables.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;

        let store = Self { pool, path };
        store.ensure_schema().await?;
        debug!(path = %store.path.display(), "feed store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for ddl in [CREATE_CURSOR_TABLE, CREATE_RECORD_TABLE, CREATE_QUEUE_TABLE] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(StoreError::Schema)?;
        }
        Ok(())
    }

    /// Current watermark. A fresh store is seeded with 0.
    pub async fn read_cursor(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT apwg_id FROM apwg_last_id LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::ReadCursor)?;

        if let Some(row) = row {
            let value: Option<i64> = row.try_get(0).map_err(StoreError::ReadCursor)?;
            return Ok(value.unwrap_or(0));
        }

        sqlx::query("INSERT INTO apwg_last_id (apwg_id) VALUES (?)")
            .bind(0_i64)
            .execute(&self.pool)
            .await
            .map_err(StoreError::ReadCursor)?;
        Ok(0)
    }

    /// Replaces the watermark in its own transaction.
    pub async fn write_cursor(&self, value: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::WriteCursor)?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM apwg_last_id")
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::WriteCursor)?;

        let statement = if count == 0 {
            "INSERT INTO apwg_last_id (apwg_id) VALUES (?)"
        } else {
            "UPDATE apwg_last_id SET apwg_id = ?"
        };
        sqlx::query(statement)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::WriteCursor)?;
        tx.commit().await.map_err(StoreError::WriteCursor)
    }

    /// Upserts `records` and seeds the liveness queue in one transaction.
    ///
    /// A failing row is recorded in the report and the batch continues. Only a
    /// failure to begin or commit the transaction is returned as an error, in
    /// which case nothing from the batch is kept.
    pub async fn persist_batch(
        &self,
        records: &[FeedRecord],
        options: &PersistOptions,
    ) -> Result<PersistReport, StoreError> {
        let mut report = PersistReport::default();
        let mut tx = self.pool.begin().await.map_err(StoreError::Transaction)?;

        for record in records {
            let mut upsert = sqlx::query(UPSERT_RECORD).bind(record.id);
            for value in [
                &record.url,
                &record.brand,
                &record.confidence,
                &record.status,
                &record.discovered_at,
                &record.created_at,
                &record.updated_at,
            ] {
                upsert = bind_scalar(upsert, value);
            }
            let upsert = bind_scalar(
                upsert
                    .bind(FeedRecord::json_text(&record.ip))
                    .bind(FeedRecord::json_text(&record.asn))
                    .bind(FeedRecord::json_text(&record.metadata)),
                &record.tld,
            )
            .execute(&mut *tx)
            .await;
            if let Err(err) = upsert {
                warn!(id = record.id, error = %err, "record upsert failed");
                report.failures.push(RowFailure {
                    id: record.id,
                    message: err.to_string(),
                });
                continue;
            }
            report.upserted += 1;

            if record.is_exempt(&options.exempt_brand) {
                report.exempt += 1;
                continue;
            }

            let queue = sqlx::query(options.queue_policy.statement()).bind(record.id);
            match bind_scalar(queue, &record.url).execute(&mut *tx).await {
                Ok(done) if done.rows_affected() == 0 => report.already_queued += 1,
                Ok(_) => report.queued += 1,
                Err(err) => {
                    warn!(id = record.id, error = %err, "liveness queue insert failed");
                    report.failures.push(RowFailure {
                        id: record.id,
                        message: err.to_string(),
                    });
                }
            }
        }

        tx.commit().await.map_err(StoreError::Transaction)?;
        Ok(report)
    }

    pub async fn status(&self) -> Result<StoreStatus, StoreError> {
        let last_id = sqlx::query_scalar::<_, Option<i64>>("SELECT apwg_id FROM apwg_last_id LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Query)?
            .flatten();
        let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM apwg_all_urls")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM apwg_urls_to_check")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(StoreStatus {
            last_id,
            records,
            queued,
        })
    }

    pub async fn queue_entry(&self, id: i64) -> Result<Option<QueueEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT apwg_id, apwg_url, trials, CAST(added_timestamp AS TEXT) AS added_timestamp
              FROM apwg_urls_to_check
             WHERE apwg_id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        row.map(|row| -> Result<QueueEntry, sqlx::Error> {
            Ok(QueueEntry {
                id: row.try_get("apwg_id")?,
                url: row.try_get("apwg_url")?,
                trials: row.try_get("trials")?,
                added_timestamp: row.try_get("added_timestamp")?,
            })
        })
        .transpose()
        .map_err(StoreError::Query)
    }

    /// Ids present in the primary table, ascending.
    pub async fn record_ids(&self) -> Result<Vec<i64>, StoreError> {
        sqlx::query_scalar("SELECT apwg_id FROM apwg_all_urls ORDER BY apwg_id")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)
    }

    pub async fn close(self) {
        self.pool.close().await;
        debug!(path = %self.path.display(), "feed store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(id: i64, brand: &str) -> FeedRecord {
        FeedRecord {
            id,
            url: json!(format!("http://phish-{id}.test/login")),
            brand: json!(brand),
            confidence: json!(90),
            status: json!("active"),
            discovered_at: json!(1_700_000_000 + id),
            created_at: json!(1_700_000_000 + id),
            updated_at: json!(1_700_000_000 + id),
            ip: json!(["198.51.100.1"]),
            asn: json!("AS64501"),
            metadata: json!({"source": "test"}),
            tld: json!("test"),
        }
    }

    fn options(policy: QueuePolicy) -> PersistOptions {
        PersistOptions {
            exempt_brand: "National Police Agency JAPAN".to_string(),
            queue_policy: policy,
        }
    }

    #[tokio::test]
    async fn cursor_starts_at_zero_and_is_replaced() {
        let dir = tempdir().expect("tempdir");
        let store = FeedStore::open(dir.path().join("nested/store.db")).await.expect("open");

        assert_eq!(store.status().await.expect("status").last_id, None);
        assert_eq!(store.read_cursor().await.expect("read"), 0);
        assert_eq!(store.read_cursor().await.expect("read again"), 0);

        store.write_cursor(120).await.expect("write");
        store.write_cursor(130).await.expect("write");
        assert_eq!(store.read_cursor().await.expect("read"), 130);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM apwg_last_id")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(rows, 1);
        store.close().await;
    }

    #[tokio::test]
    async fn cursor_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.db");
        let store = FeedStore::open(&path).await.expect("open");
        store.write_cursor(77).await.expect("write");
        store.close().await;

        let store = FeedStore::open(&path).await.expect("reopen");
        assert_eq!(store.read_cursor().await.expect("read"), 77);
        store.close().await;
    }

    #[tokio::test]
    async fn exempt_brand_skips_the_liveness_queue() {
        let dir = tempdir().expect("tempdir");
        let store = FeedStore::open(dir.path().join("store.db")).await.expect("open");
        let batch = vec![record(3, "Example Bank"), record(2, "National Police Agency JAPAN")];

        let report = store
            .persist_batch(&batch, &options(QueuePolicy::KeepExisting))
            .await
            .expect("persist");
        assert_eq!(report.upserted, 2);
        assert_eq!(report.queued, 1);
        assert_eq!(report.exempt, 1);
        assert!(report.failures.is_empty());

        assert_eq!(store.record_ids().await.expect("ids"), vec![2, 3]);
        assert!(store.queue_entry(2).await.expect("entry").is_none());
        let entry = store.queue_entry(3).await.expect("entry").expect("queued");
        assert_eq!(entry.trials, Some(0));
        assert_eq!(entry.url.as_deref(), Some("http://phish-3.test/login"));
        assert!(entry.added_timestamp.is_some());
        store.close().await;
    }

    #[tokio::test]
    async fn keep_existing_preserves_trial_state_and_replace_resets_it() {
        let dir = tempdir().expect("tempdir");
        let store = FeedStore::open(dir.path().join("store.db")).await.expect("open");
        let batch = vec![record(10, "Example Bank")];
        store
            .persist_batch(&batch, &options(QueuePolicy::KeepExisting))
            .await
            .expect("first");

        sqlx::query("UPDATE apwg_urls_to_check SET trials = 2 WHERE apwg_id = 10")
            .execute(store.pool())
            .await
            .expect("checker update");
        sqlx::query("UPDATE apwg_all_urls SET trials = 2 WHERE apwg_id = 10")
            .execute(store.pool())
            .await
            .expect("checker update");

        let report = store
            .persist_batch(&batch, &options(QueuePolicy::KeepExisting))
            .await
            .expect("rerun");
        assert_eq!(report.already_queued, 1);
        assert_eq!(report.queued, 0);
        let entry = store.queue_entry(10).await.expect("entry").expect("queued");
        assert_eq!(entry.trials, Some(2));
        let record_trials: Option<i64> =
            sqlx::query_scalar("SELECT trials FROM apwg_all_urls WHERE apwg_id = 10")
                .fetch_one(store.pool())
                .await
                .expect("trials");
        assert_eq!(record_trials, Some(2));

        store
            .persist_batch(&batch, &options(QueuePolicy::Replace))
            .await
            .expect("replace");
        let entry = store.queue_entry(10).await.expect("entry").expect("queued");
        assert_eq!(entry.trials, Some(0));
        store.close().await;
    }

    #[tokio::test]
    async fn failing_row_does_not_abort_the_batch() {
        let dir = tempdir().expect("tempdir");
        let store = FeedStore::open(dir.path().join("store.db")).await.expect("open");
        sqlx::query(
            r#"
            CREATE TRIGGER reject_poisoned BEFORE INSERT ON apwg_all_urls
            WHEN NEW.apwg_id = 13
            BEGIN
                SELECT RAISE(ABORT, 'poisoned record');
            END
            "#,
        )
        .execute(store.pool())
        .await
        .expect("trigger");

        let batch = vec![record(14, "A"), record(13, "B"), record(12, "C")];
        let report = store
            .persist_batch(&batch, &options(QueuePolicy::KeepExisting))
            .await
            .expect("persist");

        assert_eq!(report.upserted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, 13);
        assert!(report.failures[0].message.contains("poisoned record"));
        assert_eq!(store.record_ids().await.expect("ids"), vec![12, 14]);
        assert!(store.queue_entry(13).await.expect("entry").is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn opaque_fields_are_stored_as_json_text() {
        let dir = tempdir().expect("tempdir");
        let store = FeedStore::open(dir.path().join("store.db")).await.expect("open");
        store
            .persist_batch(&[record(5, "Example Bank")], &options(QueuePolicy::KeepExisting))
            .await
            .expect("persist");

        let row = sqlx::query("SELECT ip, asn, metadata FROM apwg_all_urls WHERE apwg_id = 5")
            .fetch_one(store.pool())
            .await
            .expect("row");
        let ip: String = row.try_get("ip").expect("ip");
        let asn: String = row.try_get("asn").expect("asn");
        let metadata: String = row.try_get("metadata").expect("metadata");
        assert_eq!(ip, r#"["198.51.100.1"]"#);
        assert_eq!(asn, r#""AS64501""#);
        assert_eq!(metadata, r#"{"source":"test"}"#);
        store.close().await;
    }

    #[tokio::test]
    async fn loosely_typed_values_are_stored_as_sent() {
        let dir = tempdir().expect("tempdir");
        let store = FeedStore::open(dir.path().join("store.db")).await.expect("open");
        let mut odd = record(6, "Example Bank");
        odd.brand = Value::Null;
        odd.confidence = json!("high");
        odd.discovered_at = json!(1.5);
        odd.tld = json!(["co", "uk"]);

        let report = store
            .persist_batch(&[odd], &options(QueuePolicy::KeepExisting))
            .await
            .expect("persist");
        assert_eq!(report.upserted, 1);
        assert_eq!(report.queued, 1);
        assert!(report.failures.is_empty());

        let row = sqlx::query(
            "SELECT brand, typeof(confidence) AS confidence_type, discoveredAt, tld
               FROM apwg_all_urls WHERE apwg_id = 6",
        )
        .fetch_one(store.pool())
        .await
        .expect("row");
        let brand: Option<String> = row.try_get("brand").expect("brand");
        let confidence_type: String = row.try_get("confidence_type").expect("type");
        let discovered: f64 = row.try_get("discoveredAt").expect("discoveredAt");
        let tld: String = row.try_get("tld").expect("tld");
        assert_eq!(brand, None);
        assert_eq!(confidence_type, "text");
        assert_eq!(discovered, 1.5);
        assert_eq!(tld, r#"["co","uk"]"#);
        store.close().await;
    }

    #[test]
    fn queue_policy_parses_both_spellings() {
        assert_eq!(QueuePolicy::parse("keep-existing"), Some(QueuePolicy::KeepExisting));
        assert_eq!(QueuePolicy::parse(" Replace "), Some(QueuePolicy::Replace));
        assert_eq!(QueuePolicy::parse("sometimes"), None);
    }
}
