//! Incremental feed ingestion: configuration, cursor-bounded selection,
//! scan retries and the run loop that ties shards, store and alerts together.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use phishfeed_adapters::{decode_shard, DecodedShard, ScanError, ShardError, ShardItem, ShardLocator};
use phishfeed_core::{FeedRecord, RetryDisposition};
use phishfeed_notify::{
    deliver, LogNotifier, Notifier, TelegramConfig, TelegramCredentials, TelegramNotifier,
};
use phishfeed_storage::{FeedStore, PersistOptions, QueuePolicy, DEFAULT_DATABASE_FILE};
use serde::Deserialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "phishfeed-sync";

/// Brand whose reports are takedown notices rather than live sites.
pub const DEFAULT_EXEMPT_BRAND: &str = "National Police Agency JAPAN";
pub const DEFAULT_SHARD_ROOT: &str = "./tmp/apwg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub shard_root: PathBuf,
    pub exempt_brand: String,
    pub retry: RetryPolicy,
    pub queue_policy: QueuePolicy,
}

impl IngestConfig {
    pub fn new(shard_root: impl Into<PathBuf>) -> Self {
        Self {
            shard_root: shard_root.into(),
            exempt_brand: DEFAULT_EXEMPT_BRAND.to_string(),
            retry: RetryPolicy::default(),
            queue_policy: QueuePolicy::default(),
        }
    }

    fn persist_options(&self) -> PersistOptions {
        PersistOptions {
            exempt_brand: self.exempt_brand.clone(),
            queue_policy: self.queue_policy,
        }
    }
}

/// Optional YAML settings file; every key may also come from the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub shard_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub exempt_brand: Option<String>,
    pub retry_count: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub queue_policy: Option<QueuePolicy>,
    pub telegram_api_key: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub ingest: IngestConfig,
    pub database_path: PathBuf,
    pub telegram: Option<TelegramCredentials>,
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self> {
        let file = match std::env::var_os("PHISHFEED_CONFIG") {
            Some(path) => ConfigFile::load(Path::new(&path))?,
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Environment values win over file values, which win over defaults.
    pub fn resolve(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let shard_root = env("ROOT_SAVE_PATH")
            .map(PathBuf::from)
            .or(file.shard_root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SHARD_ROOT));
        let database_path = env("PHISHFEED_DB_PATH")
            .map(PathBuf::from)
            .or(file.database_path)
            .unwrap_or_else(|| shard_root.join(DEFAULT_DATABASE_FILE));

        let defaults = RetryPolicy::default();
        let attempts = parse_setting(env("PHISHFEED_RETRY_COUNT"), "PHISHFEED_RETRY_COUNT")
            .or(file.retry_count)
            .unwrap_or(defaults.attempts);
        let delay = parse_setting(env("PHISHFEED_RETRY_DELAY_SECS"), "PHISHFEED_RETRY_DELAY_SECS")
            .or(file.retry_delay_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.delay);

        let queue_policy = env("PHISHFEED_QUEUE_POLICY")
            .and_then(|raw| {
                let parsed = QueuePolicy::parse(&raw);
                if parsed.is_none() {
                    warn!(key = "PHISHFEED_QUEUE_POLICY", value = %raw, "ignoring unknown queue policy");
                }
                parsed
            })
            .or(file.queue_policy)
            .unwrap_or_default();

        let api_key = env("TELEGRAM_API_KEY").or(file.telegram_api_key);
        let chat_id = env("TELEGRAM_CHAT_ID").or(file.telegram_chat_id);
        let telegram = match (api_key, chat_id) {
            (Some(api_key), Some(chat_id)) => Some(TelegramCredentials { api_key, chat_id }),
            _ => None,
        };

        Self {
            ingest: IngestConfig {
                shard_root,
                exempt_brand: env("PHISHFEED_EXEMPT_BRAND")
                    .or(file.exempt_brand)
                    .unwrap_or_else(|| DEFAULT_EXEMPT_BRAND.to_string()),
                retry: RetryPolicy { attempts, delay },
                queue_policy,
            },
            database_path,
            telegram,
        }
    }

    pub fn build_notifier(&self) -> Result<Box<dyn Notifier>> {
        match &self.telegram {
            Some(credentials) => {
                let notifier = TelegramNotifier::new(TelegramConfig::new(credentials.clone()))
                    .context("building telegram notifier")?;
                Ok(Box::new(notifier))
            }
            None => Ok(Box::new(LogNotifier)),
        }
    }
}

fn parse_setting<T: FromStr>(raw: Option<String>, key: &str) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

/// Records accepted by a scan, newest first.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub accepted: Vec<ShardItem>,
    pub reached_boundary: bool,
    pub shards_scanned: usize,
}

/// Walks shards newest-first, collecting items above the cursor until the first
/// item at or below it.
///
/// Correctness relies on each shard listing its items newest-first and on the
/// locator order being newest-first; an older item appearing before a newer
/// one ends the scan early.
#[derive(Debug)]
pub struct Selector {
    floor: Option<i64>,
    selection: Selection,
}

impl Selector {
    pub fn new(floor: Option<i64>) -> Self {
        Self {
            floor,
            selection: Selection::default(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.selection.reached_boundary
    }

    /// Consumes one shard. Returns `false` once the boundary has been reached
    /// and no further shard should be offered.
    pub fn offer(&mut self, shard: DecodedShard) -> bool {
        if self.is_done() {
            return false;
        }
        self.selection.shards_scanned += 1;
        for item in shard.items {
            match self.floor {
                Some(floor) if item.id <= floor => {
                    info!(shard = %shard.path.display(), id = item.id, floor, "reached already ingested records");
                    self.selection.reached_boundary = true;
                    return false;
                }
                _ => self.selection.accepted.push(item),
            }
        }
        true
    }

    pub fn finish(self) -> Selection {
        self.selection
    }
}

pub fn select_new_records(
    shards: impl IntoIterator<Item = DecodedShard>,
    floor: Option<i64>,
) -> Selection {
    let mut selector = Selector::new(floor);
    for shard in shards {
        if !selector.offer(shard) {
            break;
        }
    }
    selector.finish()
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub selection: Selection,
    pub shards_found: usize,
    pub skipped_shards: Vec<ShardError>,
}

/// Locate, decode and select in one pass. Shards that cannot be decoded are
/// skipped and returned for reporting; only transient read failures abort.
pub fn scan_for_new_records(locator: &ShardLocator, floor: Option<i64>) -> Result<ScanOutcome, ScanError> {
    let shards = locator.locate()?;
    let mut outcome = ScanOutcome {
        shards_found: shards.len(),
        ..ScanOutcome::default()
    };
    let mut selector = Selector::new(floor);

    for path in &shards {
        info!(shard = %path.display(), "processing shard");
        let shard = match decode_shard(path) {
            Ok(shard) => shard,
            Err(err) if err.disposition() == RetryDisposition::Retryable => return Err(err.into()),
            Err(err) => {
                warn!(shard = %path.display(), error = %err, "skipping shard");
                outcome.skipped_shards.push(err);
                continue;
            }
        };
        if !selector.offer(shard) {
            break;
        }
    }

    outcome.selection = selector.finish();
    Ok(outcome)
}

/// Where a run's candidate records come from.
pub trait ShardSource: Send + Sync {
    fn scan(&self, floor: Option<i64>) -> Result<ScanOutcome, ScanError>;
}

impl ShardSource for ShardLocator {
    fn scan(&self, floor: Option<i64>) -> Result<ScanOutcome, ScanError> {
        scan_for_new_records(self, floor)
    }
}

/// Errors the retry controller knows how to classify.
pub trait Transient: Display {
    fn disposition(&self) -> RetryDisposition;
}

impl Transient for ScanError {
    fn disposition(&self) -> RetryDisposition {
        ScanError::disposition(self)
    }
}

/// Bounded, fixed-delay retries around a blocking operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. Every failed attempt is reported.
    pub async fn run<T, E, Op>(&self, notifier: &dyn Notifier, mut op: Op) -> Result<T, E>
    where
        E: Transient,
        Op: FnMut() -> Result<T, E>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.disposition() == RetryDisposition::NonRetryable {
                return Err(err);
            }
            warn!(attempt, attempts, error = %err, "transient failure");
            deliver(notifier, &format!("Attempt {attempt} failed: {err}")).await;
            if attempt >= attempts {
                return Err(err);
            }
            tokio::time::sleep(self.policy.delay).await;
            attempt += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    NothingToDo,
    NoValidRecords,
    Ingested {
        persisted: usize,
        new_last_id: i64,
        cursor_advanced: bool,
    },
    ScanFailed {
        error: String,
    },
    PersistFailed {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub previous_last_id: Option<i64>,
    pub shards_found: usize,
    pub shards_skipped: usize,
    pub selected: usize,
    pub rejected: usize,
    pub row_failures: usize,
    pub queued: usize,
    pub exempt: usize,
    pub outcome: RunOutcome,
}

impl IngestRunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, previous_last_id: Option<i64>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            previous_last_id,
            shards_found: 0,
            shards_skipped: 0,
            selected: 0,
            rejected: 0,
            row_failures: 0,
            queued: 0,
            exempt: 0,
            outcome: RunOutcome::NothingToDo,
        }
    }

    fn finish(mut self, outcome: RunOutcome) -> Self {
        self.outcome = outcome;
        self.finished_at = Utc::now();
        self
    }
}

pub struct IngestPipeline {
    config: IngestConfig,
    source: Box<dyn ShardSource>,
    notifier: Box<dyn Notifier>,
}

impl IngestPipeline {
    /// Scans the shard tree under `config.shard_root`.
    pub fn new(config: IngestConfig, notifier: Box<dyn Notifier>) -> Self {
        let source: Box<dyn ShardSource> = Box::new(ShardLocator::new(&config.shard_root));
        Self {
            config,
            source,
            notifier,
        }
    }

    pub fn with_source(mut self, source: Box<dyn ShardSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    /// Opens the store, runs once, and closes the store on every path. Only a
    /// store that cannot be opened is returned as an error.
    pub async fn run_at(&self, database_path: &Path) -> Result<IngestRunSummary> {
        let store = match FeedStore::open(database_path).await {
            Ok(store) => store,
            Err(err) => {
                error!(error = %err, "cannot open feed store");
                deliver(self.notifier(), &format!("Main execution error: {err}")).await;
                return Err(err).context("opening feed store");
            }
        };
        let summary = self.run_once(&store).await;
        store.close().await;
        Ok(summary)
    }

    pub async fn run_once(&self, store: &FeedStore) -> IngestRunSummary {
        let run_id = Uuid::new_v4();
        self.run_inner(store, run_id)
            .instrument(info_span!("ingest_run", %run_id))
            .await
    }

    async fn run_inner(&self, store: &FeedStore, run_id: Uuid) -> IngestRunSummary {
        let started_at = Utc::now();
        let notifier = self.notifier();

        let floor = match store.read_cursor().await {
            Ok(last_id) => Some(last_id),
            Err(err) => {
                error!(error = %err, "cursor unavailable; scanning without a floor");
                deliver(notifier, &err.to_string()).await;
                None
            }
        };
        info!(last_id = ?floor, "current last id");
        let mut summary = IngestRunSummary::new(run_id, started_at, floor);

        let scan = RetryController::new(self.config.retry)
            .run(notifier, || self.source.scan(floor))
            .await;
        let scan = match scan {
            Ok(scan) => scan,
            Err(err) => {
                error!(error = %err, "scan failed");
                deliver(notifier, &format!("Error getting phishings: {err}")).await;
                return summary.finish(RunOutcome::ScanFailed {
                    error: err.to_string(),
                });
            }
        };

        summary.shards_found = scan.shards_found;
        summary.shards_skipped = scan.skipped_shards.len();
        for skipped in &scan.skipped_shards {
            deliver(notifier, &skipped.to_string()).await;
        }

        let accepted = scan.selection.accepted;
        summary.selected = accepted.len();
        if accepted.is_empty() {
            info!("no new records");
            deliver(notifier, "Nothing to do").await;
            return summary.finish(RunOutcome::NothingToDo);
        }

        let records = validate_selection(accepted);
        summary.rejected = summary.selected - records.len();
        let Some(new_last_id) = records.iter().map(|r| r.id).max() else {
            error!(rejected = summary.rejected, "every selected record was invalid");
            deliver(notifier, "No valid items found in the data").await;
            return summary.finish(RunOutcome::NoValidRecords);
        };
        info!(new_last_id, "new last id");

        let report = match store
            .persist_batch(&records, &self.config.persist_options())
            .await
        {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "batch rolled back");
                deliver(notifier, &format!("Main execution error: {err}")).await;
                return summary.finish(RunOutcome::PersistFailed {
                    error: err.to_string(),
                });
            }
        };
        for failure in &report.failures {
            deliver(
                notifier,
                &format!("Database error processing item {}: {}", failure.id, failure.message),
            )
            .await;
        }
        summary.row_failures = report.failures.len();
        summary.queued = report.queued;
        summary.exempt = report.exempt;

        let cursor_advanced = match advance_cursor(store, floor, new_last_id).await {
            Ok(advanced) => advanced,
            Err(err) => {
                error!(error = %err, new_last_id, "last id not advanced");
                deliver(notifier, &format!("Failed to update last id: {err}")).await;
                false
            }
        };

        info!(
            persisted = report.upserted,
            queued = report.queued,
            exempt = report.exempt,
            new_last_id,
            "ingestion complete"
        );
        deliver(
            notifier,
            &format!("Done. Num: {} new last id: {new_last_id}", report.upserted),
        )
        .await;
        summary.finish(RunOutcome::Ingested {
            persisted: report.upserted,
            new_last_id,
            cursor_advanced,
        })
    }
}

/// Drops candidates that break the required-field contract, keeping order.
pub fn validate_selection(accepted: Vec<ShardItem>) -> Vec<FeedRecord> {
    let mut records = Vec::with_capacity(accepted.len());
    for item in accepted {
        match FeedRecord::from_candidate(item.id, item.candidate) {
            Ok(record) => records.push(record),
            Err(err) => warn!(id = item.id, error = %err, "skipping invalid item"),
        }
    }
    records
}

/// Writes `new_last_id` unless the stored cursor is already at or past it.
async fn advance_cursor(
    store: &FeedStore,
    floor: Option<i64>,
    new_last_id: i64,
) -> Result<bool, phishfeed_storage::StoreError> {
    let current = match floor {
        Some(current) => Some(current),
        None => store.read_cursor().await.ok(),
    };
    if current.is_some_and(|current| new_last_id <= current) {
        return Ok(false);
    }
    store.write_cursor(new_last_id).await?;
    Ok(true)
}

pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    let config = CollectorConfig::from_env()?;
    let notifier = config.build_notifier()?;
    let pipeline = IngestPipeline::new(config.ingest.clone(), notifier);
    pipeline.run_at(&config.database_path).await
}
