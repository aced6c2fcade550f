//! Persistence gateways, retry/backoff harness and HTTP fetch utilities for openroles.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openroles_core::{PersistedRecord, Upsert};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "openroles-storage";

// ---------------------------------------------------------------------------
// Retry / backoff harness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDisposition {
    Transient,
    Fatal,
}

/// Errors that can pass through [`with_retry`] say whether another attempt may help.
pub trait Classify {
    fn disposition(&self) -> RetryDisposition;

    fn is_transient(&self) -> bool {
        self.disposition() == RetryDisposition::Transient
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Transient
    } else {
        RetryDisposition::Fatal
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Transient
    } else {
        RetryDisposition::Fatal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// Sleep before the next attempt, where `failed_attempts` counts failures so far (1-based).
    pub fn delay_for_attempt(&self, failed_attempts: usize) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32
                    .checked_shl(failed_attempts as u32)
                    .unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails fatally, or `policy.max_retries` attempts are spent.
/// The last error is returned unchanged.
pub async fn with_retry<T, E, F, Fut>(policy: &BackoffPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
{
    let attempts = policy.max_retries.max(1);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.disposition() == RetryDisposition::Fatal {
            debug!(operation, attempt, error = %err, "fatal error, not retrying");
            return Err(err);
        }
        if attempt >= attempts {
            error!(operation, attempts = attempt, error = %err, "operation failed after retries");
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient error"
        );
        tokio::time::sleep(delay).await;
    }
}

// ---------------------------------------------------------------------------
// Persistence gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt state document {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed stored record: {0}")]
    Malformed(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Classify for StoreError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Unavailable(_) | StoreError::Io { .. } => RetryDisposition::Transient,
            StoreError::Corrupt { .. } | StoreError::Malformed(_) => RetryDisposition::Fatal,
            StoreError::Database(err) => classify_sqlx_error(err),
        }
    }
}

fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Transient,
        // serialization_failure / deadlock_detected
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) => {
            RetryDisposition::Transient
        }
        _ => RetryDisposition::Fatal,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFailure {
    pub external_id: String,
    pub reason: String,
}

/// Per-item outcome of a commit call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitResult {
    pub written: Vec<String>,
    pub failed: Vec<CommitFailure>,
}

impl CommitResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, external_id: &str, reason: impl Into<String>) {
        self.failed.push(CommitFailure {
            external_id: external_id.to_string(),
            reason: reason.into(),
        });
    }
}

/// Durable store of listing lifecycle state, keyed by `(source, external_id)`.
///
/// Both calls must be safe to repeat: the same commit applied twice leaves the
/// store as if it had been applied once.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn snapshot(&self, source: &str) -> Result<Vec<PersistedRecord>, StoreError>;

    async fn commit(
        &self,
        source: &str,
        upserts: &[Upsert],
        closures: &[PersistedRecord],
    ) -> Result<CommitResult, StoreError>;
}

/// Stable document key for one listing. Identical inputs always give the same key.
pub fn storage_key_for(source: &str, external_id: &str) -> Uuid {
    let name = format!("openroles:{source}:{external_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
}

/// Apply a commit to an in-memory map of one source's records.
fn apply_commit(
    records: &mut BTreeMap<String, PersistedRecord>,
    source: &str,
    upserts: &[Upsert],
    closures: &[PersistedRecord],
) -> CommitResult {
    let mut result = CommitResult::default();

    for upsert in upserts {
        let incoming = &upsert.record;
        let external_id = incoming.external_id();
        if incoming.source() != source {
            result.fail(external_id, format!("record belongs to source `{}`", incoming.source()));
            continue;
        }

        if upsert.classification.is_touch_only() {
            match records.get_mut(external_id) {
                Some(existing) => {
                    existing.last_seen_at = incoming.last_seen_at;
                    result.written.push(external_id.to_string());
                }
                None => result.fail(external_id, "no stored record to refresh"),
            }
            continue;
        }

        let mut record = incoming.clone();
        record.storage_key = Some(storage_key_for(source, external_id).to_string());
        if let Some(existing) = records.get(external_id) {
            record.found_at = existing.found_at;
        }
        records.insert(external_id.to_string(), record);
        result.written.push(external_id.to_string());
    }

    for closure in closures {
        let external_id = closure.external_id();
        match records.get_mut(external_id) {
            Some(existing) => {
                existing.open = false;
                existing.closed_at = closure.closed_at;
                result.written.push(external_id.to_string());
            }
            None => result.fail(external_id, "no stored record to close"),
        }
    }

    result
}

/// Process-local gateway for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    sources: Mutex<HashMap<String, BTreeMap<String, PersistedRecord>>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed stored state directly, bypassing the commit path.
    pub async fn insert(&self, record: PersistedRecord) {
        let mut sources = self.sources.lock().await;
        sources
            .entry(record.source().to_string())
            .or_default()
            .insert(record.external_id().to_string(), record);
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn snapshot(&self, source: &str) -> Result<Vec<PersistedRecord>, StoreError> {
        let sources = self.sources.lock().await;
        Ok(sources
            .get(source)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(
        &self,
        source: &str,
        upserts: &[Upsert],
        closures: &[PersistedRecord],
    ) -> Result<CommitResult, StoreError> {
        let mut sources = self.sources.lock().await;
        let records = sources.entry(source.to_string()).or_default();
        Ok(apply_commit(records, source, upserts, closures))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SourceDocument {
    source: String,
    updated_at: DateTime<Utc>,
    records: Vec<PersistedRecord>,
}

/// One JSON document per source, replaced atomically on every commit.
#[derive(Debug)]
pub struct JsonFileGateway {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sources whose id has no letters or digits have no document.
    pub fn document_path(&self, source: &str) -> Result<PathBuf, StoreError> {
        let slug = source_slug(source);
        if slug.is_empty() {
            return Err(StoreError::Malformed(format!(
                "source `{source}` has no usable document name"
            )));
        }
        Ok(self.root.join(format!("{slug}.json")))
    }

    async fn load(&self, source: &str) -> Result<BTreeMap<String, PersistedRecord>, StoreError> {
        let path = self.document_path(source)?;
        let exists = fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        if !exists {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(&path).await.map_err(|e| StoreError::io(&path, e))?;
        let doc: SourceDocument = serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        if doc.source != source {
            return Err(StoreError::Malformed(format!(
                "{} holds source `{}`, expected `{source}`",
                path.display(),
                doc.source
            )));
        }
        Ok(doc
            .records
            .into_iter()
            .map(|r| (r.external_id().to_string(), r))
            .collect())
    }
}

#[async_trait]
impl PersistenceGateway for JsonFileGateway {
    fn backend(&self) -> &'static str {
        "json"
    }

    async fn snapshot(&self, source: &str) -> Result<Vec<PersistedRecord>, StoreError> {
        Ok(self.load(source).await?.into_values().collect())
    }

    async fn commit(
        &self,
        source: &str,
        upserts: &[Upsert],
        closures: &[PersistedRecord],
    ) -> Result<CommitResult, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load(source).await?;
        let result = apply_commit(&mut records, source, upserts, closures);

        let doc = SourceDocument {
            source: source.to_string(),
            updated_at: Utc::now(),
            records: records.into_values().collect(),
        };
        let path = self.document_path(source)?;
        let bytes = serde_json::to_vec_pretty(&doc).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomically(&path, &bytes).await?;
        Ok(result)
    }
}

/// Write via a temp file in the same directory and rename over the target.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Malformed(format!("state path {} has no parent", path.display())))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

pub fn source_slug(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// PostgreSQL gateway; one transaction per commit call.
#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

const LISTING_COLUMNS: &str = "storage_key, source, external_id, title, url, location, \
    employment_type, description, department, posted_date, compensation_low, \
    compensation_mid, compensation_high, attributes, open, found_at, last_seen_at, \
    closed_at, reopened_at";

impl PgGateway {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying listings migrations")
    }
}

fn record_from_row(row: &PgRow) -> Result<PersistedRecord, sqlx::Error> {
    let storage_key: Uuid = row.try_get("storage_key")?;
    let attributes: sqlx::types::Json<BTreeMap<String, serde_json::Value>> = row.try_get("attributes")?;
    Ok(PersistedRecord {
        listing: openroles_core::ObservedListing {
            external_id: row.try_get("external_id")?,
            source: row.try_get("source")?,
            title: row.try_get("title")?,
            url: row.try_get("url")?,
            location: row.try_get("location")?,
            employment_type: row.try_get("employment_type")?,
            description: row.try_get("description")?,
            department: row.try_get("department")?,
            posted_date: row.try_get("posted_date")?,
            compensation_low: row.try_get("compensation_low")?,
            compensation_mid: row.try_get("compensation_mid")?,
            compensation_high: row.try_get("compensation_high")?,
            attributes: attributes.0,
        },
        open: row.try_get("open")?,
        found_at: row.try_get("found_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        closed_at: row.try_get("closed_at")?,
        reopened_at: row.try_get("reopened_at")?,
        storage_key: Some(storage_key.to_string()),
    })
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn snapshot(&self, source: &str) -> Result<Vec<PersistedRecord>, StoreError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE source = $1 ORDER BY external_id");
        let rows = sqlx::query(&sql).bind(source).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| record_from_row(row).map_err(|e| StoreError::Malformed(e.to_string())))
            .collect()
    }

    async fn commit(
        &self,
        source: &str,
        upserts: &[Upsert],
        closures: &[PersistedRecord],
    ) -> Result<CommitResult, StoreError> {
        let mut result = CommitResult::default();
        let mut tx = self.pool.begin().await?;

        for upsert in upserts {
            let r = &upsert.record;
            let external_id = r.external_id();
            if r.source() != source {
                result.fail(external_id, format!("record belongs to source `{}`", r.source()));
                continue;
            }
            let key = storage_key_for(source, external_id);

            if upsert.classification.is_touch_only() {
                let done = sqlx::query("UPDATE listings SET last_seen_at = $2 WHERE storage_key = $1")
                    .bind(key)
                    .bind(r.last_seen_at)
                    .execute(&mut *tx)
                    .await?;
                if done.rows_affected() == 0 {
                    result.fail(external_id, "no stored record to refresh");
                } else {
                    result.written.push(external_id.to_string());
                }
                continue;
            }

            let sql = format!(
                r#"
                INSERT INTO listings ({LISTING_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                ON CONFLICT (storage_key) DO UPDATE SET
                    title = EXCLUDED.title,
                    url = EXCLUDED.url,
                    location = EXCLUDED.location,
                    employment_type = EXCLUDED.employment_type,
                    description = EXCLUDED.description,
                    department = EXCLUDED.department,
                    posted_date = EXCLUDED.posted_date,
                    compensation_low = EXCLUDED.compensation_low,
                    compensation_mid = EXCLUDED.compensation_mid,
                    compensation_high = EXCLUDED.compensation_high,
                    attributes = EXCLUDED.attributes,
                    open = EXCLUDED.open,
                    last_seen_at = EXCLUDED.last_seen_at,
                    closed_at = EXCLUDED.closed_at,
                    reopened_at = EXCLUDED.reopened_at
                "#
            );
            let l = &r.listing;
            sqlx::query(&sql)
                .bind(key)
                .bind(source)
                .bind(external_id)
                .bind(&l.title)
                .bind(&l.url)
                .bind(&l.location)
                .bind(&l.employment_type)
                .bind(&l.description)
                .bind(&l.department)
                .bind(&l.posted_date)
                .bind(l.compensation_low)
                .bind(l.compensation_mid)
                .bind(l.compensation_high)
                .bind(sqlx::types::Json(&l.attributes))
                .bind(r.open)
                .bind(r.found_at)
                .bind(r.last_seen_at)
                .bind(r.closed_at)
                .bind(r.reopened_at)
                .execute(&mut *tx)
                .await?;
            result.written.push(external_id.to_string());
        }

        for closure in closures {
            let external_id = closure.external_id();
            let done = sqlx::query("UPDATE listings SET open = FALSE, closed_at = $2 WHERE storage_key = $1")
                .bind(storage_key_for(source, external_id))
                .bind(closure.closed_at)
                .execute(&mut *tx)
                .await?;
            if done.rows_affected() == 0 {
                result.fail(external_id, "no stored record to close");
            } else {
                result.written.push(external_id.to_string());
            }
        }

        tx.commit().await?;
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not parse listings: {0}")]
    Parse(String),
    #[error("invalid request header `{0}`")]
    InvalidHeader(String),
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fetcher is shut down")]
    Closed,
}

impl Classify for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Fatal),
            FetchError::Parse(_)
            | FetchError::InvalidHeader(_)
            | FetchError::Io { .. }
            | FetchError::Closed => RetryDisposition::Fatal,
        }
    }
}

/// Shared reqwest client with a global in-flight cap. Session state (headers,
/// cookies) is passed in per call and never kept here.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", source_id, url);
        with_retry(&self.backoff, "http_fetch", || self.fetch_once(url, headers))
            .instrument(span)
            .await
    }

    async fn fetch_once(&self, url: &str, headers: &HeaderMap) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).headers(headers.clone()).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let headers = resp.headers().clone();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            headers,
            body,
        })
    }
}
