//! HTTP fetch, on-disk snapshot/raw page storage and the backing-store gateway.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{KeySpec, Record, RecordSet};
use pg_escape::quote_identifier;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-storage";

/// Browser identities rotated across attempts.
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub unit: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// `2^attempt` units, attempts numbered from 1.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.unit.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
    pub user_agents: Vec<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchAttempt {
    pub attempt: usize,
    pub user_agent: String,
    pub error: Option<String>,
    /// Sleep taken after this attempt before the next one.
    pub backoff: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct FetchReport {
    pub body: Option<String>,
    pub attempts: Vec<FetchAttempt>,
}

/// Single-URL GET with bounded retries, exponential backoff and identity rotation.
#[derive(Debug)]
pub struct Fetcher {
    client: reqwest::Client,
    config: FetcherConfig,
    rotation: AtomicUsize,
}

impl Fetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            config,
            rotation: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    fn next_user_agent(&self) -> String {
        let pool = &self.config.user_agents;
        if pool.is_empty() {
            return format!("{CRATE_NAME}/{}", env!("CARGO_PKG_VERSION"));
        }
        let idx = self.rotation.fetch_add(1, Ordering::Relaxed) % pool.len();
        pool[idx].clone()
    }

    async fn get_once(&self, url: &str, user_agent: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(USER_AGENT, user_agent)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.text().await?)
    }

    /// Body of `url`, or `None` once every attempt has failed.
    pub async fn fetch(&self, url: &str) -> Option<String> {
        self.fetch_traced(url).await.body
    }

    pub async fn fetch_traced(&self, url: &str) -> FetchReport {
        let max_attempts = self.config.max_attempts.max(1);
        async move {
            let mut attempts = Vec::with_capacity(max_attempts);
            for attempt in 1..=max_attempts {
                let user_agent = self.next_user_agent();
                match self.get_once(url, &user_agent).await {
                    Ok(body) => {
                        debug!(attempt, bytes = body.len(), "fetched");
                        attempts.push(FetchAttempt {
                            attempt,
                            user_agent,
                            error: None,
                            backoff: None,
                        });
                        return FetchReport {
                            body: Some(body),
                            attempts,
                        };
                    }
                    Err(err) => {
                        let backoff = (attempt < max_attempts)
                            .then(|| self.config.backoff.delay_for_attempt(attempt));
                        warn!(
                            attempt,
                            max_attempts,
                            error = %err,
                            retry_in_ms = backoff.map(|d| d.as_millis() as u64),
                            "fetch attempt failed"
                        );
                        attempts.push(FetchAttempt {
                            attempt,
                            user_agent,
                            error: Some(err.to_string()),
                            backoff,
                        });
                        if let Some(delay) = backoff {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
            error!(max_attempts, "all fetch attempts failed");
            FetchReport {
                body: None,
                attempts,
            }
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }

    /// One-shot JSON request for API-first producers; no retries.
    pub async fn probe_json(&self, url: &str) -> Option<JsonValue> {
        let user_agent = self.next_user_agent();
        let result = async {
            let resp = self
                .client
                .get(url)
                .header(USER_AGENT, user_agent)
                .header(ACCEPT, "application/json")
                .header("X-Requested-With", "XMLHttpRequest")
                .send()
                .await?
                .error_for_status()?;
            resp.json::<JsonValue>().await
        }
        .await;
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(url, error = %err, "json probe failed");
                None
            }
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` via a sibling temp file and rename. Returns `false` if
/// the destination already existed and was left untouched.
async fn write_atomic(path: &Path, bytes: &[u8], overwrite: bool) -> anyhow::Result<bool> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    if !overwrite
        && fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(true)
}

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub deduplicated: bool,
}

/// Content-addressed archive of every fetched document.
#[derive(Debug, Clone)]
pub struct RawPageStore {
    root: PathBuf,
}

impl RawPageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path(
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        body: &[u8],
    ) -> anyhow::Result<StoredPage> {
        let content_hash = sha256_hex(body);
        let relative_path = Self::relative_path(fetched_at, source_id, &content_hash, extension);
        let written = write_atomic(&self.root.join(&relative_path), body, false).await?;
        Ok(StoredPage {
            content_hash,
            relative_path,
            deduplicated: !written,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub scraper: String,
    pub scraped_at: DateTime<Utc>,
    pub record_count: usize,
    pub source_urls: Vec<String>,
}

/// Debug/audit copy of the latest record set of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub metadata: SnapshotMetadata,
    pub data: RecordSet,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, source_id: &str) -> PathBuf {
        self.dir.join(format!("{source_id}.json"))
    }

    pub async fn save(
        &self,
        source_id: &str,
        source_urls: Vec<String>,
        records: &[Record],
    ) -> anyhow::Result<PathBuf> {
        let envelope = SnapshotEnvelope {
            metadata: SnapshotMetadata {
                scraper: source_id.to_string(),
                scraped_at: Utc::now(),
                record_count: records.len(),
                source_urls,
            },
            data: records.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope).context("serializing snapshot")?;
        let path = self.path_for(source_id);
        write_atomic(&path, &bytes, true).await?;
        info!(source_id, records = records.len(), path = %path.display(), "saved snapshot");
        Ok(path)
    }

    pub async fn load(&self, source_id: &str) -> anyhow::Result<Option<SnapshotEnvelope>> {
        let path = self.path_for(source_id);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let envelope =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(envelope))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} on `{table}` failed: {source}")]
    Query {
        op: &'static str,
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("row from `{table}` is not a JSON object")]
    MalformedRow { table: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One row of run history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLogEntry {
    pub scraper_name: String,
    pub last_run: DateTime<Utc>,
    pub records_scraped: usize,
    pub status: String,
    pub error_message: Option<String>,
    pub duration_seconds: f64,
}

/// Table-oriented backing store used by the sync pipeline.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn get_all(&self, table: &str) -> Result<RecordSet, StoreError>;

    /// Writes in `batch_size` chunks; any failed chunk fails the whole call.
    async fn upsert(
        &self,
        table: &str,
        records: &[Record],
        on_conflict: &KeySpec,
        batch_size: usize,
    ) -> Result<(), StoreError>;

    async fn insert(&self, table: &str, records: &[Record]) -> Result<(), StoreError>;

    async fn delete_all(&self, table: &str) -> Result<(), StoreError>;

    async fn log_run(&self, entry: &RunLogEntry) -> Result<(), StoreError>;
}

pub const RUN_HISTORY_TABLE: &str = "scrape_metadata";

/// Columns present in any record of `records`, in first-seen order.
pub fn column_union(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for name in record.keys() {
            if !columns.iter().any(|c| c == name) {
                columns.push(name.clone());
            }
        }
    }
    columns
}

fn quoted_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_identifier(n).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `INSERT ... SELECT ... FROM jsonb_populate_recordset(...)`, optionally with an
/// `ON CONFLICT` clause that updates every non-key column.
pub fn build_write_sql(table: &str, columns: &[String], on_conflict: Option<&KeySpec>) -> String {
    let table_ident = quote_identifier(table);
    let column_list = quoted_list(columns);
    let mut sql = format!(
        "INSERT INTO {table_ident} ({column_list}) SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table_ident}, $1)"
    );
    if let Some(keys) = on_conflict {
        let updates = columns
            .iter()
            .filter(|c| !keys.fields().contains(c))
            .map(|c| {
                let ident = quote_identifier(c);
                format!("{ident} = EXCLUDED.{ident}")
            })
            .collect::<Vec<_>>();
        sql.push_str(&format!(" ON CONFLICT ({})", quoted_list(keys.fields())));
        if updates.is_empty() {
            sql.push_str(" DO NOTHING");
        } else {
            sql.push_str(&format!(" DO UPDATE SET {}", updates.join(", ")));
        }
    }
    sql
}

/// PostgreSQL-backed gateway. Rows travel as JSONB so any table shape works.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    /// Verifies the run-history table is reachable.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let sql = format!(
            "SELECT 1 FROM {} LIMIT 1",
            quote_identifier(RUN_HISTORY_TABLE)
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|source| StoreError::Query {
                op: "ping",
                table: RUN_HISTORY_TABLE.to_string(),
                source,
            })?;
        Ok(())
    }

    async fn write_chunk(
        &self,
        op: &'static str,
        table: &str,
        chunk: &[Record],
        on_conflict: Option<&KeySpec>,
    ) -> Result<(), StoreError> {
        let columns = column_union(chunk);
        if columns.is_empty() {
            return Ok(());
        }
        let sql = build_write_sql(table, &columns, on_conflict);
        sqlx::query(&sql)
            .bind(sqlx::types::Json(chunk))
            .execute(&self.pool)
            .await
            .map_err(|source| StoreError::Query {
                op,
                table: table.to_string(),
                source,
            })?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for PgStore {
    async fn get_all(&self, table: &str) -> Result<RecordSet, StoreError> {
        let sql = format!("SELECT to_jsonb(t) FROM {} t", quote_identifier(table));
        let rows = sqlx::query_scalar::<_, JsonValue>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| StoreError::Query {
                op: "select",
                table: table.to_string(),
                source,
            })?;
        rows.into_iter()
            .map(|row| match row {
                JsonValue::Object(map) => Ok(map),
                _ => Err(StoreError::MalformedRow {
                    table: table.to_string(),
                }),
            })
            .collect()
    }

    async fn upsert(
        &self,
        table: &str,
        records: &[Record],
        on_conflict: &KeySpec,
        batch_size: usize,
    ) -> Result<(), StoreError> {
        for (idx, chunk) in records.chunks(batch_size.max(1)).enumerate() {
            self.write_chunk("upsert", table, chunk, Some(on_conflict))
                .await?;
            info!(table, batch = idx + 1, records = chunk.len(), "upserted batch");
        }
        info!(table, records = records.len(), "upsert complete");
        Ok(())
    }

    async fn insert(&self, table: &str, records: &[Record]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.write_chunk("insert", table, records, None).await?;
        info!(table, records = records.len(), "inserted records");
        Ok(())
    }

    async fn delete_all(&self, table: &str) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {}", quote_identifier(table));
        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|source| StoreError::Query {
                op: "delete",
                table: table.to_string(),
                source,
            })?;
        info!(table, rows = result.rows_affected(), "deleted all rows");
        Ok(())
    }

    async fn log_run(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (scraper_name, last_run, records_scraped, status, error_message, duration_seconds) VALUES ($1, $2, $3, $4, $5, $6)",
            quote_identifier(RUN_HISTORY_TABLE)
        );
        sqlx::query(&sql)
            .bind(&entry.scraper_name)
            .bind(entry.last_run)
            .bind(entry.records_scraped as i64)
            .bind(&entry.status)
            .bind(entry.error_message.as_deref().unwrap_or(""))
            .bind(entry.duration_seconds)
            .execute(&self.pool)
            .await
            .map_err(|source| StoreError::Query {
                op: "insert",
                table: RUN_HISTORY_TABLE.to_string(),
                source,
            })?;
        Ok(())
    }
}
