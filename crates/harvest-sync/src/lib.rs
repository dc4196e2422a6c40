//! Sync pipeline: source registry, per-source coordination and the run orchestrator.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use harvest_core::{
    dedupe, diff, prepare_for_diff, strip_tracking, Record, RecordKey, RecordSet, RunReport,
    RunSummary, SourceStatus, SyncPlan, SyncStage, SyncStrategy,
};
use harvest_producers::{producer_for_source, Producer, ProducerContext, ProducerError, SiteConfig};
use harvest_storage::{
    BackoffPolicy, Fetcher, FetcherConfig, PersistenceGateway, PgStore, RawPageStore, RunLogEntry,
    SnapshotStore, StoreError,
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-sync";

pub const DEFAULT_MAX_CHANGE_PERCENT: f64 = 30.0;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    /// Absent for scrape-only sources.
    #[serde(default)]
    pub sync: Option<SyncPlan>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub site: SiteConfig,
    pub scrape_delay: Duration,
    pub max_retries: usize,
    pub request_timeout: Duration,
    pub max_change_percent: f64,
    pub data_dir: PathBuf,
    pub sources_file: PathBuf,
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env_non_empty(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// A percentage in `0..=100`; anything else keeps the default so the gate stays armed.
fn change_threshold(raw: Option<String>) -> f64 {
    let Some(raw) = raw else {
        return DEFAULT_MAX_CHANGE_PERCENT;
    };
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && (0.0..=100.0).contains(&value) => value,
        _ => {
            warn!(
                value = %raw,
                default = DEFAULT_MAX_CHANGE_PERCENT,
                "invalid MAX_CHANGE_PERCENT, using default"
            );
            DEFAULT_MAX_CHANGE_PERCENT
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env_non_empty("DATABASE_URL"),
            discord_webhook_url: env_non_empty("DISCORD_WEBHOOK_URL"),
            site: SiteConfig::new(
                env_non_empty("HARVEST_BASE_URL")
                    .unwrap_or_else(|| "https://www.ewubd.edu".to_string()),
                env_non_empty("HARVEST_ADMISSION_URL")
                    .unwrap_or_else(|| "https://admission.ewubd.edu".to_string()),
            ),
            scrape_delay: Duration::try_from_secs_f64(env_parse("SCRAPE_DELAY_SECONDS", 3.0f64).max(0.0))
                .unwrap_or(Duration::from_secs(3)),
            max_retries: env_parse("MAX_RETRIES", 3usize),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT", 30u64)),
            max_change_percent: change_threshold(env_non_empty("MAX_CHANGE_PERCENT")),
            data_dir: env_non_empty("HARVEST_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            sources_file: env_non_empty("HARVEST_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            timeout: self.request_timeout,
            max_attempts: self.max_retries.max(1),
            backoff: BackoffPolicy::default(),
            ..Default::default()
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn current_dir(&self) -> PathBuf {
        self.data_dir.join("current")
    }
}

/// Per-invocation switches chosen by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Skip the change threshold for `diff` sources.
    pub force: bool,
    /// Restrict the run to these source ids; empty means every enabled source.
    pub only: Vec<String>,
}

#[derive(Debug, Error)]
enum SourceFailure {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Producer(#[from] ProducerError),
}

impl SourceFailure {
    fn status(&self) -> SourceStatus {
        match self {
            SourceFailure::Store(_) => SourceStatus::UpsertFailed,
            SourceFailure::Producer(err) => SourceStatus::Error(err.to_string()),
        }
    }
}

/// Drives one source from harvest to write and reports how far it got.
pub struct SyncCoordinator<'a> {
    store: Option<&'a dyn PersistenceGateway>,
    max_change_percent: f64,
    force: bool,
}

impl<'a> SyncCoordinator<'a> {
    pub fn new(store: Option<&'a dyn PersistenceGateway>, max_change_percent: f64, force: bool) -> Self {
        Self {
            store,
            max_change_percent,
            force,
        }
    }

    /// Never fails: every outcome, including errors, ends up in the summary status.
    pub async fn run_source(
        &self,
        source: &SourceConfig,
        producer: &dyn Producer,
        ctx: &ProducerContext<'_>,
    ) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::start(&source.source_id);
        let span = info_span!("sync_source", source_id = %source.source_id);

        if let Err(err) = self
            .drive(source, producer, ctx, &mut summary)
            .instrument(span)
            .await
        {
            error!(source_id = %source.source_id, stage = ?summary.stage, error = %err, "source failed");
            summary.status = err.status();
            summary.stage = SyncStage::Failed;
        }
        summary.duration = started.elapsed();
        summary
    }

    async fn drive(
        &self,
        source: &SourceConfig,
        producer: &dyn Producer,
        ctx: &ProducerContext<'_>,
        summary: &mut RunSummary,
    ) -> Result<(), SourceFailure> {
        let records = producer.run(ctx).await?;
        summary.stage = SyncStage::Parsed;
        summary.records = records.len();

        if let Err(err) = producer.validate(&records) {
            info!(error = %err, "no usable records");
            summary.status = SourceStatus::NoData;
            summary.stage = SyncStage::Skipped;
            return Ok(());
        }
        summary.stage = SyncStage::Validated;

        let (Some(store), Some(plan)) = (self.store, source.sync.as_ref()) else {
            info!(records = records.len(), "scrape-only, snapshot kept");
            summary.stage = SyncStage::Written;
            return Ok(());
        };

        let clean = dedupe(strip_tracking(&records), &plan.conflict_keys);
        summary.stage = SyncStage::StrategySelected;
        info!(
            table = %plan.table,
            strategy = plan.strategy.as_str(),
            records = clean.len(),
            "syncing"
        );

        match plan.strategy {
            SyncStrategy::FullReplace => self.replace_all(store, plan, &clean, summary).await,
            SyncStrategy::Diff | SyncStrategy::SharedTable => {
                self.reconcile(store, plan, &clean, summary).await
            }
        }
    }

    async fn replace_all(
        &self,
        store: &dyn PersistenceGateway,
        plan: &SyncPlan,
        clean: &[Record],
        summary: &mut RunSummary,
    ) -> Result<(), SourceFailure> {
        summary.stage = SyncStage::Unconditional;
        info!(table = %plan.table, "full-replace: deleting all rows");
        store.delete_all(&plan.table).await?;
        store.insert(&plan.table, clean).await?;
        summary.changes = clean.len();
        summary.stage = SyncStage::Written;
        Ok(())
    }

    async fn reconcile(
        &self,
        store: &dyn PersistenceGateway,
        plan: &SyncPlan,
        clean: &[Record],
        summary: &mut RunSummary,
    ) -> Result<(), SourceFailure> {
        let existing = store.get_all(&plan.table).await?;
        if existing.is_empty() {
            summary.stage = SyncStage::Unconditional;
            info!(table = %plan.table, "table is empty, bootstrapping");
            store
                .upsert(&plan.table, clean, &plan.conflict_keys, plan.batch_size)
                .await?;
            summary.changes = clean.len();
            summary.stage = SyncStage::Written;
            return Ok(());
        }

        let shared = plan.strategy == SyncStrategy::SharedTable;
        let baseline = if shared {
            owned_rows(existing, clean, plan)
        } else {
            existing
        };
        let result = diff(
            &prepare_for_diff(&baseline),
            &prepare_for_diff(clean),
            &plan.conflict_keys,
        );
        info!("diff against {}\n{}", plan.table, result.report());
        let change_percentage = result.change_percentage();
        summary.changes = result.change_count();
        summary.change_percentage = Some(change_percentage);

        if shared || self.force {
            summary.stage = SyncStage::Unconditional;
        } else {
            summary.stage = SyncStage::ThresholdCheck;
            if change_percentage > self.max_change_percent {
                warn!(
                    change_percentage = %format!("{change_percentage:.1}"),
                    threshold = self.max_change_percent,
                    "change exceeds threshold, skipping write"
                );
                summary.status = SourceStatus::SkippedHighChange;
                summary.stage = SyncStage::Skipped;
                return Ok(());
            }
        }

        if !result.has_changes() {
            info!("no changes");
            summary.stage = SyncStage::Skipped;
            return Ok(());
        }
        // Keyless rows never match on conflict, so rewriting them would append copies.
        let keyed: RecordSet = clean
            .iter()
            .filter(|r| plan.conflict_keys.key_of(r).is_some())
            .cloned()
            .collect();
        if keyed.len() < clean.len() {
            warn!(
                table = %plan.table,
                keys = %plan.conflict_keys,
                skipped = clean.len() - keyed.len(),
                "records without a conflict key are not rewritten"
            );
        }
        store
            .upsert(&plan.table, &keyed, &plan.conflict_keys, plan.batch_size)
            .await?;
        summary.stage = SyncStage::Written;
        Ok(())
    }
}

/// Rows of a shared table whose key appears in this source's new set.
fn owned_rows(existing: RecordSet, clean: &[Record], plan: &SyncPlan) -> RecordSet {
    let keys = &plan.conflict_keys;
    let ours: HashSet<RecordKey> = clean.iter().filter_map(|r| keys.key_of(r)).collect();
    let before = existing.len();
    let owned: RecordSet = existing
        .into_iter()
        .filter(|row| keys.key_of(row).is_some_and(|k| ours.contains(&k)))
        .collect();
    debug!(table = %plan.table, before, owned = owned.len(), "narrowed shared table");
    owned
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str, alert: bool) -> Result<(), NotifyError>;
}

/// Posts run reports to a Discord webhook. Without a URL it only logs.
pub struct DiscordNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl DiscordNotifier {
    pub fn new(webhook_url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            webhook_url,
        })
    }

    pub fn payload(message: &str, alert: bool) -> serde_json::Value {
        let prefix = if alert { "🚨 **ALERT**" } else { "✅ **Update**" };
        json!({ "content": format!("{prefix}\n{message}") })
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send(&self, message: &str, alert: bool) -> Result<(), NotifyError> {
        let Some(url) = self.webhook_url.as_deref() else {
            debug!("discord webhook not configured, skipping notification");
            return Ok(());
        };
        self.client
            .post(url)
            .json(&Self::payload(message, alert))
            .send()
            .await?
            .error_for_status()?;
        info!("discord notification sent");
        Ok(())
    }
}

/// A configured source paired with the producer that harvests it.
pub struct SourceBinding {
    pub config: SourceConfig,
    pub producer: Box<dyn Producer>,
}

/// Resolve enabled sources, in registry order, to producers.
pub fn bind_sources(
    registry: &SourceRegistry,
    site: &SiteConfig,
    options: &RunOptions,
) -> Result<Vec<SourceBinding>> {
    for wanted in &options.only {
        if !registry.sources.iter().any(|s| &s.source_id == wanted) {
            warn!(source_id = %wanted, "requested source is not in the registry");
        }
    }
    registry
        .enabled()
        .filter(|s| options.only.is_empty() || options.only.contains(&s.source_id))
        .map(|source| {
            let producer = producer_for_source(&source.source_id, site)
                .with_context(|| format!("no producer registered for {}", source.source_id))?;
            Ok(SourceBinding {
                config: source.clone(),
                producer,
            })
        })
        .collect()
}

pub struct Orchestrator<'a> {
    store: Option<&'a dyn PersistenceGateway>,
    notifier: &'a dyn Notifier,
    max_change_percent: f64,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        store: Option<&'a dyn PersistenceGateway>,
        notifier: &'a dyn Notifier,
        max_change_percent: f64,
    ) -> Self {
        Self {
            store,
            notifier,
            max_change_percent,
        }
    }

    /// Process every source in order, one at a time, then send one report.
    pub async fn run(
        &self,
        sources: &[SourceBinding],
        ctx: &ProducerContext<'_>,
        options: &RunOptions,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, sources = sources.len(), scrape_only = self.store.is_none(), "starting run");
        if options.force {
            warn!("force mode: change threshold bypassed for this run");
        }

        let coordinator = SyncCoordinator::new(self.store, self.max_change_percent, options.force);
        let mut summaries = Vec::with_capacity(sources.len());
        for binding in sources {
            info!(source_id = %binding.config.source_id, "running {}", binding.config.display_name);
            let summary = coordinator
                .run_source(&binding.config, binding.producer.as_ref(), ctx)
                .await;
            self.record_history(&summary).await;
            summaries.push(summary);
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            forced: options.force,
            summaries,
        };
        info!("scrape summary");
        for line in report.table_lines() {
            info!("{line}");
        }

        if let Err(err) = self
            .notifier
            .send(&report.to_markdown(), !report.all_succeeded())
            .await
        {
            error!(error = %err, "failed to send run notification");
        }
        report
    }

    async fn record_history(&self, summary: &RunSummary) {
        let Some(store) = self.store else {
            return;
        };
        let entry = RunLogEntry {
            scraper_name: summary.source_id.clone(),
            last_run: Utc::now(),
            records_scraped: summary.records,
            status: summary.status.to_string(),
            error_message: summary.status.error_detail().map(str::to_string),
            duration_seconds: summary.duration_secs(),
        };
        if let Err(err) = store.log_run(&entry).await {
            warn!(source_id = %summary.source_id, error = %err, "failed to log run history");
        }
    }
}

/// Connects and pings the store; any failure means a scrape-only run.
pub async fn connect_store(database_url: Option<&str>) -> Option<PgStore> {
    let Some(url) = database_url else {
        warn!("DATABASE_URL not set, running in scrape-only mode");
        return None;
    };
    let connected = match PgStore::connect(url).await {
        Ok(store) => store.ping().await.map(|_| store),
        Err(err) => Err(err),
    };
    match connected {
        Ok(store) => {
            info!("database connected");
            Some(store)
        }
        Err(err) => {
            warn!(error = %err, "database unavailable, running in scrape-only mode");
            None
        }
    }
}

pub async fn run_from_env(options: RunOptions) -> Result<RunReport> {
    let config = SyncConfig::from_env();
    let registry = SourceRegistry::load(&config.sources_file).await?;
    let sources = bind_sources(&registry, &config.site, &options)?;

    let fetcher = Fetcher::new(config.fetcher_config())?;
    let snapshots = SnapshotStore::new(config.current_dir());
    let raw_pages = RawPageStore::new(config.raw_dir());
    let ctx = ProducerContext::new(&fetcher, &snapshots)
        .with_raw_pages(&raw_pages)
        .with_politeness_delay(config.scrape_delay);

    let store = connect_store(config.database_url.as_deref()).await;
    let notifier = DiscordNotifier::new(config.discord_webhook_url.clone())?;
    let orchestrator = Orchestrator::new(
        store.as_ref().map(|s| s as &dyn PersistenceGateway),
        &notifier,
        config.max_change_percent,
    );
    Ok(orchestrator.run(&sources, &ctx, &options).await)
}

/// One line per registered source with its sync plan and latest snapshot.
pub async fn source_overview(config: &SyncConfig) -> Result<Vec<String>> {
    let registry = SourceRegistry::load(&config.sources_file).await?;
    let snapshots = SnapshotStore::new(config.current_dir());
    let mut lines = Vec::with_capacity(registry.sources.len());
    for source in &registry.sources {
        let plan = source
            .sync
            .as_ref()
            .map(|p| format!("{} -> {} ({})", p.strategy.as_str(), p.table, p.conflict_keys))
            .unwrap_or_else(|| "scrape-only".to_string());
        let last = match snapshots.load(&source.source_id).await? {
            Some(snapshot) => format!(
                "{} records at {}",
                snapshot.metadata.record_count,
                snapshot.metadata.scraped_at.to_rfc3339()
            ),
            None => "never scraped".to_string(),
        };
        lines.push(format!(
            "{:28} {:8} {:55} {}",
            source.source_id,
            if source.enabled { "enabled" } else { "disabled" },
            plan,
            last
        ));
    }
    Ok(lines)
}
