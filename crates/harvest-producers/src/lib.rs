//! Producer contract and the built-in campus producers.
//!
//! A producer declares the URLs it visits and turns each fetched document into
//! records. The default [`Producer::run`] walks [`Producer::urls`] in order with a
//! politeness pause between requests, validates the result and saves a snapshot.
//! Producers with pagination, several linked documents or an API-first strategy
//! override `run` but finish through [`finish_run`] so the snapshot/validation
//! behaviour stays the same.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use harvest_core::{Record, RecordSet, ValidationError};
use harvest_storage::{Fetcher, RawPageStore, SnapshotStore};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{info, warn};

mod admissions;
mod campus;
mod community;

pub use admissions::{
    parse_money, AdmissionDeadlinesProducer, ScholarshipsProducer, TuitionFeesProducer,
};
pub use campus::{
    AboutProducer, AcademicCalendarProducer, ClubsProducer, DocumentProducer, FacultyProducer,
    HelpdeskProducer, NoticesProducer, DOCUMENT_PAGES,
};
pub use community::{
    event_date_range, EventsProducer, GovernanceProducer, NewslettersProducer, GOVERNANCE_BODIES,
};

pub const CRATE_NAME: &str = "harvest-producers";

/// Hosts the built-in producers point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    pub base_url: String,
    pub admission_url: String,
}

impl SiteConfig {
    pub fn new(base_url: impl Into<String>, admission_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            admission_url: admission_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self::new("https://www.ewubd.edu", "https://admission.ewubd.edu")
    }
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Collaborators a producer needs during one run.
pub struct ProducerContext<'a> {
    pub fetcher: &'a Fetcher,
    pub snapshots: &'a SnapshotStore,
    pub raw_pages: Option<&'a RawPageStore>,
    pub politeness_delay: Duration,
}

impl<'a> ProducerContext<'a> {
    pub fn new(fetcher: &'a Fetcher, snapshots: &'a SnapshotStore) -> Self {
        Self {
            fetcher,
            snapshots,
            raw_pages: None,
            politeness_delay: Duration::from_secs(3),
        }
    }

    pub fn with_raw_pages(mut self, raw_pages: &'a RawPageStore) -> Self {
        self.raw_pages = Some(raw_pages);
        self
    }

    pub fn with_politeness_delay(mut self, delay: Duration) -> Self {
        self.politeness_delay = delay;
        self
    }

    /// Fetch `url` and archive the body. `None` means the URL contributes nothing this run.
    pub async fn fetch_page(&self, source_id: &str, url: &str) -> Option<String> {
        let body = self.fetcher.fetch(url).await?;
        if let Some(raw_pages) = self.raw_pages {
            if let Err(err) = raw_pages
                .store_page(Utc::now(), source_id, "html", body.as_bytes())
                .await
            {
                warn!(source_id, url, error = %err, "failed to archive raw page");
            }
        }
        Some(body)
    }

    pub async fn pause(&self) {
        if !self.politeness_delay.is_zero() {
            tokio::time::sleep(self.politeness_delay).await;
        }
    }
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn urls(&self) -> Vec<String>;

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError>;

    /// Fields every record must carry for the set to be trusted.
    fn required_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn validate(&self, records: &[Record]) -> Result<(), ValidationError> {
        harvest_core::validate(self.source_id(), records, self.required_fields())
    }

    /// `visited` lists the URLs whose documents fed `records`.
    async fn save(
        &self,
        ctx: &ProducerContext<'_>,
        visited: &[String],
        records: &[Record],
    ) -> anyhow::Result<()> {
        ctx.snapshots
            .save(self.source_id(), visited.to_vec(), records)
            .await?;
        Ok(())
    }

    async fn run(&self, ctx: &ProducerContext<'_>) -> Result<RecordSet, ProducerError> {
        run_url_list(self, ctx).await
    }
}

/// Default fetch loop: every declared URL in order, parse, concatenate.
pub async fn run_url_list<P: Producer + ?Sized>(
    producer: &P,
    ctx: &ProducerContext<'_>,
) -> Result<RecordSet, ProducerError> {
    let source_id = producer.source_id();
    let urls = producer.urls();
    info!(source_id, urls = urls.len(), "starting scrape");

    let mut records = Vec::new();
    let mut visited = Vec::new();
    for (idx, url) in urls.iter().enumerate() {
        if let Some(body) = ctx.fetch_page(source_id, url).await {
            records.extend(producer.parse(&body, url)?);
            visited.push(url.clone());
        }
        if idx + 1 < urls.len() {
            ctx.pause().await;
        }
    }
    Ok(finish_run(producer, ctx, &visited, records).await)
}

/// Validate and snapshot a finished record set. Invalid sets come back empty.
pub async fn finish_run<P: Producer + ?Sized>(
    producer: &P,
    ctx: &ProducerContext<'_>,
    visited: &[String],
    records: RecordSet,
) -> RecordSet {
    let source_id = producer.source_id();
    if let Err(err) = producer.validate(&records) {
        warn!(source_id, error = %err, "scrape failed validation");
        return Vec::new();
    }
    if let Err(err) = producer.save(ctx, visited, &records).await {
        warn!(source_id, error = %err, "failed to save snapshot");
    }
    info!(source_id, records = records.len(), "scrape complete");
    records
}

pub const BUILTIN_SOURCE_IDS: &[&str] = &[
    "tuition_fees",
    "scholarships",
    "notices",
    "events",
    "clubs",
    "faculty",
    "newsletters",
    "admission_deadlines",
    "helpdesk",
    "governance",
    "grading_doc",
    "policies_doc",
    "rules_doc",
    "payment_doc",
    "career_center_doc",
    "admission_process_doc",
    "admission_requirements_doc",
    "sexual_harassment_doc",
    "facilities_doc",
    "academic_calendar",
    "about",
];

pub fn producer_for_source(source_id: &str, site: &SiteConfig) -> Option<Box<dyn Producer>> {
    let base = site.base_url.clone();
    match source_id {
        "tuition_fees" => Some(Box::new(TuitionFeesProducer::new(base))),
        "scholarships" => Some(Box::new(ScholarshipsProducer::new(base))),
        "events" => Some(Box::new(EventsProducer::new(base))),
        "newsletters" => Some(Box::new(NewslettersProducer::new(base))),
        "admission_deadlines" => Some(Box::new(AdmissionDeadlinesProducer::new(
            site.admission_url.clone(),
        ))),
        "governance" => Some(Box::new(GovernanceProducer::new(base))),
        "notices" => Some(Box::new(NoticesProducer::new(base))),
        "clubs" => Some(Box::new(ClubsProducer::new(base))),
        "faculty" => Some(Box::new(FacultyProducer::new(base))),
        "helpdesk" => Some(Box::new(HelpdeskProducer::new(base))),
        "academic_calendar" => Some(Box::new(AcademicCalendarProducer::new(base))),
        "about" => Some(Box::new(AboutProducer::new(base))),
        other => DocumentProducer::for_source(other, site)
            .map(|p| Box::new(p) as Box<dyn Producer>),
    }
}

pub fn selector(css: &str) -> Result<Selector, ProducerError> {
    Selector::parse(css).map_err(|e| ProducerError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// Visible text with whitespace runs collapsed.
pub fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|el| text_or_none(element_text(el)))
}

pub fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|el| el.value().attr(attr))
        .and_then(|v| text_or_none(v.to_string()))
}

/// Resolve site-relative links against `base`.
pub fn absolute_url(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() || href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    let base = base.trim_end_matches('/');
    if href.starts_with('/') {
        format!("{base}{href}")
    } else {
        format!("{base}/{href}")
    }
}

/// Main content container: `<main>`, then `div.content`, `div.container`, `<body>`.
pub fn content_root(document: &Html) -> Result<Option<ElementRef<'_>>, ProducerError> {
    for css in ["main", "div.content", "div.container", "body"] {
        let sel = selector(css)?;
        if let Some(el) = document.select(&sel).next() {
            return Ok(Some(el));
        }
    }
    Ok(None)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    struct TwoPageProducer {
        base: String,
    }

    #[async_trait]
    impl Producer for TwoPageProducer {
        fn source_id(&self) -> &'static str {
            "two_pages"
        }

        fn urls(&self) -> Vec<String> {
            vec![
                format!("{}/a", self.base),
                format!("{}/missing", self.base),
                format!("{}/b", self.base),
            ]
        }

        fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
            Ok(vec![harvest_core::record([
                ("name", json!(body.trim())),
                ("source_url", json!(url)),
            ])])
        }

        fn required_fields(&self) -> &'static [&'static str] {
            &["name"]
        }
    }

    #[test]
    fn absolute_url_handles_relative_and_absolute_links() {
        assert_eq!(absolute_url("https://x.test/", "/clubs"), "https://x.test/clubs");
        assert_eq!(absolute_url("https://x.test", "clubs"), "https://x.test/clubs");
        assert_eq!(absolute_url("https://x.test", "https://y.test/a"), "https://y.test/a");
        assert_eq!(absolute_url("https://x.test", ""), "");
    }

    #[test]
    fn content_root_prefers_main() {
        let doc = Html::parse_document(
            "<html><body><div class='content'>c</div><main><p>m</p></main></body></html>",
        );
        let root = content_root(&doc).unwrap().unwrap();
        assert_eq!(root.value().name(), "main");
    }

    #[test]
    fn invalid_selector_is_reported() {
        assert!(matches!(selector("a[[["), Err(ProducerError::Selector { .. })));
    }

    #[test]
    fn registry_resolves_every_builtin_source() {
        let site = SiteConfig::default();
        for id in BUILTIN_SOURCE_IDS {
            let producer = producer_for_source(id, &site)
                .unwrap_or_else(|| panic!("no producer for {id}"));
            assert_eq!(producer.source_id(), *id);
            assert!(!producer.urls().is_empty());
        }
        assert!(producer_for_source("unknown", &site).is_none());
    }

    #[tokio::test]
    async fn default_run_concatenates_pages_skips_failures_and_saves_snapshot() {
        let (base, hits) = serve(vec![("/a", "alpha".to_string()), ("/b", "beta".to_string())]).await;
        let fetcher = test_fetcher();
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::new(dir.path().join("current"));
        let raw_pages = RawPageStore::new(dir.path().join("raw"));
        let ctx = ProducerContext::new(&fetcher, &snapshots)
            .with_raw_pages(&raw_pages)
            .with_politeness_delay(Duration::ZERO);
        let producer = TwoPageProducer { base };

        let records = producer.run(&ctx).await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], json!("alpha"));
        assert_eq!(records[1]["name"], json!("beta"));
        assert_eq!(*hits.lock().unwrap(), vec!["/a", "/missing", "/b"]);

        let snapshot = snapshots.load("two_pages").await.unwrap().expect("snapshot");
        assert_eq!(snapshot.metadata.record_count, 2);
        assert_eq!(
            snapshot.metadata.source_urls,
            vec![format!("{}/a", producer.base), format!("{}/b", producer.base)]
        );
        assert!(raw_pages.root().exists());
    }

    #[tokio::test]
    async fn failed_validation_returns_no_records_and_no_snapshot() {
        let (base, _hits) = serve(vec![]).await;
        let fetcher = test_fetcher();
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::new(dir.path());
        let ctx = ProducerContext::new(&fetcher, &snapshots).with_politeness_delay(Duration::ZERO);

        let records = TwoPageProducer { base }.run(&ctx).await.unwrap();

        assert!(records.is_empty());
        assert!(snapshots.load("two_pages").await.unwrap().is_none());
    }

    #[test]
    fn fixtures_directory_is_present() {
        assert!(workspace_fixture_dir().join("clubs/listing.html").exists());
    }
}
