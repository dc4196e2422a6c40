use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use harvest_core::{record, Record, RecordSet};
use scraper::{ElementRef, Html};
use serde_json::json;
use tracing::{info, warn};

use crate::campus::semester_in;
use crate::{
    absolute_url, element_text, finish_run, first_attr, first_text, selector, Producer,
    ProducerContext, ProducerError,
};

const EVENT_DATE_FORMATS: &[&str] = &["%d %b, %Y", "%d %B, %Y", "%d %b %Y", "%Y-%m-%d"];

fn iso_date(text: &str) -> Option<String> {
    EVENT_DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(text.trim(), fmt)
            .ok()
            .map(|d| d.format("%Y-%m-%d").to_string())
    })
}

/// `15 Nov, 2025 To 17 Nov, 2025` -> start and end as ISO dates.
pub fn event_date_range(text: &str) -> (Option<String>, Option<String>) {
    let mut parts: Vec<Vec<&str>> = vec![Vec::new()];
    for word in text.split_whitespace() {
        if word.eq_ignore_ascii_case("to") {
            parts.push(Vec::new());
        } else if let Some(last) = parts.last_mut() {
            last.push(word);
        }
    }
    let mut dates = parts
        .iter()
        .filter(|words| !words.is_empty())
        .map(|words| iso_date(&words.join(" ")));
    (dates.next().flatten(), dates.next().flatten())
}

pub struct EventsProducer {
    base_url: String,
}

impl EventsProducer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Producer for EventsProducer {
    fn source_id(&self) -> &'static str {
        "events"
    }

    fn urls(&self) -> Vec<String> {
        vec![format!("{}/events", self.base_url)]
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["title"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        let document = Html::parse_document(body);
        let containers = selector(".event-details")?;
        let title_sel = selector(".event-head h3")?;
        let meta_sel = selector(".event-head .margin-bottom10 span")?;
        let link_sel = selector("a[href*='/single-event/']")?;

        let mut events = Vec::new();
        for container in document.select(&containers) {
            let Some(title) = first_text(container, &title_sel).filter(|t| t.chars().count() >= 5)
            else {
                continue;
            };
            let mut meta = container.select(&meta_sel).map(element_text);
            let when = meta.next().unwrap_or_default();
            let location = meta.next().unwrap_or_default();
            let (event_date, end_date) = event_date_range(&when);
            let link = first_attr(container, &link_sel, "href")
                .map(|href| absolute_url(&self.base_url, &href))
                .unwrap_or_default();
            events.push(record([
                ("title", json!(title)),
                ("description", json!("")),
                ("event_date", json!(event_date)),
                ("end_date", json!(end_date)),
                ("location", json!(location)),
                ("url", json!(link)),
                ("source_url", json!(url)),
            ]));
        }
        Ok(events)
    }
}

pub struct NewslettersProducer {
    base_url: String,
}

impl NewslettersProducer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Producer for NewslettersProducer {
    fn source_id(&self) -> &'static str {
        "newsletters"
    }

    fn urls(&self) -> Vec<String> {
        vec![format!("{}/newsletters", self.base_url)]
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["title"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        let document = Html::parse_document(body);
        let columns = selector(".news-letter-col")?;
        let wraps = selector(".news-letter-wrap")?;
        let title_sel = selector(".program-name")?;
        let image_sel = selector(".news-letter-photo img")?;
        let pdf_sel = selector("a.btn-program")?;
        let date_sel = selector(".news-letter-date-wrap")?;

        let mut items: Vec<ElementRef<'_>> = document.select(&columns).collect();
        if items.is_empty() {
            items = document.select(&wraps).collect();
        }

        let mut newsletters = Vec::new();
        for item in items {
            let Some(title) = first_text(item, &title_sel) else {
                continue;
            };
            let (semester, year) = semester_in(&title, false)
                .and_then(|found| {
                    found
                        .split_once(' ')
                        .map(|(term, year)| (term.to_string(), year.to_string()))
                })
                .unwrap_or_default();
            let image_url = first_attr(item, &image_sel, "src")
                .map(|src| absolute_url(&self.base_url, &src))
                .unwrap_or_default();
            let pdf_url = first_attr(item, &pdf_sel, "href")
                .map(|href| absolute_url(&self.base_url, &href))
                .unwrap_or_default();
            newsletters.push(record([
                ("title", json!(title)),
                ("published_date", json!(first_text(item, &date_sel).unwrap_or_default())),
                ("semester", json!(semester)),
                ("year", json!(year)),
                ("image_url", json!(image_url)),
                ("pdf_url", json!(pdf_url)),
                ("source_url", json!(url)),
            ]));
        }
        Ok(newsletters)
    }
}

/// Governing bodies and the page each one is listed on.
pub const GOVERNANCE_BODIES: &[(&str, &str)] = &[
    ("board_of_trustees", "/board-trustees"),
    ("syndicate", "/syndicate"),
    ("academic_council", "/academic-council"),
];

const NON_MEMBER_HEADINGS: &[&str] = &["menu", "footer", "search", "contact"];

fn governance_member(body: &str, name: String, role: String, profile_url: String, url: &str) -> Record {
    let lower = role.to_lowercase();
    let is_chairperson = lower.contains("chairperson") || lower.contains("chairman");
    record([
        ("body", json!(body)),
        ("name", json!(name)),
        ("role", json!(role)),
        ("is_chairperson", json!(is_chairperson)),
        ("profile_url", json!(profile_url)),
        ("source_url", json!(url)),
    ])
}

/// Members of the board of trustees, syndicate and academic council.
pub struct GovernanceProducer {
    base_url: String,
}

impl GovernanceProducer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn body_for(&self, url: &str) -> &'static str {
        GOVERNANCE_BODIES
            .iter()
            .find(|(_, path)| url.ends_with(path))
            .map(|(body, _)| *body)
            .unwrap_or("unknown")
    }

    /// Linked member cards (`h4` name, `h6` role); bare `h4`/`h6` pairs when there are none.
    pub fn parse_body(&self, html: &str, url: &str, body: &str) -> Result<RecordSet, ProducerError> {
        let document = Html::parse_document(html);
        let links_sel = selector("a[href*='/office-employee/']")?;
        let name_sel = selector("h4")?;
        let role_sel = selector("h6")?;

        let mut seen = HashSet::new();
        let mut members = Vec::new();
        for link in document.select(&links_sel) {
            let name = first_text(link, &name_sel).unwrap_or_else(|| element_text(link));
            if name.chars().count() < 3 || !seen.insert(name.clone()) {
                continue;
            }
            let role = first_text(link, &role_sel).unwrap_or_default();
            let profile_url = link
                .value()
                .attr("href")
                .map(|href| absolute_url(&self.base_url, href))
                .unwrap_or_default();
            members.push(governance_member(body, name, role, profile_url, url));
        }
        if !members.is_empty() {
            return Ok(members);
        }

        for heading in document.select(&name_sel) {
            let name = element_text(heading);
            let lower = name.to_lowercase();
            if name.chars().count() < 3
                || NON_MEMBER_HEADINGS.iter().any(|skip| lower.contains(skip))
                || !seen.insert(name.clone())
            {
                continue;
            }
            let role = heading
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "h6")
                .map(element_text)
                .unwrap_or_default();
            members.push(governance_member(body, name, role, String::new(), url));
        }
        Ok(members)
    }
}

#[async_trait]
impl Producer for GovernanceProducer {
    fn source_id(&self) -> &'static str {
        "governance"
    }

    fn urls(&self) -> Vec<String> {
        GOVERNANCE_BODIES
            .iter()
            .map(|(_, path)| format!("{}{}", self.base_url, path))
            .collect()
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["body", "name"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        self.parse_body(body, url, self.body_for(url))
    }

    async fn run(&self, ctx: &ProducerContext<'_>) -> Result<RecordSet, ProducerError> {
        info!(source_id = self.source_id(), "starting governance scrape");
        let mut members = Vec::new();
        let mut visited = Vec::new();
        for (idx, (body, path)) in GOVERNANCE_BODIES.iter().enumerate() {
            if idx > 0 {
                ctx.pause().await;
            }
            let url = format!("{}{}", self.base_url, path);
            let Some(html) = ctx.fetch_page(self.source_id(), &url).await else {
                warn!(body, url = %url, "could not fetch governing body");
                continue;
            };
            let found = self.parse_body(&html, &url, body)?;
            info!(body, members = found.len(), "parsed governing body");
            members.extend(found);
            visited.push(url);
        }
        Ok(finish_run(self, ctx, &visited, members).await)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use harvest_storage::SnapshotStore;
    use tempfile::tempdir;

    use super::*;
    use crate::test_support::{fixture, serve, test_fetcher};

    #[test]
    fn event_ranges_become_iso_dates() {
        assert_eq!(
            event_date_range("15 Nov, 2025 To 17 Nov, 2025"),
            (Some("2025-11-15".into()), Some("2025-11-17".into()))
        );
        assert_eq!(event_date_range("02 Feb 2026"), (Some("2026-02-02".into()), None));
        assert_eq!(event_date_range("sometime soon"), (None, None));
        assert_eq!(event_date_range(""), (None, None));
    }

    #[test]
    fn events_fixture_parses_titled_cards() {
        let producer = EventsProducer::new("https://www.ewubd.edu");
        let events = producer
            .parse(&fixture("events/listing.html"), "https://www.ewubd.edu/events")
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["title"], json!("International Conference on Data Science"));
        assert_eq!(events[0]["event_date"], json!("2025-11-15"));
        assert_eq!(events[0]["end_date"], json!("2025-11-17"));
        assert_eq!(events[0]["location"], json!("EWU Auditorium"));
        assert_eq!(events[0]["url"], json!("https://www.ewubd.edu/single-event/icds-2025"));
        assert_eq!(events[1]["event_date"], json!("2026-02-02"));
        assert!(events[1]["end_date"].is_null());
    }

    #[test]
    fn newsletters_split_semester_and_year_from_title() {
        let producer = NewslettersProducer::new("https://www.ewubd.edu");
        let rows = producer
            .parse(&fixture("newsletters/listing.html"), "https://www.ewubd.edu/newsletters")
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["title"], json!("EWU Newsletter Fall 2025"));
        assert_eq!(rows[0]["semester"], json!("Fall"));
        assert_eq!(rows[0]["year"], json!("2025"));
        assert_eq!(rows[0]["published_date"], json!("December 2025"));
        assert_eq!(
            rows[0]["pdf_url"],
            json!("https://www.ewubd.edu/storage/newsletters/fall-2025.pdf")
        );
        assert_eq!(
            rows[0]["image_url"],
            json!("https://www.ewubd.edu/storage/newsletters/fall-2025.jpg")
        );
        assert_eq!(rows[1]["semester"], json!(""));
        assert_eq!(rows[1]["pdf_url"], json!(""));
    }

    #[test]
    fn governance_cards_are_unique_per_name() {
        let producer = GovernanceProducer::new("https://www.ewubd.edu");
        let url = "https://www.ewubd.edu/syndicate";
        let members = producer.parse(&fixture("governance/syndicate.html"), url).unwrap();

        assert_eq!(members.len(), 2);
        assert_eq!(members[0]["body"], json!("syndicate"));
        assert_eq!(members[0]["name"], json!("Prof. Jane Doe"));
        assert_eq!(members[0]["role"], json!("Chairperson, Syndicate"));
        assert_eq!(members[0]["is_chairperson"], json!(true));
        assert_eq!(
            members[0]["profile_url"],
            json!("https://www.ewubd.edu/office-employee/jane-doe")
        );
        assert_eq!(members[1]["is_chairperson"], json!(false));
    }

    #[test]
    fn governance_falls_back_to_heading_pairs() {
        let producer = GovernanceProducer::new("https://www.ewubd.edu");
        let html = "<html><body><div><h4>Main Menu</h4><h4>Dr. Rahim Uddin</h4><p>Since 2019</p>\
                    <h6>Chairman</h6><h4>Ms. Karima Begum</h4><h6>Member</h6></div></body></html>";
        let members = producer
            .parse(html, "https://www.ewubd.edu/board-trustees")
            .unwrap();

        assert_eq!(members.len(), 2);
        assert_eq!(members[0]["body"], json!("board_of_trustees"));
        assert_eq!(members[0]["name"], json!("Dr. Rahim Uddin"));
        assert_eq!(members[0]["role"], json!("Chairman"));
        assert_eq!(members[0]["is_chairperson"], json!(true));
        assert_eq!(members[0]["profile_url"], json!(""));
        assert_eq!(members[1]["role"], json!("Member"));
    }

    #[tokio::test]
    async fn governance_run_tags_each_body_and_skips_missing_pages() {
        let (base, hits) = serve(vec![
            (
                "/board-trustees",
                "<html><body><h4>Dr. Rahim Uddin</h4><h6>Chairman</h6></body></html>".to_string(),
            ),
            ("/syndicate", fixture("governance/syndicate.html")),
        ])
        .await;
        let fetcher = test_fetcher();
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::new(dir.path());
        let ctx = ProducerContext::new(&fetcher, &snapshots).with_politeness_delay(Duration::ZERO);

        let members = GovernanceProducer::new(base.clone()).run(&ctx).await.unwrap();

        assert_eq!(members.len(), 3);
        assert_eq!(members[0]["body"], json!("board_of_trustees"));
        assert_eq!(members[1]["body"], json!("syndicate"));
        assert_eq!(
            *hits.lock().unwrap(),
            vec!["/board-trustees", "/syndicate", "/academic-council"]
        );
        let snapshot = snapshots.load("governance").await.unwrap().unwrap();
        assert_eq!(
            snapshot.metadata.source_urls,
            vec![format!("{base}/board-trustees"), format!("{base}/syndicate")]
        );
    }
}
