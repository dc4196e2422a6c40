use async_trait::async_trait;
use harvest_core::{record, Record, RecordSet};
use scraper::{ElementRef, Html};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::{
    absolute_url, content_root, element_text, finish_run, first_attr, first_text, selector,
    text_or_none, Producer, ProducerContext, ProducerError, SiteConfig,
};

pub struct ClubsProducer {
    base_url: String,
}

impl ClubsProducer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Producer for ClubsProducer {
    fn source_id(&self) -> &'static str {
        "clubs"
    }

    fn urls(&self) -> Vec<String> {
        vec![format!("{}/clubs", self.base_url)]
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        let document = Html::parse_document(body);
        let cards = selector(".ewu-clubs-member-details")?;
        let name_sel = selector("h4")?;
        let link_sel = selector("a.btn-ewu-clubs-now")?;
        let logo_sel = selector(".ewu-clubs-img img")?;

        let mut clubs = Vec::new();
        for card in document.select(&cards) {
            let Some(name) = first_text(card, &name_sel).filter(|n| n.chars().count() >= 3) else {
                continue;
            };
            let link = first_attr(card, &link_sel, "href")
                .map(|href| absolute_url(&self.base_url, &href))
                .unwrap_or_default();
            let logo = first_attr(card, &logo_sel, "src")
                .map(|src| absolute_url(&self.base_url, &src))
                .unwrap_or_default();
            clubs.push(record([
                ("name", json!(name)),
                ("description", json!("")),
                ("url", json!(link)),
                ("logo", json!(logo)),
                ("source_url", json!(url)),
            ]));
        }
        Ok(clubs)
    }
}

const ADMIN_KEYWORDS: &[&str] = &[
    "accounts",
    "registrar",
    "admission",
    "library",
    "hr",
    "ict",
    "it",
    "admin",
    "exam",
    "controller",
];

/// Department mailboxes from the helpdesk notice tables.
pub struct HelpdeskProducer {
    base_url: String,
}

impl HelpdeskProducer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Producer for HelpdeskProducer {
    fn source_id(&self) -> &'static str {
        "helpdesk"
    }

    fn urls(&self) -> Vec<String> {
        vec![format!(
            "{}/notice-details/online-helpdesk-list-email-accounts",
            self.base_url
        )]
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["email"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        let document = Html::parse_document(body);
        let tables = selector("table")?;
        let rows_sel = selector("tr")?;
        let cells_sel = selector("th, td")?;
        let mailto_sel = selector("a[href^='mailto:']")?;

        let mut contacts = Vec::new();
        for table in document.select(&tables) {
            let rows: Vec<ElementRef<'_>> = table.select(&rows_sel).collect();
            let Some((header, body_rows)) = rows.split_first() else {
                continue;
            };
            let headers: Vec<String> = header
                .select(&cells_sel)
                .map(|c| element_text(c).to_lowercase())
                .collect();
            if headers.is_empty() {
                continue;
            }

            for row in body_rows {
                let cells: Vec<String> = row.select(&cells_sel).map(element_text).collect();
                if cells.len() < 2 {
                    continue;
                }
                let email = first_attr(*row, &mailto_sel, "href")
                    .map(|href| href.trim_start_matches("mailto:").trim().to_string())
                    .or_else(|| cells.iter().find(|c| c.contains('@')).cloned())
                    .unwrap_or_default();
                if email.is_empty() {
                    continue;
                }

                let mut department = String::new();
                let mut purpose = String::new();
                for (header, cell) in headers.iter().zip(&cells) {
                    if header.contains("group") || header.contains("department") || header.contains("name") {
                        department = cell.clone();
                    } else if header.contains("purpose") || header.contains("description") {
                        purpose = cell.clone();
                    }
                }
                let dept_lower = department.to_lowercase();
                let category = if ADMIN_KEYWORDS.iter().any(|kw| dept_lower.contains(kw)) {
                    "administrative"
                } else {
                    "academic"
                };

                contacts.push(record([
                    ("category", json!(category)),
                    ("department_code", json!(department)),
                    ("full_name", json!(department)),
                    ("email", json!(email)),
                    ("purpose", json!(purpose)),
                    ("source_url", json!(url)),
                ]));
            }
        }
        Ok(contacts)
    }
}

pub const NOTICE_PAGE_LIMIT: usize = 30;

pub struct NoticesProducer {
    base_url: String,
}

impl NoticesProducer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn page_url(&self, page: usize) -> String {
        format!("{}/notice-board?page={page}", self.base_url)
    }
}

/// Whether the pager on `body` links past `current_page`.
pub fn has_next_page(body: &str, current_page: usize) -> Result<bool, ProducerError> {
    let document = Html::parse_document(body);
    let pager_sel = selector("ul.pagination, nav.pagination")?;
    let anchor_sel = selector("a")?;
    let Some(pager) = document.select(&pager_sel).next() else {
        return Ok(false);
    };
    let next_label = (current_page + 1).to_string();
    Ok(pager.select(&anchor_sel).map(element_text).any(|label| {
        label.to_lowercase().contains("next")
            || label.contains('›')
            || label.contains('»')
            || label == next_label
    }))
}

#[async_trait]
impl Producer for NoticesProducer {
    fn source_id(&self) -> &'static str {
        "notices"
    }

    fn urls(&self) -> Vec<String> {
        vec![format!("{}/notice-board", self.base_url)]
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["title"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        let document = Html::parse_document(body);
        let items_sel = selector(
            ".notice-item, .notice-list li, .news-item, article, .card, .list-group-item",
        )?;
        let title_sel = selector("h2, h3, h4, h5, a")?;
        let date_sel = selector("time[class*=date], span[class*=date], small[class*=date]")?;

        let mut items: Vec<ElementRef<'_>> = document.select(&items_sel).collect();
        if items.is_empty() {
            if let Some(root) = content_root(&document)? {
                items = root.select(&selector("a[href]")?).collect();
            }
        }

        let mut notices = Vec::new();
        for item in items {
            let title_el = item.select(&title_sel).next();
            let title = title_el.map(element_text).unwrap_or_else(|| element_text(item));
            if title.chars().count() < 5 {
                continue;
            }
            let href = match title_el {
                Some(el) if el.value().name() == "a" => el.value().attr("href"),
                _ if item.value().name() == "a" => item.value().attr("href"),
                _ => None,
            };
            let link = href
                .map(|h| absolute_url(&self.base_url, h))
                .unwrap_or_default();
            let date = first_text(item, &date_sel).unwrap_or_default();
            notices.push(record([
                ("title", json!(title)),
                ("url", json!(link)),
                ("published_date", json!(date)),
                ("source_url", json!(url)),
            ]));
        }
        Ok(notices)
    }

    async fn run(&self, ctx: &ProducerContext<'_>) -> Result<RecordSet, ProducerError> {
        info!(source_id = self.source_id(), "starting paginated scrape");
        let mut notices = Vec::new();
        let mut visited = Vec::new();
        let mut page = 1;
        while page <= NOTICE_PAGE_LIMIT {
            let url = self.page_url(page);
            let Some(body) = ctx.fetch_page(self.source_id(), &url).await else {
                break;
            };
            let found = self.parse(&body, &url)?;
            visited.push(url);
            if found.is_empty() {
                info!(page, "no notices on page, stopping pagination");
                break;
            }
            notices.extend(found);
            info!(page, total = notices.len(), "parsed notice page");

            if !has_next_page(&body, page)? {
                break;
            }
            page += 1;
            ctx.pause().await;
        }
        Ok(finish_run(self, ctx, &visited, notices).await)
    }
}

const FACULTY_API_PATHS: &[&str] = &["/api/faculty", "/search-faculty/search", "/faculty/search"];

#[derive(Debug, Default)]
struct FacultyRow {
    name: String,
    designation: String,
    department_name: String,
    email: String,
    phone: String,
    profile_url: String,
    image_url: String,
    specialization: String,
}

impl FacultyRow {
    fn into_record(self, source_url: &str) -> Record {
        let profile_id = self
            .profile_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(|id| text_or_none(id.to_string()));
        record([
            ("name", json!(self.name)),
            ("designation", json!(self.designation)),
            ("department_name", json!(self.department_name)),
            ("email", json!(self.email)),
            ("phone", json!(self.phone)),
            ("profile_url", json!(self.profile_url)),
            ("profile_id", json!(profile_id)),
            ("image_url", json!(self.image_url)),
            ("specialization", json!(self.specialization)),
            ("academic_background", JsonValue::Null),
            ("publications", JsonValue::Null),
            ("details", JsonValue::Null),
            ("source_url", json!(source_url)),
        ])
    }
}

/// Faculty directory. Tries the JSON search endpoints first, then the static page.
pub struct FacultyProducer {
    base_url: String,
}

impl FacultyProducer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn normalize(&self, raw: &Record, api_url: &str) -> Record {
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| raw.get(*n).and_then(JsonValue::as_str))
                .unwrap_or_default()
                .trim()
                .to_string()
        };
        let profile_url = field(&["profile_url", "profile_link"]);
        FacultyRow {
            name: field(&["name"]),
            designation: field(&["designation", "position"]),
            department_name: field(&["department_name", "department"]),
            email: field(&["email"]),
            phone: field(&["phone"]),
            profile_url: absolute_url(&self.base_url, &profile_url),
            image_url: field(&["image_url", "image"]),
            specialization: field(&["specialization"]),
        }
        .into_record(api_url)
    }

    async fn from_api(&self, ctx: &ProducerContext<'_>) -> Option<(String, RecordSet)> {
        for (idx, path) in FACULTY_API_PATHS.iter().enumerate() {
            if idx > 0 {
                ctx.pause().await;
            }
            let api_url = format!("{}{}", self.base_url, path);
            let Some(payload) = ctx.fetcher.probe_json(&api_url).await else {
                continue;
            };
            let rows = match payload {
                JsonValue::Array(rows) => rows,
                JsonValue::Object(mut map) => match map.remove("data") {
                    Some(JsonValue::Array(rows)) => rows,
                    _ => continue,
                },
                _ => continue,
            };
            let faculty: RecordSet = rows
                .iter()
                .filter_map(JsonValue::as_object)
                .map(|raw| self.normalize(raw, &api_url))
                .collect();
            if !faculty.is_empty() {
                info!(api_url = %api_url, records = faculty.len(), "faculty API responded");
                return Some((api_url, faculty));
            }
        }
        None
    }
}

#[async_trait]
impl Producer for FacultyProducer {
    fn source_id(&self) -> &'static str {
        "faculty"
    }

    fn urls(&self) -> Vec<String> {
        vec![format!("{}/search-faculty", self.base_url)]
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        let document = Html::parse_document(body);
        let cards_sel = selector(
            ".faculty-card, .faculty-item, .member-item, .card, .team-member, .profile-card",
        )?;
        let name_sel = selector("h3, h4, h5, a")?;
        let designation_sel = selector("p[class*=designation], span[class*=designation]")?;
        let dept_sel = selector("p[class*=dept], span[class*=dept]")?;
        let mailto_sel = selector("a[href^='mailto:']")?;
        let profile_sel = selector("a[href*='faculty-profile']")?;

        let mut faculty = Vec::new();
        for card in document.select(&cards_sel) {
            let Some(name) = first_text(card, &name_sel) else {
                continue;
            };
            let profile_url = first_attr(card, &profile_sel, "href")
                .map(|href| absolute_url(&self.base_url, &href))
                .unwrap_or_default();
            let row = FacultyRow {
                name,
                designation: first_text(card, &designation_sel).unwrap_or_default(),
                department_name: first_text(card, &dept_sel).unwrap_or_default(),
                email: first_attr(card, &mailto_sel, "href")
                    .map(|h| h.trim_start_matches("mailto:").to_string())
                    .unwrap_or_default(),
                profile_url,
                ..Default::default()
            };
            faculty.push(row.into_record(url));
        }
        Ok(faculty)
    }

    async fn run(&self, ctx: &ProducerContext<'_>) -> Result<RecordSet, ProducerError> {
        info!(source_id = self.source_id(), "starting faculty scrape");
        if let Some((api_url, faculty)) = self.from_api(ctx).await {
            return Ok(finish_run(self, ctx, &[api_url], faculty).await);
        }
        info!("faculty API unavailable, parsing static page");
        let url = format!("{}/search-faculty", self.base_url);
        ctx.pause().await;
        let Some(body) = ctx.fetch_page(self.source_id(), &url).await else {
            return Ok(finish_run(self, ctx, &[], Vec::new()).await);
        };
        let faculty = self.parse(&body, &url)?;
        Ok(finish_run(self, ctx, &[url], faculty).await)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteHost {
    Main,
    Admission,
}

/// A page (or set of pages) stored as one row of the shared documents table.
#[derive(Debug, Clone, Copy)]
pub struct DocumentPage {
    pub source_id: &'static str,
    pub slug: &'static str,
    pub title: &'static str,
    pub host: SiteHost,
    pub paths: &'static [&'static str],
}

pub const DOCUMENT_PAGES: &[DocumentPage] = &[
    DocumentPage {
        source_id: "grading_doc",
        slug: "grading",
        title: "Grades, Rules and Regulations",
        host: SiteHost::Main,
        paths: &["/grades-rules-and-regulations"],
    },
    DocumentPage {
        source_id: "policies_doc",
        slug: "policies",
        title: "University Policies",
        host: SiteHost::Main,
        paths: &["/ewu-policies"],
    },
    DocumentPage {
        source_id: "rules_doc",
        slug: "rules",
        title: "Student Rules and Regulations",
        host: SiteHost::Main,
        paths: &["/student-rules-regulation"],
    },
    DocumentPage {
        source_id: "payment_doc",
        slug: "payment-procedure",
        title: "Payment Procedure",
        host: SiteHost::Main,
        paths: &["/payment-procedure"],
    },
    DocumentPage {
        source_id: "career_center_doc",
        slug: "career-counseling",
        title: "Career Counseling Center",
        host: SiteHost::Main,
        paths: &["/career-counseling-center"],
    },
    DocumentPage {
        source_id: "admission_process_doc",
        slug: "admission-process",
        title: "Admission Process",
        host: SiteHost::Admission,
        paths: &[""],
    },
    DocumentPage {
        source_id: "admission_requirements_doc",
        slug: "admission-requirements",
        title: "Admission Requirements",
        host: SiteHost::Admission,
        paths: &[""],
    },
    DocumentPage {
        source_id: "sexual_harassment_doc",
        slug: "sexual-harassment-policy",
        title: "Sexual Harassment Elimination and Prevention Policy",
        host: SiteHost::Main,
        paths: &["/ewu-sexual-harassment-elimination-and-prevention-policy"],
    },
    DocumentPage {
        source_id: "facilities_doc",
        slug: "facilities",
        title: "University Facilities",
        host: SiteHost::Main,
        paths: &["/research-facilities", "/campus-life"],
    },
];

#[derive(Debug, Default, PartialEq)]
pub struct DocumentContent {
    pub sections: Vec<JsonValue>,
    pub pdf_links: Vec<JsonValue>,
}

impl DocumentContent {
    fn into_json(self) -> JsonValue {
        let mut content = serde_json::Map::new();
        content.insert("sections".into(), JsonValue::Array(self.sections));
        if !self.pdf_links.is_empty() {
            content.insert("pdf_links".into(), JsonValue::Array(self.pdf_links));
        }
        JsonValue::Object(content)
    }
}

/// Split a page into heading-delimited sections of paragraphs, lists and tables.
pub fn extract_document(body: &str, base_url: &str) -> Result<Option<DocumentContent>, ProducerError> {
    let document = Html::parse_document(body);
    let Some(root) = content_root(&document)? else {
        return Ok(None);
    };
    let blocks_sel = selector("h1, h2, h3, h4, h5, p, ul, ol, table")?;
    let rows_sel = selector("tr")?;
    let cells_sel = selector("th, td")?;
    let links_sel = selector("a[href]")?;

    let mut sections = Vec::new();
    let mut title = "Introduction".to_string();
    let mut blocks: Vec<JsonValue> = Vec::new();
    for el in root.select(&blocks_sel) {
        match el.value().name() {
            "h1" | "h2" | "h3" | "h4" | "h5" => {
                let next_title = element_text(el);
                if !blocks.is_empty() {
                    sections.push(json!({ "title": title, "content": std::mem::take(&mut blocks) }));
                }
                title = next_title;
            }
            "table" => {
                let rows: Vec<Vec<String>> = el
                    .select(&rows_sel)
                    .map(|tr| tr.select(&cells_sel).map(element_text).collect::<Vec<_>>())
                    .filter(|cells| !cells.is_empty())
                    .collect();
                if !rows.is_empty() {
                    blocks.push(json!({ "type": "table", "rows": rows }));
                }
            }
            "ul" | "ol" => {
                let items: Vec<String> = el
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|child| child.value().name() == "li")
                    .map(element_text)
                    .collect();
                if !items.is_empty() {
                    blocks.push(json!({ "type": "list", "items": items }));
                }
            }
            _ => {
                if let Some(text) = text_or_none(element_text(el)) {
                    blocks.push(JsonValue::String(text));
                }
            }
        }
    }
    if !blocks.is_empty() {
        sections.push(json!({ "title": title, "content": blocks }));
    }

    let pdf_links = root
        .select(&links_sel)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            href.ends_with(".pdf").then(|| {
                json!({ "title": element_text(a), "url": absolute_url(base_url, href) })
            })
        })
        .collect();

    Ok(Some(DocumentContent {
        sections,
        pdf_links,
    }))
}

pub struct DocumentProducer {
    page: DocumentPage,
    base_url: String,
    urls: Vec<String>,
}

impl DocumentProducer {
    pub fn new(page: DocumentPage, site: &SiteConfig) -> Self {
        let host = match page.host {
            SiteHost::Main => &site.base_url,
            SiteHost::Admission => &site.admission_url,
        };
        let urls = page.paths.iter().map(|p| format!("{host}{p}")).collect();
        Self {
            page,
            base_url: site.base_url.clone(),
            urls,
        }
    }

    pub fn for_source(source_id: &str, site: &SiteConfig) -> Option<Self> {
        DOCUMENT_PAGES
            .iter()
            .find(|p| p.source_id == source_id)
            .map(|page| Self::new(*page, site))
    }

    fn document_record(&self, content: DocumentContent, source_url: Option<&str>) -> Record {
        let mut doc = record([
            ("slug", json!(self.page.slug)),
            ("title", json!(self.page.title)),
            ("content", content.into_json()),
            ("source_file", json!(format!("{}.json", self.page.source_id))),
        ]);
        if let Some(url) = source_url {
            doc.insert("source_url".into(), json!(url));
        }
        doc
    }

    /// Fold every page into one document. Empty when no page yields a section.
    async fn run_merged(&self, ctx: &ProducerContext<'_>) -> Result<RecordSet, ProducerError> {
        let mut merged = DocumentContent::default();
        let mut visited = Vec::new();
        for (idx, url) in self.urls.iter().enumerate() {
            if idx > 0 {
                ctx.pause().await;
            }
            let Some(body) = ctx.fetch_page(self.page.source_id, url).await else {
                continue;
            };
            visited.push(url.clone());
            if let Some(content) = extract_document(&body, &self.base_url)? {
                merged.sections.extend(content.sections);
                merged.pdf_links.extend(content.pdf_links);
            }
        }
        if merged.sections.is_empty() {
            warn!(source_id = self.page.source_id, "no content found on any page");
            return Ok(finish_run(self, ctx, &visited, Vec::new()).await);
        }
        let doc = self.document_record(merged, None);
        Ok(finish_run(self, ctx, &visited, vec![doc]).await)
    }
}

#[async_trait]
impl Producer for DocumentProducer {
    fn source_id(&self) -> &'static str {
        self.page.source_id
    }

    fn urls(&self) -> Vec<String> {
        self.urls.clone()
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["slug", "title"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        Ok(extract_document(body, &self.base_url)?
            .map(|content| vec![self.document_record(content, Some(url))])
            .unwrap_or_default())
    }

    async fn run(&self, ctx: &ProducerContext<'_>) -> Result<RecordSet, ProducerError> {
        if self.urls.len() > 1 {
            self.run_merged(ctx).await
        } else {
            crate::run_url_list(self, ctx).await
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarLink {
    pub text: String,
    pub url: String,
}

/// Detail links under the first (latest) year tab of the calendar listing.
pub fn latest_year_links(body: &str, base_url: &str) -> Result<Vec<CalendarLink>, ProducerError> {
    let document = Html::parse_document(body);
    let anchors_sel = selector("a[href]")?;
    let is_year_tab = |href: &str| {
        href.len() == 5 && href.starts_with('#') && href[1..].bytes().all(|b| b.is_ascii_digit())
    };
    let Some(latest_year) = document
        .select(&anchors_sel)
        .find(|a| a.value().attr("href").is_some_and(is_year_tab))
        .map(element_text)
    else {
        warn!("no year tabs found on calendar listing");
        return Ok(Vec::new());
    };
    info!(latest_year = %latest_year, "latest calendar year");

    let links: Vec<CalendarLink> = document
        .select(&anchors_sel)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            if !href.contains("/academic-calendar-details/") {
                return None;
            }
            let text = element_text(a);
            (text.contains(&latest_year) || href.contains(&latest_year)).then(|| CalendarLink {
                text,
                url: absolute_url(base_url, href),
            })
        })
        .collect();
    info!(latest_year = %latest_year, links = links.len(), "calendar detail links");
    Ok(links)
}

pub fn calendar_type(slug: &str, link_text: &str) -> &'static str {
    let combined = format!("{slug} {link_text}").to_lowercase();
    if combined.contains("exam") || combined.contains("schedule-final") {
        "exam_schedule"
    } else {
        "academic_calendar"
    }
}

/// `Spring|Summer|Fall YYYY` in `text`; `anchored` requires it at the start.
pub fn semester_in(text: &str, anchored: bool) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let candidates = if anchored {
        words.windows(2).take(1).collect::<Vec<_>>()
    } else {
        words.windows(2).collect()
    };
    candidates.into_iter().find_map(|pair| {
        let term = if anchored {
            pair[0]
        } else {
            pair[0].trim_start_matches(|c: char| !c.is_alphabetic())
        };
        let year: String = pair[1].chars().take(4).collect();
        let is_term = ["spring", "summer", "fall"].contains(&term.to_lowercase().as_str());
        (is_term && year.len() == 4 && year.bytes().all(|b| b.is_ascii_digit()))
            .then(|| format!("{term} {year}"))
    })
}

fn program_type_from_heading(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    if !(lower.contains("academic calendar") && lower.contains("program")) {
        return None;
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    let prefix = ["academic", "calendar", "for"];
    let has_prefix = words.len() > prefix.len()
        && words
            .iter()
            .zip(prefix)
            .all(|(w, p)| w.eq_ignore_ascii_case(p));
    Some(if has_prefix {
        words[prefix.len()..].join(" ")
    } else {
        words.join(" ")
    })
}

/// Event rows of one calendar detail page.
pub fn parse_calendar_detail(body: &str, url: &str, link_text: &str) -> Result<RecordSet, ProducerError> {
    let document = Html::parse_document(body);
    let slug = url.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    let kind = calendar_type(slug, link_text);

    let program_type = document
        .select(&selector("h4")?)
        .find_map(|h4| program_type_from_heading(&element_text(h4)))
        .unwrap_or_else(|| link_text.to_string());
    let semester = document
        .select(&selector("h3")?)
        .find_map(|h3| {
            let text = element_text(h3);
            semester_in(&text, true).map(|_| text)
        })
        .or_else(|| semester_in(link_text, false));
    let Some(semester) = semester else {
        warn!(url, "could not determine semester");
        return Ok(Vec::new());
    };
    let Some(table) = document.select(&selector("table")?).next() else {
        warn!(url, "no calendar table");
        return Ok(Vec::new());
    };

    let td_sel = selector("td")?;
    let mut events = Vec::new();
    for row in table.select(&selector("tr")?) {
        let cells: Vec<String> = row.select(&td_sel).map(element_text).collect();
        if cells.len() < 3 {
            continue;
        }
        let (event_date, day, event_name) = (&cells[0], &cells[1], &cells[2]);
        if event_date.eq_ignore_ascii_case("date") && day.eq_ignore_ascii_case("day") {
            continue;
        }
        if event_date.is_empty() || event_name.is_empty() {
            continue;
        }
        events.push(record([
            ("semester", json!(semester)),
            ("program_type", json!(program_type)),
            ("calendar_type", json!(kind)),
            ("event_date", json!(event_date)),
            ("day", json!(text_or_none(day.clone()))),
            ("event_name", json!(event_name)),
            ("source_url", json!(url)),
        ]));
    }
    info!(
        url,
        events = events.len(),
        semester = %semester,
        program_type = %program_type,
        calendar_type = kind,
        "parsed calendar page"
    );
    Ok(events)
}

/// Latest-year academic calendar: listing page, then one request per detail page.
pub struct AcademicCalendarProducer {
    base_url: String,
}

impl AcademicCalendarProducer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Producer for AcademicCalendarProducer {
    fn source_id(&self) -> &'static str {
        "academic_calendar"
    }

    fn urls(&self) -> Vec<String> {
        vec![format!("{}/academic-calendar", self.base_url)]
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["semester", "event_date", "event_name"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        let slug = url.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
        parse_calendar_detail(body, url, slug)
    }

    async fn run(&self, ctx: &ProducerContext<'_>) -> Result<RecordSet, ProducerError> {
        let listing_url = format!("{}/academic-calendar", self.base_url);
        let Some(listing) = ctx.fetch_page(self.source_id(), &listing_url).await else {
            return Ok(finish_run(self, ctx, &[], Vec::new()).await);
        };
        let links = latest_year_links(&listing, &self.base_url)?;

        let mut events = Vec::new();
        let mut visited = vec![listing_url];
        for link in &links {
            ctx.pause().await;
            info!(url = %link.url, "fetching calendar detail page");
            if let Some(body) = ctx.fetch_page(self.source_id(), &link.url).await {
                events.extend(parse_calendar_detail(&body, &link.url, &link.text)?);
                visited.push(link.url.clone());
            }
        }
        Ok(finish_run(self, ctx, &visited, events).await)
    }
}

/// History and vision pages. Snapshot only.
pub struct AboutProducer {
    base_url: String,
}

impl AboutProducer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Producer for AboutProducer {
    fn source_id(&self) -> &'static str {
        "about"
    }

    fn urls(&self) -> Vec<String> {
        vec![
            format!("{}/history", self.base_url),
            format!("{}/vision-mission-ewu", self.base_url),
        ]
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["section"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        let document = Html::parse_document(body);
        let Some(root) = content_root(&document)? else {
            return Ok(Vec::new());
        };
        let section = if url.contains("history") {
            "history"
        } else if url.contains("vision") {
            "vision_mission"
        } else {
            "about"
        };
        let title = first_text(root, &selector("h1, h2")?).unwrap_or_default();
        let content: Vec<JsonValue> = root
            .select(&selector("h2, h3, h4, p, li")?)
            .filter_map(|el| {
                text_or_none(element_text(el))
                    .map(|text| json!({ "type": el.value().name(), "text": text }))
            })
            .collect();
        Ok(vec![record([
            ("section", json!(section)),
            ("title", json!(title)),
            ("content", JsonValue::Array(content)),
            ("source_url", json!(url)),
        ])])
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
    fn clubs_fixture_parses_named_cards_only() {
        let producer = ClubsProducer::new("https://www.ewubd.edu");
        let clubs = producer
            .parse(&fixture("clubs/listing.html"), "https://www.ewubd.edu/clubs")
            .unwrap();

        assert_eq!(clubs.len(), 2);
        assert_eq!(clubs[0]["name"], json!("EWU Computer Programming Club"));
        assert_eq!(clubs[0]["url"], json!("https://www.ewubd.edu/clubs/ewucpc"));
        assert_eq!(clubs[0]["logo"], json!("https://www.ewubd.edu/storage/clubs/cpc.png"));
        assert_eq!(clubs[1]["name"], json!("Debate Club"));
        assert_eq!(clubs[1]["url"], json!("https://debate.example.org"));
        assert_eq!(clubs[1]["logo"], json!(""));
        assert!(producer.validate(&clubs).is_ok());
    }

    #[test]
    fn helpdesk_fixture_reads_mailto_and_classifies_departments() {
        let producer = HelpdeskProducer::new("https://www.ewubd.edu");
        let contacts = producer
            .parse(&fixture("helpdesk/listing.html"), "https://www.ewubd.edu/helpdesk")
            .unwrap();

        assert_eq!(contacts.len(), 3);
        assert_eq!(contacts[0]["email"], json!("registrar@ewubd.edu"));
        assert_eq!(contacts[0]["category"], json!("administrative"));
        assert_eq!(contacts[0]["purpose"], json!("Transcripts and certificates"));
        assert_eq!(contacts[1]["email"], json!("cse@ewubd.edu"));
        assert_eq!(contacts[1]["category"], json!("academic"));
        assert_eq!(contacts[2]["email"], json!("accounts@ewubd.edu"));
        assert_eq!(contacts[2]["full_name"], json!("Accounts Office"));
    }

    #[test]
    fn notices_fixture_parses_items_and_pager() {
        let producer = NoticesProducer::new("https://www.ewubd.edu");
        let body = fixture("notices/page1.html");
        let notices = producer
            .parse(&body, "https://www.ewubd.edu/notice-board?page=1")
            .unwrap();

        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0]["title"], json!("Mid-term examination schedule published"));
        assert_eq!(
            notices[0]["url"],
            json!("https://www.ewubd.edu/notice-details/midterm-schedule")
        );
        assert_eq!(notices[0]["published_date"], json!("12 March 2026"));
        assert!(has_next_page(&body, 1).unwrap());
        assert!(!has_next_page(&fixture("notices/page2.html"), 2).unwrap());
    }

    #[tokio::test]
    async fn notices_run_follows_pagination_until_last_page() {
        let (base, hits) = serve(vec![
            ("/notice-board?page=1", fixture("notices/page1.html")),
            ("/notice-board?page=2", fixture("notices/page2.html")),
        ])
        .await;
        let fetcher = test_fetcher();
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::new(dir.path());
        let ctx = ProducerContext::new(&fetcher, &snapshots).with_politeness_delay(Duration::ZERO);

        let notices = NoticesProducer::new(base.clone()).run(&ctx).await.unwrap();

        assert_eq!(notices.len(), 3);
        assert_eq!(
            *hits.lock().unwrap(),
            vec!["/notice-board?page=1", "/notice-board?page=2"]
        );
        let snapshot = snapshots.load("notices").await.unwrap().unwrap();
        assert_eq!(
            snapshot.metadata.source_urls,
            vec![
                format!("{base}/notice-board?page=1"),
                format!("{base}/notice-board?page=2"),
            ]
        );
    }

    #[tokio::test]
    async fn faculty_run_falls_back_to_static_page() {
        let (base, hits) = serve(vec![("/search-faculty", fixture("faculty/search.html"))]).await;
        let fetcher = test_fetcher();
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::new(dir.path());
        let ctx = ProducerContext::new(&fetcher, &snapshots).with_politeness_delay(Duration::ZERO);

        let faculty = FacultyProducer::new(base.clone()).run(&ctx).await.unwrap();

        assert_eq!(faculty.len(), 2);
        assert_eq!(faculty[0]["name"], json!("Dr. Ahmed Rahman"));
        assert_eq!(faculty[0]["designation"], json!("Professor"));
        assert_eq!(faculty[0]["department_name"], json!("Computer Science and Engineering"));
        assert_eq!(faculty[0]["email"], json!("ahmed@ewubd.edu"));
        assert_eq!(faculty[0]["profile_id"], json!("ahmed-rahman"));
        assert_eq!(
            faculty[0]["profile_url"],
            json!(format!("{base}/faculty-profile/ahmed-rahman"))
        );
        assert_eq!(faculty[1]["profile_id"], JsonValue::Null);
        assert_eq!(hits.lock().unwrap().last().map(String::as_str), Some("/search-faculty"));
        let snapshot = snapshots.load("faculty").await.unwrap().unwrap();
        assert_eq!(snapshot.metadata.source_urls, vec![format!("{base}/search-faculty")]);
    }

    #[test]
    fn faculty_api_rows_are_normalized() {
        let producer = FacultyProducer::new("https://www.ewubd.edu");
        let raw = record([
            ("name", json!("Dr. Nadia Islam")),
            ("position", json!("Lecturer")),
            ("department", json!("EEE")),
            ("profile_link", json!("/faculty-profile/nadia-islam/")),
            ("image", json!("https://cdn.test/n.jpg")),
        ]);
        let row = producer.normalize(&raw, "https://www.ewubd.edu/api/faculty");

        assert_eq!(row["designation"], json!("Lecturer"));
        assert_eq!(row["department_name"], json!("EEE"));
        assert_eq!(row["profile_id"], json!("nadia-islam"));
        assert_eq!(row["image_url"], json!("https://cdn.test/n.jpg"));
        assert_eq!(row["publications"], JsonValue::Null);
        assert_eq!(row["source_url"], json!("https://www.ewubd.edu/api/faculty"));
    }

    #[test]
    fn document_fixture_builds_sections_lists_tables_and_pdfs() {
        let producer = DocumentProducer::for_source("grading_doc", &SiteConfig::default()).unwrap();
        let docs = producer
            .parse(
                &fixture("grading_doc/page.html"),
                "https://www.ewubd.edu/grades-rules-and-regulations",
            )
            .unwrap();

        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc["slug"], json!("grading"));
        assert_eq!(doc["source_file"], json!("grading_doc.json"));
        let sections = doc["content"]["sections"].as_array().unwrap();
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0]["title"], json!("Introduction"));
        assert_eq!(sections[1]["title"], json!("Grading System"));
        assert_eq!(sections[1]["content"][0]["type"], json!("table"));
        assert_eq!(sections[1]["content"][0]["rows"][1], json!(["80-100", "A+", "4.00"]));
        assert_eq!(sections[2]["content"][0]["items"], json!(["Attend classes", "Submit work"]));
        assert_eq!(
            doc["content"]["pdf_links"][0]["url"],
            json!("https://www.ewubd.edu/storage/grading.pdf")
        );
    }

    #[tokio::test]
    async fn facilities_merges_pages_into_one_document() {
        let page = fixture("grading_doc/page.html");
        let (base, _hits) = serve(vec![
            ("/research-facilities", page.clone()),
            ("/campus-life", page),
        ])
        .await;
        let site = SiteConfig::new(base.clone(), base);
        let fetcher = test_fetcher();
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::new(dir.path());
        let ctx = ProducerContext::new(&fetcher, &snapshots).with_politeness_delay(Duration::ZERO);

        let producer = DocumentProducer::for_source("facilities_doc", &site).unwrap();
        let docs = producer.run(&ctx).await.unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["slug"], json!("facilities"));
        assert_eq!(docs[0]["content"]["sections"].as_array().unwrap().len(), 6);
        assert!(docs[0].get("source_url").is_none());
    }

    #[test]
    fn semester_detection() {
        assert_eq!(semester_in("Spring 2026", true).as_deref(), Some("Spring 2026"));
        assert_eq!(semester_in("Calendar Spring 2026", true), None);
        assert_eq!(
            semester_in("Academic Calendar (Fall 2025)", false).as_deref(),
            Some("Fall 2025")
        );
        assert_eq!(semester_in("no term here", false), None);
    }

    #[test]
    fn calendar_type_prefers_exam_schedule() {
        assert_eq!(calendar_type("final-exam-spring-2026", ""), "exam_schedule");
        assert_eq!(calendar_type("spring-2026", "Spring 2026"), "academic_calendar");
    }

    #[test]
    fn calendar_listing_keeps_latest_year_links() {
        let links = latest_year_links(&fixture("academic_calendar/listing.html"), "https://www.ewubd.edu")
            .unwrap();
        assert_eq!(
            links,
            vec![
                CalendarLink {
                    text: "Spring 2026".into(),
                    url: "https://www.ewubd.edu/academic-calendar-details/spring-2026".into(),
                },
                CalendarLink {
                    text: "Final Exam Schedule Spring 2026".into(),
                    url: "https://www.ewubd.edu/academic-calendar-details/final-exam-spring-2026"
                        .into(),
                },
            ]
        );
    }

    #[test]
    fn calendar_detail_rows_skip_headers_and_blanks() {
        let events = parse_calendar_detail(
            &fixture("academic_calendar/detail.html"),
            "https://www.ewubd.edu/academic-calendar-details/spring-2026",
            "Spring 2026",
        )
        .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["semester"], json!("Spring 2026"));
        assert_eq!(
            events[0]["program_type"],
            json!("Undergraduate Programs (Except B.Pharm and LL.B)")
        );
        assert_eq!(events[0]["calendar_type"], json!("academic_calendar"));
        assert_eq!(events[0]["event_name"], json!("Classes begin"));
        assert_eq!(events[1]["day"], JsonValue::Null);
    }

    #[tokio::test]
    async fn calendar_run_visits_listing_then_details() {
        let (base, hits) = serve(vec![
            ("/academic-calendar", fixture("academic_calendar/listing.html")),
            (
                "/academic-calendar-details/spring-2026",
                fixture("academic_calendar/detail.html"),
            ),
        ])
        .await;
        let fetcher = test_fetcher();
        let dir = tempdir().unwrap();
        let snapshots = SnapshotStore::new(dir.path());
        let ctx = ProducerContext::new(&fetcher, &snapshots).with_politeness_delay(Duration::ZERO);

        let events = AcademicCalendarProducer::new(base.clone()).run(&ctx).await.unwrap();

        assert_eq!(events.len(), 2);
        let snapshot = snapshots.load("academic_calendar").await.unwrap().unwrap();
        assert_eq!(
            snapshot.metadata.source_urls,
            vec![
                format!("{base}/academic-calendar"),
                format!("{base}/academic-calendar-details/spring-2026"),
            ]
        );
        assert_eq!(
            *hits.lock().unwrap(),
            vec![
                "/academic-calendar",
                "/academic-calendar-details/spring-2026",
                "/academic-calendar-details/final-exam-spring-2026",
            ]
        );
    }

    #[test]
    fn about_page_sections_by_url() {
        let producer = AboutProducer::new("https://www.ewubd.edu");
        let body = "<html><body><main><h1>Our History</h1><p>Founded in 1996.</p>\
                    <ul><li>First campus</li><li> </li></ul></main></body></html>";
        let rows = producer.parse(body, "https://www.ewubd.edu/history").unwrap();

        assert_eq!(rows[0]["section"], json!("history"));
        assert_eq!(rows[0]["title"], json!("Our History"));
        assert_eq!(
            rows[0]["content"],
            json!([{"type": "p", "text": "Founded in 1996."}, {"type": "li", "text": "First campus"}])
        );
        let rows = producer.parse(body, "https://www.ewubd.edu/vision-mission-ewu").unwrap();
        assert_eq!(rows[0]["section"], json!("vision_mission"));
    }
}
