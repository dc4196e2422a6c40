use async_trait::async_trait;
use harvest_core::{record, Record, RecordSet};
use scraper::Html;
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use crate::campus::semester_in;
use crate::{content_root, element_text, selector, text_or_none, Producer, ProducerError};

/// Fee table headers and the columns they land in. Other headers are dropped.
const FEE_COLUMNS: &[(&str, &str)] = &[
    ("name of programs", "program"),
    ("tuition fee per credit", "fee_per_credit"),
    ("tuition fees", "total_tuition"),
    ("library, lab & activities fees", "library_lab_fees"),
    ("admission fee", "admission_fee"),
    ("grand total", "grand_total"),
    ("credits", "credits"),
];

const MONEY_COLUMNS: &[&str] = &[
    "fee_per_credit",
    "total_tuition",
    "library_lab_fees",
    "admission_fee",
    "grand_total",
];

/// `6,500/=` -> 6500, `1,250.50/=` -> 1250.5; anything without digits is null.
pub fn parse_money(text: &str) -> JsonValue {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.contains('.') {
        cleaned.parse::<f64>().map(|v| json!(v)).unwrap_or(JsonValue::Null)
    } else {
        cleaned.parse::<i64>().map(|v| json!(v)).unwrap_or(JsonValue::Null)
    }
}

fn parse_credits(text: &str) -> JsonValue {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| json!(v.trunc() as i64))
        .unwrap_or(JsonValue::Null)
}

/// Per-credit and total fees for every program, one row per (program, level).
pub struct TuitionFeesProducer {
    base_url: String,
}

impl TuitionFeesProducer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Producer for TuitionFeesProducer {
    fn source_id(&self) -> &'static str {
        "tuition_fees"
    }

    fn urls(&self) -> Vec<String> {
        vec![
            format!("{}/undergraduate-tuition-fees", self.base_url),
            format!("{}/graduate-programs-tuition-fees", self.base_url),
        ]
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["program", "level"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        let document = Html::parse_document(body);
        let tables = selector("table")?;
        let th_sel = selector("th")?;
        let rows_sel = selector("tr")?;
        let td_sel = selector("td")?;
        let level = if url.contains("undergraduate") {
            "Undergraduate"
        } else {
            "Graduate"
        };

        let mut fees = Vec::new();
        for table in document.select(&tables) {
            let columns: Vec<Option<&str>> = table
                .select(&th_sel)
                .map(|th| {
                    let header = element_text(th).to_lowercase();
                    FEE_COLUMNS
                        .iter()
                        .find(|(raw, _)| *raw == header)
                        .map(|(_, column)| *column)
                })
                .collect();

            for row in table.select(&rows_sel) {
                let cells: Vec<String> = row.select(&td_sel).map(element_text).collect();
                if cells.is_empty() {
                    continue;
                }
                let mut fee = record([("level", json!(level))]);
                for (column, text) in columns.iter().zip(&cells) {
                    let Some(column) = column else {
                        continue;
                    };
                    let value = if MONEY_COLUMNS.contains(column) {
                        parse_money(text)
                    } else if *column == "credits" {
                        parse_credits(text)
                    } else {
                        json!(text)
                    };
                    fee.insert((*column).to_string(), value);
                }
                let program = fee.get("program").and_then(JsonValue::as_str).unwrap_or_default();
                if program.is_empty() || program.to_lowercase().starts_with("sl") {
                    continue;
                }
                fee.insert("source_url".into(), json!(url));
                fees.push(fee);
            }
        }
        if fees.is_empty() {
            warn!(url, "no fee rows found");
        }
        Ok(fees)
    }
}

/// Last heading before `table` in document order decides the level.
fn deadline_level(heading: Option<&str>) -> &'static str {
    match heading.map(str::to_lowercase) {
        Some(text) if text.contains("graduate") && !text.contains("undergraduate") => "Graduate",
        _ => "Undergraduate",
    }
}

/// Application and admission-test dates from the admission site.
pub struct AdmissionDeadlinesProducer {
    admission_url: String,
}

impl AdmissionDeadlinesProducer {
    pub fn new(admission_url: impl Into<String>) -> Self {
        Self {
            admission_url: admission_url.into(),
        }
    }
}

#[async_trait]
impl Producer for AdmissionDeadlinesProducer {
    fn source_id(&self) -> &'static str {
        "admission_deadlines"
    }

    fn urls(&self) -> Vec<String> {
        vec![format!(
            "{}/index.php?documentid=importantdates.php",
            self.admission_url
        )]
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["program", "level"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        let document = Html::parse_document(body);
        let walk = selector("h2, h3, h4, h5, strong, b, table")?;
        let rows_sel = selector("tr")?;
        let cells_sel = selector("th, td")?;

        let page_text = document.root_element().text().collect::<Vec<_>>().join(" ");
        let semester = semester_in(&page_text, false).unwrap_or_default();

        let mut deadlines = Vec::new();
        let mut heading: Option<String> = None;
        for el in document.select(&walk) {
            if el.value().name() != "table" {
                heading = text_or_none(element_text(el));
                continue;
            }
            let level = deadline_level(heading.as_deref());
            let mut rows = el.select(&rows_sel);
            let Some(header_row) = rows.next() else {
                continue;
            };
            let headers: Vec<String> = header_row
                .select(&cells_sel)
                .map(|c| element_text(c).to_lowercase())
                .collect();

            for row in rows {
                let cells: Vec<String> = row.select(&cells_sel).map(element_text).collect();
                if cells.len() < 2 {
                    continue;
                }
                let mut program = String::new();
                let mut application_deadline = String::new();
                let mut admission_test_date = String::new();
                for (header, cell) in headers.iter().zip(cells) {
                    if header.contains("program") || header.contains("department") {
                        program = cell;
                    } else if header.contains("deadline")
                        || header.contains("last date")
                        || header.contains("application")
                    {
                        application_deadline = cell;
                    } else if header.contains("test") || header.contains("exam") {
                        admission_test_date = cell;
                    }
                }
                if program.is_empty() {
                    continue;
                }
                deadlines.push(record([
                    ("program", json!(program)),
                    ("department", json!("")),
                    ("level", json!(level)),
                    ("semester", json!(semester)),
                    ("application_deadline", json!(application_deadline)),
                    ("admission_test_date", json!(admission_test_date)),
                    ("source_url", json!(url)),
                ]));
            }
        }
        Ok(deadlines)
    }
}

pub struct ScholarshipsProducer {
    base_url: String,
}

impl ScholarshipsProducer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

struct Scholarship {
    name: String,
    description: Vec<String>,
    eligibility: Vec<String>,
}

impl Scholarship {
    fn into_record(self, url: &str) -> Record {
        record([
            ("name", json!(self.name)),
            ("description", json!(self.description.join(" "))),
            ("eligibility", json!(self.eligibility.join("; "))),
            ("source_url", json!(url)),
        ])
    }
}

#[async_trait]
impl Producer for ScholarshipsProducer {
    fn source_id(&self) -> &'static str {
        "scholarships"
    }

    fn urls(&self) -> Vec<String> {
        vec![format!("{}/scholarships-financial-aid", self.base_url)]
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn parse(&self, body: &str, url: &str) -> Result<RecordSet, ProducerError> {
        let document = Html::parse_document(body);
        let Some(root) = content_root(&document)? else {
            return Ok(Vec::new());
        };
        let blocks = selector("h2, h3, h4, p, li")?;

        let mut scholarships = Vec::new();
        let mut current: Option<Scholarship> = None;
        for el in root.select(&blocks) {
            let Some(text) = text_or_none(element_text(el)) else {
                continue;
            };
            let tag = el.value().name();
            if matches!(tag, "h2" | "h3" | "h4") {
                scholarships.extend(current.take());
                current = Some(Scholarship {
                    name: text,
                    description: Vec::new(),
                    eligibility: Vec::new(),
                });
                continue;
            }
            let Some(scholarship) = current.as_mut() else {
                continue;
            };
            if tag == "p" {
                scholarship.description.push(text);
            } else {
                scholarship.eligibility.push(text);
            }
        }
        scholarships.extend(current);
        Ok(scholarships.into_iter().map(|s| s.into_record(url)).collect())
    }
}
