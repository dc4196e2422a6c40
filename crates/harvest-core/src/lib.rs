//! Core record model, key handling, validation, dedup and diff for the harvester.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-core";

/// One harvested row: an ordered field-name -> value mapping.
pub type Record = Map<String, JsonValue>;

/// Records produced by one run of one producer, in parse order.
pub type RecordSet = Vec<Record>;

/// Fields producers attach for provenance; never persisted.
pub const TRACKING_FIELDS: &[&str] = &["source_url", "source_file"];

/// Fields generated by the backing store; ignored when diffing.
pub const STORE_METADATA_FIELDS: &[&str] = &["id", "created_at", "updated_at"];

pub fn strip_fields(records: &[Record], fields: &[&str]) -> RecordSet {
    records
        .iter()
        .map(|record| {
            record
                .iter()
                .filter(|(name, _)| !fields.contains(&name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        })
        .collect()
}

/// Drop tracking-only fields before anything is written.
pub fn strip_tracking(records: &[Record]) -> RecordSet {
    strip_fields(records, TRACKING_FIELDS)
}

/// Drop store metadata and tracking fields so both sides of a diff compare fairly.
pub fn prepare_for_diff(records: &[Record]) -> RecordSet {
    let skip: Vec<&str> = STORE_METADATA_FIELDS
        .iter()
        .chain(TRACKING_FIELDS.iter())
        .copied()
        .collect();
    strip_fields(records, &skip)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeySpecError {
    #[error("key spec is empty")]
    Empty,
    #[error("key spec `{0}` contains an empty field name")]
    EmptyField(String),
}

/// Natural identifier of a record: one field or an order-sensitive tuple of fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeySpec {
    fields: Vec<String>,
}

impl KeySpec {
    pub fn single(field: impl Into<String>) -> Self {
        Self {
            fields: vec![field.into()],
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn is_composite(&self) -> bool {
        self.fields.len() > 1
    }

    /// Key value for `record`, or `None` when any key field is missing or null.
    pub fn key_of(&self, record: &Record) -> Option<RecordKey> {
        self.fields
            .iter()
            .map(|field| match record.get(field) {
                None | Some(JsonValue::Null) => None,
                Some(value) => Some(value.to_string()),
            })
            .collect::<Option<Vec<_>>>()
            .map(RecordKey)
    }
}

impl FromStr for KeySpec {
    type Err = KeySpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(KeySpecError::Empty);
        }
        let fields = s.split(',').map(|f| f.trim().to_string()).collect::<Vec<_>>();
        if fields.iter().any(String::is_empty) {
            return Err(KeySpecError::EmptyField(s.to_string()));
        }
        Ok(Self { fields })
    }
}

impl TryFrom<String> for KeySpec {
    type Error = KeySpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeySpec> for String {
    fn from(spec: KeySpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fields.join(","))
    }
}

/// Concrete key value extracted from a record; each part is the JSON text of one field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordKey(Vec<String>);

impl RecordKey {
    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => f.write_str(single),
            parts => write!(f, "({})", parts.join(", ")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{source_id}: dataset is empty")]
    Empty { source_id: String },
    #[error("{source_id}: {} invalid record(s): {}", .problems.len(), .problems.join("; "))]
    MissingFields {
        source_id: String,
        problems: Vec<String>,
    },
}

fn is_blank(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// A record set is trusted only if it is non-empty and every record carries the required fields.
pub fn validate(
    source_id: &str,
    records: &[Record],
    required_fields: &[&str],
) -> Result<(), ValidationError> {
    if records.is_empty() {
        return Err(ValidationError::Empty {
            source_id: source_id.to_string(),
        });
    }

    let problems = records
        .iter()
        .enumerate()
        .flat_map(|(idx, record)| {
            required_fields
                .iter()
                .filter(move |field| is_blank(record.get(**field)))
                .map(move |field| format!("{source_id}[{idx}]: missing required field '{field}'"))
        })
        .collect::<Vec<_>>();

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::MissingFields {
            source_id: source_id.to_string(),
            problems,
        })
    }
}

/// Keep the first record per key; records with an absent key field are always kept.
pub fn dedupe(records: RecordSet, keys: &KeySpec) -> RecordSet {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| match keys.key_of(record) {
            Some(key) => seen.insert(key),
            None => true,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModifiedRecord {
    pub key: RecordKey,
    pub old: Record,
    pub new: Record,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
    pub added: RecordSet,
    pub modified: Vec<ModifiedRecord>,
    pub removed: RecordSet,
    pub unchanged: RecordSet,
}

impl DiffResult {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty())
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    pub fn total_compared(&self) -> usize {
        self.change_count() + self.unchanged.len()
    }

    pub fn change_percentage(&self) -> f64 {
        let total = self.total_compared();
        if total == 0 {
            return 0.0;
        }
        self.change_count() as f64 * 100.0 / total as f64
    }

    /// Human-readable summary with up to ten samples per category.
    pub fn report(&self) -> String {
        const SAMPLES: usize = 10;
        let mut lines = vec![
            "=== Data Diff Report ===".to_string(),
            format!("Added:     {}", self.added.len()),
            format!("Modified:  {}", self.modified.len()),
            format!("Removed:   {}", self.removed.len()),
            format!("Unchanged: {}", self.unchanged.len()),
            format!("Change %:  {:.1}%", self.change_percentage()),
        ];
        if !self.added.is_empty() {
            lines.push("--- Added ---".to_string());
            lines.extend(
                self.added
                    .iter()
                    .take(SAMPLES)
                    .map(|r| format!("  + {}", JsonValue::Object(r.clone()))),
            );
        }
        if !self.modified.is_empty() {
            lines.push("--- Modified ---".to_string());
            lines.extend(self.modified.iter().take(SAMPLES).map(|m| format!("  ~ {}", m.key)));
        }
        if !self.removed.is_empty() {
            lines.push("--- Removed ---".to_string());
            lines.extend(
                self.removed
                    .iter()
                    .take(SAMPLES)
                    .map(|r| format!("  - {}", JsonValue::Object(r.clone()))),
            );
        }
        lines.join("\n")
    }
}

fn index_by_key<'a>(records: &'a [Record], keys: &KeySpec) -> (Vec<RecordKey>, HashMap<RecordKey, &'a Record>) {
    let mut order = Vec::new();
    let mut index = HashMap::new();
    for record in records {
        let Some(key) = keys.key_of(record) else {
            debug!(keys = %keys, "record without key excluded from diff");
            continue;
        };
        if !index.contains_key(&key) {
            order.push(key.clone());
            index.insert(key, record);
        }
    }
    (order, index)
}

/// Partition `old` vs `new` by key into added / modified / removed / unchanged.
///
/// Records missing a key field cannot be matched and take no part in the comparison.
/// Within one side the first record for a key wins.
pub fn diff(old: &[Record], new: &[Record], keys: &KeySpec) -> DiffResult {
    let (old_order, old_index) = index_by_key(old, keys);
    let (new_order, new_index) = index_by_key(new, keys);
    let mut result = DiffResult::default();

    for key in new_order {
        let new_record = new_index[&key];
        match old_index.get(&key) {
            None => result.added.push(new_record.clone()),
            Some(old_record) if *old_record == new_record => {
                result.unchanged.push((*old_record).clone())
            }
            Some(old_record) => result.modified.push(ModifiedRecord {
                key,
                old: (*old_record).clone(),
                new: new_record.clone(),
            }),
        }
    }

    for key in old_order {
        if !new_index.contains_key(&key) {
            result.removed.push(old_index[&key].clone());
        }
    }

    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStrategy {
    /// Diff against the table and upsert when the change is within threshold.
    #[default]
    Diff,
    /// Delete every row, then insert the new set.
    FullReplace,
    /// Table holds rows from several sources; diff only against rows this source owns.
    SharedTable,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Diff => "diff",
            SyncStrategy::FullReplace => "full-replace",
            SyncStrategy::SharedTable => "shared-table",
        }
    }
}

pub const DEFAULT_BATCH_SIZE: usize = 500;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Where and how one source's records are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub table: String,
    pub conflict_keys: KeySpec,
    #[serde(default)]
    pub strategy: SyncStrategy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Success,
    NoData,
    SkippedHighChange,
    UpsertFailed,
    Error(String),
}

impl SourceStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SourceStatus::Success)
    }

    pub fn error_detail(&self) -> Option<&str> {
        match self {
            SourceStatus::Error(message) => Some(message),
            _ => None,
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStatus::Success => f.write_str("success"),
            SourceStatus::NoData => f.write_str("no_data"),
            SourceStatus::SkippedHighChange => f.write_str("skipped_high_change"),
            SourceStatus::UpsertFailed => f.write_str("upsert_failed"),
            SourceStatus::Error(message) => write!(f, "error: {message}"),
        }
    }
}

impl Serialize for SourceStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Per-source pipeline position. `Written`, `Skipped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Fetching,
    Parsed,
    Validated,
    StrategySelected,
    ThresholdCheck,
    Unconditional,
    Written,
    Skipped,
    Failed,
}

impl SyncStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStage::Written | SyncStage::Skipped | SyncStage::Failed)
    }
}

/// Outcome of one source within one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub source_id: String,
    pub status: SourceStatus,
    pub stage: SyncStage,
    pub records: usize,
    pub changes: usize,
    pub change_percentage: Option<f64>,
    pub duration: Duration,
}

impl RunSummary {
    pub fn start(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            status: SourceStatus::Success,
            stage: SyncStage::Fetching,
            records: 0,
            changes: 0,
            change_percentage: None,
            duration: Duration::ZERO,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (self.duration.as_secs_f64() * 100.0).round() / 100.0
    }
}

/// Consolidated result of one orchestrator pass over every configured source.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub forced: bool,
    pub summaries: Vec<RunSummary>,
}

impl RunReport {
    pub fn total_records(&self) -> usize {
        self.summaries.iter().map(|s| s.records).sum()
    }

    pub fn total_changes(&self) -> usize {
        self.summaries.iter().map(|s| s.changes).sum()
    }

    pub fn all_succeeded(&self) -> bool {
        self.summaries.iter().all(|s| s.status.is_success())
    }

    /// Fixed-width table for the log, one line per source plus a TOTAL line.
    pub fn table_lines(&self) -> Vec<String> {
        let mut lines = self
            .summaries
            .iter()
            .map(|s| {
                format!(
                    "  {:30} | {:20} | records: {:5} | changes: {:5} | {:.1}s",
                    s.source_id,
                    s.status.to_string(),
                    s.records,
                    s.changes,
                    s.duration_secs()
                )
            })
            .collect::<Vec<_>>();
        lines.push(format!(
            "  {:30} | {:20} | records: {:5} | changes: {:5}",
            "TOTAL",
            "",
            self.total_records(),
            self.total_changes()
        ));
        lines
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![format!(
            "**Scrape Run Complete** (`{}`{})",
            self.run_id,
            if self.forced { ", forced" } else { "" }
        )];
        lines.extend(self.summaries.iter().map(|s| {
            format!(
                "- **{}**: {} ({} records, {} changes)",
                s.source_id, s.status, s.records, s.changes
            )
        }));
        lines.push(format!(
            "Total: {} records, {} changes",
            self.total_records(),
            self.total_changes()
        ));
        lines.join("\n")
    }
}

/// Build a record from `(field, value)` pairs, keeping their order.
pub fn record<K, I>(pairs: I) -> Record
where
    K: Into<String>,
    I: IntoIterator<Item = (K, JsonValue)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: JsonValue) -> Record {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn key(spec: &str) -> KeySpec {
        spec.parse().unwrap()
    }

    #[test]
    fn key_spec_parses_single_and_composite_fields() {
        assert_eq!(key("name").fields(), &["name".to_string()]);
        let composite = key("program, level");
        assert!(composite.is_composite());
        assert_eq!(composite.to_string(), "program,level");
        assert_eq!("".parse::<KeySpec>(), Err(KeySpecError::Empty));
        assert!(matches!("a,,b".parse::<KeySpec>(), Err(KeySpecError::EmptyField(_))));
    }

    #[test]
    fn key_of_treats_null_as_absent() {
        let spec = key("a,b");
        assert!(spec.key_of(&rec(json!({"a": 1, "b": null}))).is_none());
        assert!(spec.key_of(&rec(json!({"a": 1}))).is_none());
        assert!(spec.key_of(&rec(json!({"a": 1, "b": "x"}))).is_some());
    }

    #[test]
    fn dedupe_keeps_first_occurrence_per_key() {
        let records = vec![
            rec(json!({"name": "Robotics", "v": 1})),
            rec(json!({"name": "Chess", "v": 2})),
            rec(json!({"name": "Robotics", "v": 3})),
            rec(json!({"name": "Robotics", "v": 4})),
        ];
        let out = dedupe(records, &key("name"));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["v"], json!(1));
        assert_eq!(out[1]["v"], json!(2));
    }

    #[test]
    fn dedupe_passes_through_records_missing_key_fields() {
        let records = vec![
            rec(json!({"program": "CSE", "level": "UG"})),
            rec(json!({"program": "CSE"})),
            rec(json!({"program": "CSE"})),
            rec(json!({"program": "CSE", "level": null})),
            rec(json!({"program": "CSE", "level": "UG"})),
            rec(json!({"program": "CSE", "level": "PG"})),
        ];
        let out = dedupe(records, &key("program,level"));
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn composite_key_order_matters() {
        let records = vec![
            rec(json!({"a": "x", "b": "y"})),
            rec(json!({"a": "y", "b": "x"})),
        ];
        assert_eq!(dedupe(records, &key("a,b")).len(), 2);
    }

    #[test]
    fn diff_of_identical_sets_has_no_changes() {
        let x = vec![
            rec(json!({"key": "x", "v": 1})),
            rec(json!({"key": "y", "v": 2})),
        ];
        let result = diff(&x, &x, &key("key"));
        assert!(result.added.is_empty());
        assert!(result.modified.is_empty());
        assert!(result.removed.is_empty());
        assert_eq!(result.unchanged.len(), 2);
        assert_eq!(result.change_percentage(), 0.0);
        assert!(!result.has_changes());
    }

    #[test]
    fn diff_against_empty_baseline_adds_everything() {
        let x = vec![
            rec(json!({"key": "x", "v": 1})),
            rec(json!({"key": "y", "v": 2})),
            rec(json!({"key": "z", "v": 3})),
        ];
        let result = diff(&[], &x, &key("key"));
        assert_eq!(result.added, x);
        assert!(result.removed.is_empty());
        assert_eq!(result.change_percentage(), 100.0);
    }

    #[test]
    fn diff_of_two_empty_sets_is_zero_percent() {
        let result = diff(&[], &[], &key("key"));
        assert_eq!(result.total_compared(), 0);
        assert_eq!(result.change_percentage(), 0.0);
    }

    #[test]
    fn diff_partitions_added_modified_removed_unchanged() {
        let old = vec![
            rec(json!({"key": "x", "v": 1})),
            rec(json!({"key": "y", "v": 2})),
        ];
        let new = vec![
            rec(json!({"key": "x", "v": 1})),
            rec(json!({"key": "y", "v": 9})),
            rec(json!({"key": "z", "v": 3})),
        ];
        let result = diff(&old, &new, &key("key"));
        assert_eq!(result.added, vec![rec(json!({"key": "z", "v": 3}))]);
        assert_eq!(result.modified.len(), 1);
        assert_eq!(result.modified[0].old["v"], json!(2));
        assert_eq!(result.modified[0].new["v"], json!(9));
        assert!(result.removed.is_empty());
        assert_eq!(result.unchanged, vec![rec(json!({"key": "x", "v": 1}))]);
        assert!((result.change_percentage() - 200.0 / 3.0).abs() < 1e-9);

        let shrunk = diff(&old, &new[..1], &key("key"));
        assert_eq!(shrunk.removed, vec![rec(json!({"key": "y", "v": 2}))]);
    }

    #[test]
    fn diff_uses_composite_keys() {
        let old = vec![
            rec(json!({"program": "CSE", "level": "UG", "fee": 100})),
            rec(json!({"program": "CSE", "level": "PG", "fee": 200})),
        ];
        let new = vec![
            rec(json!({"program": "CSE", "level": "UG", "fee": 100})),
            rec(json!({"program": "CSE", "level": "PG", "fee": 250})),
        ];
        let result = diff(&old, &new, &key("program,level"));
        assert_eq!(result.unchanged.len(), 1);
        assert_eq!(result.modified.len(), 1);
        assert_eq!(result.modified[0].key.to_string(), "(\"CSE\", \"PG\")");
    }

    #[test]
    fn record_equality_ignores_field_order() {
        let old = vec![rec(json!({"key": "x", "a": 1, "b": 2}))];
        let new = vec![record([("b", json!(2)), ("key", json!("x")), ("a", json!(1))])];
        assert!(!diff(&old, &new, &key("key")).has_changes());
    }

    #[test]
    fn prepare_for_diff_strips_metadata_and_tracking() {
        let rows = vec![rec(json!({
            "id": 7, "created_at": "t", "updated_at": "t",
            "name": "Chess", "source_url": "https://x"
        }))];
        assert_eq!(prepare_for_diff(&rows), vec![rec(json!({"name": "Chess"}))]);
        let tracked = strip_tracking(&rows);
        assert!(tracked[0].contains_key("id"));
        assert!(!tracked[0].contains_key("source_url"));
    }

    #[test]
    fn validate_rejects_empty_and_missing_required_fields() {
        assert_eq!(
            validate("clubs", &[], &[]),
            Err(ValidationError::Empty {
                source_id: "clubs".into()
            })
        );
        let records = vec![
            rec(json!({"name": "Chess"})),
            rec(json!({"name": "  "})),
        ];
        let err = validate("clubs", &records, &["name"]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingFields {
                source_id: "clubs".into(),
                problems: vec!["clubs[1]: missing required field 'name'".into()],
            }
        );
        assert!(validate("clubs", &records[..1], &["name"]).is_ok());
    }

    #[test]
    fn status_renders_wire_tags() {
        assert_eq!(SourceStatus::SkippedHighChange.to_string(), "skipped_high_change");
        assert_eq!(SourceStatus::Error("boom".into()).to_string(), "error: boom");
        assert_eq!(
            serde_json::to_value(SourceStatus::UpsertFailed).unwrap(),
            json!("upsert_failed")
        );
    }

    #[test]
    fn sync_plan_deserializes_with_defaults() {
        let plan: SyncPlan =
            serde_json::from_value(json!({"table": "tuition_fees", "conflict_keys": "program,level"}))
                .unwrap();
        assert_eq!(plan.strategy, SyncStrategy::Diff);
        assert_eq!(plan.batch_size, DEFAULT_BATCH_SIZE);
        assert!(plan.conflict_keys.is_composite());
    }
}
