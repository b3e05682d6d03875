//! Core domain model for market-report ingestion.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub mod registry;

pub use registry::SchemaRegistry;

pub const CRATE_NAME: &str = "mrip-core";

/// Minutes covered by one dispatch interval.
pub const INTERVAL_MINUTES: u32 = 5;
/// Number of dispatch intervals in a trading day.
pub const INTERVALS_PER_DAY: u16 = 288;

/// Leading field of every row in the tagged report dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowClass {
    Info,
    Data,
    Other,
}

impl RowClass {
    pub fn from_field(field: &str) -> Self {
        match field.trim() {
            "I" | "i" | "info" | "INFO" => Self::Info,
            "D" | "d" | "data" | "DATA" => Self::Data,
            _ => Self::Other,
        }
    }
}

/// Report category + subtype; the registry key for a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagKey {
    pub category: String,
    pub subtype: String,
}

impl TagKey {
    pub fn new(category: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            subtype: subtype.into(),
        }
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.subtype)
    }
}

/// The three leading fields of a dialect row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagTriple {
    pub class: RowClass,
    pub key: TagKey,
}

impl TagTriple {
    pub fn parse(class: &str, category: &str, subtype: &str) -> Self {
        Self {
            class: RowClass::from_field(class),
            key: TagKey::new(category.trim(), subtype.trim()),
        }
    }
}

/// One archive advertised by the remote listing. Identity is the filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReportFile {
    pub url: String,
    pub filename: String,
    pub report_date: Option<NaiveDate>,
}

/// Tracker row; presence means the file's data reached the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedFileRecord {
    pub filename: String,
    pub processed_at: DateTime<Utc>,
}

/// A data row captured by the record parser, tag prefix stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub tag: TagTriple,
    pub version: u32,
    pub fields: Vec<String>,
    pub line: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Timestamp,
    Float,
    Int,
    Text,
    Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    /// `year=YYYY/month=M/<region column>=...`
    YearMonthRegion,
    /// `year=YYYY/month=M`
    YearMonth,
    /// `<date column>=YYYY-MM-DD`
    Date,
}

/// Static description of one recognised report dataset at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub category: String,
    pub subtype: String,
    pub version: u32,
    pub columns: Vec<String>,
    #[serde(default)]
    pub natural_key: Vec<String>,
    #[serde(default)]
    pub timestamp_columns: Vec<String>,
    #[serde(default)]
    pub float_columns: Vec<String>,
    #[serde(default)]
    pub int_columns: Vec<String>,
    #[serde(default)]
    pub category_columns: Vec<String>,
    /// Drives the interval index and time-based partition keys.
    pub primary_timestamp: String,
    #[serde(default)]
    pub region_column: Option<String>,
    pub partitioning: PartitionScheme,
    /// Partition column name used by [`PartitionScheme::Date`].
    #[serde(default = "default_date_partition")]
    pub date_partition_column: String,
}

fn default_date_partition() -> String {
    "report_date".to_string()
}

impl SchemaDefinition {
    pub fn tag_key(&self) -> TagKey {
        TagKey::new(self.category.clone(), self.subtype.clone())
    }

    pub fn column_kind(&self, column: &str) -> ColumnKind {
        let has = |set: &[String]| set.iter().any(|c| c.eq_ignore_ascii_case(column));
        if has(&self.timestamp_columns) {
            ColumnKind::Timestamp
        } else if has(&self.float_columns) {
            ColumnKind::Float
        } else if has(&self.int_columns) {
            ColumnKind::Int
        } else if has(&self.category_columns) {
            ColumnKind::Category
        } else {
            ColumnKind::Text
        }
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
    }

    /// Copy of this definition whose column list is the one a file declared.
    /// Kinds are still looked up by name, so unknown columns become text.
    pub fn resolve_columns(&self, declared: &[String]) -> SchemaDefinition {
        let mut resolved = self.clone();
        resolved.columns = declared.iter().map(|c| c.trim().to_string()).collect();
        resolved
    }

    /// Names of partition columns, in path order.
    pub fn partition_columns(&self) -> Vec<String> {
        match self.partitioning {
            PartitionScheme::YearMonthRegion => vec![
                "year".to_string(),
                "month".to_string(),
                self.region_column
                    .clone()
                    .unwrap_or_else(|| "REGIONID".to_string()),
            ],
            PartitionScheme::YearMonth => vec!["year".to_string(), "month".to_string()],
            PartitionScheme::Date => vec![self.date_partition_column.clone()],
        }
    }
}

/// Typed field value produced by the normaliser.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Timestamp(NaiveDateTime),
    Float(f64),
    Int(i64),
    Text(String),
    Category(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Category(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Stable textual key used when comparing natural keys across files.
    pub fn key_fragment(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Timestamp(ts) => ts.and_utc().timestamp_millis().to_string(),
            Value::Float(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Text(s) | Value::Category(s) => s.clone(),
        }
    }
}

/// Interval slot owning a timestamp: 1-indexed, 5-minute granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntervalIndex {
    pub date: NaiveDate,
    pub index: u16,
}

/// Interval ending at `ts`. Midnight closes the final interval of the previous day.
pub fn interval_index(ts: NaiveDateTime) -> IntervalIndex {
    let minutes = ts.hour() * 60 + ts.minute();
    if minutes == 0 {
        return IntervalIndex {
            date: ts.date() - Duration::days(1),
            index: INTERVALS_PER_DAY,
        };
    }
    IntervalIndex {
        date: ts.date(),
        index: ((minutes - 1) / INTERVAL_MINUTES + 1) as u16,
    }
}

/// Ordered partition key/value pairs; maps to a hive-style relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(pub Vec<(String, String)>);

impl PartitionKey {
    pub fn derive(schema: &SchemaDefinition, ts: NaiveDateTime, region: Option<&str>) -> Self {
        let pairs = match schema.partitioning {
            PartitionScheme::YearMonthRegion => vec![
                ("year".to_string(), ts.year().to_string()),
                ("month".to_string(), ts.month().to_string()),
                (
                    schema
                        .region_column
                        .clone()
                        .unwrap_or_else(|| "REGIONID".to_string()),
                    sanitize_partition_value(region.unwrap_or("unknown")),
                ),
            ],
            PartitionScheme::YearMonth => vec![
                ("year".to_string(), ts.year().to_string()),
                ("month".to_string(), ts.month().to_string()),
            ],
            PartitionScheme::Date => vec![(
                schema.date_partition_column.clone(),
                ts.date().format("%Y-%m-%d").to_string(),
            )],
        };
        Self(pairs)
    }

    pub fn relative_path(&self) -> PathBuf {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<PathBuf>()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join("/"))
    }
}

fn sanitize_partition_value(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    trimmed
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// One normalised observation; values are aligned with the batch schema's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub values: Vec<Value>,
    pub timestamp: NaiveDateTime,
    pub interval: IntervalIndex,
    pub partition: PartitionKey,
    pub source_file: String,
}

impl NormalizedRecord {
    pub fn get<'a>(&'a self, schema: &SchemaDefinition, column: &str) -> Option<&'a Value> {
        schema.column_index(column).and_then(|i| self.values.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn midnight_belongs_to_previous_day() {
        let idx = interval_index(ts("2025-06-12 00:00:00"));
        assert_eq!(idx.index, 288);
        assert_eq!(idx.date, NaiveDate::from_ymd_opt(2025, 6, 11).unwrap());
    }

    #[test]
    fn interval_boundaries() {
        assert_eq!(interval_index(ts("2025-06-12 00:05:00")).index, 1);
        assert_eq!(interval_index(ts("2025-06-12 00:10:00")).index, 2);
        assert_eq!(interval_index(ts("2025-06-12 18:35:00")).index, 223);
        assert_eq!(interval_index(ts("2025-06-12 23:55:00")).index, 287);
    }

    #[test]
    fn partition_paths_are_hive_style() {
        let registry = SchemaRegistry::builtin();
        let schema = registry
            .lookup(&TagKey::new("TRADING", "PRICE"), 3)
            .unwrap();
        let key = PartitionKey::derive(schema, ts("2025-06-12 18:35:00"), Some("NSW1"));
        assert_eq!(key.to_string(), "year=2025/month=6/REGIONID=NSW1");
        assert_eq!(
            key.relative_path(),
            PathBuf::from("year=2025").join("month=6").join("REGIONID=NSW1")
        );
    }

    #[test]
    fn resolved_columns_keep_kinds_by_name() {
        let registry = SchemaRegistry::builtin();
        let schema = registry
            .lookup(&TagKey::new("TRADING", "PRICE"), 3)
            .unwrap();
        let resolved = schema.resolve_columns(&[
            "SETTLEMENTDATE".to_string(),
            "RRP".to_string(),
            "NEWCOLUMN".to_string(),
        ]);
        assert_eq!(resolved.columns.len(), 3);
        assert_eq!(resolved.column_kind("RRP"), ColumnKind::Float);
        assert_eq!(resolved.column_kind("NEWCOLUMN"), ColumnKind::Text);
    }
}
