//! Typed coercion of parsed rows plus derived interval and partition keys.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use mrip_core::{
    interval_index, ColumnKind, NormalizedRecord, PartitionKey, RawRow, SchemaDefinition, Value,
};
use serde::Serialize;
use tracing::debug;

use crate::parser::{ParsedReport, ReportSection};

/// One candidate timestamp layout. Tried in declaration order; first parse wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampStrategy {
    pub name: &'static str,
    pub format: &'static str,
    pub date_only: bool,
}

pub const TIMESTAMP_STRATEGIES: &[TimestampStrategy] = &[
    TimestampStrategy {
        name: "slash_seconds",
        format: "%Y/%m/%d %H:%M:%S",
        date_only: false,
    },
    TimestampStrategy {
        name: "dash_seconds",
        format: "%Y-%m-%d %H:%M:%S",
        date_only: false,
    },
    TimestampStrategy {
        name: "slash_minutes",
        format: "%Y/%m/%d %H:%M",
        date_only: false,
    },
    TimestampStrategy {
        name: "iso_t",
        format: "%Y-%m-%dT%H:%M:%S",
        date_only: false,
    },
    TimestampStrategy {
        name: "dash_fractional",
        format: "%Y-%m-%d %H:%M:%S%.f",
        date_only: false,
    },
    TimestampStrategy {
        name: "day_first_seconds",
        format: "%d/%m/%Y %H:%M:%S",
        date_only: false,
    },
    TimestampStrategy {
        name: "day_first_minutes",
        format: "%d/%m/%Y %H:%M",
        date_only: false,
    },
    TimestampStrategy {
        name: "slash_date",
        format: "%Y/%m/%d",
        date_only: true,
    },
    TimestampStrategy {
        name: "dash_date",
        format: "%Y-%m-%d",
        date_only: true,
    },
    TimestampStrategy {
        name: "day_first_date",
        format: "%d/%m/%Y",
        date_only: true,
    },
];

impl TimestampStrategy {
    fn parse(&self, raw: &str) -> Option<NaiveDateTime> {
        if self.date_only {
            NaiveDate::parse_from_str(raw, self.format)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        } else {
            NaiveDateTime::parse_from_str(raw, self.format).ok()
        }
    }
}

/// Parses with the first matching strategy, returning it alongside the value.
pub fn parse_timestamp(raw: &str) -> Option<(NaiveDateTime, &'static TimestampStrategy)> {
    let raw = clean(raw);
    if raw.is_empty() {
        return None;
    }
    TIMESTAMP_STRATEGIES
        .iter()
        .find_map(|strategy| strategy.parse(raw).map(|ts| (ts, strategy)))
}

fn clean(raw: &str) -> &str {
    raw.trim().trim_matches('"').trim()
}

fn is_missing_numeric(raw: &str) -> bool {
    raw.is_empty() || raw.eq_ignore_ascii_case("n/a") || raw.eq_ignore_ascii_case("nan")
}

fn coerce_float(raw: &str) -> Option<f64> {
    let raw = clean(raw);
    if is_missing_numeric(raw) {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn coerce_int(raw: &str) -> Option<i64> {
    let raw = clean(raw);
    if is_missing_numeric(raw) {
        return None;
    }
    raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.fract() == 0.0 && v.abs() < i64::MAX as f64)
            .map(|v| v as i64)
    })
}

/// Counters for one normalised file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    pub input_rows: u64,
    pub output_rows: u64,
    /// Rows removed because a timestamp could not be parsed.
    pub dropped_rows: u64,
    /// Numeric fields that became null.
    pub null_numeric: u64,
    pub strategy_hits: BTreeMap<String, u64>,
}

impl NormalizeStats {
    pub fn absorb(&mut self, other: &NormalizeStats) {
        self.input_rows += other.input_rows;
        self.output_rows += other.output_rows;
        self.dropped_rows += other.dropped_rows;
        self.null_numeric += other.null_numeric;
        for (name, hits) in &other.strategy_hits {
            *self.strategy_hits.entry(name.clone()).or_default() += hits;
        }
    }
}

/// Records that share one schema, ready for the writer.
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub schema: SchemaDefinition,
    pub records: Vec<NormalizedRecord>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    source_file: String,
}

impl Normalizer {
    pub fn new(source_file: impl Into<String>) -> Self {
        Self {
            source_file: source_file.into(),
        }
    }

    pub fn normalize(&self, report: &ParsedReport) -> (Vec<NormalizedBatch>, NormalizeStats) {
        let mut stats = NormalizeStats::default();
        let batches = report
            .sections
            .iter()
            .map(|section| self.normalize_section(section, &mut stats))
            .filter(|batch| !batch.records.is_empty())
            .collect();
        (batches, stats)
    }

    pub fn normalize_section(&self, section: &ReportSection, stats: &mut NormalizeStats) -> NormalizedBatch {
        let schema = &section.schema;
        let kinds = schema
            .columns
            .iter()
            .map(|c| schema.column_kind(c))
            .collect::<Vec<_>>();
        let primary = schema.column_index(&schema.primary_timestamp).or_else(|| {
            kinds.iter().position(|k| *k == ColumnKind::Timestamp)
        });
        let region = schema
            .region_column
            .as_deref()
            .and_then(|c| schema.column_index(c));

        let mut records = Vec::with_capacity(section.rows.len());
        for row in &section.rows {
            stats.input_rows += 1;
            match self.normalize_row(schema, &kinds, primary, region, row, stats) {
                Some(record) => {
                    stats.output_rows += 1;
                    records.push(record);
                }
                None => {
                    stats.dropped_rows += 1;
                    debug!(
                        source_file = %self.source_file,
                        line = row.line,
                        "row dropped: unparseable timestamp"
                    );
                }
            }
        }

        NormalizedBatch {
            schema: schema.clone(),
            records,
        }
    }

    fn normalize_row(
        &self,
        schema: &SchemaDefinition,
        kinds: &[ColumnKind],
        primary: Option<usize>,
        region: Option<usize>,
        row: &RawRow,
        stats: &mut NormalizeStats,
    ) -> Option<NormalizedRecord> {
        let mut values = Vec::with_capacity(kinds.len());
        for (index, kind) in kinds.iter().enumerate() {
            let raw = row.fields.get(index).map(String::as_str).unwrap_or("");
            let value = match kind {
                ColumnKind::Timestamp => {
                    if clean(raw).is_empty() && Some(index) != primary {
                        Value::Null
                    } else {
                        let (ts, strategy) = parse_timestamp(raw)?;
                        *stats
                            .strategy_hits
                            .entry(strategy.name.to_string())
                            .or_default() += 1;
                        Value::Timestamp(ts)
                    }
                }
                ColumnKind::Float => match coerce_float(raw) {
                    Some(v) => Value::Float(v),
                    None => {
                        stats.null_numeric += 1;
                        Value::Null
                    }
                },
                ColumnKind::Int => match coerce_int(raw) {
                    Some(v) => Value::Int(v),
                    None => {
                        stats.null_numeric += 1;
                        Value::Null
                    }
                },
                ColumnKind::Category => Value::Category(clean(raw).to_string()),
                ColumnKind::Text => Value::Text(clean(raw).to_string()),
            };
            values.push(value);
        }

        let timestamp = match primary.and_then(|i| values.get(i)) {
            Some(Value::Timestamp(ts)) => *ts,
            _ => return None,
        };
        let region_value = region.and_then(|i| values.get(i)).and_then(Value::as_str);
        let partition = PartitionKey::derive(schema, timestamp, region_value);

        Some(NormalizedRecord {
            values,
            timestamp,
            interval: interval_index(timestamp),
            partition,
            source_file: self.source_file.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::RecordParser;
    use mrip_core::{SchemaRegistry, TagKey};

    fn parse(body: &str) -> ParsedReport {
        let registry = SchemaRegistry::builtin();
        RecordParser::new(&registry, TagKey::new("TRADING", "PRICE"))
            .unwrap()
            .parse(body.as_bytes(), "t.csv")
            .unwrap()
    }

    #[test]
    fn strategies_are_tried_in_order() {
        let (ts, strategy) = parse_timestamp("\"2025/06/01 18:35:00\"").unwrap();
        assert_eq!(strategy.name, "slash_seconds");
        assert_eq!(ts.to_string(), "2025-06-01 18:35:00");

        let (_, strategy) = parse_timestamp("2025-06-01T18:35:00").unwrap();
        assert_eq!(strategy.name, "iso_t");

        let (ts, strategy) = parse_timestamp("2025/06/01").unwrap();
        assert_eq!(strategy.name, "slash_date");
        assert_eq!(ts.to_string(), "2025-06-01 00:00:00");

        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn numeric_failures_become_null_and_row_is_kept() {
        let report = parse(
            "I,TRADING,PRICE,3,SETTLEMENTDATE,RUNNO,REGIONID,PERIODID,RRP,EEP\n\
             D,TRADING,PRICE,3,2025/06/01 18:35:00,1,NSW1,223,N/A,\n",
        );
        let (batches, stats) = Normalizer::new("t.zip").normalize(&report);
        assert_eq!(stats.dropped_rows, 0);
        assert_eq!(stats.null_numeric, 2);
        let batch = &batches[0];
        let record = &batch.records[0];
        assert_eq!(record.get(&batch.schema, "RRP"), Some(&Value::Null));
        assert_eq!(record.get(&batch.schema, "EEP"), Some(&Value::Null));
        assert_eq!(record.get(&batch.schema, "RUNNO"), Some(&Value::Int(1)));
        assert_eq!(
            record.get(&batch.schema, "REGIONID"),
            Some(&Value::Category("NSW1".into()))
        );
        assert_eq!(record.interval.index, 223);
        assert_eq!(record.partition.to_string(), "year=2025/month=6/REGIONID=NSW1");
        assert_eq!(record.source_file, "t.zip");
    }

    #[test]
    fn unparseable_timestamps_are_counted_as_dropped() {
        let report = parse(
            "I,TRADING,PRICE,3,SETTLEMENTDATE,RUNNO,REGIONID\n\
             D,TRADING,PRICE,3,not a date,1,NSW1\n\
             D,TRADING,PRICE,3,2025/06/02 00:00:00,1,VIC1\n",
        );
        let (batches, stats) = Normalizer::new("t.zip").normalize(&report);
        assert_eq!(stats.input_rows, 2);
        assert_eq!(stats.dropped_rows, 1);
        assert_eq!(stats.output_rows, 1);
        let record = &batches[0].records[0];
        assert_eq!(record.interval.index, 288);
        assert_eq!(record.interval.date.to_string(), "2025-06-01");
        assert_eq!(stats.strategy_hits.get("slash_seconds"), Some(&1));
    }

    #[test]
    fn text_keeps_empty_strings() {
        let report = parse(
            "I,TRADING,PRICE,3,SETTLEMENTDATE,REGIONID,PRICE_STATUS,NOTE\n\
             D,TRADING,PRICE,3,2025/06/01 00:05:00,NSW1,,\" padded \"\n",
        );
        let (batches, _) = Normalizer::new("t.zip").normalize(&report);
        let batch = &batches[0];
        let record = &batch.records[0];
        assert_eq!(
            record.get(&batch.schema, "PRICE_STATUS"),
            Some(&Value::Category(String::new()))
        );
        assert_eq!(
            record.get(&batch.schema, "NOTE"),
            Some(&Value::Text("padded".into()))
        );
    }

    #[test]
    fn empty_secondary_timestamp_is_null() {
        let report = parse(
            "I,TRADING,PRICE,3,SETTLEMENTDATE,REGIONID,LASTCHANGED\n\
             D,TRADING,PRICE,3,2025/06/01 00:05:00,NSW1,\n",
        );
        let (batches, stats) = Normalizer::new("t.zip").normalize(&report);
        assert_eq!(stats.dropped_rows, 0);
        let batch = &batches[0];
        assert_eq!(
            batch.records[0].get(&batch.schema, "LASTCHANGED"),
            Some(&Value::Null)
        );
    }

    #[test]
    fn mtpasa_file_partitions_by_publish_time() {
        let registry = SchemaRegistry::builtin();
        let body = "I,MTPASA,DUIDAVAILABILITY,1,PUBLISH_DATETIME,DAY,REGIONID,DUID,PASAAVAILABILITY\n\
                    D,MTPASA,DUIDAVAILABILITY,1,\"2025/06/01 14:00:00\",\"2025/06/02 00:00:00\",NSW1,BW01,660\n\
                    D,MTPASA,DUIDAVAILABILITY,1,\"2025/06/01 14:00:00\",\"2025/09/15 00:00:00\",NSW1,BW01,0\n\
                    D,MTPASA,DUIDAVAILABILITY,1,\"2025/06/01 14:00:00\",\"2027/05/30 00:00:00\",QLD1,GSTONE1,280\n";
        let report = RecordParser::new(&registry, TagKey::new("MTPASA", "DUIDAVAILABILITY"))
            .unwrap()
            .parse(body.as_bytes(), "PUBLIC_MTPASADUIDAVAILABILITY_2025060114.CSV")
            .unwrap();

        let (batches, stats) = Normalizer::new("m.zip").normalize(&report);
        assert_eq!(stats.output_rows, 3);
        let partitions = batches[0]
            .records
            .iter()
            .map(|r| r.partition.to_string())
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(
            partitions.into_iter().collect::<Vec<_>>(),
            vec!["report_date=2025-06-01".to_string()]
        );
        assert_eq!(batches[0].records[2].interval.index, 168);
        assert_eq!(batches[0].records[2].interval.date.to_string(), "2025-06-01");
    }
}
