//! Hive-partitioned parquet dataset writer.
//!
//! Each (partition, source file) pair owns exactly one part file whose name is
//! derived from the source filename, so re-ingesting a file replaces its own
//! parts and never appends a second copy.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{
    Float64Type, Int16Type, Int32Type, Int64Type, TimestampMillisecondType,
};
use arrow_array::{
    Array, ArrayRef, Date32Array, DictionaryArray, Float64Array, Int16Array, Int64Array,
    RecordBatch, StringArray, TimestampMillisecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use chrono::Datelike;
use mrip_adapters::NormalizedBatch;
use mrip_core::{ColumnKind, NormalizedRecord, PartitionKey, SchemaDefinition, Value};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::WriteError;

pub const INTERVAL_INDEX_COLUMN: &str = "INTERVAL_INDEX";
pub const INTERVAL_DATE_COLUMN: &str = "INTERVAL_DATE";
pub const SOURCE_FILE_COLUMN: &str = "SOURCE_FILE";

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub rows_written: u64,
    pub rows_deduplicated: u64,
    pub files: Vec<PathBuf>,
}

impl WriteOutcome {
    fn absorb(&mut self, other: WriteOutcome) {
        self.rows_written += other.rows_written;
        self.rows_deduplicated += other.rows_deduplicated;
        self.files.extend(other.files);
    }
}

#[derive(Debug, Clone)]
pub struct PartitionedWriter {
    root: PathBuf,
    natural_key_dedup: bool,
}

impl PartitionedWriter {
    pub fn new(root: impl Into<PathBuf>, natural_key_dedup: bool) -> Self {
        Self {
            root: root.into(),
            natural_key_dedup,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write_batches(
        &self,
        batches: &[NormalizedBatch],
        source_file: &str,
    ) -> Result<WriteOutcome, WriteError> {
        let mut outcome = WriteOutcome::default();
        for (index, batch) in batches.iter().enumerate() {
            let part_name = part_file_name(source_file, index);
            outcome.absorb(self.write_batch(batch, &part_name)?);
        }
        Ok(outcome)
    }

    fn write_batch(&self, batch: &NormalizedBatch, part_name: &str) -> Result<WriteOutcome, WriteError> {
        let mut ordered = batch.records.iter().collect::<Vec<_>>();
        ordered.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.partition.cmp(&b.partition))
        });

        let mut partitions: BTreeMap<&PartitionKey, Vec<&NormalizedRecord>> = BTreeMap::new();
        for record in ordered {
            partitions.entry(&record.partition).or_default().push(record);
        }

        let layout = ColumnLayout::new(&batch.schema);
        let mut outcome = WriteOutcome::default();
        for (partition, records) in partitions {
            let dir = self.root.join(partition.relative_path());
            fs::create_dir_all(&dir).map_err(|source| WriteError::CreateDir {
                path: dir.clone(),
                source,
            })?;
            let target = dir.join(part_name);

            let records = if self.natural_key_dedup {
                let existing = existing_keys(&dir, &target, &layout)?;
                let before = records.len();
                let kept = records
                    .into_iter()
                    .filter(|r| existing.is_empty() || !existing.contains(&layout.record_key(r)))
                    .collect::<Vec<_>>();
                outcome.rows_deduplicated += (before - kept.len()) as u64;
                kept
            } else {
                records
            };
            if records.is_empty() {
                debug!(%partition, "every row already present, part skipped");
                continue;
            }

            let record_batch = layout.record_batch(&records)?;
            write_parquet_atomic(&target, record_batch)?;
            debug!(%partition, rows = records.len(), path = %target.display(), "part written");
            outcome.rows_written += records.len() as u64;
            outcome.files.push(target);
        }

        info!(
            rows = outcome.rows_written,
            deduplicated = outcome.rows_deduplicated,
            parts = outcome.files.len(),
            "batch written"
        );
        Ok(outcome)
    }
}

/// `part-<first 16 hex of sha256(source file)>[-n].parquet`.
pub fn part_file_name(source_file: &str, batch_index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_file.as_bytes());
    let digest = hex::encode(hasher.finalize());
    if batch_index == 0 {
        format!("part-{}.parquet", &digest[..16])
    } else {
        format!("part-{}-{batch_index}.parquet", &digest[..16])
    }
}

/// Stored columns of one schema: payload columns minus partition columns, then derived ones.
struct ColumnLayout {
    stored: Vec<(usize, String, ColumnKind)>,
    key_columns: Vec<usize>,
    schema: Arc<Schema>,
}

impl ColumnLayout {
    fn new(definition: &SchemaDefinition) -> Self {
        let partition_columns = definition.partition_columns();
        let is_partition = |name: &str| partition_columns.iter().any(|p| p.eq_ignore_ascii_case(name));
        let derived = [INTERVAL_INDEX_COLUMN, INTERVAL_DATE_COLUMN, SOURCE_FILE_COLUMN];

        let mut seen = HashSet::new();
        let stored = definition
            .columns
            .iter()
            .enumerate()
            .filter(|(_, name)| !is_partition(name))
            .filter(|(_, name)| !derived.iter().any(|d| d.eq_ignore_ascii_case(name)))
            .filter(|(_, name)| seen.insert(name.to_ascii_uppercase()))
            .map(|(index, name)| (index, name.clone(), definition.column_kind(name)))
            .collect::<Vec<_>>();

        let key_columns = definition
            .natural_key
            .iter()
            .filter_map(|key| stored.iter().position(|(_, name, _)| name.eq_ignore_ascii_case(key)))
            .collect();

        let mut fields = stored
            .iter()
            .map(|(_, name, kind)| ArrowField::new(name.as_str(), arrow_type(*kind), true))
            .collect::<Vec<_>>();
        fields.push(ArrowField::new(INTERVAL_INDEX_COLUMN, DataType::Int16, false));
        fields.push(ArrowField::new(INTERVAL_DATE_COLUMN, DataType::Date32, false));
        fields.push(ArrowField::new(SOURCE_FILE_COLUMN, DataType::Utf8, false));

        Self {
            stored,
            key_columns,
            schema: Arc::new(Schema::new(fields)),
        }
    }

    fn record_batch(&self, records: &[&NormalizedRecord]) -> Result<RecordBatch, WriteError> {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.stored.len() + 3);
        for (index, _, kind) in &self.stored {
            let values = records.iter().map(|r| r.values.get(*index).unwrap_or(&Value::Null));
            columns.push(build_array(*kind, values));
        }
        columns.push(Arc::new(Int16Array::from(
            records.iter().map(|r| r.interval.index as i16).collect::<Vec<_>>(),
        )));
        columns.push(Arc::new(Date32Array::from(
            records
                .iter()
                .map(|r| r.interval.date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
                .collect::<Vec<_>>(),
        )));
        columns.push(Arc::new(StringArray::from(
            records.iter().map(|r| r.source_file.as_str()).collect::<Vec<_>>(),
        )));
        Ok(RecordBatch::try_new(self.schema.clone(), columns)?)
    }

    fn record_key(&self, record: &NormalizedRecord) -> String {
        self.key_columns
            .iter()
            .map(|&k| {
                let (index, _, _) = &self.stored[k];
                record
                    .values
                    .get(*index)
                    .map(Value::key_fragment)
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }

    fn key_names(&self) -> Vec<&str> {
        self.key_columns
            .iter()
            .map(|&k| self.stored[k].1.as_str())
            .collect()
    }
}

fn arrow_type(kind: ColumnKind) -> DataType {
    match kind {
        ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, None),
        ColumnKind::Float => DataType::Float64,
        ColumnKind::Int => DataType::Int64,
        ColumnKind::Text => DataType::Utf8,
        ColumnKind::Category => {
            DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
        }
    }
}

fn build_array<'a>(kind: ColumnKind, values: impl Iterator<Item = &'a Value>) -> ArrayRef {
    match kind {
        ColumnKind::Timestamp => Arc::new(TimestampMillisecondArray::from(
            values
                .map(|v| match v {
                    Value::Timestamp(ts) => Some(ts.and_utc().timestamp_millis()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Float => Arc::new(Float64Array::from(
            values
                .map(|v| match v {
                    Value::Float(f) => Some(*f),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Int => Arc::new(Int64Array::from(
            values
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Text => Arc::new(StringArray::from(
            values.map(Value::as_str).collect::<Vec<_>>(),
        )),
        ColumnKind::Category => Arc::new(
            values
                .map(Value::as_str)
                .collect::<DictionaryArray<Int32Type>>(),
        ),
    }
}

fn write_parquet_atomic(path: &Path, batch: RecordBatch) -> Result<(), WriteError> {
    let parquet_err = |e: parquet::errors::ParquetError| WriteError::Parquet {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = (|| {
        let file = File::create(&temp).map_err(|source| WriteError::Io {
            path: temp.clone(),
            source,
        })?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).map_err(parquet_err)?;
        writer.write(&batch).map_err(parquet_err)?;
        writer.close().map_err(parquet_err)?;
        fs::rename(&temp, path).map_err(|source| WriteError::Io {
            path: path.to_path_buf(),
            source,
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Natural keys already stored by other part files of a partition directory.
fn existing_keys(dir: &Path, exclude: &Path, layout: &ColumnLayout) -> Result<HashSet<String>, WriteError> {
    let mut keys = HashSet::new();
    let key_names = layout.key_names();
    if key_names.is_empty() {
        return Ok(keys);
    }

    let entries = fs::read_dir(dir).map_err(|source| WriteError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path == exclude || path.extension().and_then(|e| e.to_str()) != Some("parquet") {
            continue;
        }
        let read_err = |message: String| WriteError::ReadExisting {
            path: path.clone(),
            message,
        };
        let file = File::open(&path).map_err(|e| read_err(e.to_string()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .and_then(|b| b.build())
            .map_err(|e| read_err(e.to_string()))?;
        for batch in reader {
            let batch = batch.map_err(|e| read_err(e.to_string()))?;
            let columns = key_names
                .iter()
                .map(|name| batch.column_by_name(name))
                .collect::<Option<Vec<_>>>();
            // Parts written under an older layout without the key columns are skipped.
            let Some(columns) = columns else {
                continue;
            };
            for row in 0..batch.num_rows() {
                let key = columns
                    .iter()
                    .map(|column| key_fragment_at(column.as_ref(), row))
                    .collect::<Vec<_>>()
                    .join("\u{1f}");
                keys.insert(key);
            }
        }
    }
    Ok(keys)
}

/// Same rendering as `Value::key_fragment` for values read back from parquet.
fn key_fragment_at(array: &dyn Array, row: usize) -> String {
    if array.is_null(row) {
        return String::new();
    }
    match array.data_type() {
        DataType::Timestamp(TimeUnit::Millisecond, _) => array
            .as_primitive::<TimestampMillisecondType>()
            .value(row)
            .to_string(),
        DataType::Float64 => array.as_primitive::<Float64Type>().value(row).to_string(),
        DataType::Int64 => array.as_primitive::<Int64Type>().value(row).to_string(),
        DataType::Int16 => array.as_primitive::<Int16Type>().value(row).to_string(),
        DataType::Utf8 => array.as_string::<i32>().value(row).to_string(),
        DataType::Dictionary(_, _) => {
            let dict = array.as_dictionary::<Int32Type>();
            let key = dict.keys().value(row) as usize;
            dict.values().as_string::<i32>().value(key).to_string()
        }
        _ => String::new(),
    }
}
