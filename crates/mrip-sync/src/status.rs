//! Read-side inspection of the dataset: row counts from parquet footers.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionStatus {
    /// Hive path relative to the family dataset root, e.g. `year=2025/month=6/REGIONID=NSW1`.
    pub partition: String,
    pub files: usize,
    pub rows: i64,
}

/// Partitions of one family dataset, sorted by path. A missing dataset has none.
pub fn dataset_status(dataset_root: &Path) -> Result<Vec<PartitionStatus>> {
    let mut parts = Vec::new();
    if dataset_root.exists() {
        collect_parts(dataset_root, &mut parts)?;
    }

    let mut by_partition = std::collections::BTreeMap::<String, PartitionStatus>::new();
    for path in parts {
        let rows = footer_rows(&path)?;
        let partition = path
            .parent()
            .and_then(|p| p.strip_prefix(dataset_root).ok())
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();
        let entry = by_partition
            .entry(partition.clone())
            .or_insert_with(|| PartitionStatus {
                partition,
                files: 0,
                rows: 0,
            });
        entry.files += 1;
        entry.rows += rows;
    }
    Ok(by_partition.into_values().collect())
}

fn collect_parts(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
        let path = entry.path();
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_parts(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
            out.push(path);
        }
    }
    Ok(())
}

fn footer_rows(path: &Path) -> Result<i64> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("reading parquet footer {}", path.display()))?;
    Ok(reader.metadata().file_metadata().num_rows())
}
