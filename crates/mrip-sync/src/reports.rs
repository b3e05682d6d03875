use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::config::SyncConfig;
use crate::error::Stage;
use crate::pipeline::RunSummary;

#[derive(Serialize)]
struct SummaryReport<'a> {
    run: &'a RunSummary,
    totals: RunTotals,
}

#[derive(Serialize)]
struct RunTotals {
    files_discovered: usize,
    files_downloaded: usize,
    files_processed: usize,
    rows_written: u64,
    rows_dropped: u64,
    failures_by_stage: BTreeMap<Stage, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub family: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `run_summary.json`, `run_brief.md` and `manifest.json` under `reports/<run_id>/`.
pub async fn write_reports(config: &SyncConfig, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = config.reports_root().join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let report = SummaryReport {
        run: summary,
        totals: RunTotals {
            files_discovered: summary.files_discovered(),
            files_downloaded: summary.files_downloaded(),
            files_processed: summary.files_processed(),
            rows_written: summary.rows_written(),
            rows_dropped: summary.rows_dropped(),
            failures_by_stage: summary.failures_by_stage(),
        },
    };
    let summary_json = serde_json::to_vec_pretty(&report).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), summary_json)
        .await
        .context("writing run_summary.json")?;

    fs::write(reports_dir.join("run_brief.md"), run_brief_markdown(summary))
        .await
        .context("writing run_brief.md")?;

    let mut files = Vec::new();
    for family in &summary.families {
        for path in &family.written_files {
            files.push(manifest_entry(&family.family, &config.data_dir, path).await?);
        }
    }
    let manifest = ParquetManifest {
        schema_version: 1,
        run_id: summary.run_id.to_string(),
        files,
    };
    let manifest_path = reports_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(reports_dir)
}

pub fn run_brief_markdown(summary: &RunSummary) -> String {
    let failures = summary.failures_by_stage();
    let failure_lines = if failures.is_empty() {
        "- none".to_string()
    } else {
        failures
            .iter()
            .map(|(stage, count)| format!("- {stage}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let family_lines = summary
        .families
        .iter()
        .map(|f| {
            format!(
                "| {} | {} | {} | {} | {} | {} | {} |",
                f.family,
                f.discovered,
                f.already_tracked,
                f.downloaded + f.already_present,
                f.processed,
                f.rows_written,
                f.failures()
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Market Report Sync\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Files discovered: {}\n- Files downloaded: {}\n- Files processed: {}\n- Rows written: {}\n- Rows dropped (unparseable timestamp): {}\n\n## Families\n\n| family | discovered | tracked before | available | processed | rows | failures |\n|---|---|---|---|---|---|---|\n{}\n\n## Failures by stage\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.files_discovered(),
        summary.files_downloaded(),
        summary.files_processed(),
        summary.rows_written(),
        summary.rows_dropped(),
        family_lines,
        failure_lines
    )
}

async fn manifest_entry(family: &str, data_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(data_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        family: family.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
