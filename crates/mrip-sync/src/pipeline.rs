//! Run orchestration: list, filter, download, then per file extract → parse →
//! normalize → write → track, strictly in that order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mrip_adapters::{
    ArchiveExtractor, HttpReportSource, NormalizeStats, Normalizer, ParseError, RecordParser,
    ReportSource, SourceArchives, SourceLister,
};
use mrip_core::SchemaRegistry;
use mrip_storage::{
    ArchiveCache, DownloadManager, DownloadOutcome, DownloadStatus, HttpClientConfig, HttpFetcher,
    LockError, ProcessedFileTracker, RunLock,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{FamilyConfig, ReportsFile, SyncConfig};
use crate::error::{IngestError, Stage};
use crate::reports::write_reports;
use crate::writer::PartitionedWriter;

/// Where a file ended up in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "stage")]
pub enum FileState {
    Discovered,
    Downloaded,
    Extracted,
    Parsed,
    Normalized,
    Written,
    Tracked,
    Failed(Stage),
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub filename: String,
    pub state: FileState,
    pub rows_written: u64,
    pub rows_dropped: u64,
    pub rows_deduplicated: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FamilyRunSummary {
    pub family: String,
    pub discovered: usize,
    pub already_tracked: usize,
    pub downloaded: usize,
    pub already_present: usize,
    pub processed: usize,
    pub rows_written: u64,
    pub rows_dropped: u64,
    pub rows_deduplicated: u64,
    pub ignored_rows: u64,
    pub failures_by_stage: BTreeMap<Stage, usize>,
    pub normalize: NormalizeStats,
    pub files: Vec<FileReport>,
    #[serde(skip)]
    pub written_files: Vec<PathBuf>,
}

impl FamilyRunSummary {
    pub fn failures(&self) -> usize {
        self.failures_by_stage.values().sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub families: Vec<FamilyRunSummary>,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn files_discovered(&self) -> usize {
        self.families.iter().map(|f| f.discovered).sum()
    }

    pub fn files_downloaded(&self) -> usize {
        self.families.iter().map(|f| f.downloaded).sum()
    }

    pub fn files_processed(&self) -> usize {
        self.families.iter().map(|f| f.processed).sum()
    }

    pub fn rows_written(&self) -> u64 {
        self.families.iter().map(|f| f.rows_written).sum()
    }

    pub fn rows_dropped(&self) -> u64 {
        self.families.iter().map(|f| f.rows_dropped).sum()
    }

    pub fn failures_by_stage(&self) -> BTreeMap<Stage, usize> {
        let mut totals = BTreeMap::new();
        for family in &self.families {
            for (stage, count) in &family.failures_by_stage {
                *totals.entry(*stage).or_default() += count;
            }
        }
        totals
    }
}

/// Result of pushing one downloaded archive through the file stages.
struct FileSuccess {
    rows_written: u64,
    rows_dropped: u64,
    rows_deduplicated: u64,
    ignored_rows: u64,
    stats: NormalizeStats,
    files: Vec<PathBuf>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    reports: ReportsFile,
    registry: SchemaRegistry,
    source: Arc<dyn ReportSource>,
}

impl SyncPipeline {
    /// Pipeline over the live HTTP portal, families read from the configured reports file.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let reports = ReportsFile::load_or_builtin(&config.reports_config)?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            global_concurrency: config.download_workers.max(1),
            ..Default::default()
        })?;
        let source = Arc::new(HttpReportSource::new(Arc::new(http)));
        Ok(Self::with_source(config, reports, source))
    }

    pub fn with_source(config: SyncConfig, reports: ReportsFile, source: Arc<dyn ReportSource>) -> Self {
        let registry = reports.registry();
        Self {
            config,
            reports,
            registry,
            source,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn reports(&self) -> &ReportsFile {
        &self.reports
    }

    /// Enabled families, or exactly `only` when given (enabled or not).
    pub fn selected_families(&self, only: Option<&str>) -> Result<Vec<FamilyConfig>> {
        match only {
            Some(id) => {
                let family = self
                    .reports
                    .family(id)
                    .with_context(|| format!("unknown report family {id}"))?;
                Ok(vec![family.clone()])
            }
            None => Ok(self
                .reports
                .families
                .iter()
                .filter(|f| f.enabled)
                .cloned()
                .collect()),
        }
    }

    /// One full run. Fatal errors come back as `IngestError` inside the `anyhow::Error`.
    pub async fn run_once(&self, only: Option<&str>) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let families = self.selected_families(only)?;

        let lock = RunLock::acquire(
            self.config.lock_path(),
            &run_id.to_string(),
            Duration::from_secs(self.config.stale_lock_secs),
        )
        .map_err(|err| match err {
            held @ LockError::Held { .. } => anyhow::Error::new(IngestError::RunLocked(held)),
            other => anyhow::Error::new(other).context("acquiring run lock"),
        })?;

        info!(%run_id, families = families.len(), "sync run started");
        let mut summaries = Vec::with_capacity(families.len());
        for family in &families {
            let span = tracing::info_span!("family", %run_id, family = %family.id);
            match self.run_family(family, &lock).instrument(span).await {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    error!(%run_id, family = %family.id, error = %format!("{err:#}"), "fatal error, aborting run");
                    return Err(err);
                }
            }
        }

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            families: summaries,
            reports_dir: None,
        };
        let reports_dir = write_reports(&self.config, &summary).await?;
        summary.reports_dir = Some(reports_dir.display().to_string());

        info!(
            %run_id,
            discovered = summary.files_discovered(),
            downloaded = summary.files_downloaded(),
            processed = summary.files_processed(),
            rows_written = summary.rows_written(),
            rows_dropped = summary.rows_dropped(),
            "sync run finished"
        );
        Ok(summary)
    }

    /// Processes one family under `lock`. Fatal failures are returned as `IngestError`.
    pub async fn run_family(&self, family: &FamilyConfig, lock: &RunLock) -> Result<FamilyRunSummary> {
        let tracker_unavailable = |source| IngestError::TrackerUnavailable {
            family: family.id.clone(),
            source,
        };
        let listing_unavailable = |source| IngestError::ListingUnavailable {
            family: family.id.clone(),
            source,
        };

        let tracker = ProcessedFileTracker::open(self.config.tracker_path(&family.id))
            .await
            .map_err(tracker_unavailable)?;

        let lister = SourceLister::new(family.listing_url.clone(), family.archive_extension.clone());
        let mut files = lister
            .list(self.source.as_ref())
            .await
            .map_err(listing_unavailable)?;
        if let Some(filter) = family.effective_date_filter(self.config.lookback_days) {
            files = filter
                .apply(files, Utc::now().date_naive())
                .map_err(listing_unavailable)?;
        }

        let mut summary = FamilyRunSummary {
            family: family.id.clone(),
            discovered: files.len(),
            ..Default::default()
        };

        let (candidates, already_tracked) = tracker
            .partition_untracked(files, |f| f.filename.as_str())
            .await
            .map_err(tracker_unavailable)?;
        summary.already_tracked = already_tracked;
        for file in &candidates {
            debug!(file = %file.filename, state = ?FileState::Discovered, "candidate");
        }
        info!(
            discovered = summary.discovered,
            already_tracked,
            candidates = candidates.len(),
            "candidates selected"
        );

        let cache = ArchiveCache::new(self.config.archives_dir(&family.id));
        let downloads = DownloadManager::new(
            cache.clone(),
            Arc::new(SourceArchives(Arc::clone(&self.source))),
            self.config.download_workers,
        )
        .download_all(&candidates)
        .await;

        let writer = PartitionedWriter::new(
            self.config.dataset_dir(&family.id),
            self.config.natural_key_dedup,
        );
        let extractor = ArchiveExtractor::new(
            family.member_extension.clone(),
            self.config.max_in_memory_entry_bytes,
        );
        let parser = RecordParser::new(&self.registry, family.tag())
            .with_context(|| format!("report family {}", family.id))?;

        for download in downloads {
            match &download.status {
                DownloadStatus::Downloaded { .. } => summary.downloaded += 1,
                DownloadStatus::AlreadyPresent => summary.already_present += 1,
                DownloadStatus::Failed(_) => {}
            }
            let filename = download.file.filename.clone();
            keep_lock_fresh(lock)?;

            match self.process_file(&download, &extractor, &parser, &writer) {
                Ok(done) => {
                    info!(file = %filename, state = ?FileState::Written, rows = done.rows_written, "file written");
                    tracker
                        .insert(&filename, Utc::now())
                        .await
                        .map_err(tracker_unavailable)?;
                    info!(file = %filename, state = ?FileState::Tracked, "file tracked");

                    summary.processed += 1;
                    summary.rows_written += done.rows_written;
                    summary.rows_dropped += done.rows_dropped;
                    summary.rows_deduplicated += done.rows_deduplicated;
                    summary.ignored_rows += done.ignored_rows;
                    summary.normalize.absorb(&done.stats);
                    summary.written_files.extend(done.files);
                    summary.files.push(FileReport {
                        filename,
                        state: FileState::Tracked,
                        rows_written: done.rows_written,
                        rows_dropped: done.rows_dropped,
                        rows_deduplicated: done.rows_deduplicated,
                        error: None,
                    });
                }
                Err(err) => {
                    let stage = err.stage().unwrap_or(Stage::Download);
                    warn!(
                        family = %family.id,
                        file = %filename,
                        %stage,
                        error = %err,
                        "file failed, left untracked"
                    );
                    if err.discards_cached_archive() {
                        match cache.remove(&filename).await {
                            Ok(_) => info!(file = %filename, "cached archive discarded"),
                            Err(remove_err) => warn!(
                                file = %filename,
                                error = %format!("{remove_err:#}"),
                                "could not discard cached archive"
                            ),
                        }
                    }
                    *summary.failures_by_stage.entry(stage).or_default() += 1;
                    summary.files.push(FileReport {
                        filename,
                        state: FileState::Failed(stage),
                        rows_written: 0,
                        rows_dropped: 0,
                        rows_deduplicated: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        tracker.close().await;
        info!(
            processed = summary.processed,
            failures = summary.failures(),
            rows_written = summary.rows_written,
            "family finished"
        );
        Ok(summary)
    }

    fn process_file(
        &self,
        download: &DownloadOutcome,
        extractor: &ArchiveExtractor,
        parser: &RecordParser<'_>,
        writer: &PartitionedWriter,
    ) -> Result<FileSuccess, IngestError> {
        let filename = download.file.filename.as_str();
        if let DownloadStatus::Failed(message) = &download.status {
            return Err(IngestError::DownloadFailed {
                file: filename.to_string(),
                message: message.clone(),
            });
        }
        info!(file = filename, state = ?FileState::Downloaded, "archive available");

        let corrupt = |message: String| IngestError::CorruptArchive {
            file: filename.to_string(),
            message,
        };
        let members = extractor
            .extract_path(&download.path)
            .map_err(|e| corrupt(e.to_string()))?;
        let readers = members
            .iter()
            .map(|m| m.reader().map(|r| (m.name.as_str(), r)))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| corrupt(e.to_string()))?;
        info!(file = filename, members = members.len(), state = ?FileState::Extracted, "archive extracted");

        let report = parser.parse_all(readers, filename).map_err(|err| match err {
            ParseError::NoRows { tag, .. } => IngestError::ParseProducedNoRows {
                file: filename.to_string(),
                tag: tag.to_string(),
            },
            other => IngestError::MalformedReport {
                file: filename.to_string(),
                message: other.to_string(),
            },
        })?;
        info!(
            file = filename,
            rows = report.row_count(),
            ignored = report.ignored_rows,
            state = ?FileState::Parsed,
            "report parsed"
        );

        let (batches, stats) = Normalizer::new(filename).normalize(&report);
        for (strategy, hits) in &stats.strategy_hits {
            debug!(file = filename, strategy, hits, "timestamp strategy used");
        }
        info!(
            file = filename,
            kept = stats.output_rows,
            dropped = stats.dropped_rows,
            state = ?FileState::Normalized,
            "rows normalized"
        );

        let outcome = writer
            .write_batches(&batches, filename)
            .map_err(|source| IngestError::WriteFailure {
                file: filename.to_string(),
                source,
            })?;

        Ok(FileSuccess {
            rows_written: outcome.rows_written,
            rows_dropped: stats.dropped_rows,
            rows_deduplicated: outcome.rows_deduplicated,
            ignored_rows: report.ignored_rows,
            stats,
            files: outcome.files,
        })
    }

    /// `None` unless `scheduler_enabled` is set.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        self.build_scheduler().await.map(Some)
    }

    /// Cron job running the pipeline; an overlapping tick is refused by the run lock.
    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once(None).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        rows_written = summary.rows_written(),
                        "scheduled sync finished"
                    ),
                    Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

/// A run that lost its lock to a stale takeover must stop writing.
fn keep_lock_fresh(lock: &RunLock) -> Result<()> {
    match lock.refresh() {
        Ok(()) => Ok(()),
        Err(lost @ LockError::Lost { .. }) => Err(IngestError::RunLocked(lost).into()),
        Err(err) => {
            warn!(error = %err, "could not refresh run lock");
            Ok(())
        }
    }
}

pub async fn run_sync_once_from_env(only: Option<&str>) -> Result<RunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_once(only).await
}
