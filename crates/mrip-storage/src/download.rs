//! Bounded-width archive download pool.

use std::path::PathBuf;
use std::sync::Arc;

use mrip_core::RemoteReportFile;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};

use crate::{ArchiveCache, ArchiveFetcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloaded { bytes: usize },
    AlreadyPresent,
    Failed(String),
}

impl DownloadStatus {
    pub fn is_available(&self) -> bool {
        !matches!(self, DownloadStatus::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub file: RemoteReportFile,
    pub path: PathBuf,
    pub status: DownloadStatus,
}

pub struct DownloadManager {
    cache: ArchiveCache,
    fetcher: Arc<dyn ArchiveFetcher>,
    workers: usize,
}

impl DownloadManager {
    pub fn new(cache: ArchiveCache, fetcher: Arc<dyn ArchiveFetcher>, workers: usize) -> Self {
        Self {
            cache,
            fetcher,
            workers: workers.max(1),
        }
    }

    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    /// Ensures every file is in the local cache. One outcome per input, in input order.
    ///
    /// A failed download never aborts the others; it is reported as `Failed`.
    pub async fn download_all(&self, files: &[RemoteReportFile]) -> Vec<DownloadOutcome> {
        let limit = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (index, file) in files.iter().cloned().enumerate() {
            let limit = Arc::clone(&limit);
            let cache = self.cache.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let span = tracing::info_span!("download", file = %file.filename);
            tasks.spawn(
                async move {
                    let _permit = limit.acquire_owned().await.ok();
                    let status = download_one(&cache, fetcher.as_ref(), &file).await;
                    (index, status)
                }
                .instrument(span),
            );
        }

        let mut statuses: Vec<Option<DownloadStatus>> = vec![None; files.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, status)) => statuses[index] = Some(status),
                Err(err) => warn!(error = %err, "download worker aborted"),
            }
        }

        files
            .iter()
            .zip(statuses)
            .map(|(file, status)| DownloadOutcome {
                path: self.cache.path_for(&file.filename),
                file: file.clone(),
                status: status
                    .unwrap_or_else(|| DownloadStatus::Failed("download worker aborted".into())),
            })
            .collect()
    }
}

async fn download_one(
    cache: &ArchiveCache,
    fetcher: &dyn ArchiveFetcher,
    file: &RemoteReportFile,
) -> DownloadStatus {
    if cache.is_present(&file.filename).await {
        return DownloadStatus::AlreadyPresent;
    }

    let bytes = match fetcher.fetch_archive(&file.url).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(url = %file.url, error = %err, "download failed");
            return DownloadStatus::Failed(err.to_string());
        }
    };

    match cache.store_bytes(&file.filename, &bytes).await {
        Ok(stored) => {
            info!(bytes = stored.byte_size, "archive cached");
            DownloadStatus::Downloaded {
                bytes: stored.byte_size,
            }
        }
        Err(err) => {
            warn!(error = %err, "could not store archive");
            DownloadStatus::Failed(format!("{err:#}"))
        }
    }
}
