use std::fmt;
use std::path::PathBuf;

use mrip_adapters::ListingError;
use mrip_storage::{LockError, TrackerError};
use serde::Serialize;
use thiserror::Error;

/// Pipeline step a file was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Extract,
    Parse,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Parse => "parse",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("creating partition directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing {path}: {message}")]
    Parquet { path: PathBuf, message: String },
    #[error("building record batch: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("reading existing part {path}: {message}")]
    ReadExisting { path: PathBuf, message: String },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Run-level error taxonomy. Fatal variants abort the run; the rest are
/// recorded against one file, which stays untracked for the next run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("listing unavailable for {family}: {source}")]
    ListingUnavailable {
        family: String,
        #[source]
        source: ListingError,
    },
    #[error("tracker unavailable for {family}: {source}")]
    TrackerUnavailable {
        family: String,
        #[source]
        source: TrackerError,
    },
    #[error("run locked: {0}")]
    RunLocked(#[source] LockError),
    #[error("download failed for {file}: {message}")]
    DownloadFailed { file: String, message: String },
    #[error("corrupt archive {file}: {message}")]
    CorruptArchive { file: String, message: String },
    #[error("malformed report in {file}: {message}")]
    MalformedReport { file: String, message: String },
    #[error("{file} produced no rows for {tag}")]
    ParseProducedNoRows { file: String, tag: String },
    #[error("write failed for {file}: {source}")]
    WriteFailure {
        file: String,
        #[source]
        source: WriteError,
    },
}

impl IngestError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::ListingUnavailable { .. }
                | IngestError::TrackerUnavailable { .. }
                | IngestError::RunLocked(_)
        )
    }

    /// Stage of a per-file failure; `None` for run-level errors.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            IngestError::DownloadFailed { .. } => Some(Stage::Download),
            IngestError::CorruptArchive { .. } => Some(Stage::Extract),
            IngestError::MalformedReport { .. } | IngestError::ParseProducedNoRows { .. } => {
                Some(Stage::Parse)
            }
            IngestError::WriteFailure { .. } => Some(Stage::Write),
            _ => None,
        }
    }

    /// Failures that point at bad archive bytes; the cached copy must be fetched again.
    pub fn discards_cached_archive(&self) -> bool {
        matches!(
            self,
            IngestError::CorruptArchive { .. } | IngestError::MalformedReport { .. }
        )
    }
}
