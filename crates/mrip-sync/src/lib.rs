//! Sync pipeline orchestration: list, download, extract, parse, normalise,
//! write partitioned parquet, track.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod reports;
pub mod status;
pub mod writer;

pub const CRATE_NAME: &str = "mrip-sync";

pub use config::{FamilyConfig, ReportsFile, SyncConfig};
pub use error::{IngestError, Stage, WriteError};
pub use pipeline::{
    run_sync_once_from_env, FamilyRunSummary, FileReport, FileState, RunSummary, SyncPipeline,
};
pub use reports::{write_reports, ParquetManifest, ParquetManifestFile};
pub use status::{dataset_status, PartitionStatus};
pub use writer::{part_file_name, PartitionedWriter, WriteOutcome};
