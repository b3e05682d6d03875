//! Report source contracts plus the listing, archive, dialect and normalisation stages.

use std::sync::Arc;

use async_trait::async_trait;
use mrip_storage::{ArchiveFetcher, FetchError, HttpFetcher};

pub mod archive;
pub mod lister;
pub mod normalize;
pub mod parser;

pub use archive::{ArchiveError, ArchiveExtractor, MemberData, ReportMember};
pub use lister::{DateFilter, ListingError, SourceLister};
pub use normalize::{parse_timestamp, NormalizeStats, NormalizedBatch, Normalizer, TimestampStrategy};
pub use parser::{ParseError, ParsedReport, RecordParser, ReportSection};

pub const CRATE_NAME: &str = "mrip-adapters";

/// Network seam of the pipeline: listing pages and archive bytes.
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Returns the listing document body for `url`; non-success statuses are errors.
    async fn fetch_listing(&self, url: &str) -> Result<String, FetchError>;

    async fn fetch_archive(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// `ReportSource` backed by the shared HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpReportSource {
    http: Arc<HttpFetcher>,
}

impl HttpReportSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ReportSource for HttpReportSource {
    async fn fetch_listing(&self, url: &str) -> Result<String, FetchError> {
        let response = self.http.fetch_bytes(url).await?;
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }

    async fn fetch_archive(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Ok(self.http.fetch_bytes(url).await?.body)
    }
}

/// Lets any `ReportSource` feed the download manager.
pub struct SourceArchives(pub Arc<dyn ReportSource>);

#[async_trait]
impl ArchiveFetcher for SourceArchives {
    async fn fetch_archive(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.0.fetch_archive(url).await
    }
}
