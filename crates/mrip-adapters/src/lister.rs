//! Directory-listing scrape and filename date filtering.

use std::collections::HashSet;

use chrono::{Duration, NaiveDate};
use mrip_core::RemoteReportFile;
use mrip_storage::FetchError;
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::ReportSource;

/// Filename date patterns tried in order; named groups `year`, optional `month` and `day`.
pub const DEFAULT_DATE_PATTERNS: &[&str] = &[
    r"(?P<year>20\d{2})(?P<month>\d{2})(?P<day>\d{2})\d{4}",
    r"_(?P<year>20\d{2})(?P<month>\d{2})(?P<day>\d{2})",
    r"_(?P<year>20\d{2})(?P<month>\d{2})",
    r"_(?P<year>20\d{2})",
];

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("listing {url} unavailable: {source}")]
    Unavailable {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("invalid listing url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("invalid date pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Keeps archives whose filename date falls inside a lookback window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateFilter {
    pub lookback_days: i64,
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
    #[serde(default = "default_fallback_latest")]
    pub fallback_latest: usize,
}

fn default_patterns() -> Vec<String> {
    DEFAULT_DATE_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_fallback_latest() -> usize {
    10
}

impl DateFilter {
    pub fn new(lookback_days: i64) -> Self {
        Self {
            lookback_days,
            patterns: default_patterns(),
            fallback_latest: default_fallback_latest(),
        }
    }

    fn compiled(&self) -> Result<Vec<Regex>, ListingError> {
        compile_patterns(&self.patterns)
    }

    /// Files whose extracted date is on or after `today - lookback_days`.
    /// When nothing qualifies, falls back to the last `fallback_latest` by name.
    pub fn apply(
        &self,
        files: Vec<RemoteReportFile>,
        today: NaiveDate,
    ) -> Result<Vec<RemoteReportFile>, ListingError> {
        let patterns = self.compiled()?;
        let cutoff = today - Duration::days(self.lookback_days.max(0));

        let kept = files
            .iter()
            .filter(|file| {
                extract_period_end(&patterns, &file.filename)
                    .map(|end| end >= cutoff)
                    .unwrap_or(false)
            })
            .cloned()
            .collect::<Vec<_>>();

        if !kept.is_empty() {
            info!(kept = kept.len(), total = files.len(), %cutoff, "date filter applied");
            return Ok(kept);
        }

        let mut by_name = files;
        by_name.sort_by(|a, b| a.filename.cmp(&b.filename));
        let skip = by_name.len().saturating_sub(self.fallback_latest);
        let latest = by_name.split_off(skip);
        info!(kept = latest.len(), %cutoff, "no file inside lookback window, using latest by name");
        Ok(latest)
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ListingError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| ListingError::InvalidPattern {
                pattern: p.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

struct DateMatch {
    year: i32,
    month: Option<u32>,
    day: Option<u32>,
}

fn first_match(patterns: &[Regex], filename: &str) -> Option<DateMatch> {
    patterns.iter().find_map(|re| {
        let caps = re.captures(filename)?;
        let year = caps.name("year")?.as_str().parse().ok()?;
        let month = caps.name("month").and_then(|m| m.as_str().parse().ok());
        let day = caps.name("day").and_then(|d| d.as_str().parse().ok());
        let m = DateMatch { year, month, day };
        // Reject digit runs that are not calendar dates.
        m.start().map(|_| m)
    })
}

impl DateMatch {
    fn start(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month.unwrap_or(1), self.day.unwrap_or(1))
    }

    /// Last day covered by the match; a year-only name covers the whole year.
    fn end(&self) -> Option<NaiveDate> {
        match (self.month, self.day) {
            (Some(_), Some(_)) => self.start(),
            (Some(month), None) => {
                let (y, m) = if month == 12 {
                    (self.year + 1, 1)
                } else {
                    (self.year, month + 1)
                };
                NaiveDate::from_ymd_opt(y, m, 1).and_then(|d| d.pred_opt())
            }
            (None, _) => NaiveDate::from_ymd_opt(self.year, 12, 31),
        }
    }
}

fn extract_period_end(patterns: &[Regex], filename: &str) -> Option<NaiveDate> {
    first_match(patterns, filename).and_then(|m| m.end())
}

/// Best-effort publication date from a report filename.
pub fn infer_report_date(filename: &str) -> Option<NaiveDate> {
    let patterns = compile_patterns(&default_patterns()).ok()?;
    first_match(&patterns, filename).and_then(|m| m.start())
}

/// Scrapes archive links from a listing page.
#[derive(Debug, Clone)]
pub struct SourceLister {
    pub listing_url: String,
    pub archive_extension: String,
}

impl SourceLister {
    pub fn new(listing_url: impl Into<String>, archive_extension: impl Into<String>) -> Self {
        Self {
            listing_url: listing_url.into(),
            archive_extension: archive_extension.into(),
        }
    }

    pub async fn list(&self, source: &dyn ReportSource) -> Result<Vec<RemoteReportFile>, ListingError> {
        let body = source
            .fetch_listing(&self.listing_url)
            .await
            .map_err(|source| ListingError::Unavailable {
                url: self.listing_url.clone(),
                source,
            })?;
        let files = self.extract_links(&body)?;
        info!(url = %self.listing_url, files = files.len(), "listing fetched");
        Ok(files)
    }

    /// Anchors whose target ends in the archive extension, resolved against the
    /// listing URL. The first occurrence of a filename wins.
    pub fn extract_links(&self, html: &str) -> Result<Vec<RemoteReportFile>, ListingError> {
        let base = Url::parse(&self.listing_url).map_err(|e| ListingError::InvalidUrl {
            url: self.listing_url.clone(),
            message: e.to_string(),
        })?;
        let document = Html::parse_document(html);
        let anchors = Selector::parse("a[href]").map_err(|e| ListingError::InvalidUrl {
            url: self.listing_url.clone(),
            message: e.to_string(),
        })?;
        let extension = self.archive_extension.to_ascii_lowercase();

        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for anchor in document.select(&anchors) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            if !href.to_ascii_lowercase().ends_with(&extension) {
                continue;
            }
            let Ok(url) = base.join(href) else {
                debug!(href, "skipping unresolvable link");
                continue;
            };
            let Some(filename) = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string())
            else {
                continue;
            };
            if !seen.insert(filename.clone()) {
                continue;
            }
            files.push(RemoteReportFile {
                report_date: infer_report_date(&filename),
                url: url.to_string(),
                filename,
            });
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<html><body><pre>
        <a href="/Reports/Current/TradingIS_Reports/">[To Parent Directory]</a><br>
        <a href="/Reports/Current/TradingIS_Reports/PUBLIC_TRADINGIS_202506010005_0000000466962125.zip">one</a>
        <a href="PUBLIC_TRADINGIS_202506010010_0000000466962400.ZIP">two</a>
        <a href="/Reports/Current/TradingIS_Reports/PUBLIC_TRADINGIS_202506010005_0000000466962125.zip">dup</a>
        <a href="/Reports/Current/TradingIS_Reports/readme.txt">readme</a>
    </pre></body></html>"#;

    fn file(name: &str) -> RemoteReportFile {
        RemoteReportFile {
            url: format!("https://example.test/{name}"),
            filename: name.to_string(),
            report_date: infer_report_date(name),
        }
    }

    #[test]
    fn extracts_archive_links_resolved_against_base() {
        let lister = SourceLister::new(
            "https://nemweb.example/Reports/Current/TradingIS_Reports/",
            ".zip",
        );
        let files = lister.extract_links(LISTING).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(
            files[0].url,
            "https://nemweb.example/Reports/Current/TradingIS_Reports/PUBLIC_TRADINGIS_202506010005_0000000466962125.zip"
        );
        assert_eq!(
            files[0].filename,
            "PUBLIC_TRADINGIS_202506010005_0000000466962125.zip"
        );
        assert_eq!(
            files[0].report_date,
            NaiveDate::from_ymd_opt(2025, 6, 1)
        );
        assert_eq!(
            files[1].filename,
            "PUBLIC_TRADINGIS_202506010010_0000000466962400.ZIP"
        );
    }

    #[test]
    fn date_filter_keeps_files_inside_window() {
        let filter = DateFilter::new(7);
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let files = vec![
            file("PUBLIC_MTPASADUIDAVAILABILITY_20250601_0000.zip"),
            file("PUBLIC_MTPASADUIDAVAILABILITY_20250605_0000.zip"),
            file("PUBLIC_MTPASADUIDAVAILABILITY_202506091200_0000.zip"),
        ];
        let kept = filter.apply(files, today).unwrap();
        let names = kept.iter().map(|f| f.filename.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "PUBLIC_MTPASADUIDAVAILABILITY_20250605_0000.zip",
                "PUBLIC_MTPASADUIDAVAILABILITY_202506091200_0000.zip",
            ]
        );
    }

    #[test]
    fn year_only_names_cover_the_whole_year() {
        let filter = DateFilter::new(30);
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let kept = filter
            .apply(vec![file("MTPASA_2024.zip"), file("MTPASA_2025.zip")], today)
            .unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].filename, "MTPASA_2025.zip");
    }

    #[test]
    fn undated_names_fall_back_to_latest_by_name() {
        let mut filter = DateFilter::new(7);
        filter.fallback_latest = 2;
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let files = vec![file("c.zip"), file("a.zip"), file("b.zip")];
        let kept = filter.apply(files, today).unwrap();
        let names = kept.iter().map(|f| f.filename.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["b.zip", "c.zip"]);
    }

    #[test]
    fn bad_pattern_is_reported() {
        let filter = DateFilter {
            lookback_days: 1,
            patterns: vec!["(".to_string()],
            fallback_latest: 1,
        };
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        assert!(matches!(
            filter.apply(vec![], today),
            Err(ListingError::InvalidPattern { .. })
        ));
    }
}
