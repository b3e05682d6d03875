//! Durable set of fully-processed source files, one sqlite database per family.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use mrip_core::ProcessedFileRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker store {path} unavailable: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("tracker query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("tracker row for {filename} has unreadable timestamp {value:?}")]
    CorruptTimestamp { filename: String, value: String },
}

#[derive(Debug, Clone)]
pub struct ProcessedFileTracker {
    pool: SqlitePool,
    path: PathBuf,
}

impl ProcessedFileTracker {
    /// Opens (creating if needed) the tracker database and its table.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TrackerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            // Failure here surfaces as Unavailable on connect.
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let unavailable = |source: sqlx::Error| TrackerError::Unavailable {
            path: path.clone(),
            source,
        };

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(unavailable)?;

        let tracker = Self { pool, path };
        tracker.ensure_schema().await.map_err(|err| match err {
            TrackerError::Query(source) => TrackerError::Unavailable {
                path: tracker.path.clone(),
                source,
            },
            other => other,
        })?;
        Ok(tracker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_schema(&self) -> Result<(), TrackerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS processed_files (
                filename TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn contains(&self, filename: &str) -> Result<bool, TrackerError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM processed_files WHERE filename = ?")
                .bind(filename)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Records a file as processed. Re-inserting an existing name is a no-op;
    /// returns whether a new row was written.
    pub async fn insert(&self, filename: &str, processed_at: DateTime<Utc>) -> Result<bool, TrackerError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO processed_files (filename, processed_at) VALUES (?, ?)",
        )
        .bind(filename)
        .bind(processed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        let inserted = result.rows_affected() > 0;
        debug!(filename, inserted, "tracker insert");
        Ok(inserted)
    }

    /// Every processed file, oldest first.
    pub async fn list(&self) -> Result<Vec<ProcessedFileRecord>, TrackerError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT filename, processed_at FROM processed_files ORDER BY processed_at, filename",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(filename, value)| {
                let processed_at = DateTime::parse_from_rfc3339(&value)
                    .map_err(|_| TrackerError::CorruptTimestamp {
                        filename: filename.clone(),
                        value: value.clone(),
                    })?
                    .with_timezone(&Utc);
                Ok(ProcessedFileRecord {
                    filename,
                    processed_at,
                })
            })
            .collect()
    }

    pub async fn count(&self) -> Result<u64, TrackerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_files")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Splits candidate filenames into (untracked, already tracked count), keeping order.
    pub async fn partition_untracked<T, F>(
        &self,
        candidates: Vec<T>,
        filename: F,
    ) -> Result<(Vec<T>, usize), TrackerError>
    where
        F: Fn(&T) -> &str,
    {
        let mut untracked = Vec::with_capacity(candidates.len());
        let mut tracked = 0usize;
        for candidate in candidates {
            if self.contains(filename(&candidate)).await? {
                tracked += 1;
            } else {
                untracked.push(candidate);
            }
        }
        Ok((untracked, tracked))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn insert_is_idempotent_and_listed() {
        let dir = tempdir().expect("tempdir");
        let tracker = ProcessedFileTracker::open(dir.path().join("trackers/trading-price.sqlite"))
            .await
            .expect("open");

        assert!(!tracker.contains("PUBLIC_TRADINGIS_1.zip").await.unwrap());
        let now = Utc::now();
        assert!(tracker.insert("PUBLIC_TRADINGIS_1.zip", now).await.unwrap());
        assert!(!tracker.insert("PUBLIC_TRADINGIS_1.zip", now).await.unwrap());
        assert!(tracker.contains("PUBLIC_TRADINGIS_1.zip").await.unwrap());
        assert_eq!(tracker.count().await.unwrap(), 1);

        let listed = tracker.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, "PUBLIC_TRADINGIS_1.zip");
        assert_eq!(listed[0].processed_at.timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn list_is_oldest_first() {
        let dir = tempdir().expect("tempdir");
        let tracker = ProcessedFileTracker::open(dir.path().join("t.sqlite")).await.unwrap();
        let earlier = Utc::now() - chrono::Duration::hours(2);
        tracker.insert("b.zip", earlier).await.unwrap();
        tracker.insert("c.zip", Utc::now()).await.unwrap();
        tracker.insert("a.zip", Utc::now() + chrono::Duration::hours(1)).await.unwrap();

        let names = tracker
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["b.zip", "c.zip", "a.zip"]);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.sqlite");
        {
            let tracker = ProcessedFileTracker::open(&path).await.unwrap();
            tracker.insert("a.zip", Utc::now()).await.unwrap();
            tracker.close().await;
        }
        let tracker = ProcessedFileTracker::open(&path).await.unwrap();
        assert!(tracker.contains("a.zip").await.unwrap());
    }

    #[tokio::test]
    async fn partition_keeps_candidate_order() {
        let dir = tempdir().expect("tempdir");
        let tracker = ProcessedFileTracker::open(dir.path().join("t.sqlite"))
            .await
            .unwrap();
        tracker.insert("b.zip", Utc::now()).await.unwrap();

        let candidates = vec!["c.zip".to_string(), "b.zip".to_string(), "a.zip".to_string()];
        let (untracked, tracked) = tracker
            .partition_untracked(candidates, |s| s.as_str())
            .await
            .unwrap();
        assert_eq!(untracked, vec!["c.zip".to_string(), "a.zip".to_string()]);
        assert_eq!(tracked, 1);
    }

    #[tokio::test]
    async fn unopenable_path_is_unavailable() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let err = ProcessedFileTracker::open(blocker.join("t.sqlite"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, TrackerError::Unavailable { .. }));
    }
}
