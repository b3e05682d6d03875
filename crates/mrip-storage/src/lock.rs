//! Single-run exclusion via a lock file in the data directory.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds {path} (since {age_secs}s ago)")]
    Held { path: PathBuf, age_secs: u64 },
    #[error("run {run_id} no longer holds {path}")]
    Lost { path: PathBuf, run_id: String },
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held for the duration of a sync run; the file is removed on drop while it
/// still carries this run's id.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    run_id: String,
}

impl RunLock {
    /// Creates the lock file exclusively. A lock older than `stale_after` is
    /// assumed to belong to a crashed run and is taken over.
    pub fn acquire(path: impl AsRef<Path>, run_id: &str, stale_after: Duration) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        match Self::create(&path, run_id) {
            Ok(()) => return Ok(Self::owned(path, run_id)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => return Err(io_err(err)),
        }

        let age = lock_age(&path).map_err(io_err)?;
        if age < stale_after {
            return Err(LockError::Held {
                path,
                age_secs: age.as_secs(),
            });
        }

        warn!(path = %path.display(), age_secs = age.as_secs(), "taking over stale run lock");
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(err)),
        }
        match Self::create(&path, run_id) {
            Ok(()) => Ok(Self::owned(path, run_id)),
            // Another process won the takeover race.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(LockError::Held {
                path,
                age_secs: 0,
            }),
            Err(err) => Err(io_err(err)),
        }
    }

    fn owned(path: PathBuf, run_id: &str) -> Self {
        Self {
            path,
            run_id: run_id.to_string(),
        }
    }

    fn create(path: &Path, run_id: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "run_id={run_id}")?;
        writeln!(file, "pid={}", std::process::id())?;
        writeln!(file, "started_at={}", Utc::now().to_rfc3339())?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Whether the file on disk still names this run.
    pub fn is_owned(&self) -> bool {
        fs::read_to_string(&self.path)
            .map(|contents| lock_owner(&contents) == Some(self.run_id.as_str()))
            .unwrap_or(false)
    }

    /// Bumps the lock file's mtime so a long run is not mistaken for a stale one.
    pub fn refresh(&self) -> Result<(), LockError> {
        if !self.is_owned() {
            return Err(LockError::Lost {
                path: self.path.clone(),
                run_id: self.run_id.clone(),
            });
        }
        OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|file| file.set_modified(SystemTime::now()))
            .map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.is_owned() {
            let _ = fs::remove_file(&self.path);
        } else {
            warn!(
                path = %self.path.display(),
                run_id = %self.run_id,
                "run lock was taken over; leaving it in place"
            );
        }
    }
}

fn lock_owner(contents: &str) -> Option<&str> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("run_id="))
        .map(str::trim)
}

fn lock_age(path: &Path) -> std::io::Result<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mrip.lock");
        let stale = Duration::from_secs(3600);

        let first = RunLock::acquire(&path, "run-1", stale).expect("first lock");
        let err = RunLock::acquire(&path, "run-2", stale).expect_err("second lock");
        assert!(matches!(err, LockError::Held { .. }));

        drop(first);
        assert!(!path.exists());
        let again = RunLock::acquire(&path, "run-3", stale).expect("after release");
        let contents = std::fs::read_to_string(again.path()).unwrap();
        assert!(contents.contains("run_id=run-3"));
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mrip.lock");
        std::fs::write(&path, "run_id=crashed\n").unwrap();

        let lock = RunLock::acquire(&path, "run-new", Duration::ZERO).expect("takeover");
        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert!(contents.contains("run_id=run-new"));
    }

    #[test]
    fn dropping_a_taken_over_lock_keeps_the_new_owner() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mrip.lock");
        let hour = Duration::from_secs(3600);

        let slow = RunLock::acquire(&path, "run-a", hour).expect("run a");
        let takeover = RunLock::acquire(&path, "run-b", Duration::ZERO).expect("run b");
        assert!(!slow.is_owned());
        assert!(takeover.is_owned());
        assert!(matches!(slow.refresh(), Err(LockError::Lost { .. })));

        drop(slow);
        assert!(path.exists());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("run_id=run-b"));

        let err = RunLock::acquire(&path, "run-c", hour).expect_err("run c");
        assert!(matches!(err, LockError::Held { .. }));

        drop(takeover);
        assert!(!path.exists());
    }

    #[test]
    fn refresh_resets_lock_age() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mrip.lock");
        let lock = RunLock::acquire(&path, "run-1", Duration::from_secs(3600)).expect("lock");

        let old = SystemTime::now() - Duration::from_secs(7200);
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();
        assert!(lock_age(&path).unwrap() >= Duration::from_secs(7000));

        lock.refresh().expect("refresh");
        assert!(lock_age(&path).unwrap() < Duration::from_secs(60));
        let err = RunLock::acquire(&path, "run-2", Duration::from_secs(3600)).expect_err("held");
        assert!(matches!(err, LockError::Held { .. }));
    }
}
