//! Durable single-value checkpoint: the timestamp of the last record the
//! pipeline finished with.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MAX_FALLBACK_WINDOW_MINS;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// File-backed checkpoint. Writes go to a sibling temp file which is synced
/// and renamed over the real one, so a reader sees either the old or the new
/// value, never a torn one.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    fallback_window: Duration,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, fallback_window_mins: i64) -> Self {
        Self {
            path: path.into(),
            fallback_window: Duration::minutes(fallback_window_mins.clamp(0, MAX_FALLBACK_WINDOW_MINS)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The persisted checkpoint, or `now - fallback_window` when there is
    /// none or it cannot be read.
    pub fn load(&self) -> DateTime<Utc> {
        self.load_at(Utc::now())
    }

    fn load_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.read() {
            Some(ts) => ts,
            None => {
                let fallback = now - self.fallback_window;
                debug!(%fallback, "no usable checkpoint, using fallback window");
                fallback
            }
        }
    }

    /// The persisted value only, without fallback.
    pub fn read(&self) -> Option<DateTime<Utc>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to read checkpoint");
                }
                return None;
            }
        };
        match DateTime::parse_from_rfc3339(content.trim()) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint is not a valid timestamp");
                None
            }
        }
    }

    /// Persist `ts`. Returns only after the data and the rename are on disk.
    pub fn save(&self, ts: DateTime<Utc>) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(io_err)?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(io_err)?;
        file.write_all(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true).as_bytes())
            .map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(io_err)?;

        // Persist the directory entry as well; not supported everywhere.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }

        debug!(%ts, path = %self.path.display(), "checkpoint saved");
        Ok(())
    }

    /// [`CheckpointStore::save`] on the blocking pool, for async callers.
    pub async fn commit(&self, ts: DateTime<Utc>) -> Result<(), CheckpointError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save(ts)).await?
    }

    /// Remove the checkpoint so the next load uses the fallback window.
    pub fn reset(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_fallback_window() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint"), 15);
        let now: DateTime<Utc> = "2024-06-01T12:00:00Z".parse().unwrap();

        assert_eq!(store.load_at(now), now - Duration::minutes(15));
        assert!(store.read().is_none());
    }

    #[test]
    fn test_save_then_load_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state").join("checkpoint");
        let ts: DateTime<Utc> = "2024-06-01T11:59:30.250Z".parse().unwrap();

        CheckpointStore::new(&path, 15).save(ts).unwrap();

        let reopened = CheckpointStore::new(&path, 15);
        assert_eq!(reopened.load(), ts);
        assert!(!dir.path().join("state").join("checkpoint.tmp").exists());
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint"), 15);
        let a: DateTime<Utc> = "2024-06-01T10:00:00Z".parse().unwrap();
        let b: DateTime<Utc> = "2024-06-01T11:00:00Z".parse().unwrap();

        store.save(a).unwrap();
        store.save(b).unwrap();
        assert_eq!(store.read(), Some(b));
    }

    #[test]
    fn test_garbage_file_uses_fallback() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("checkpoint");
        std::fs::write(&path, "now-15m").unwrap();
        let store = CheckpointStore::new(&path, 30);
        let now: DateTime<Utc> = "2024-06-01T12:00:00Z".parse().unwrap();

        assert_eq!(store.load_at(now), now - Duration::minutes(30));
    }

    #[test]
    fn test_reset_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint"), 15);
        store.save(Utc::now()).unwrap();
        store.reset().unwrap();
        store.reset().unwrap();
        assert!(store.read().is_none());
    }

    #[test]
    fn test_save_into_unwritable_location_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        // parent is a regular file, so the directory cannot be created
        let store = CheckpointStore::new(blocker.join("checkpoint"), 15);
        assert!(store.save(Utc::now()).is_err());
    }

    #[tokio::test]
    async fn test_commit_from_async_context() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint"), 15);
        let ts: DateTime<Utc> = "2024-06-01T10:00:00Z".parse().unwrap();

        store.commit(ts).await.unwrap();
        assert_eq!(store.read(), Some(ts));

        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let broken = CheckpointStore::new(blocker.join("checkpoint"), 15);
        assert!(matches!(broken.commit(ts).await, Err(CheckpointError::Io { .. })));
    }

    #[test]
    fn test_oversized_window_is_clamped() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint"), i64::MAX);
        let now: DateTime<Utc> = "2024-06-01T12:00:00Z".parse().unwrap();
        assert_eq!(store.load_at(now), now - Duration::minutes(MAX_FALLBACK_WINDOW_MINS));
    }
}
