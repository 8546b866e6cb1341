//! Persistent per-service caches.
//!
//! Every write becomes visible atomically: files are staged in a temporary
//! file next to their destination and persisted with a rename, database rows
//! commit in a single transaction. Writers to the same key are serialized by
//! [`WriteLock`]; a second writer fails with `WriteConflict`.

pub mod grid;
pub mod raster;
pub mod station;

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{BoundingBox, Coordinate, RawSample, TimeRange};
use crate::error::EnviroError;

/// Lock files older than this belong to a crashed loader and are taken over.
const STALE_LOCK_AFTER: Duration = Duration::from_secs(60 * 60);

pub trait CacheStore: Send + Sync {
    type Payload;

    /// Write or overwrite the cached data for this key.
    fn put(
        &self,
        range: &TimeRange,
        extent: &BoundingBox,
        payload: Self::Payload,
    ) -> Result<(), EnviroError>;

    /// Samples of `variable` (source name) intersecting `window` at `coordinate`.
    fn read(
        &self,
        coordinate: &Coordinate,
        window: &TimeRange,
        variable: &str,
    ) -> Result<Vec<RawSample>, EnviroError>;

    fn cache_state(&self) -> Result<CacheState, EnviroError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheState {
    pub entries: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

/// Serializes writers per cache key, within the process and across processes.
#[derive(Debug, Clone, Default)]
pub struct WriteLock {
    in_flight: Arc<Mutex<HashSet<Utf8PathBuf>>>,
}

impl WriteLock {
    pub fn acquire(&self, target: &Utf8Path) -> Result<WriteGuard, EnviroError> {
        let key = target.to_path_buf();
        {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| EnviroError::WriteConflict(target.to_string()))?;
            if !in_flight.insert(key.clone()) {
                return Err(EnviroError::WriteConflict(target.to_string()));
            }
        }
        let lock_path = lock_path(target);
        match create_lock_file(&lock_path) {
            Ok(()) => Ok(WriteGuard {
                in_flight: self.in_flight.clone(),
                key,
                lock_path,
            }),
            Err(err) => {
                if let Ok(mut in_flight) = self.in_flight.lock() {
                    in_flight.remove(&key);
                }
                Err(err)
            }
        }
    }
}

pub struct WriteGuard {
    in_flight: Arc<Mutex<HashSet<Utf8PathBuf>>>,
    key: Utf8PathBuf,
    lock_path: Utf8PathBuf,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.lock_path.as_std_path());
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.key);
        }
    }
}

fn lock_path(target: &Utf8Path) -> Utf8PathBuf {
    let name = target.file_name().unwrap_or("cache");
    target.with_file_name(format!(".{name}.lock"))
}

fn create_lock_file(path: &Utf8Path) -> Result<(), EnviroError> {
    ensure_parent(path)?;
    let open = || {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path())
    };
    match open() {
        Ok(mut file) => {
            let _ = writeln!(file, "{}", std::process::id());
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let stale = fs::metadata(path.as_std_path())
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .is_some_and(|age| age > STALE_LOCK_AFTER);
            if !stale {
                return Err(EnviroError::WriteConflict(path.to_string()));
            }
            tracing::warn!(lock = %path, "taking over stale cache lock");
            fs::remove_file(path.as_std_path())
                .map_err(|err| EnviroError::Filesystem(err.to_string()))?;
            open()
                .map(|_| ())
                .map_err(|_| EnviroError::WriteConflict(path.to_string()))
        }
        Err(err) => Err(EnviroError::Filesystem(err.to_string())),
    }
}

pub(crate) fn ensure_parent(path: &Utf8Path) -> Result<(), EnviroError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| EnviroError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// Stage `content` in a temp file beside `dest`, then rename over it.
pub fn write_bytes_atomic(dest: &Utf8Path, content: &[u8]) -> Result<(), EnviroError> {
    ensure_parent(dest)?;
    let parent = dest
        .parent()
        .ok_or_else(|| EnviroError::Filesystem("invalid destination path".to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".envirocode-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| EnviroError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| EnviroError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| EnviroError::Filesystem(err.to_string()))?;
    temp.persist(dest.as_std_path())
        .map_err(|err| EnviroError::Filesystem(err.to_string()))?;
    Ok(())
}
