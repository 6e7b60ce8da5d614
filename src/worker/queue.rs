//! Durable on-disk queue for async-accepted ingestion requests.
//!
//! Entries live under `<data_dir>/queue/`, one JSON file each, named by
//! arrival time so drains process oldest first. Enqueue is an
//! exclusive-create plus fsync, so an accepted request survives a crash;
//! entries are deleted only after the pipeline has processed them.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// A spooled ingestion request.
///
/// The body is kept verbatim so the signature still verifies at drain time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub body: String,
    #[serde(default)]
    pub shop_domain: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// One claimed entry: the request plus the file backing it.
#[derive(Debug)]
pub struct QueueEntry {
    pub request: QueuedRequest,
    path: PathBuf,
}

impl QueueEntry {
    /// Removes the entry after successful processing.
    pub fn remove(self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}

/// The on-disk ingest queue.
#[derive(Debug, Clone)]
pub struct IngestQueue {
    dir: PathBuf,
}

impl IngestQueue {
    /// Creates a queue rooted at `<data_dir>/queue`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: data_dir.into().join("queue"),
        }
    }

    /// Durably spools one request.
    pub fn enqueue(&self, request: &QueuedRequest) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let name = format!("{}-{}.json", request.received_at.timestamp_millis(), request.id);
        let path = self.dir.join(name);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(
            &serde_json::to_vec(request)
                .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?,
        )?;
        file.sync_all()?;

        let dir = OpenOptions::new().read(true).open(&self.dir)?;
        dir.sync_all()
    }

    /// Returns up to `limit` entries, oldest first.
    ///
    /// Unparseable entries are logged and skipped, never fatal for a drain.
    pub fn claim(&self, limit: usize) -> io::Result<Vec<QueueEntry>> {
        let mut paths = match self.sorted_paths() {
            Ok(paths) => paths,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        paths.truncate(limit);

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                // Claimed by a concurrent drain; the lock normally prevents
                // this, but a removed file is not worth failing over.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            match serde_json::from_slice(&bytes) {
                Ok(request) => entries.push(QueueEntry { request, path }),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable queue entry");
                }
            }
        }
        Ok(entries)
    }

    /// Deletes entries older than `max_age`. Returns how many were removed.
    pub fn purge_stale(&self, max_age: Duration) -> io::Result<usize> {
        let paths = match self.sorted_paths() {
            Ok(paths) => paths,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let mut purged = 0;
        for path in paths {
            if entry_timestamp(&path).is_some_and(|ts| ts < cutoff) {
                fs::remove_file(&path)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Number of entries currently queued.
    pub fn len(&self) -> io::Result<usize> {
        match self.sorted_paths() {
            Ok(paths) => Ok(paths.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err),
        }
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    fn sorted_paths(&self) -> io::Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

/// Parses the arrival timestamp out of an entry file name.
fn entry_timestamp(path: &Path) -> Option<i64> {
    path.file_name()?
        .to_str()?
        .split('-')
        .next()?
        .parse()
        .ok()
}

/// Builds a fresh queued request from raw ingestion parts.
pub fn queued_request(
    body: String,
    shop_domain: Option<String>,
    origin: Option<String>,
    referer: Option<String>,
    signature: Option<String>,
) -> QueuedRequest {
    QueuedRequest {
        id: Uuid::new_v4().to_string(),
        received_at: Utc::now(),
        body,
        shop_domain,
        origin,
        referer,
        signature,
    }
}
