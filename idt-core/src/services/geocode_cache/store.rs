//! Persistence for the geocode cache
//!
//! All writes in a process go through one writer task. Each write takes an
//! exclusive lock on `<cache>.lock`, re-reads the file so entries added by other
//! processes survive, and replaces the file atomically.

use super::{CacheError, GeocodeEntry};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

pub(crate) type EntryMap = BTreeMap<String, GeocodeEntry>;

const WRITER_QUEUE_DEPTH: usize = 64;

enum WriteCommand {
    Put {
        key: String,
        entry: GeocodeEntry,
        reply: oneshot::Sender<Result<(), CacheError>>,
    },
}

/// Handle to the writer task; the task exits once every handle is dropped
#[derive(Clone)]
pub(crate) struct StoreWriter {
    tx: mpsc::Sender<WriteCommand>,
}

impl StoreWriter {
    pub(crate) fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        tokio::spawn(run_writer(path, rx));
        Self { tx }
    }

    /// Persist one entry; returns once it is on disk
    pub(crate) async fn put(&self, key: String, entry: GeocodeEntry) -> Result<(), CacheError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(WriteCommand::Put { key, entry, reply })
            .await
            .map_err(|_| CacheError::Closed)?;
        done.await.map_err(|_| CacheError::Closed)?
    }
}

async fn run_writer(path: PathBuf, mut rx: mpsc::Receiver<WriteCommand>) {
    tracing::debug!(path = %path.display(), "Geocode cache writer started");

    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Put { key, entry, reply } => {
                let target = path.clone();
                let result = tokio::task::spawn_blocking(move || write_entry(&target, key, entry))
                    .await
                    .unwrap_or_else(|e| Err(CacheError::Storage(format!("writer task failed: {}", e))));

                if let Err(e) = &result {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to persist geocode entry");
                }
                let _ = reply.send(result);
            }
        }
    }

    tracing::debug!(path = %path.display(), "Geocode cache writer stopped");
}

pub(crate) fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn storage_error(path: &Path, err: impl std::fmt::Display) -> CacheError {
    CacheError::Storage(format!("{}: {}", path.display(), err))
}

/// Read the cache file; a missing file is an empty cache
///
/// A file that does not parse is treated as empty (it is a memoization cache) and
/// will be replaced by the next write.
pub(crate) fn load(path: &Path) -> Result<EntryMap, CacheError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(EntryMap::new()),
        Err(e) => return Err(storage_error(path, e)),
    };

    if content.trim().is_empty() {
        return Ok(EntryMap::new());
    }

    match serde_json::from_str(&content) {
        Ok(map) => Ok(map),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Geocode cache file is unreadable, starting empty");
            Ok(EntryMap::new())
        }
    }
}

fn write_entry(path: &Path, key: String, entry: GeocodeEntry) -> Result<(), CacheError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| storage_error(&dir, e))?;

    let lock_path = lock_path(path);
    let lock_file: File = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| storage_error(&lock_path, e))?;
    lock_file.lock().map_err(|e| storage_error(&lock_path, e))?;

    let mut map = load(path)?;
    map.insert(key, entry);

    let tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| storage_error(&dir, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, &map).map_err(|e| storage_error(path, e))?;
        writer.flush().map_err(|e| storage_error(path, e))?;
    }
    tmp.as_file().sync_all().map_err(|e| storage_error(path, e))?;
    tmp.persist(path).map_err(|e| storage_error(path, e.error))?;

    lock_file.unlock().map_err(|e| storage_error(&lock_path, e))?;
    Ok(())
}
