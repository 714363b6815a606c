//! Resume ledger
//!
//! Append-only JSON-lines log of per-item, per-stage outcomes under the run's
//! output directory. Every write is fsynced before `mark_outcome` returns; on open
//! the log is replayed and the latest entry for each (item, stage) wins.
//!
//! The log never keeps bytes past the last committed line: a failed append is cut
//! back before anyone else writes, so one bad write cannot corrupt the next entry.

use chrono::{DateTime, Utc};
use idt_common::{Coordinate, DescriptionResult, ItemId, Stage, StageOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// Durable progress could not be recorded; fatal to the run
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    /// An earlier failed append could not be rolled back; the log is read-only
    #[error("Ledger {path} is unusable after a failed write")]
    Poisoned { path: PathBuf },
}

/// Stage output kept alongside a succeeded outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    Description(DescriptionResult),
    Place { place: String, coordinate: Coordinate },
}

/// One line of the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub item_id: ItemId,
    pub stage: Stage,
    pub outcome: StageOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,
    pub recorded_at: DateTime<Utc>,
}

type EntryKey = (ItemId, Stage);

/// Writer-side state, guarded by one mutex so appends never interleave
struct LogState {
    /// File length after the last fsynced line
    committed_len: u64,
    poisoned: bool,
}

pub struct ResumeLedger {
    path: PathBuf,
    entries: RwLock<HashMap<EntryKey, LedgerEntry>>,
    log: Mutex<LogState>,
}

impl ResumeLedger {
    /// Open (creating if needed) and replay the ledger at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let entries = replay(&path).await?;

        let file = open_for_append(&path).await.map_err(|e| io_error(&path, e))?;
        let committed_len = file.metadata().await.map_err(|e| io_error(&path, e))?.len();

        tracing::info!(path = %path.display(), entries = entries.len(), "Resume ledger opened");

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            log: Mutex::new(LogState {
                committed_len,
                poisoned: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the item never needs this stage again (succeeded or skipped)
    pub async fn is_done(&self, item_id: &ItemId, stage: Stage) -> bool {
        self.entries
            .read()
            .await
            .get(&(item_id.clone(), stage))
            .is_some_and(|entry| entry.outcome.is_done())
    }

    pub async fn outcome(&self, item_id: &ItemId, stage: Stage) -> Option<StageOutcome> {
        self.entry(item_id, stage).await.map(|entry| entry.outcome)
    }

    pub async fn entry(&self, item_id: &ItemId, stage: Stage) -> Option<LedgerEntry> {
        self.entries
            .read()
            .await
            .get(&(item_id.clone(), stage))
            .cloned()
    }

    /// Record an outcome
    ///
    /// A no-op (returns `Ok(false)`) when the pair already has a done outcome and
    /// `force` is not set. Otherwise the entry is appended, fsynced, and applied.
    pub async fn mark_outcome(
        &self,
        item_id: &ItemId,
        stage: Stage,
        outcome: StageOutcome,
        payload: Option<StagePayload>,
        force: bool,
    ) -> Result<bool, LedgerError> {
        let key = (item_id.clone(), stage);
        let mut log = self.log.lock().await;
        if log.poisoned {
            return Err(LedgerError::Poisoned {
                path: self.path.clone(),
            });
        }

        if !force {
            let entries = self.entries.read().await;
            if let Some(existing) = entries.get(&key) {
                if existing.outcome.is_done() {
                    tracing::debug!(
                        item_id = %item_id,
                        stage = %stage,
                        existing = existing.outcome.label(),
                        "Outcome already recorded, ignoring"
                    );
                    return Ok(false);
                }
            }
        }

        let entry = LedgerEntry {
            item_id: item_id.clone(),
            stage,
            outcome,
            payload,
            recorded_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        if let Err(source) = self.append(&mut log, &line).await {
            tracing::error!(path = %self.path.display(), error = %source, "Ledger append failed");
            if let Err(e) = self.roll_back(&log).await {
                tracing::error!(path = %self.path.display(), error = %e, "Ledger rollback failed");
                log.poisoned = true;
            }
            return Err(io_error(&self.path, source));
        }

        self.entries.write().await.insert(key, entry);
        Ok(true)
    }

    /// Write one line after the committed end of the log
    async fn append(&self, log: &mut LogState, line: &[u8]) -> std::io::Result<()> {
        let mut file = open_for_append(&self.path).await?;

        let len = file.metadata().await?.len();
        if len != log.committed_len {
            tracing::warn!(
                path = %self.path.display(),
                stray_bytes = len.abs_diff(log.committed_len),
                "Ledger has bytes past the last committed line, cutting back"
            );
            file.set_len(log.committed_len).await?;
        }

        file.write_all(line).await?;
        file.flush().await?;
        file.sync_data().await?;
        log.committed_len += line.len() as u64;
        Ok(())
    }

    /// Drop whatever a failed append left past the committed end
    async fn roll_back(&self, log: &LogState) -> std::io::Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len(log.committed_len).await?;
        file.sync_all().await
    }

    /// Latest entry for every recorded (item, stage), ordered by item then stage
    pub async fn snapshot(&self) -> Vec<LedgerEntry> {
        let mut all: Vec<LedgerEntry> = self.entries.read().await.values().cloned().collect();
        all.sort_by(|a, b| (&a.item_id, a.stage).cmp(&(&b.item_id, b.stage)));
        all
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn open_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

fn io_error(path: &Path, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Rebuild state from the log, cutting off a torn final line
async fn replay(path: &Path) -> Result<HashMap<EntryKey, LedgerEntry>, LedgerError> {
    let mut entries = HashMap::new();

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(io_error(path, e)),
    };

    let complete_len = bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);

    if complete_len < bytes.len() {
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - complete_len,
            "Ledger ends with a partial line (interrupted write), truncating"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| io_error(path, e))?;
        file.set_len(complete_len as u64)
            .await
            .map_err(|e| io_error(path, e))?;
        file.sync_all().await.map_err(|e| io_error(path, e))?;
    }

    let content = String::from_utf8_lossy(&bytes[..complete_len]);
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => {
                entries.insert((entry.item_id.clone(), entry.stage), entry);
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping malformed ledger line"
                );
            }
        }
    }

    Ok(entries)
}
