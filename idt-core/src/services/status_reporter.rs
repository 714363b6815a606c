//! Status reporter
//!
//! Appends each [`StatusEvent`] as one JSON line to `<output_dir>/status.jsonl` and
//! republishes it on an optional [`EventBus`]. A tailing viewer may read the file
//! while it is written: every event is a single self-contained line, so a reader
//! consumes complete lines and resumes from the last newline it saw.

use idt_common::{EventBus, StatusEvent};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};

pub struct StatusReporter {
    path: PathBuf,
    file: Mutex<File>,
    bus: Option<EventBus>,
}

impl StatusReporter {
    pub async fn open(path: impl Into<PathBuf>, bus: Option<EventBus>) -> idt_common::Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await?;

        // A previous process may have died mid-line; start ours on a fresh one
        let len = file.metadata().await?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(std::io::SeekFrom::Start(len - 1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                tracing::warn!(path = %path.display(), "Status file ends mid-line, starting a new line");
                file.write_all(b"\n").await?;
                file.flush().await?;
            }
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            bus,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event; write failures are logged, never returned
    pub async fn emit(&self, event: StatusEvent) {
        match serde_json::to_vec(&event) {
            Ok(mut line) => {
                line.push(b'\n');
                let mut file = self.file.lock().await;
                let written: std::io::Result<()> = async {
                    file.write_all(&line).await?;
                    file.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::warn!(
                        path = %self.path.display(),
                        event = event.name(),
                        error = %e,
                        "Failed to write status event"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(event = event.name(), error = %e, "Failed to encode status event");
            }
        }

        if let Some(bus) = &self.bus {
            bus.emit_lossy(event);
        }
    }

    /// In-process subscription, when the reporter was given a bus
    pub fn subscribe(&self) -> Option<broadcast::Receiver<StatusEvent>> {
        self.bus.as_ref().map(EventBus::subscribe)
    }
}

/// Parse the complete lines of a status file that may still be growing
///
/// Returns the decoded events and the number of bytes consumed; a trailing partial
/// line is left for the next read. Undecodable lines are skipped.
pub fn parse_complete_lines(content: &str) -> (Vec<StatusEvent>, usize) {
    let consumed = content.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let events = content[..consumed]
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping undecodable status line");
                None
            }
        })
        .collect();
    (events, consumed)
}

/// Every complete event currently in a status file
pub fn read_events(path: &Path) -> idt_common::Result<Vec<StatusEvent>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_complete_lines(&content).0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use idt_common::Stage;
    use tempfile::TempDir;

    fn stage_started(count: usize) -> StatusEvent {
        StatusEvent::StageStarted {
            stage: Stage::Describe,
            item_count: count,
            previously_completed: 0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_events_appended_one_per_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.jsonl");
        let reporter = StatusReporter::open(&path, None).await.unwrap();

        reporter.emit(stage_started(3)).await;
        reporter.emit(stage_started(4)).await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with('\n'));
        assert_eq!(read_events(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_partial_trailing_line_left_unconsumed() {
        let full = serde_json::to_string(&stage_started(1)).unwrap();
        let content = format!("{}\n{}", full, &full[..full.len() / 2]);

        let (events, consumed) = parse_complete_lines(&content);
        assert_eq!(events.len(), 1);
        assert_eq!(consumed, full.len() + 1);
    }

    #[tokio::test]
    async fn test_reopen_after_torn_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.jsonl");
        std::fs::write(&path, r#"{"event":"stage_sta"#).unwrap();

        let reporter = StatusReporter::open(&path, None).await.unwrap();
        reporter.emit(stage_started(2)).await;

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "stage_started");
    }

    #[tokio::test]
    async fn test_events_republished_on_bus() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(16);
        let reporter = StatusReporter::open(dir.path().join("status.jsonl"), Some(bus))
            .await
            .unwrap();
        let mut rx = reporter.subscribe().unwrap();

        reporter.emit(stage_started(5)).await;
        match rx.recv().await.unwrap() {
            StatusEvent::StageStarted { item_count, .. } => assert_eq!(item_count, 5),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
