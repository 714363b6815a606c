//! Error types for idt-core
//!
//! Component-local errors (`ProviderError`, `CacheError`, `LedgerError`,
//! `ScanError`) live next to their components. `RunError` is what stops a run
//! before or while it executes.

use crate::services::resume_ledger::LedgerError;
use idt_common::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal run error
#[derive(Debug, Error)]
pub enum RunError {
    /// Invalid or inconsistent configuration; no work was started
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Another process holds the run directory
    #[error("Run directory is in use by another process (lock: {path})")]
    RunLocked { path: PathBuf },

    /// Durable progress could not be recorded
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Filesystem error on run-owned state
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Status stream could not be opened
    #[error(transparent)]
    Common(#[from] idt_common::Error),

    /// Run manifest could not be encoded or decoded
    #[error("Run manifest {path} is unreadable: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl RunError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for run-level operations
pub type RunResult<T> = Result<T, RunError>;
