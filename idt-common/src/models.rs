//! Shared domain types
//!
//! Types that cross component boundaries: the pipeline stages, per-stage outcomes,
//! item identifiers and the plain-data records exchanged with external collaborators
//! (metadata extraction, report writers).

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// One pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Reverse-geocode the item's GPS position into a place name
    Geocode,
    /// Ask the vision provider for a description
    Describe,
}

impl Stage {
    /// Default stage order for a new run
    pub const DEFAULT_ORDER: [Stage; 2] = [Stage::Geocode, Stage::Describe];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Geocode => "geocode",
            Stage::Describe => "describe",
        }
    }

    /// Whether a failure in this stage removes the item from later stages.
    ///
    /// Geocoding only enriches the output; an item whose place lookup failed is
    /// still described.
    pub fn is_gating(&self) -> bool {
        match self {
            Stage::Geocode => false,
            Stage::Describe => true,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "geocode" | "geocoding" => Ok(Stage::Geocode),
            "describe" | "description" => Ok(Stage::Describe),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Outcome of one item in one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Pending,
    Succeeded,
    Failed { reason: String },
    Skipped { reason: String },
}

impl StageOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    /// Terminal for the purposes of resume: the item never needs this stage again
    /// unless the caller forces a re-run. Failed items are retried by later runs.
    pub fn is_done(&self) -> bool {
        matches!(self, StageOutcome::Succeeded | StageOutcome::Skipped { .. })
    }

    /// Terminal for the purposes of stage completion
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageOutcome::Pending)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Pending => "pending",
            StageOutcome::Succeeded => "succeeded",
            StageOutcome::Failed { .. } => "failed",
            StageOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Content-stable item identifier
///
/// Derived from the canonical path, file size and modification time rather than
/// the file content, so that computing it is cheap on resume. Editing a file (new
/// size or mtime) yields a new identifier and therefore a fresh pass through every
/// stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn derive(path: &Path, size: u64, modified_nanos: u128) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(size.to_le_bytes());
        hasher.update(modified_nanos.to_le_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// GPS position in decimal degrees (WGS84)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Flat metadata record produced by the external metadata extractor
///
/// Every field is optional; a missing record is valid and simply disables
/// geocoding and date prefixing for the item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<Coordinate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_model: Option<String>,
}

/// Token accounting reported by a provider (when it reports any)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn total(&self) -> Option<u64> {
        match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
        }
    }
}

/// Output of a successful provider call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionResult {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub prompt_style: String,
    pub latency_ms: u64,
    /// Number of backend calls it took, including the successful one
    pub attempts: u32,
    #[serde(default)]
    pub usage: TokenUsage,
    pub completed_at: DateTime<Utc>,
}
