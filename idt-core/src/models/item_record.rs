//! Final per-item record handed to report writers

use idt_common::{DescriptionResult, ItemId, MetadataRecord};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How an item ended up after the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FinalOutcome {
    /// Every gating stage succeeded or was skipped
    Succeeded,
    /// A gating stage failed
    Failed { reason: String },
    /// The run stopped before the item reached a terminal outcome
    Pending,
}

impl FinalOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FinalOutcome::Succeeded)
    }
}

/// `{path, metadata?, description?, final_outcome}` for one input file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_id: ItemId,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataRecord>,
    /// Resolved place name, when geocoding succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<DescriptionResult>,
    pub final_outcome: FinalOutcome,
}

impl ItemRecord {
    /// Location/date prefix, e.g. `"Austin, Texas Mar 5, 2024"`
    ///
    /// `None` when neither a place nor a capture date is known.
    pub fn caption_prefix(&self) -> Option<String> {
        let date = self
            .metadata
            .as_ref()
            .and_then(|m| m.captured_at)
            .map(|ts| ts.format("%b %-d, %Y").to_string());

        match (self.place.as_deref(), date) {
            (Some(place), Some(date)) => Some(format!("{} {}", place, date)),
            (Some(place), None) => Some(place.to_string()),
            (None, Some(date)) => Some(date),
            (None, None) => None,
        }
    }

    /// Description text with the location/date prefix applied
    pub fn captioned_text(&self) -> Option<String> {
        let description = self.description.as_ref()?;
        let text = description.text.trim();
        Some(match self.caption_prefix() {
            Some(prefix) => format!("{}: {}", prefix, text),
            None => text.to_string(),
        })
    }
}
