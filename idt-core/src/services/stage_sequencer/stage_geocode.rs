//! Geocode stage: resolve each item's GPS position to a place name
//!
//! Enrichment only. Items without usable coordinates are skipped; lookup failures
//! are recorded as failed so a later run retries them, but they never keep the
//! item out of later stages.

use super::{ItemResult, StageWorker};
use crate::models::ImageTask;
use crate::services::geocode_cache::{CacheError, GeocodeCache};
use crate::services::resume_ledger::StagePayload;
use async_trait::async_trait;
use idt_common::StageOutcome;
use tokio_util::sync::CancellationToken;

pub(crate) struct GeocodeWorker {
    cache: GeocodeCache,
}

impl GeocodeWorker {
    pub(crate) fn new(cache: GeocodeCache) -> Self {
        Self { cache }
    }
}

fn error_kind(error: &CacheError) -> &'static str {
    match error {
        CacheError::InvalidCoordinate(_) => "invalid_coordinate",
        CacheError::Lookup(_) => "lookup_failed",
        CacheError::NoResult(_) => "no_result",
        CacheError::Storage(_) | CacheError::Closed => "cache_storage",
    }
}

#[async_trait]
impl StageWorker for GeocodeWorker {
    async fn process(&self, task: &ImageTask, cancel: &CancellationToken) -> ItemResult {
        let Some(coordinate) = task.gps() else {
            return ItemResult::Done {
                outcome: StageOutcome::skipped("no GPS coordinates"),
                attempts: 0,
                error_kind: None,
                payload: None,
            };
        };

        let resolved = tokio::select! {
            _ = cancel.cancelled() => return ItemResult::Interrupted { attempts: 0 },
            resolved = self.cache.resolve(coordinate) => resolved,
        };

        match resolved {
            Ok(place) => ItemResult::Done {
                outcome: StageOutcome::Succeeded,
                attempts: 1,
                error_kind: None,
                payload: Some(StagePayload::Place { place, coordinate }),
            },
            Err(CacheError::InvalidCoordinate(detail)) => ItemResult::Done {
                outcome: StageOutcome::skipped(format!("invalid GPS coordinates ({})", detail)),
                attempts: 0,
                error_kind: None,
                payload: None,
            },
            Err(error) => {
                tracing::warn!(item_id = %task.id, error = %error, "Geocoding failed, continuing without place");
                ItemResult::Done {
                    outcome: StageOutcome::failed(error.to_string()),
                    attempts: 1,
                    error_kind: Some(error_kind(&error).to_string()),
                    payload: None,
                }
            }
        }
    }
}
