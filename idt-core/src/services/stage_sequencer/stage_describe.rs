//! Describe stage: one provider call (with retries) per item

use super::{ItemResult, StageWorker};
use crate::models::ImageTask;
use crate::services::provider_gateway::{DescribeError, ProviderGateway};
use crate::services::resume_ledger::StagePayload;
use async_trait::async_trait;
use idt_common::StageOutcome;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) struct DescribeWorker {
    gateway: Arc<ProviderGateway>,
}

impl DescribeWorker {
    pub(crate) fn new(gateway: Arc<ProviderGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl StageWorker for DescribeWorker {
    async fn process(&self, task: &ImageTask, cancel: &CancellationToken) -> ItemResult {
        match self.gateway.describe(task, cancel).await {
            Ok(result) => ItemResult::Done {
                outcome: StageOutcome::Succeeded,
                attempts: result.attempts,
                error_kind: None,
                payload: Some(StagePayload::Description(result)),
            },
            Err(DescribeError::Failed { error, attempts }) => ItemResult::Done {
                outcome: StageOutcome::failed(error.to_string()),
                attempts,
                error_kind: Some(error.kind.as_str().to_string()),
                payload: None,
            },
            Err(DescribeError::Aborted { attempts }) => ItemResult::Interrupted { attempts },
        }
    }
}
