//! Stage sequencer
//!
//! Drives one workflow run: `NotStarted -> stage[0] -> ... -> stage[n-1] -> Completed`,
//! or `Aborted` from any stage. Each stage fans its pending items out over a
//! bounded worker pool and finishes only when every eligible item has a terminal
//! outcome. Stages gate on whole-stage completion; an item that failed a gating
//! stage does not enter later stages.
//!
//! The ledger is the source of truth for progress: items already done for a stage
//! are not dispatched again unless the run forces that stage.

mod stage_describe;
mod stage_geocode;
mod statistics;

pub use statistics::StageTally;

use crate::error::{RunError, RunResult};
use crate::models::{FinalOutcome, ImageTask, ItemRecord, RunManifest, WorkflowRun};
use crate::services::geocode_cache::GeocodeCache;
use crate::services::provider_gateway::ProviderGateway;
use crate::services::resume_ledger::{LedgerError, ResumeLedger, StagePayload};
use crate::services::status_reporter::StatusReporter;
use crate::utils::RunLock;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use idt_common::{ConfigError, EventBus, RunContext, Stage, StageOutcome, StatusEvent};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stage_describe::DescribeWorker;
use stage_geocode::GeocodeWorker;

/// Result of one stage worker invocation
pub(crate) enum ItemResult {
    /// Terminal outcome to record
    Done {
        outcome: StageOutcome,
        payload: Option<StagePayload>,
        attempts: u32,
        error_kind: Option<String>,
    },
    /// Run cancelled before a terminal outcome; nothing is recorded
    Interrupted { attempts: u32 },
}

/// Per-item operation of one stage
#[async_trait]
pub(crate) trait StageWorker: Send + Sync {
    async fn process(&self, task: &ImageTask, cancel: &CancellationToken) -> ItemResult;
}

/// Terminal state of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Completed,
    Aborted { reason: String },
}

/// What a run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub state: RunState,
    pub stages: Vec<StageTally>,
    pub records: Vec<ItemRecord>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, FinalOutcome::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FinalOutcome::Failed { .. }))
    }

    pub fn pending(&self) -> usize {
        self.count(|o| matches!(o, FinalOutcome::Pending))
    }

    fn count(&self, pred: impl Fn(&FinalOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.final_outcome)).count()
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.state, RunState::Aborted { .. })
    }

    /// 0 = every item succeeded, 2 = completed with failed or unfinished items, 1 = aborted
    pub fn exit_code(&self) -> u8 {
        match self.state {
            RunState::Aborted { .. } => 1,
            RunState::Completed if self.failed() > 0 || self.pending() > 0 => 2,
            RunState::Completed => 0,
        }
    }
}

/// Outcome of one dispatched item, as seen by the pool loop
struct ItemReport {
    outcome: StageOutcome,
}

/// Why a stage pass stopped early
enum StageStop {
    Cancelled,
    Ledger(LedgerError),
}

pub struct StageSequencer {
    ctx: RunContext,
    run: WorkflowRun,
    gateway: Arc<ProviderGateway>,
    geocoder: Option<GeocodeCache>,
    ledger: Arc<ResumeLedger>,
    reporter: Arc<StatusReporter>,
    workers: usize,
    _lock: RunLock,
}

impl StageSequencer {
    /// Claim the run directory and open its manifest, ledger and status stream
    ///
    /// Fails before any work starts on invalid configuration, a run directory held
    /// by another process, or a manifest that disagrees with `run`.
    pub async fn open(
        ctx: RunContext,
        mut run: WorkflowRun,
        gateway: Arc<ProviderGateway>,
        geocoder: Option<GeocodeCache>,
        bus: Option<EventBus>,
        workers: usize,
    ) -> RunResult<Self> {
        if workers == 0 {
            return Err(ConfigError::invalid("run.workers", "must be >= 1").into());
        }
        if run.stages().contains(&Stage::Geocode) && geocoder.is_none() {
            return Err(ConfigError::missing("geocode cache (required by the geocode stage)").into());
        }

        std::fs::create_dir_all(&ctx.output_dir).map_err(|e| RunError::io(&ctx.output_dir, e))?;
        let lock = RunLock::acquire(ctx.lock_path())?;

        RunManifest::load_or_create(&ctx, &mut run, gateway.config())?;
        let ledger = ResumeLedger::open(ctx.ledger_path()).await?;
        let reporter = StatusReporter::open(ctx.status_path(), bus).await?;

        Ok(Self {
            ctx,
            run,
            gateway,
            geocoder,
            ledger: Arc::new(ledger),
            reporter: Arc::new(reporter),
            workers,
            _lock: lock,
        })
    }

    pub fn run(&self) -> &WorkflowRun {
        &self.run
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn ledger(&self) -> &ResumeLedger {
        &self.ledger
    }

    /// Execute every stage over `tasks`
    ///
    /// Item failures, total stage failure, cancellation and ledger write failures
    /// all end in `Ok(summary)`; the summary's state tells them apart.
    pub async fn execute(
        &self,
        tasks: Vec<ImageTask>,
        cancel: &CancellationToken,
    ) -> RunResult<RunSummary> {
        let started = Instant::now();
        let tasks = dedupe(tasks);

        tracing::info!(
            run_id = %self.run.run_id,
            run = %self.run.name,
            items = tasks.len(),
            stages = ?self.run.stages(),
            workers = self.workers,
            "Run started"
        );
        self.reporter
            .emit(StatusEvent::RunStarted {
                run_id: self.run.run_id,
                run_name: self.run.name.clone(),
                stages: self.run.stages().to_vec(),
                item_count: tasks.len(),
                timestamp: Utc::now(),
            })
            .await;

        let mut tallies = Vec::new();
        let mut abort_reason = None;

        for (index, &stage) in self.run.stages().iter().enumerate() {
            if cancel.is_cancelled() {
                abort_reason = Some("cancelled".to_string());
                break;
            }

            let gating_before: Vec<Stage> = self.run.stages()[..index]
                .iter()
                .copied()
                .filter(Stage::is_gating)
                .collect();

            match self.run_stage(stage, &tasks, &gating_before, cancel).await {
                Ok(tally) => {
                    let total_failure = stage.is_gating() && tally.all_failed();
                    tallies.push(tally);
                    if total_failure {
                        abort_reason = Some(format!("stage '{}' failed for every item", stage));
                        break;
                    }
                }
                Err((tally, StageStop::Cancelled)) => {
                    tallies.push(tally);
                    abort_reason = Some(format!("cancelled during stage '{}'", stage));
                    break;
                }
                Err((tally, StageStop::Ledger(e))) => {
                    tallies.push(tally);
                    abort_reason = Some(format!("ledger write failed during stage '{}': {}", stage, e));
                    break;
                }
            }
        }

        let records = self.final_records(&tasks).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let state = match abort_reason {
            Some(reason) => {
                tracing::error!(run_id = %self.run.run_id, reason = %reason, "Run aborted");
                self.reporter
                    .emit(StatusEvent::RunAborted {
                        reason: reason.clone(),
                        timestamp: Utc::now(),
                    })
                    .await;
                RunState::Aborted { reason }
            }
            None => RunState::Completed,
        };

        let summary = RunSummary {
            run_id: self.run.run_id,
            state,
            stages: tallies,
            records,
            duration_ms,
        };

        if !summary.is_aborted() {
            tracing::info!(
                run_id = %self.run.run_id,
                succeeded = summary.succeeded(),
                failed = summary.failed(),
                duration_ms,
                "Run completed"
            );
            self.reporter
                .emit(StatusEvent::RunCompleted {
                    succeeded: summary.succeeded(),
                    failed: summary.failed(),
                    duration_ms,
                    timestamp: Utc::now(),
                })
                .await;
        }

        Ok(summary)
    }

    /// One pass of `stage` over every eligible item
    async fn run_stage(
        &self,
        stage: Stage,
        tasks: &[ImageTask],
        gating_before: &[Stage],
        cancel: &CancellationToken,
    ) -> Result<StageTally, (StageTally, StageStop)> {
        let forced = self.run.is_forced(stage);
        let mut tally = StageTally::new(stage);
        let mut work = Vec::new();

        for task in tasks {
            if !self.is_eligible(task, gating_before).await {
                continue;
            }
            match self.ledger.outcome(&task.id, stage).await {
                Some(outcome) if outcome.is_done() && !forced => tally.record_previous(&outcome),
                _ => work.push(task.clone()),
            }
        }

        tracing::info!(
            stage = %stage,
            pending = work.len(),
            previously_completed = tally.previously_completed,
            forced,
            "Stage started"
        );
        self.reporter
            .emit(StatusEvent::StageStarted {
                stage,
                item_count: work.len(),
                previously_completed: tally.previously_completed,
                timestamp: Utc::now(),
            })
            .await;

        let worker = match self.worker_for(stage) {
            Ok(worker) => worker,
            Err(e) => {
                // Rejected in `open`; unreachable for a sequencer built there
                tracing::error!(stage = %stage, error = %e, "No worker for stage");
                tally.pending += work.len();
                return Err((tally, StageStop::Cancelled));
            }
        };

        let stage_cancel = cancel.child_token();
        let mut queue = work.into_iter();
        let mut jobs = JoinSet::new();
        let mut ledger_failure = None;

        // Seed the pool, then refill one job per completion
        for task in queue.by_ref().take(self.workers) {
            jobs.spawn(self.item_job(Arc::clone(&worker), stage, task, forced, stage_cancel.clone()));
        }

        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(Ok(report)) => tally.record(&report.outcome),
                Ok(Err(e)) => {
                    tracing::error!(stage = %stage, error = %e, "Ledger write failed, stopping stage");
                    tally.pending += 1;
                    stage_cancel.cancel();
                    ledger_failure.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(stage = %stage, error = %e, "Item job did not finish");
                    tally.pending += 1;
                }
            }

            if !stage_cancel.is_cancelled() {
                if let Some(task) = queue.next() {
                    jobs.spawn(self.item_job(Arc::clone(&worker), stage, task, forced, stage_cancel.clone()));
                }
            }
        }
        tally.pending += queue.count();

        if let Some(e) = ledger_failure {
            return Err((tally, StageStop::Ledger(e)));
        }
        if stage_cancel.is_cancelled() {
            tracing::warn!(stage = %stage, pending = tally.pending, "Stage interrupted");
            return Err((tally, StageStop::Cancelled));
        }

        tracing::info!(stage = %stage, "Stage completed: {}", tally.display_string());
        self.reporter
            .emit(StatusEvent::StageCompleted {
                stage,
                succeeded: tally.succeeded,
                failed: tally.failed,
                skipped: tally.skipped,
                previously_completed: tally.previously_completed,
                timestamp: Utc::now(),
            })
            .await;

        Ok(tally)
    }

    fn worker_for(&self, stage: Stage) -> Result<Arc<dyn StageWorker>, ConfigError> {
        match stage {
            Stage::Describe => Ok(Arc::new(DescribeWorker::new(Arc::clone(&self.gateway)))),
            Stage::Geocode => self
                .geocoder
                .clone()
                .map(|cache| Arc::new(GeocodeWorker::new(cache)) as Arc<dyn StageWorker>)
                .ok_or_else(|| ConfigError::missing("geocode cache")),
        }
    }

    /// Passed every earlier gating stage
    async fn is_eligible(&self, task: &ImageTask, gating_before: &[Stage]) -> bool {
        for &stage in gating_before {
            if !self.ledger.is_done(&task.id, stage).await {
                return false;
            }
        }
        true
    }

    /// Future for one item: run the stage operation, record, report
    fn item_job(
        &self,
        worker: Arc<dyn StageWorker>,
        stage: Stage,
        task: ImageTask,
        force: bool,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<ItemReport, LedgerError>> + Send + 'static {
        let ledger = Arc::clone(&self.ledger);
        let reporter = Arc::clone(&self.reporter);

        async move {
            let started = Instant::now();
            // A panicking worker fails its item instead of leaving it unrecorded
            let result = match AssertUnwindSafe(worker.process(&task, &cancel))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(item_id = %task.id, stage = %stage, panic = %message, "Item worker panicked");
                    ItemResult::Done {
                        outcome: StageOutcome::failed(format!("worker panicked: {}", message)),
                        payload: None,
                        attempts: 0,
                        error_kind: Some("worker_panic".to_string()),
                    }
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let (outcome, payload, attempts, error_kind) = match result {
                ItemResult::Done {
                    outcome,
                    payload,
                    attempts,
                    error_kind,
                } => (outcome, payload, attempts, error_kind),
                ItemResult::Interrupted { attempts } => {
                    tracing::debug!(item_id = %task.id, stage = %stage, attempts, "Item left pending");
                    return Ok(ItemReport {
                        outcome: StageOutcome::Pending,
                    });
                }
            };

            let recorded = ledger
                .mark_outcome(&task.id, stage, outcome.clone(), payload, force)
                .await?;
            if !recorded {
                tracing::debug!(item_id = %task.id, stage = %stage, "Ledger already had a done outcome");
            }

            tracing::debug!(
                item_id = %task.id,
                stage = %stage,
                outcome = outcome.label(),
                attempts,
                duration_ms,
                "Item finished"
            );
            reporter
                .emit(StatusEvent::ItemOutcome {
                    item_id: task.id.clone(),
                    path: task.path.display().to_string(),
                    stage,
                    outcome: outcome.clone(),
                    attempts,
                    duration_ms,
                    error_kind,
                    timestamp: Utc::now(),
                })
                .await;

            Ok(ItemReport { outcome })
        }
    }

    /// Final record per item, read back from the ledger
    async fn final_records(&self, tasks: &[ImageTask]) -> Vec<ItemRecord> {
        let mut records = Vec::with_capacity(tasks.len());

        for task in tasks {
            let mut place = None;
            let mut description = None;
            let mut gating_failure = None;
            let mut incomplete = false;

            for &stage in self.run.stages() {
                let entry = self.ledger.entry(&task.id, stage).await;
                let outcome = entry.as_ref().map(|e| &e.outcome);

                match outcome {
                    Some(StageOutcome::Failed { reason }) if stage.is_gating() => {
                        gating_failure.get_or_insert_with(|| format!("{}: {}", stage, reason));
                    }
                    Some(o) if o.is_terminal() => {}
                    _ => incomplete = true,
                }

                match entry.and_then(|e| e.payload) {
                    Some(StagePayload::Place { place: p, .. }) => place = Some(p),
                    Some(StagePayload::Description(d)) => description = Some(d),
                    None => {}
                }
            }

            let final_outcome = match (gating_failure, incomplete) {
                (Some(reason), _) => FinalOutcome::Failed { reason },
                (None, true) => FinalOutcome::Pending,
                (None, false) => FinalOutcome::Succeeded,
            };

            records.push(ItemRecord {
                item_id: task.id.clone(),
                path: task.path.clone(),
                metadata: task.metadata.clone(),
                place,
                description,
                final_outcome,
            });
        }

        records
    }
}

/// Drop repeated item ids, keeping the first occurrence
fn dedupe(tasks: Vec<ImageTask>) -> Vec<ImageTask> {
    let mut seen = HashSet::new();
    let before = tasks.len();
    let unique: Vec<ImageTask> = tasks
        .into_iter()
        .filter(|task| seen.insert(task.id.clone()))
        .collect();
    if unique.len() < before {
        tracing::warn!(duplicates = before - unique.len(), "Ignoring duplicate input items");
    }
    unique
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(outcome: FinalOutcome) -> ItemRecord {
        ItemRecord {
            item_id: "x".into(),
            path: "/x.jpg".into(),
            metadata: None,
            place: None,
            description: None,
            final_outcome: outcome,
        }
    }

    fn summary(state: RunState, outcomes: Vec<FinalOutcome>) -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            state,
            stages: vec![],
            records: outcomes.into_iter().map(record).collect(),
            duration_ms: 0,
        }
    }

    #[test]
    fn test_exit_codes() {
        let ok = summary(RunState::Completed, vec![FinalOutcome::Succeeded]);
        assert_eq!(ok.exit_code(), 0);

        let partial = summary(
            RunState::Completed,
            vec![
                FinalOutcome::Succeeded,
                FinalOutcome::Failed {
                    reason: "auth".to_string(),
                },
            ],
        );
        assert_eq!(partial.exit_code(), 2);

        let aborted = summary(
            RunState::Aborted {
                reason: "cancelled".to_string(),
            },
            vec![FinalOutcome::Pending],
        );
        assert_eq!(aborted.exit_code(), 1);
        assert_eq!(aborted.pending(), 1);

        let unfinished = summary(
            RunState::Completed,
            vec![FinalOutcome::Succeeded, FinalOutcome::Pending],
        );
        assert_eq!(unfinished.exit_code(), 2);
    }

    #[test]
    fn test_panic_message_from_payload() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let formatted: Box<dyn Any + Send> = Box::new(format!("bad index {}", 3));
        let other: Box<dyn Any + Send> = Box::new(42u8);

        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(formatted.as_ref()), "bad index 3");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let tasks = vec![
            ImageTask::with_id("a", "/one.jpg", None),
            ImageTask::with_id("b", "/two.jpg", None),
            ImageTask::with_id("a", "/three.jpg", None),
        ];
        let unique = dedupe(tasks);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].path, std::path::PathBuf::from("/one.jpg"));
    }
}
