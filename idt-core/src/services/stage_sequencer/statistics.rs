//! Per-stage outcome counts

use idt_common::{Stage, StageOutcome};
use serde::{Deserialize, Serialize};

/// Counts for one stage pass over its eligible population
///
/// `succeeded`, `failed` and `skipped` include items that were already done
/// before this pass (also counted in `previously_completed`). `pending` counts
/// items that never reached a terminal outcome because the run stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTally {
    pub stage: Option<Stage>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub previously_completed: usize,
}

impl StageTally {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: &StageOutcome) {
        match outcome {
            StageOutcome::Succeeded => self.succeeded += 1,
            StageOutcome::Failed { .. } => self.failed += 1,
            StageOutcome::Skipped { .. } => self.skipped += 1,
            StageOutcome::Pending => self.pending += 1,
        }
    }

    /// An item the ledger already had as done
    pub fn record_previous(&mut self, outcome: &StageOutcome) {
        self.previously_completed += 1;
        self.record(outcome);
    }

    /// Items in the stage's eligible population
    pub fn population(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.pending
    }

    /// Every eligible item failed (and there was at least one)
    pub fn all_failed(&self) -> bool {
        self.failed > 0 && self.failed == self.population()
    }

    pub fn display_string(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} skipped ({} from earlier runs)",
            self.succeeded, self.failed, self.skipped, self.previously_completed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_failed_requires_whole_population() {
        let mut tally = StageTally::new(Stage::Describe);
        assert!(!tally.all_failed());

        tally.record(&StageOutcome::failed("x"));
        tally.record(&StageOutcome::failed("y"));
        assert!(tally.all_failed());

        tally.record_previous(&StageOutcome::Succeeded);
        assert!(!tally.all_failed());
        assert_eq!(tally.population(), 3);
        assert_eq!(tally.previously_completed, 1);
    }

    #[test]
    fn test_pending_prevents_total_failure() {
        let mut tally = StageTally::new(Stage::Describe);
        tally.record(&StageOutcome::failed("x"));
        tally.record(&StageOutcome::Pending);
        assert!(!tally.all_failed());
    }
}
