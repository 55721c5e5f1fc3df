use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::catalog::TuningStep;
use crate::executor::execute;
use crate::probe::HostProfile;
use crate::report::{RunOutcome, RunReport, StepOutcome, StepResult};
use crate::tuner::SystemTuner;

/// Drives the catalog through the executor in fixed order.
///
/// Sequential by design: the steps mutate host-global kernel state where
/// concurrent writers could race. Cancellation is honored between steps
/// only; already-applied steps stay applied (each is idempotent and
/// re-runnable, so nothing is rolled back).
pub struct PipelineRunner {
    cancel: Option<Arc<AtomicBool>>,
    dry_run: bool,
}

impl PipelineRunner {
    pub fn new() -> Self {
        Self {
            cancel: None,
            dry_run: false,
        }
    }

    /// Flag checked before each step; setting it stops the run without
    /// interrupting the step in flight.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Probe and filter only; no apply is ever invoked.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn run(
        &self,
        catalog: &[TuningStep],
        profile: &HostProfile,
        tuner: &dyn SystemTuner,
    ) -> RunReport {
        let mut results = Vec::with_capacity(catalog.len());
        let mut partial = false;

        for step in catalog {
            if let Some(cancel) = &self.cancel {
                if cancel.load(Ordering::SeqCst) {
                    info!(next_step = step.id, "run_cancelled_between_steps");
                    break;
                }
            }

            let result = if self.dry_run {
                if step.platforms.contains(&profile.platform) {
                    StepResult::skipped(step.id, step.description, "dry-run")
                } else {
                    StepResult::skipped(step.id, step.description, "platform-mismatch")
                }
            } else {
                execute(step, profile, tuner)
            };

            match &result.outcome {
                StepOutcome::Applied => {
                    info!(step = step.id, "step_applied");
                }
                StepOutcome::Skipped { reason } => {
                    info!(step = step.id, reason = %reason, "step_skipped");
                }
                StepOutcome::Failed { cause, fatal } => {
                    info!(step = step.id, fatal, cause = %cause, "step_failed");
                    partial = true;
                }
            }

            let fatal_failure = result.is_fatal_failure();
            let step_id = result.step_id.clone();
            results.push(result);

            if fatal_failure {
                return RunReport {
                    results,
                    outcome: RunOutcome::Aborted { step_id },
                };
            }
        }

        let outcome = if partial {
            RunOutcome::PartialSuccess
        } else {
            RunOutcome::Success
        };
        RunReport { results, outcome }
    }
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{catalog, CatalogOptions};
    use crate::probe::Platform;
    use crate::tuner::tests::MockTuner;
    use std::collections::BTreeMap;

    fn linux_profile() -> HostProfile {
        HostProfile {
            platform: Platform::Linux,
            primary_interface: Some("eth0".to_string()),
            is_wireless: false,
            tools: BTreeMap::new(),
        }
    }

    fn steps() -> Vec<crate::catalog::TuningStep> {
        catalog(&CatalogOptions::default())
    }

    fn outcome_of<'a>(report: &'a RunReport, id: &str) -> Option<&'a StepOutcome> {
        report
            .results
            .iter()
            .find(|r| r.step_id == id)
            .map(|r| &r.outcome)
    }

    #[test]
    fn clean_run_is_success() {
        let tuner = MockTuner::new();
        let report = PipelineRunner::new().run(&steps(), &linux_profile(), &tuner);

        assert_eq!(report.outcome, RunOutcome::Success);
        // Darwin entries skip as platform mismatches, nothing fails.
        assert!(report
            .results
            .iter()
            .all(|r| !matches!(r.outcome, StepOutcome::Failed { .. })));
        assert_eq!(report.results.len(), steps().len());
    }

    #[test]
    fn fatal_first_step_aborts_before_later_steps() {
        let tuner = MockTuner::new();
        tuner.fail("set_adaptive_coalescing");
        let report = PipelineRunner::new().run(&steps(), &linux_profile(), &tuner);

        assert_eq!(
            report.outcome,
            RunOutcome::Aborted {
                step_id: "adaptive-coalescing".to_string()
            }
        );
        assert_eq!(report.results.len(), 1);
        assert!(outcome_of(&report, "ring-expansion").is_none());
        assert!(!tuner.called("ring_limits"));
    }

    #[test]
    fn driver_rejection_of_coalescing_aborts_run() {
        let tuner = MockTuner::new();
        tuner.mark_unsupported("set_adaptive_coalescing");
        let report = PipelineRunner::new().run(&steps(), &linux_profile(), &tuner);

        assert_eq!(
            report.outcome,
            RunOutcome::Aborted {
                step_id: "adaptive-coalescing".to_string()
            }
        );
        assert_eq!(report.results.len(), 1);
        assert!(!tuner.called("ring_limits"));
    }

    #[test]
    fn tolerable_failure_continues_to_partial_success() {
        let tuner = MockTuner::new();
        tuner.fail("ring_limits");
        let report = PipelineRunner::new().run(&steps(), &linux_profile(), &tuner);

        assert_eq!(report.outcome, RunOutcome::PartialSuccess);
        assert!(matches!(
            outcome_of(&report, "ring-expansion"),
            Some(StepOutcome::Failed { fatal: false, .. })
        ));
        // Steps 3-10 were still attempted.
        assert!(outcome_of(&report, "congestion-control").is_some());
        assert!(tuner.called("load_module"));
    }

    #[test]
    fn second_run_never_degrades_applied_steps() {
        let tuner = MockTuner::new();
        let profile = linux_profile();
        let catalog = steps();

        let first = PipelineRunner::new().run(&catalog, &profile, &tuner);
        assert_eq!(first.outcome, RunOutcome::Success);
        let applied_ids: Vec<String> = first
            .results
            .iter()
            .filter(|r| r.outcome == StepOutcome::Applied)
            .map(|r| r.step_id.clone())
            .collect();
        assert!(applied_ids.contains(&"latency-hold".to_string()));

        let second = PipelineRunner::new().run(&catalog, &profile, &tuner);
        assert_eq!(second.outcome, RunOutcome::Success);
        for id in &applied_ids {
            let outcome = outcome_of(&second, id).unwrap();
            assert!(
                matches!(outcome, StepOutcome::Applied | StepOutcome::Skipped { .. }),
                "step {id} degraded on re-run: {outcome:?}"
            );
        }
        // The hold and the ring expansion turn into skips once in effect.
        assert!(matches!(
            outcome_of(&second, "latency-hold"),
            Some(StepOutcome::Skipped { .. })
        ));
        assert!(matches!(
            outcome_of(&second, "ring-expansion"),
            Some(StepOutcome::Skipped { .. })
        ));
    }

    #[test]
    fn cancellation_stops_before_next_step() {
        let tuner = MockTuner::new();
        let cancel = Arc::new(AtomicBool::new(true));
        let report = PipelineRunner::new()
            .with_cancel(cancel)
            .run(&steps(), &linux_profile(), &tuner);

        assert!(report.results.is_empty());
        assert_eq!(report.outcome, RunOutcome::Success);
        assert!(tuner.calls().is_empty());
    }

    #[test]
    fn dry_run_invokes_nothing() {
        let tuner = MockTuner::new();
        let report = PipelineRunner::new()
            .dry_run()
            .run(&steps(), &linux_profile(), &tuner);

        assert!(tuner.calls().is_empty());
        assert_eq!(report.results.len(), steps().len());
        assert!(matches!(
            outcome_of(&report, "adaptive-coalescing"),
            Some(StepOutcome::Skipped { reason }) if reason == "dry-run"
        ));
        assert!(matches!(
            outcome_of(&report, "darwin-maxsockbuf"),
            Some(StepOutcome::Skipped { reason }) if reason == "platform-mismatch"
        ));
    }
}
