use tracing::warn;

use crate::catalog::{ApplyOutcome, TuningStep};
use crate::probe::HostProfile;
use crate::report::StepResult;
use crate::tuner::SystemTuner;

/// Apply one step against the probed host.
///
/// Never raises past its own boundary: every error is folded into the
/// returned [`StepResult`]. Platform mismatches skip without invoking
/// apply; a verify failure is informational and does not downgrade an
/// Applied result, since some knobs cannot be read back reliably.
pub fn execute(step: &TuningStep, profile: &HostProfile, tuner: &dyn SystemTuner) -> StepResult {
    if !step.platforms.contains(&profile.platform) {
        return StepResult::skipped(step.id, step.description, "platform-mismatch");
    }

    match (step.apply)(tuner, profile) {
        Ok(ApplyOutcome::Done) => {
            let observed = step.verify.as_ref().and_then(|verify| {
                match verify(tuner, profile) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!(step = step.id, error = %err, "verify_failed");
                        None
                    }
                }
            });
            StepResult::applied(step.id, step.description, observed)
        }
        Ok(ApplyOutcome::Skipped(reason)) => StepResult::skipped(step.id, step.description, reason),
        // Gaps detectable in advance are reported as Skipped by the step
        // itself; an error surfacing here means the host was attempted and
        // rejected the mutation, which is a failure.
        Err(err) => StepResult::failed(step.id, step.description, err.to_string(), step.fatal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{catalog, CatalogOptions};
    use crate::probe::Platform;
    use crate::report::StepOutcome;
    use crate::tuner::tests::MockTuner;
    use std::collections::BTreeMap;

    fn profile(platform: Platform) -> HostProfile {
        HostProfile {
            platform,
            primary_interface: Some("eth0".to_string()),
            is_wireless: false,
            tools: BTreeMap::new(),
        }
    }

    #[test]
    fn platform_mismatch_skips_without_invoking_apply() {
        let tuner = MockTuner::new();
        let steps = catalog(&CatalogOptions::default());
        let darwin_profile = profile(Platform::Darwin);

        for step in steps.iter().filter(|s| s.platforms.contains(&Platform::Linux)) {
            let result = execute(step, &darwin_profile, &tuner);
            assert_eq!(
                result.outcome,
                StepOutcome::Skipped {
                    reason: "platform-mismatch".to_string()
                },
                "step {}",
                step.id
            );
        }
        assert!(tuner.calls().is_empty());
    }

    #[test]
    fn fatal_step_failure_is_marked_fatal() {
        let tuner = MockTuner::new();
        tuner.fail("set_adaptive_coalescing");
        let steps = catalog(&CatalogOptions::default());
        let step = steps.iter().find(|s| s.id == "adaptive-coalescing").unwrap();

        let result = execute(step, &profile(Platform::Linux), &tuner);
        assert!(result.is_fatal_failure());
    }

    #[test]
    fn tolerable_step_failure_is_not_fatal() {
        let tuner = MockTuner::new();
        tuner.fail("set_hugepage_mode");
        let steps = catalog(&CatalogOptions::default());
        let step = steps.iter().find(|s| s.id == "hugepages").unwrap();

        let result = execute(step, &profile(Platform::Linux), &tuner);
        assert!(matches!(
            result.outcome,
            StepOutcome::Failed { fatal: false, .. }
        ));
    }

    #[test]
    fn capability_gap_discovered_mid_apply_is_failure() {
        let tuner = MockTuner::new();
        tuner.mark_unsupported("exempt_udp_from_conntrack");
        let steps = catalog(&CatalogOptions::default());
        let step = steps.iter().find(|s| s.id == "conntrack-bypass").unwrap();

        let result = execute(step, &profile(Platform::Linux), &tuner);
        assert!(matches!(
            result.outcome,
            StepOutcome::Failed { fatal: false, .. }
        ));
    }

    #[test]
    fn driver_rejection_of_adaptive_coalescing_is_fatal() {
        let tuner = MockTuner::new();
        tuner.mark_unsupported("set_adaptive_coalescing");
        let steps = catalog(&CatalogOptions::default());
        let step = steps.iter().find(|s| s.id == "adaptive-coalescing").unwrap();

        let result = execute(step, &profile(Platform::Linux), &tuner);
        assert!(result.is_fatal_failure());
    }

    #[test]
    fn verify_failure_keeps_applied_result() {
        let tuner = MockTuner::new();
        tuner.mark_unsupported("read_sysctl");
        let steps = catalog(&CatalogOptions::default());
        let step = steps.iter().find(|s| s.id == "congestion-control").unwrap();

        let result = execute(step, &profile(Platform::Linux), &tuner);
        assert_eq!(result.outcome, StepOutcome::Applied);
        assert!(result.observed.is_none());
    }

    #[test]
    fn verify_records_observed_value() {
        let tuner = MockTuner::new();
        let steps = catalog(&CatalogOptions::default());
        let step = steps.iter().find(|s| s.id == "congestion-control").unwrap();

        let result = execute(step, &profile(Platform::Linux), &tuner);
        assert_eq!(result.outcome, StepOutcome::Applied);
        assert_eq!(result.observed.as_deref(), Some("bbr"));
    }
}
