use std::fmt::Write as _;

use serde::Serialize;

/// Outcome of one catalog step. Produced exactly once per step per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    Skipped { reason: String },
    Failed { cause: String, fatal: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub description: String,
    pub outcome: StepOutcome,
    /// Read-back value from the step's verify hook, when present.
    pub observed: Option<String>,
}

impl StepResult {
    pub fn applied(step_id: &str, description: &str, observed: Option<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            description: description.to_string(),
            outcome: StepOutcome::Applied,
            observed,
        }
    }

    pub fn skipped(step_id: &str, description: &str, reason: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            description: description.to_string(),
            outcome: StepOutcome::Skipped {
                reason: reason.into(),
            },
            observed: None,
        }
    }

    pub fn failed(step_id: &str, description: &str, cause: impl Into<String>, fatal: bool) -> Self {
        Self {
            step_id: step_id.to_string(),
            description: description.to_string(),
            outcome: StepOutcome::Failed {
                cause: cause.into(),
                fatal,
            },
            observed: None,
        }
    }

    pub fn is_fatal_failure(&self) -> bool {
        matches!(self.outcome, StepOutcome::Failed { fatal: true, .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialSuccess,
    Aborted { step_id: String },
}

/// Ordered per-step results plus the folded overall outcome. Created empty
/// by the runner, appended to as steps execute, immutable once returned.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub results: Vec<StepResult>,
    pub outcome: RunOutcome,
}

impl RunReport {
    /// Human-readable per-step listing in catalog order, aborting step last.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for result in &self.results {
            match &result.outcome {
                StepOutcome::Applied => {
                    let _ = write!(out, "applied  {}", result.step_id);
                    if let Some(observed) = &result.observed {
                        let _ = write!(out, " (observed: {observed})");
                    }
                }
                StepOutcome::Skipped { reason } => {
                    let _ = write!(out, "skipped  {} ({reason})", result.step_id);
                }
                StepOutcome::Failed { cause, fatal } => {
                    let marker = if *fatal { "FATAL  " } else { "failed " };
                    let _ = write!(out, "{marker} {}: {cause}", result.step_id);
                }
            }
            out.push('\n');
        }

        match &self.outcome {
            RunOutcome::Success => out.push_str("outcome: success"),
            RunOutcome::PartialSuccess => out.push_str("outcome: partial success"),
            RunOutcome::Aborted { step_id } => {
                let _ = write!(out, "outcome: aborted at {step_id}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_marks_aborting_step_last() {
        let report = RunReport {
            results: vec![
                StepResult::applied("a", "first", None),
                StepResult::failed("b", "second", "driver rejected", true),
            ],
            outcome: RunOutcome::Aborted {
                step_id: "b".to_string(),
            },
        };

        let text = report.render_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "applied  a");
        assert!(lines[1].starts_with("FATAL   b"));
        assert_eq!(lines[2], "outcome: aborted at b");
    }

    #[test]
    fn render_includes_observed_value() {
        let report = RunReport {
            results: vec![StepResult::applied(
                "congestion-control",
                "enable bbr",
                Some("bbr".to_string()),
            )],
            outcome: RunOutcome::Success,
        };

        assert!(report.render_text().contains("(observed: bbr)"));
    }

    #[test]
    fn serializes_to_tagged_json() {
        let result = StepResult::skipped("x", "desc", "platform-mismatch");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["outcome"]["kind"], "skipped");
        assert_eq!(value["outcome"]["reason"], "platform-mismatch");
    }
}
