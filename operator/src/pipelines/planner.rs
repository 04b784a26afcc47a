use chrono::{DateTime, Utc};
use roundtable_common::template::{StepOutput, TemplateContext};
use roundtable_types::{Step, StepPhase, StepStatus};
use std::collections::HashMap;

/// True once `now - started_at` exceeds `timeout_seconds`. Shared by both
/// the overall-pipeline and per-step timeout checks (`spec.md` §4.2 steps
/// 1 and 2).
pub fn timed_out(started_at: DateTime<Utc>, now: DateTime<Utc>, timeout_seconds: u32) -> bool {
    (now - started_at).num_seconds() > timeout_seconds as i64
}

/// A step is ready to dispatch once it is Pending and every step it
/// depends on is Succeeded or Failed-with-`continueOnFailure`.
pub fn step_is_ready(step: &Step, statuses: &[StepStatus], steps: &[Step]) -> bool {
    let Some(status) = statuses.iter().find(|s| s.name == step.name) else {
        return false;
    };
    if status.phase != StepPhase::Pending {
        return false;
    }
    step.depends_on.iter().all(|dep| {
        statuses
            .iter()
            .find(|s| &s.name == dep)
            .is_some_and(|s| s.succeeded_or_continued(steps))
    })
}

/// True while a retried step is still inside its backoff window, measured
/// from the timestamp of its last (failed) attempt (`spec.md` §4.2 step 3:
/// "If retries>0 and last attempt completedAt + backoff > now, skip").
pub fn in_backoff(status: &StepStatus, now: DateTime<Utc>, backoff_seconds: u32) -> bool {
    if status.retries == 0 {
        return false;
    }
    match &status.completed_at {
        Some(completed_at) => {
            let elapsed = (now - completed_at.0).num_seconds();
            elapsed < backoff_seconds as i64
        }
        None => false,
    }
}

pub fn all_terminal(statuses: &[StepStatus]) -> bool {
    statuses.iter().all(|s| s.terminal())
}

/// A run fails outright if any step is Failed without `continueOnFailure`.
pub fn any_hard_failure(statuses: &[StepStatus], steps: &[Step]) -> bool {
    statuses.iter().any(|status| {
        status.phase == StepPhase::Failed
            && !steps
                .iter()
                .find(|s| s.name == status.name)
                .is_some_and(|s| s.continue_on_failure)
    })
}

/// Builds the template context exposing `.Input` and `.Steps["name"]` from
/// the current step statuses (`spec.md` §4.2 step 3).
pub fn template_context(input: Option<&str>, statuses: &[StepStatus]) -> TemplateContext {
    let mut steps = HashMap::new();
    for status in statuses {
        steps.insert(
            status.name.clone(),
            StepOutput {
                output: status.output.clone(),
                error: status.error.clone(),
            },
        );
    }
    TemplateContext {
        input: input.map(str::to_string),
        steps,
    }
}

/// Composes `pipeline-<pipeline>-<step>-<millis>`, the task id used both
/// in the published task envelope and the result subject.
pub fn task_id(pipeline: &str, step: &str, now: DateTime<Utc>) -> String {
    format!("pipeline-{pipeline}-{step}-{}", now.timestamp_millis())
}

/// Resets every step status to Pending, ready for a fresh run
/// (`spec.md` §4.2 "Schedule management").
pub fn reset_steps(steps: &[Step]) -> Vec<StepStatus> {
    steps
        .iter()
        .map(|s| StepStatus {
            name: s.name.clone(),
            phase: StepPhase::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            retries: 0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn step(name: &str, deps: &[&str], continue_on_failure: bool) -> Step {
        Step {
            name: name.to_string(),
            agent_ref: "a".to_string(),
            task: "t".to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            timeout_seconds: 60,
            output_key: None,
            continue_on_failure,
        }
    }

    fn status(name: &str, phase: StepPhase) -> StepStatus {
        StepStatus {
            name: name.to_string(),
            phase,
            ..Default::default()
        }
    }

    #[test]
    fn step_is_ready_once_dependencies_succeed() {
        let steps = vec![step("a", &[], false), step("b", &["a"], false)];
        let statuses = vec![status("a", StepPhase::Succeeded), status("b", StepPhase::Pending)];
        assert!(step_is_ready(&steps[1], &statuses, &steps));
    }

    #[test]
    fn step_is_not_ready_while_dependency_pending() {
        let steps = vec![step("a", &[], false), step("b", &["a"], false)];
        let statuses = vec![status("a", StepPhase::Pending), status("b", StepPhase::Pending)];
        assert!(!step_is_ready(&steps[1], &statuses, &steps));
    }

    #[test]
    fn continue_on_failure_unblocks_dependents() {
        let steps = vec![step("a", &[], true), step("b", &["a"], false)];
        let statuses = vec![status("a", StepPhase::Failed), status("b", StepPhase::Pending)];
        assert!(step_is_ready(&steps[1], &statuses, &steps));
    }

    #[test]
    fn hard_failure_without_continue_flag_fails_the_run() {
        let steps = vec![step("a", &[], false)];
        let statuses = vec![status("a", StepPhase::Failed)];
        assert!(any_hard_failure(&statuses, &steps));
    }

    #[test]
    fn soft_failure_with_continue_flag_does_not_fail_the_run() {
        let steps = vec![step("a", &[], true)];
        let statuses = vec![status("a", StepPhase::Failed)];
        assert!(!any_hard_failure(&statuses, &steps));
    }

    #[test]
    fn backoff_blocks_immediate_retry() {
        let now = Utc::now();
        let mut s = status("a", StepPhase::Pending);
        s.retries = 1;
        s.completed_at = Some(Time(now));
        assert!(in_backoff(&s, now, 30));
    }

    #[test]
    fn backoff_clears_after_window_elapses() {
        let now = Utc::now();
        let mut s = status("a", StepPhase::Pending);
        s.retries = 1;
        s.completed_at = Some(Time(now - chrono::Duration::seconds(31)));
        assert!(!in_backoff(&s, now, 30));
    }

    #[test]
    fn all_terminal_requires_every_step_done() {
        let statuses = vec![status("a", StepPhase::Succeeded), status("b", StepPhase::Running)];
        assert!(!all_terminal(&statuses));
        let statuses = vec![status("a", StepPhase::Succeeded), status("b", StepPhase::Skipped)];
        assert!(all_terminal(&statuses));
    }

    #[test]
    fn timeout_compares_against_wall_clock() {
        let start = Utc::now() - chrono::Duration::seconds(100);
        assert!(timed_out(start, Utc::now(), 60));
        assert!(!timed_out(start, Utc::now(), 600));
    }
}
