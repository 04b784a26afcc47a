pub mod args;
pub mod bus;
pub mod cron;
pub mod metrics;
pub mod shutdown;
pub mod template;

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

/// Touches a readiness marker file, mirrored from the platform's liveness
/// convention - the operator's own `/health` endpoint checks for it.
pub fn signal_ready() {
    if let Ok(path) = std::env::var("READY_FILE") {
        let _ = std::fs::write(path, "ready");
    }
}

pub mod annotations {
    pub const SPEC_HASH: &str = "roundtable.ai/spec-hash";
    pub const CREATED_BY: &str = "roundtable.ai/created-by";
    pub const MANAGED_BY: &str = "roundtable.ai/managed-by";
}

/// Default NATS subject prefix used when a resource references no Fleet.
pub const DEFAULT_SUBJECT_PREFIX: &str = "fleet-a";

/// Builds the `<prefix>.tasks.<domain>.<agent>` subject per `spec.md` §6.
pub fn tasks_subject(prefix: &str, domain: &str, agent: &str) -> String {
    format!("{prefix}.tasks.{domain}.{agent}")
}

/// Builds the `<prefix>.results.pipeline-<pipeline>-<step>.<taskId>` subject.
pub fn pipeline_result_subject(prefix: &str, pipeline: &str, step: &str, task_id: &str) -> String {
    format!("{prefix}.results.pipeline-{pipeline}-{step}.{task_id}")
}

/// Wildcard form of [`pipeline_result_subject`], used for the bounded poll.
pub fn pipeline_result_wildcard(prefix: &str, pipeline: &str, step: &str) -> String {
    format!("{prefix}.results.pipeline-{pipeline}-{step}.*")
}

/// Builds the general (non-pipeline) agent result subject.
pub fn agent_result_subject(prefix: &str, domain: &str, agent: &str) -> String {
    format!("{prefix}.results.{domain}.{agent}")
}

/// Builds the `<prefix>.briefing` subject.
pub fn briefing_subject(prefix: &str) -> String {
    format!("{prefix}.briefing")
}

/// Builds the `<prefix>.heartbeat.<agent>` subject.
pub fn heartbeat_subject(prefix: &str, agent: &str) -> String {
    format!("{prefix}.heartbeat.{agent}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_match_wire_contract() {
        assert_eq!(tasks_subject("fleet-a", "ops", "scribe"), "fleet-a.tasks.ops.scribe");
        assert_eq!(
            pipeline_result_subject("fleet-a", "deploy", "build", "t1"),
            "fleet-a.results.pipeline-deploy-build.t1"
        );
        assert_eq!(
            pipeline_result_wildcard("fleet-a", "deploy", "build"),
            "fleet-a.results.pipeline-deploy-build.*"
        );
    }
}
