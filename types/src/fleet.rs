use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::agent::ArsenalSpec;
use crate::common::ResourceSpec;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

impl RetentionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionPolicy::Limits => "limits",
            RetentionPolicy::Interest => "interest",
            RetentionPolicy::WorkQueue => "workqueue",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct FleetBus {
    pub url: Option<String>,
    pub subject_prefix: Option<String>,
    /// Explicit stream name override. Left unset, the Fleet controller
    /// names it `<prefix>_tasks` per `spec.md` §6.
    pub tasks_stream: Option<String>,
    /// Explicit stream name override. Left unset, the Fleet controller
    /// names it `<prefix>_results` per `spec.md` §6.
    pub results_stream: Option<String>,
    #[serde(default)]
    pub create_streams: bool,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct FleetDefaults {
    pub model: Option<String>,
    pub image: Option<String>,
    pub task_timeout_seconds: Option<u32>,
    pub concurrency: Option<u32>,
    pub resources: Option<ResourceSpec>,
    pub arsenal: Option<ArsenalSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct FleetPolicies {
    pub max_concurrent_tasks: Option<u32>,
    pub cost_budget_usd: Option<String>,
    pub cost_reset_cron: Option<String>,
    pub max_agents: Option<u32>,
    pub max_missions: Option<u32>,
}

impl FleetPolicies {
    /// `None` when no budget is configured or the budget is the literal "0"
    /// sentinel (spec.md §4.4: "cost budget set (non-\"0\")").
    pub fn parsed_budget(&self) -> Option<f64> {
        let raw = self.cost_budget_usd.as_deref()?;
        if raw == "0" || raw.trim().is_empty() {
            return None;
        }
        raw.parse::<f64>().ok()
    }
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "roundtable.ai",
    version = "v1",
    kind = "Fleet",
    plural = "fleets",
    derive = "PartialEq",
    status = "FleetStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = r#"{"jsonPath": ".status.phase", "name": "PHASE", "type": "string"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".status.readyAgents", "name": "READY", "type": "integer"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".status.totalAgents", "name": "TOTAL", "type": "integer"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".status.tasksCompleted", "name": "TASKS", "type": "integer"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".status.totalCost", "name": "COST", "type": "string"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".metadata.creationTimestamp", "name": "AGE", "type": "date"}"#)]
pub struct FleetSpec {
    pub description: Option<String>,
    #[serde(default)]
    pub bus: FleetBus,
    #[serde(default)]
    pub defaults: FleetDefaults,
    #[serde(default)]
    pub policies: FleetPolicies,
    #[serde(default)]
    pub agent_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub shared_secrets: Vec<String>,
    pub shared_vault: Option<String>,
    #[serde(default)]
    pub suspended: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum FleetPhase {
    #[default]
    Provisioning,
    Ready,
    Degraded,
    Suspended,
    OverBudget,
}

impl fmt::Display for FleetPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FleetPhase::Provisioning => "Provisioning",
            FleetPhase::Ready => "Ready",
            FleetPhase::Degraded => "Degraded",
            FleetPhase::Suspended => "Suspended",
            FleetPhase::OverBudget => "OverBudget",
        };
        write!(f, "{s}")
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct FleetAgentSummary {
    pub name: String,
    pub phase: String,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct FleetStatus {
    pub phase: FleetPhase,
    #[serde(default)]
    pub ready_agents: u32,
    #[serde(default)]
    pub total_agents: u32,
    #[serde(default)]
    pub agents: Vec<FleetAgentSummary>,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default = "crate::agent::default_cost")]
    pub total_cost: String,
    #[serde(default)]
    pub active_missions: u32,
    pub last_updated: Option<Time>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Computes the Fleet's `phase` per `spec.md` §4.4 step 5.
pub fn compute_phase(
    suspended: bool,
    ready: u32,
    total: u32,
    total_cost: f64,
    budget: Option<f64>,
) -> FleetPhase {
    if suspended {
        return FleetPhase::Suspended;
    }
    if let Some(budget) = budget
        && total_cost > budget
    {
        return FleetPhase::OverBudget;
    }
    if total == 0 {
        return FleetPhase::Provisioning;
    }
    if ready == total {
        FleetPhase::Ready
    } else {
        FleetPhase::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspended_wins_over_everything() {
        assert_eq!(
            compute_phase(true, 5, 5, 999.0, Some(1.0)),
            FleetPhase::Suspended
        );
    }

    #[test]
    fn over_budget_detected() {
        assert_eq!(
            compute_phase(false, 3, 3, 15.0, Some(10.0)),
            FleetPhase::OverBudget
        );
    }

    #[test]
    fn zero_budget_sentinel_disables_budget_check() {
        assert_eq!(compute_phase(false, 0, 0, 999.0, None), FleetPhase::Provisioning);
    }

    #[test]
    fn ready_when_all_agents_ready() {
        assert_eq!(compute_phase(false, 4, 4, 1.0, None), FleetPhase::Ready);
    }

    #[test]
    fn degraded_when_some_agents_not_ready() {
        assert_eq!(compute_phase(false, 2, 4, 1.0, None), FleetPhase::Degraded);
    }

    #[test]
    fn budget_parses_sentinel_zero_as_disabled() {
        let policies = FleetPolicies {
            cost_budget_usd: Some("0".to_string()),
            ..Default::default()
        };
        assert_eq!(policies.parsed_budget(), None);
    }

    #[test]
    fn budget_parses_decimal_string() {
        let policies = FleetPolicies {
            cost_budget_usd: Some("10.00".to_string()),
            ..Default::default()
        };
        assert_eq!(policies.parsed_budget(), Some(10.0));
    }
}
