use k8s_openapi::api::core::v1::{EnvFromSource, EnvVar};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::common::ResourceSpec;

fn default_concurrency() -> u32 {
    2
}

fn default_task_timeout_seconds() -> u32 {
    120
}

/// Grouped package lists used to derive the toolchain-manager config,
/// native-package flake, and system-package manifest artifacts.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AgentTools {
    /// Native (compiled-from-source) packages, provisioned via a dedicated store volume.
    #[serde(default)]
    pub native: Vec<String>,
    /// System packages installed into the workload image.
    #[serde(default)]
    pub system: Vec<String>,
    /// Toolchain-manager-resolved packages (language runtimes, CLIs).
    #[serde(default)]
    pub toolchain: Vec<String>,
}

impl AgentTools {
    pub fn is_empty(&self) -> bool {
        self.native.is_empty() && self.system.is_empty() && self.toolchain.is_empty()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AgentBus {
    pub url: Option<String>,
    #[serde(default)]
    pub filter_subjects: Vec<String>,
    pub primary_stream: Option<String>,
    pub results_stream: Option<String>,
    pub consumer_name: Option<String>,
    pub max_deliver: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VaultMount {
    pub claim_name: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub writable_subpaths: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PromptConfigRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PromptSpec {
    pub identity: Option<String>,
    pub instructions: Option<String>,
    pub config_ref: Option<PromptConfigRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ArsenalSpec {
    pub repo: String,
    #[serde(default = "default_arsenal_ref")]
    pub git_ref: String,
    #[serde(default = "default_sync_period_seconds")]
    pub sync_period_seconds: u32,
    #[serde(default = "default_arsenal_image")]
    pub image: String,
}

fn default_arsenal_ref() -> String {
    "main".to_string()
}

fn default_sync_period_seconds() -> u32 {
    300
}

fn default_arsenal_image() -> String {
    "alpine/git:latest".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct WorkspaceSpec {
    pub existing_claim: Option<String>,
    pub size: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "roundtable.ai",
    version = "v1",
    kind = "Agent",
    plural = "agents",
    derive = "PartialEq",
    status = "AgentStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = r#"{"jsonPath": ".spec.domain", "name": "DOMAIN", "type": "string"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".spec.model", "name": "MODEL", "type": "string"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".status.phase", "name": "PHASE", "type": "string"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".status.ready", "name": "READY", "type": "boolean"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".status.tasksCompleted", "name": "TASKS", "type": "integer"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".metadata.creationTimestamp", "name": "AGE", "type": "date"}"#)]
pub struct AgentSpec {
    pub domain: String,
    pub model: Option<String>,
    pub image: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tools: AgentTools,
    #[serde(default)]
    pub bus: AgentBus,
    pub vault: Option<VaultMount>,
    pub prompt: Option<PromptSpec>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_task_timeout_seconds")]
    pub task_timeout_seconds: u32,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub env_from: Vec<EnvFromSource>,
    pub arsenal: Option<ArsenalSpec>,
    pub workspace: Option<WorkspaceSpec>,
    #[serde(default)]
    pub suspended: bool,
}

impl AgentSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.domain.trim().is_empty() {
            return Err("spec.domain must be non-empty".to_string());
        }
        if self.skills.is_empty() {
            return Err("spec.skills must contain at least one entry".to_string());
        }
        if !(1..=10).contains(&self.concurrency) {
            return Err("spec.concurrency must be between 1 and 10".to_string());
        }
        if !(30..=3600).contains(&self.task_timeout_seconds) {
            return Err("spec.taskTimeout must be between 30 and 3600 seconds".to_string());
        }
        if !self.bus.filter_subjects.is_empty() {
            // fine; zero is only disallowed once bus is actually wired up by the Fleet default.
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum AgentPhase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Degraded,
    Suspended,
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentPhase::Pending => "Pending",
            AgentPhase::Provisioning => "Provisioning",
            AgentPhase::Ready => "Ready",
            AgentPhase::Degraded => "Degraded",
            AgentPhase::Suspended => "Suspended",
        };
        write!(f, "{s}")
    }
}

impl FromStr for AgentPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(AgentPhase::Pending),
            "Provisioning" => Ok(AgentPhase::Provisioning),
            "Ready" => Ok(AgentPhase::Ready),
            "Degraded" => Ok(AgentPhase::Degraded),
            "Suspended" => Ok(AgentPhase::Suspended),
            _ => Err(()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AgentStatus {
    pub phase: AgentPhase,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
    pub last_task_time: Option<Time>,
    #[serde(default = "default_cost")]
    pub total_cost: String,
    pub consumer_name: Option<String>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

pub fn default_cost() -> String {
    "0.00".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_domain() {
        let spec = AgentSpec {
            domain: "".into(),
            skills: vec!["chat".into()],
            concurrency: 2,
            task_timeout_seconds: 120,
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_empty_skills() {
        let spec = AgentSpec {
            domain: "ops".into(),
            skills: vec![],
            concurrency: 2,
            task_timeout_seconds: 120,
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn accepts_minimal_valid_spec() {
        let spec = AgentSpec {
            domain: "ops".into(),
            skills: vec!["chat".into()],
            concurrency: 2,
            task_timeout_seconds: 120,
            ..Default::default()
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn phase_roundtrips_through_str() {
        for phase in [
            AgentPhase::Pending,
            AgentPhase::Provisioning,
            AgentPhase::Ready,
            AgentPhase::Degraded,
            AgentPhase::Suspended,
        ] {
            assert_eq!(AgentPhase::from_str(&phase.to_string()), Ok(phase));
        }
    }
}
