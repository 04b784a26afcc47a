use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::agent::AgentSpec;

fn default_ttl_seconds() -> u64 {
    3600
}

fn default_timeout_seconds() -> u64 {
    1800
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MissionAgent {
    /// Name of an existing Agent in the same namespace. Mutually exclusive with `ephemeral`.
    pub agent_ref: Option<String>,
    /// Inline spec for an Agent the Mission owns and tears down on cleanup.
    pub ephemeral: Option<Box<AgentSpec>>,
    pub role: Option<String>,
}

impl MissionAgent {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral.is_some()
    }

    /// The name used to address this participant once resolved - either the
    /// referenced Agent's name or (for ephemerals) the derived child name.
    pub fn resolved_name(&self, mission_name: &str, index: usize) -> Option<String> {
        if let Some(name) = &self.agent_ref {
            return Some(name.clone());
        }
        if self.ephemeral.is_some() {
            return Some(format!("{mission_name}-agent-{index}"));
        }
        None
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum MissionStage {
    Setup,
    #[default]
    Active,
    Teardown,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MissionPipelineRef {
    pub name: String,
    pub stage: MissionStage,
    pub input: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum CleanupPolicy {
    #[default]
    Delete,
    Retain,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "roundtable.ai",
    version = "v1",
    kind = "Mission",
    plural = "missions",
    derive = "PartialEq",
    status = "MissionStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = r#"{"jsonPath": ".spec.objective", "name": "OBJECTIVE", "type": "string"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".status.phase", "name": "PHASE", "type": "string"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".spec.ttlSeconds", "name": "TTL", "type": "integer"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".metadata.creationTimestamp", "name": "AGE", "type": "date"}"#)]
pub struct MissionSpec {
    pub objective: String,
    pub success_criteria: Option<String>,
    pub agents: Vec<MissionAgent>,
    #[serde(default)]
    pub pipelines: Vec<MissionPipelineRef>,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    pub subject_prefix: Option<String>,
    pub fleet_ref: Option<String>,
    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
    #[serde(default)]
    pub briefing: String,
}

impl MissionSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.objective.trim().is_empty() {
            return Err("spec.objective must be non-empty".to_string());
        }
        if self.agents.is_empty() {
            return Err("spec.agents must contain at least one entry".to_string());
        }
        if !(60..=604_800).contains(&self.ttl_seconds) {
            return Err("spec.ttl must be between 60s and 7 days".to_string());
        }
        if !(60..=86_400).contains(&self.timeout_seconds) {
            return Err("spec.timeout must be between 60s and 24h".to_string());
        }
        for a in &self.agents {
            if a.agent_ref.is_some() == a.ephemeral.is_some() {
                return Err(
                    "each spec.agents entry must set exactly one of agentRef or ephemeral"
                        .to_string(),
                );
            }
        }
        Ok(())
    }

    pub fn all_ephemeral(&self) -> bool {
        !self.agents.is_empty() && self.agents.iter().all(|a| a.is_ephemeral())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum MissionPhase {
    #[default]
    Assembling,
    Briefing,
    Active,
    Succeeded,
    Failed,
    Expired,
    CleaningUp,
}

impl fmt::Display for MissionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissionPhase::Assembling => "Assembling",
            MissionPhase::Briefing => "Briefing",
            MissionPhase::Active => "Active",
            MissionPhase::Succeeded => "Succeeded",
            MissionPhase::Failed => "Failed",
            MissionPhase::Expired => "Expired",
            MissionPhase::CleaningUp => "CleaningUp",
        };
        write!(f, "{s}")
    }
}

impl MissionPhase {
    pub fn is_terminal_run(&self) -> bool {
        matches!(self, MissionPhase::Succeeded | MissionPhase::Failed)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AgentReadiness {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub tasks: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MissionStatus {
    pub phase: MissionPhase,
    #[serde(default)]
    pub agents: Vec<AgentReadiness>,
    pub started_at: Option<Time>,
    pub completed_at: Option<Time>,
    pub expires_at: Option<Time>,
    pub result_summary: Option<String>,
    #[serde(default = "crate::agent::default_cost")]
    pub total_cost: String,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_ref(name: &str) -> MissionAgent {
        MissionAgent {
            agent_ref: Some(name.to_string()),
            ephemeral: None,
            role: None,
        }
    }

    fn ephemeral() -> MissionAgent {
        MissionAgent {
            agent_ref: None,
            ephemeral: Some(Box::new(AgentSpec::default())),
            role: Some("scout".into()),
        }
    }

    #[test]
    fn rejects_agent_with_both_ref_and_ephemeral() {
        let bad = MissionAgent {
            agent_ref: Some("x".into()),
            ephemeral: Some(Box::new(AgentSpec::default())),
            role: None,
        };
        let spec = MissionSpec {
            objective: "win".into(),
            agents: vec![bad],
            ttl_seconds: 120,
            timeout_seconds: 120,
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_agent_with_neither_ref_nor_ephemeral() {
        let bad = MissionAgent::default();
        let spec = MissionSpec {
            objective: "win".into(),
            agents: vec![bad],
            ttl_seconds: 120,
            timeout_seconds: 120,
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn all_ephemeral_detected() {
        let spec = MissionSpec {
            objective: "win".into(),
            agents: vec![ephemeral(), ephemeral()],
            ttl_seconds: 120,
            timeout_seconds: 120,
            ..Default::default()
        };
        assert!(spec.all_ephemeral());
    }

    #[test]
    fn mixed_participants_not_all_ephemeral() {
        let spec = MissionSpec {
            objective: "win".into(),
            agents: vec![ephemeral(), agent_ref("scribe")],
            ttl_seconds: 120,
            timeout_seconds: 120,
            ..Default::default()
        };
        assert!(!spec.all_ephemeral());
    }

    #[test]
    fn ttl_out_of_range_rejected() {
        let spec = MissionSpec {
            objective: "win".into(),
            agents: vec![agent_ref("a")],
            ttl_seconds: 10,
            timeout_seconds: 120,
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }
}
