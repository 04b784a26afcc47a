use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

fn default_step_timeout_seconds() -> u32 {
    60
}

fn default_pipeline_timeout_seconds() -> u32 {
    3600
}

fn default_max_retries() -> u32 {
    0
}

fn default_backoff_seconds() -> u32 {
    30
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Step {
    pub name: String,
    pub agent_ref: String,
    pub task: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_step_timeout_seconds")]
    pub timeout_seconds: u32,
    pub output_key: Option<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "roundtable.ai",
    version = "v1",
    kind = "Pipeline",
    plural = "pipelines",
    derive = "PartialEq",
    status = "PipelineStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = r#"{"jsonPath": ".status.phase", "name": "PHASE", "type": "string"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".spec.schedule", "name": "SCHEDULE", "type": "string"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".status.runsCompleted", "name": "RUNS", "type": "integer"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".metadata.creationTimestamp", "name": "AGE", "type": "date"}"#)]
pub struct PipelineSpec {
    pub steps: Vec<Step>,
    #[serde(default = "default_pipeline_timeout_seconds")]
    pub timeout_seconds: u32,
    pub schedule: Option<String>,
    pub input: Option<String>,
    pub fleet_ref: Option<String>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// Validation errors `spec.md` §4.2 distinguishes by `reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    UnknownStep { step: String, depends_on: String },
    CyclicDependency,
    DuplicateStep(String),
}

impl fmt::Display for DagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DagError::UnknownStep { step, depends_on } => write!(
                f,
                "step {step:?} depends on unknown step {depends_on:?}"
            ),
            DagError::CyclicDependency => write!(f, "step dependency graph contains a cycle"),
            DagError::DuplicateStep(name) => write!(f, "duplicate step name {name:?}"),
        }
    }
}

impl DagError {
    pub fn reason(&self) -> &'static str {
        match self {
            DagError::UnknownStep { .. } => "UnknownStep",
            DagError::CyclicDependency => "CyclicDependency",
            DagError::DuplicateStep(_) => "DuplicateStep",
        }
    }
}

impl PipelineSpec {
    /// Kahn's-algorithm topological validation, per `spec.md` §4.2: build an
    /// in-degree map from `dependsOn` edges, reject unknown dependency names,
    /// then drain zero-in-degree nodes; if fewer nodes drain than exist, a
    /// cycle is present.
    pub fn validate_dag(&self) -> Result<Vec<String>, DagError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(DagError::DuplicateStep(step.name.clone()));
            }
        }
        let names: HashSet<&str> = self.steps.iter().map(|s| s.name.as_str()).collect();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(DagError::UnknownStep {
                        step: step.name.clone(),
                        depends_on: dep.clone(),
                    });
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.name.as_str(), s.depends_on.len()))
            .collect();
        // dependents[x] = steps that depend on x
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.name.as_str());
            }
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| *name)
            .collect();
        queue.sort();
        let mut order = Vec::with_capacity(self.steps.len());
        let mut i = 0;
        while i < queue.len() {
            let node = queue[i];
            i += 1;
            order.push(node.to_string());
            if let Some(next) = dependents.get(node) {
                let mut newly_free = Vec::new();
                for &dep_name in next {
                    let deg = in_degree.get_mut(dep_name).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        newly_free.push(dep_name);
                    }
                }
                newly_free.sort();
                queue.extend(newly_free);
            }
        }

        if order.len() < self.steps.len() {
            return Err(DagError::CyclicDependency);
        }
        Ok(order)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum StepPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepPhase::Pending => "Pending",
            StepPhase::Running => "Running",
            StepPhase::Succeeded => "Succeeded",
            StepPhase::Failed => "Failed",
            StepPhase::Skipped => "Skipped",
        };
        write!(f, "{s}")
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct StepStatus {
    pub name: String,
    pub phase: StepPhase,
    pub started_at: Option<Time>,
    pub completed_at: Option<Time>,
    pub output: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub retries: u32,
}

impl StepStatus {
    pub fn terminal(&self) -> bool {
        matches!(
            self.phase,
            StepPhase::Succeeded | StepPhase::Failed | StepPhase::Skipped
        )
    }

    pub fn succeeded_or_continued(&self, steps: &[Step]) -> bool {
        match self.phase {
            StepPhase::Succeeded => true,
            StepPhase::Failed => steps
                .iter()
                .find(|s| s.name == self.name)
                .is_some_and(|s| s.continue_on_failure),
            _ => false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum PipelinePhase {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Suspended,
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelinePhase::Idle => "Idle",
            PipelinePhase::Running => "Running",
            PipelinePhase::Succeeded => "Succeeded",
            PipelinePhase::Failed => "Failed",
            PipelinePhase::Suspended => "Suspended",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PipelinePhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Idle" => Ok(PipelinePhase::Idle),
            "Running" => Ok(PipelinePhase::Running),
            "Succeeded" => Ok(PipelinePhase::Succeeded),
            "Failed" => Ok(PipelinePhase::Failed),
            "Suspended" => Ok(PipelinePhase::Suspended),
            _ => Err(()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PipelineStatus {
    pub phase: PipelinePhase,
    #[serde(default)]
    pub steps: Vec<StepStatus>,
    #[serde(default)]
    pub runs_completed: u64,
    #[serde(default)]
    pub runs_failed: u64,
    pub last_scheduled_at: Option<Time>,
    pub started_at: Option<Time>,
    pub completed_at: Option<Time>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, deps: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            agent_ref: "a".to_string(),
            task: "t".to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            timeout_seconds: 60,
            output_key: None,
            continue_on_failure: false,
        }
    }

    #[test]
    fn fan_out_fan_in_respects_partial_order() {
        let spec = PipelineSpec {
            steps: vec![
                step("a", &[]),
                step("b", &["a"]),
                step("c", &["a"]),
                step("d", &["b", "c"]),
            ],
            ..Default::default()
        };
        let order = spec.validate_dag().expect("valid dag");
        let pos = |n: &str| order.iter().position(|s| s == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn detects_two_node_cycle() {
        let spec = PipelineSpec {
            steps: vec![step("a", &["b"]), step("b", &["a"])],
            ..Default::default()
        };
        assert_eq!(spec.validate_dag(), Err(DagError::CyclicDependency));
    }

    #[test]
    fn detects_unknown_dependency() {
        let spec = PipelineSpec {
            steps: vec![step("a", &["ghost"])],
            ..Default::default()
        };
        match spec.validate_dag() {
            Err(DagError::UnknownStep { depends_on, .. }) => assert_eq!(depends_on, "ghost"),
            other => panic!("expected UnknownStep, got {other:?}"),
        }
    }

    #[test]
    fn detects_duplicate_step_names() {
        let spec = PipelineSpec {
            steps: vec![step("a", &[]), step("a", &[])],
            ..Default::default()
        };
        assert_eq!(
            spec.validate_dag(),
            Err(DagError::DuplicateStep("a".to_string()))
        );
    }

    #[test]
    fn single_step_has_no_dependencies() {
        let spec = PipelineSpec {
            steps: vec![step("only", &[])],
            ..Default::default()
        };
        assert_eq!(spec.validate_dag().unwrap(), vec!["only".to_string()]);
    }
}
