pub mod agent;
pub mod common;
pub mod fleet;
pub mod mission;
pub mod pipeline;

pub use agent::{
    Agent, AgentBus, AgentPhase, AgentSpec, AgentStatus, AgentTools, ArsenalSpec, PromptSpec,
    VaultMount, WorkspaceSpec,
};
pub use common::{condition_is_true, set_condition, ResourceSpec};
pub use fleet::{
    compute_phase, Fleet, FleetAgentSummary, FleetBus, FleetDefaults, FleetPhase, FleetPolicies,
    FleetSpec, FleetStatus, RetentionPolicy,
};
pub use mission::{
    AgentReadiness, CleanupPolicy, Mission, MissionAgent, MissionPhase, MissionPipelineRef,
    MissionSpec, MissionStage, MissionStatus,
};
pub use pipeline::{
    DagError, Pipeline, PipelineSpec, PipelineStatus, RetryPolicy, Step, StepPhase, StepStatus,
};
