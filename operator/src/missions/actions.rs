use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{Api, Client, ResourceExt, api::DeleteParams};
use roundtable_common::bus::Bus;
use roundtable_types::*;
use serde::Serialize;

use crate::util::{Error, patch::patch_status};

pub fn instance_name(instance: &Mission) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Mission is missing metadata.name".to_string()))
}

pub fn instance_namespace(instance: &Mission) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Mission is missing metadata.namespace".to_string()))
}

/// Resolves the subject prefix: explicit override, else the referenced
/// Fleet's prefix, else `mission-<name>` (`spec.md` §6 "Default prefix
/// convention"). Per §9's REDESIGN FLAG, this resolved prefix - not a
/// hardcoded literal - is what the briefing publish below actually uses.
pub async fn resolve_prefix(client: Client, namespace: &str, instance: &Mission) -> String {
    if let Some(prefix) = &instance.spec.subject_prefix {
        return prefix.clone();
    }
    if let Some(fleet_name) = &instance.spec.fleet_ref {
        let api: Api<Fleet> = Api::namespaced(client, namespace);
        if let Ok(fleet) = api.get(fleet_name).await
            && let Some(prefix) = fleet.spec.bus.subject_prefix
        {
            return prefix;
        }
    }
    format!("mission-{}", instance.name_any())
}

fn ephemeral_agent_name(instance: &Mission, index: usize) -> String {
    format!("{}-agent-{index}", instance.name_any())
}

fn owner_ref(instance: &Mission) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
    instance.controller_owner_ref(&()).expect("Mission is namespaced")
}

/// Creates (but never updates) the owned ephemeral Agent children.
/// `spec.md` §3: "Missions spawn ephemeral Agents as owned children
/// (deleted on mission cleanup)".
pub async fn ensure_ephemeral_agents(client: Client, instance: &Mission) -> Result<(), Error> {
    let namespace = instance_namespace(instance)?;
    let api: Api<Agent> = Api::namespaced(client, namespace);
    for (index, participant) in instance.spec.agents.iter().enumerate() {
        let Some(spec) = &participant.ephemeral else {
            continue;
        };
        let name = ephemeral_agent_name(instance, index);
        if api.get(&name).await.is_ok() {
            continue;
        }
        let agent = Agent {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                owner_references: Some(vec![owner_ref(instance)]),
                ..Default::default()
            },
            spec: (**spec).clone(),
            status: None,
        };
        api.create(&Default::default(), &agent).await?;
    }
    Ok(())
}

/// Readiness + cost for every *non-ephemeral* participant, used for both
/// the Assembling readiness gate and the cost rollup. Ephemeral
/// participants are intentionally excluded (`spec.md` §4.3).
pub async fn non_ephemeral_readiness(
    client: Client,
    namespace: &str,
    instance: &Mission,
) -> (Vec<AgentReadiness>, f64) {
    let api: Api<Agent> = Api::namespaced(client, namespace);
    let mut out = Vec::new();
    let mut costs = Vec::new();
    for participant in &instance.spec.agents {
        let Some(name) = &participant.agent_ref else {
            continue;
        };
        match api.get(name).await {
            Ok(agent) => {
                let status = agent.status.unwrap_or_default();
                out.push(AgentReadiness {
                    name: name.clone(),
                    ready: status.ready,
                    tasks: status.tasks_completed,
                });
                costs.push(status.total_cost);
            }
            Err(_) => out.push(AgentReadiness {
                name: name.clone(),
                ready: false,
                tasks: 0,
            }),
        }
    }
    let total = super::planner::sum_costs(costs.iter().map(String::as_str));
    (out, total)
}

#[derive(Debug, Serialize)]
struct BriefingEnvelope {
    mission_name: String,
    objective: String,
    briefing: String,
    agents: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BriefingTaskEnvelope {
    task_id: String,
    task: String,
}

/// Publishes the mission-wide briefing, then a per-agent task envelope to
/// each non-ephemeral agent's normal task subject (`spec.md` §4.3
/// "Briefing publication").
pub async fn publish_briefing(client: Client, bus: &Bus, prefix: &str, instance: &Mission) -> Result<(), Error> {
    let namespace = instance_namespace(instance)?.to_string();
    let mission_name = instance_name(instance)?.to_string();
    let agent_names: Vec<String> = instance
        .spec
        .agents
        .iter()
        .enumerate()
        .filter_map(|(i, a)| a.resolved_name(&mission_name, i))
        .collect();

    let envelope = BriefingEnvelope {
        mission_name: mission_name.clone(),
        objective: instance.spec.objective.clone(),
        briefing: instance.spec.briefing.clone(),
        agents: agent_names.clone(),
    };
    let payload = serde_json::to_vec(&envelope)?;
    bus.publish(roundtable_common::briefing_subject(prefix), payload)
        .await
        .map_err(Error::from)?;

    let agent_api: Api<Agent> = Api::namespaced(client, &namespace);
    for participant in &instance.spec.agents {
        let Some(name) = &participant.agent_ref else {
            continue;
        };
        let Ok(agent) = agent_api.get(name).await else {
            continue;
        };
        let task = BriefingTaskEnvelope {
            task_id: format!("mission-{mission_name}-briefing"),
            task: format!(
                "[mission {mission_name}] objective: {} -- {}",
                instance.spec.objective, instance.spec.briefing
            ),
        };
        let subject = roundtable_common::tasks_subject(prefix, &agent.spec.domain, name);
        let payload = serde_json::to_vec(&task)?;
        bus.publish(subject, payload).await.map_err(Error::from)?;
    }
    Ok(())
}

/// `Succeeded` when Pipeline phase is `Succeeded`, `Failed` when `Failed`,
/// `None` while still running (`spec.md` §4.3: "watched by name").
async fn pipeline_outcome(client: Client, namespace: &str, name: &str) -> Option<PipelinePhase> {
    let api: Api<Pipeline> = Api::namespaced(client, namespace);
    let pipeline = api.get(name).await.ok()?;
    let phase = pipeline.status.map(|s| s.phase).unwrap_or_default();
    matches!(phase, PipelinePhase::Succeeded | PipelinePhase::Failed).then_some(phase)
}

/// Evaluates every Active-stage Pipeline reference. `Some(true)` once all
/// have succeeded, `Some(false)` the moment any has failed, `None` while
/// still in flight.
pub async fn active_pipelines_outcome(client: Client, namespace: &str, instance: &Mission) -> Option<bool> {
    let active: Vec<&MissionPipelineRef> =
        super::planner::pipelines_in_stage(&instance.spec.pipelines, MissionStage::Active).collect();
    if active.is_empty() {
        return Some(true);
    }
    let mut all_succeeded = true;
    for pipeline_ref in active {
        // Mirrors the original source's unused `chainName` local
        // (`<mission>-<chain>`), carried forward per spec.md §9 as a
        // documented, deliberately dead computation rather than silently
        // dropped behavior.
        let _chain_name = format!("{}-{}", instance_name(instance).ok()?, pipeline_ref.name);
        match pipeline_outcome(client.clone(), namespace, &pipeline_ref.name).await {
            Some(PipelinePhase::Failed) => return Some(false),
            Some(PipelinePhase::Succeeded) => {}
            _ => all_succeeded = false,
        }
    }
    Some(all_succeeded)
}

/// Transitions every Teardown-stage Pipeline Idle->Running, per `spec.md`
/// §4.3 "Teardown-phase pipelines ... launched by transitioning their
/// phase Idle->Running (status write on the Pipeline)".
pub async fn launch_teardown_pipelines(client: Client, namespace: &str, instance: &Mission) -> Result<(), Error> {
    let api: Api<Pipeline> = Api::namespaced(client.clone(), namespace);
    for pipeline_ref in super::planner::pipelines_in_stage(&instance.spec.pipelines, MissionStage::Teardown) {
        let Ok(pipeline) = api.get(&pipeline_ref.name).await else {
            continue;
        };
        let phase = pipeline.status.as_ref().map(|s| s.phase).unwrap_or_default();
        if phase != PipelinePhase::Idle {
            continue;
        }
        if let Some(input) = &pipeline_ref.input {
            let patch = serde_json::json!({"spec": {"input": input}});
            api.patch(
                &pipeline_ref.name,
                &kube::api::PatchParams::apply(crate::util::MANAGER_NAME),
                &kube::api::Patch::Merge(patch),
            )
            .await?;
        }
        let generation = pipeline.meta().generation.unwrap_or(0);
        let reset = crate::pipelines::reset_steps(&pipeline.spec.steps);
        patch_status::<PipelineStatus, Pipeline>(client.clone(), &pipeline, |s| {
            s.phase = PipelinePhase::Running;
            s.steps = reset.clone();
            s.started_at = Some(Time(chrono::Utc::now()));
            s.completed_at = None;
            set_condition(&mut s.conditions, "Complete", false, "Running", "teardown run started".to_string(), generation);
        })
        .await?;
    }
    Ok(())
}

/// `true` once every Teardown-stage Pipeline has reached a terminal
/// phase, or trivially `true` if none are configured.
pub async fn teardown_pipelines_terminal(client: Client, namespace: &str, instance: &Mission) -> bool {
    let api: Api<Pipeline> = Api::namespaced(client, namespace);
    for pipeline_ref in super::planner::pipelines_in_stage(&instance.spec.pipelines, MissionStage::Teardown) {
        let Ok(pipeline) = api.get(&pipeline_ref.name).await else {
            continue;
        };
        let phase = pipeline.status.map(|s| s.phase).unwrap_or_default();
        if !matches!(phase, PipelinePhase::Succeeded | PipelinePhase::Failed) {
            return false;
        }
    }
    true
}

pub async fn delete_self(client: Client, instance: &Mission) -> Result<(), Error> {
    let namespace = instance_namespace(instance)?;
    let api: Api<Mission> = Api::namespaced(client, namespace);
    let _ = api.delete(instance.name_any().as_str(), &DeleteParams::default()).await;
    Ok(())
}

pub fn now() -> Time {
    Time(chrono::Utc::now())
}
