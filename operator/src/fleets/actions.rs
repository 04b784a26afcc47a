use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Api, Client, ResourceExt, api::ListParams};
use roundtable_common::bus::{retention_from_policy, Bus};
use roundtable_types::*;

use crate::util::Error;

pub fn instance_name(instance: &Fleet) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Fleet is missing metadata.name".to_string()))
}

pub fn instance_namespace(instance: &Fleet) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Fleet is missing metadata.namespace".to_string()))
}

fn selector_string(selector: &std::collections::BTreeMap<String, String>) -> Option<String> {
    if selector.is_empty() {
        return None;
    }
    Some(
        selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Discovers member Agents by label selector, not ownership
/// (`spec.md` §4.4 step 1: "Agents matching `spec.agentSelector`,
/// independent of who created them").
pub async fn discover_agents(client: Client, namespace: &str, instance: &Fleet) -> Result<Vec<Agent>, Error> {
    let api: Api<Agent> = Api::namespaced(client, namespace);
    let mut lp = ListParams::default();
    if let Some(selector) = selector_string(&instance.spec.agent_selector) {
        lp = lp.labels(&selector);
    }
    let list = api.list(&lp).await?;
    Ok(list.items)
}

/// Builds the per-agent health summary and the (ready, total, cost,
/// tasks-completed) rollup in one pass over the discovered Agents
/// (`spec.md` §4.4 step 3: "sum `tasksCompleted` and `totalCost`").
pub fn summarize_agents(agents: &[Agent]) -> (Vec<FleetAgentSummary>, f64, u64) {
    let summaries: Vec<FleetAgentSummary> = agents
        .iter()
        .map(|agent| {
            let status = agent.status.clone().unwrap_or_default();
            FleetAgentSummary {
                name: agent.name_any(),
                phase: status.phase.to_string(),
                ready: status.ready,
            }
        })
        .collect();
    let costs: Vec<String> = agents
        .iter()
        .map(|a| a.status.as_ref().map(|s| s.total_cost.clone()).unwrap_or_default())
        .collect();
    let total_cost = super::planner::sum_costs(costs.iter().map(String::as_str));
    let tasks_completed: u64 = agents
        .iter()
        .map(|a| a.status.as_ref().map(|s| s.tasks_completed).unwrap_or_default())
        .sum();
    (summaries, total_cost, tasks_completed)
}

/// Counts Missions in this namespace that reference this Fleet and have
/// not yet reached a terminal phase (`spec.md` §4.4 step 3
/// "active mission count").
pub async fn count_active_missions(client: Client, namespace: &str, fleet_name: &str) -> Result<u32, Error> {
    let api: Api<Mission> = Api::namespaced(client, namespace);
    let list = api.list(&ListParams::default()).await?;
    let count = list
        .items
        .iter()
        .filter(|m| m.spec.fleet_ref.as_deref() == Some(fleet_name))
        .filter(|m| {
            !matches!(
                m.status.as_ref().map(|s| s.phase).unwrap_or_default(),
                MissionPhase::Succeeded | MissionPhase::Failed | MissionPhase::Expired
            )
        })
        .count() as u32;
    Ok(count)
}

/// Default stream name, `<prefix>_tasks`/`<prefix>_results` per `spec.md` §6.
fn stream_name(prefix: &str, suffix: &str) -> String {
    format!("{prefix}_{suffix}")
}

/// Idempotently provisions the tasks/results JetStream streams when
/// `spec.bus.createStreams` is set (`spec.md` §4.4 step 4).
pub async fn ensure_streams(bus: &Bus, namespace: &str, instance: &Fleet) -> Result<(), Error> {
    if !instance.spec.bus.create_streams {
        return Ok(());
    }
    let prefix = instance
        .spec
        .bus
        .subject_prefix
        .clone()
        .unwrap_or_else(|| format!("fleet-{namespace}-{}", instance.name_any()));
    let retention = retention_from_policy(instance.spec.bus.retention_policy.as_str());

    for (stream, suffix) in [
        (&instance.spec.bus.tasks_stream, "tasks"),
        (&instance.spec.bus.results_stream, "results"),
    ] {
        let subjects = vec![format!("{prefix}.{suffix}.>")];
        let config = async_nats::jetstream::stream::Config {
            name: stream.clone().unwrap_or_else(|| stream_name(&prefix, suffix)),
            subjects,
            retention,
            ..Default::default()
        };
        bus.ensure_stream(config).await.map_err(Error::from)?;
    }
    Ok(())
}

pub fn now() -> Time {
    Time(chrono::Utc::now())
}
