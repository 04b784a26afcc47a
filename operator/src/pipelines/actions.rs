use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Api, Client, ResourceExt};
use roundtable_common::{DEFAULT_SUBJECT_PREFIX, bus::Bus};
use roundtable_types::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::Error;

pub fn instance_name(instance: &Pipeline) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Pipeline is missing metadata.name".to_string()))
}

pub fn instance_namespace(instance: &Pipeline) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Pipeline is missing metadata.namespace".to_string()))
}

/// Resolves the NATS subject prefix for this Pipeline: the referenced
/// Fleet's `bus.subjectPrefix` if set, else the literal fallback
/// (`spec.md` §6: "Default prefix convention").
pub async fn resolve_prefix(client: Client, namespace: &str, fleet_ref: &Option<String>) -> String {
    let Some(fleet_name) = fleet_ref else {
        return DEFAULT_SUBJECT_PREFIX.to_string();
    };
    let api: Api<Fleet> = Api::namespaced(client, namespace);
    match api.get(fleet_name).await {
        Ok(fleet) => fleet
            .spec
            .bus
            .subject_prefix
            .unwrap_or_else(|| DEFAULT_SUBJECT_PREFIX.to_string()),
        Err(_) => DEFAULT_SUBJECT_PREFIX.to_string(),
    }
}

/// Each step's `agentRef` must resolve to an Agent in the same namespace;
/// returns the name of the first missing reference, if any
/// (`spec.md` §4.2 "Agent resolution").
pub async fn first_missing_agent_ref(client: Client, namespace: &str, steps: &[Step]) -> Option<String> {
    let api: Api<Agent> = Api::namespaced(client, namespace);
    for step in steps {
        if api.get(&step.agent_ref).await.is_err() {
            return Some(step.agent_ref.clone());
        }
    }
    None
}

/// Fetches the Agent's `domain`, used to route the task subject.
pub async fn agent_domain(client: Client, namespace: &str, agent_name: &str) -> Result<String, Error> {
    let api: Api<Agent> = Api::namespaced(client, namespace);
    let agent = api.get(agent_name).await?;
    Ok(agent.spec.domain)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub pipeline_name: Option<String>,
    pub step_name: Option<String>,
    pub task: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: String,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Publishes a rendered step task to `<prefix>.tasks.<domain>.<agent>`
/// (`spec.md` §4.2 step 3, "Ready-step dispatch").
pub async fn publish_task(
    bus: &Bus,
    prefix: &str,
    domain: &str,
    agent: &str,
    pipeline_name: &str,
    step_name: &str,
    task: String,
    task_id: &str,
) -> Result<(), Error> {
    let envelope = TaskEnvelope {
        task_id: task_id.to_string(),
        pipeline_name: Some(pipeline_name.to_string()),
        step_name: Some(step_name.to_string()),
        task,
    };
    let subject = roundtable_common::tasks_subject(prefix, domain, agent);
    let payload = serde_json::to_vec(&envelope)?;
    bus.publish(subject, payload).await.map_err(Error::from)
}

/// Bounded (≤500ms) nonblocking fetch for a step's result, per
/// `spec.md` §4.2 step 2: "attempt a short nonblocking fetch".
pub async fn poll_step_result(
    bus: &Bus,
    prefix: &str,
    pipeline_name: &str,
    step_name: &str,
) -> Result<Option<ResultEnvelope>, Error> {
    let subject = roundtable_common::pipeline_result_wildcard(prefix, pipeline_name, step_name);
    let payload = bus
        .poll_once(subject, Duration::from_millis(500))
        .await
        .map_err(Error::from)?;
    match payload {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Registers or removes the Pipeline's cron entry with the shared
/// scheduler, keyed `namespace/name` (`spec.md` §4.2 "Schedule management").
pub fn sync_schedule(scheduler: &roundtable_common::cron::CronScheduler, instance: &Pipeline) {
    let key = format!(
        "{}/{}",
        instance.namespace().unwrap_or_default(),
        instance.name_any()
    );
    match (&instance.spec.schedule, instance.spec.suspended) {
        (Some(expr), false) => {
            if let Err(e) = scheduler.register(key.clone(), expr) {
                eprintln!("🛑 failed to register cron schedule for {key}: {e}");
            }
        }
        _ => scheduler.remove(&key),
    }
}

pub fn now() -> Time {
    Time(chrono::Utc::now())
}
