use futures::stream::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use roundtable_common::bus::Bus;
use roundtable_types::*;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use super::actions;
use crate::util::{
    Error, MANAGER_NAME, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use roundtable_common::metrics::ControllerMetrics;

const FINALIZER: &str = "roundtable.ai/agent-cleanup";

/// Entrypoint for the `Agent` controller.
pub async fn run(client: Client, default_bus_url: String, leader_election: bool) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Agent controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), default_bus_url));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("roundtable-agent-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "roundtable-agent-controller-lock".to_string();
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        roundtable_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    roundtable_common::signal_ready();
    println!("{}", "🌱 Starting Agent controller...".green());
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let is_leader = if leader_election {
            match leadership.try_acquire_or_renew().await {
                Ok(l) => matches!(l, LeaseLockResult::Acquired(_)),
                Err(e) => {
                    eprintln!("leader election renew/acquire failed: {e}");
                    if let Some(task) = controller_task.take() {
                        task.abort();
                        eprintln!("aborted controller due to leader election error");
                    }
                    continue;
                }
            }
        } else {
            true
        };
        if is_leader {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting Agent controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<Agent> = Api::namespaced(client_for_controller.clone(), &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Agent controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .owns(
                            Api::<Deployment>::namespaced(client_for_controller.clone(), &controller_namespace),
                            Default::default(),
                        )
                        .owns(
                            Api::<ConfigMap>::namespaced(client_for_controller.clone(), &controller_namespace),
                            Default::default(),
                        )
                        .owns(
                            Api::<PersistentVolumeClaim>::namespaced(client_for_controller, &controller_namespace),
                            Default::default(),
                        )
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping Agent controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    bus: Bus,
    default_bus_url: String,
    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
    last_action: Mutex<HashMap<(String, String), (AgentAction, Instant)>>,
}

impl ContextData {
    fn new(client: Client, default_bus_url: String) -> Self {
        let bus = Bus::new(default_bus_url.clone());
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                bus,
                default_bus_url,
                metrics: ControllerMetrics::new("agents"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                bus,
                default_bus_url,
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
enum AgentAction {
    InstallFinalizer,
    Teardown,
    Suspend,
    Reconcile,
    Error(String),
    NoOp,
    Requeue(Duration),
}

impl AgentAction {
    fn to_str(&self) -> &str {
        match self {
            AgentAction::InstallFinalizer => "InstallFinalizer",
            AgentAction::Teardown => "Teardown",
            AgentAction::Suspend => "Suspend",
            AgentAction::Reconcile => "Reconcile",
            AgentAction::Error(_) => "Error",
            AgentAction::NoOp => "NoOp",
            AgentAction::Requeue(_) => "Requeue",
        }
    }
}

async fn reconcile(instance: Arc<Agent>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = instance.namespace().ok_or_else(|| {
        Error::UserInput("Expected Agent resource to be namespaced.".to_owned())
    })?;
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context.metrics.record_reconcile(&namespace, &name);
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let action = determine_action(&instance);

    if action != AgentAction::NoOp {
        let mut la = context.last_action.lock().await;
        let previous = la.insert((namespace.clone(), name.clone()), (action.clone(), Instant::now()));
        if previous.as_ref().map(|(a, _)| a) != Some(&action) {
            println!(
                "🔧 {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " ACTION: ".color(FG1),
                format!("{:?}", action).color(FG2),
            );
        }
    }

    #[cfg(feature = "metrics")]
    context.metrics.observe_read_phase(start.elapsed());
    #[cfg(feature = "metrics")]
    context.metrics.record_action(action.to_str());

    let result = match action {
        AgentAction::Requeue(d) => Action::requeue(d),
        AgentAction::InstallFinalizer => {
            install_finalizer(client, &instance).await?;
            Action::requeue(Duration::from_secs(1))
        }
        AgentAction::Teardown => {
            run_teardown(client, &context.bus, &instance).await?;
            Action::await_change()
        }
        AgentAction::Suspend => {
            actions::suspend(client.clone(), &instance).await?;
            actions::mark_phase(
                client,
                &instance,
                AgentPhase::Suspended,
                false,
                true,
                "Suspended",
                "spec.suspended is true".to_string(),
            )
            .await?;
            Action::requeue(PROBE_INTERVAL)
        }
        AgentAction::Reconcile => {
            let bus_url = instance.spec.bus.url.clone().unwrap_or_else(|| context.default_bus_url.clone());
            match actions::reconcile_children(client.clone(), &instance, &bus_url).await {
                Ok(()) => {
                    ensure_consumer(&context.bus, &instance).await;
                    report_ready_phase(client, &instance).await?;
                }
                Err(e) => {
                    actions::mark_phase(
                        client,
                        &instance,
                        AgentPhase::Degraded,
                        false,
                        false,
                        "ChildUpsertFailed",
                        e.to_string(),
                    )
                    .await?;
                }
            }
            Action::requeue(PROBE_INTERVAL)
        }
        AgentAction::Error(message) => {
            actions::mark_phase(client, &instance, AgentPhase::Degraded, false, false, "Error", message).await?;
            Action::requeue(Duration::from_secs(30))
        }
        AgentAction::NoOp => Action::requeue(PROBE_INTERVAL),
    };

    #[cfg(feature = "metrics")]
    context.metrics.observe_write_phase(start.elapsed());

    Ok(result)
}

fn determine_action(instance: &Agent) -> AgentAction {
    let has_finalizer = instance.finalizers().iter().any(|f| f == FINALIZER);
    if instance.meta().deletion_timestamp.is_some() {
        return if has_finalizer {
            AgentAction::Teardown
        } else {
            AgentAction::NoOp
        };
    }
    if !has_finalizer {
        return AgentAction::InstallFinalizer;
    }
    if instance.spec.suspended {
        return AgentAction::Suspend;
    }
    if let Err(msg) = instance.spec.validate() {
        return AgentAction::Error(msg);
    }
    AgentAction::Reconcile
}

async fn install_finalizer(client: Client, instance: &Agent) -> Result<(), Error> {
    let namespace = instance.namespace().unwrap();
    let api: Api<Agent> = Api::namespaced(client, &namespace);
    let mut finalizers = instance.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == FINALIZER) {
        finalizers.push(FINALIZER.to_string());
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        api.patch(
            &instance.name_any(),
            &kube::api::PatchParams::apply(MANAGER_NAME),
            &kube::api::Patch::Merge(patch),
        )
        .await?;
    }
    Ok(())
}

async fn run_teardown(client: Client, bus: &Bus, instance: &Agent) -> Result<(), Error> {
    actions::teardown_consumer(bus, instance).await?;
    let namespace = instance.namespace().unwrap();
    let api: Api<Agent> = Api::namespaced(client, &namespace);
    let finalizers: Vec<String> = instance
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &instance.name_any(),
        &kube::api::PatchParams::apply(MANAGER_NAME),
        &kube::api::Patch::Merge(patch),
    )
    .await?;
    Ok(())
}

async fn ensure_consumer(bus: &Bus, instance: &Agent) {
    let stream = instance
        .spec
        .bus
        .primary_stream
        .clone()
        .unwrap_or_else(|| "tasks".to_string());
    let consumer = actions::consumer_name(instance);
    let max_deliver = instance.spec.bus.max_deliver.unwrap_or(5);
    if let Err(e) = bus
        .ensure_consumer(&stream, &consumer, instance.spec.bus.filter_subjects.clone(), max_deliver)
        .await
    {
        eprintln!("🛑 failed to ensure consumer {consumer} on stream {stream}: {e}");
    }
}

/// Derives phase from the owned Deployment's ready-replica count, per
/// `spec.md` §4.1 step 6.
async fn report_ready_phase(client: Client, instance: &Agent) -> Result<(), Error> {
    let namespace = instance.namespace().unwrap();
    let deploy_api: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    let ready = deploy_api
        .get(&actions::deployment_name(instance))
        .await
        .ok()
        .and_then(|d| d.status)
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
        >= 1;
    let phase = if ready { AgentPhase::Ready } else { AgentPhase::Provisioning };
    actions::mark_phase(
        client,
        instance,
        phase,
        ready,
        ready,
        if ready { "AllReplicasReady" } else { "WaitingForReplicas" },
        format!("phase={phase}"),
    )
    .await
}

fn on_error(instance: Arc<Agent>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!("{}", format!("Agent reconciliation error: {error:?} {instance:?}").red());
    Action::requeue(Duration::from_secs(5))
}
