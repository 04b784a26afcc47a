use futures::stream::StreamExt;
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
    Error, MANAGER_NAME,
    colors::{FG1, FG2},
    patch::patch_status,
};

#[cfg(feature = "metrics")]
use roundtable_common::metrics::ControllerMetrics;

const FINALIZER: &str = "roundtable.ai/fleet-cleanup";
/// `spec.md` §4.4 "forced reconcile every 60s" - Fleet health/cost is
/// derived from other resources, not watched directly, so a periodic
/// sweep is the only way to notice drift between reconciles.
const FORCE_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Entrypoint for the `Fleet` controller.
pub async fn run(client: Client, default_bus_url: String, leader_election: bool) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Fleet controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), default_bus_url));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("roundtable-fleet-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "roundtable-fleet-controller-lock".to_string();
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
    println!("{}", "🌱 Starting Fleet controller...".green());
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
                println!("{}", "👑 Acquired leadership; starting Fleet controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<Fleet> = Api::namespaced(client_for_controller, &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Fleet controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping Fleet controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    bus: Bus,
    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
    last_action: Mutex<HashMap<(String, String), (String, Instant)>>,
}

impl ContextData {
    fn new(client: Client, default_bus_url: String) -> Self {
        let bus = Bus::new(default_bus_url);
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                bus,
                metrics: ControllerMetrics::new("fleets"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                bus,
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }
}

fn has_finalizer(instance: &Fleet) -> bool {
    instance.finalizers().iter().any(|f| f == FINALIZER)
}

async fn reconcile(instance: Arc<Fleet>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = instance.namespace().ok_or_else(|| {
        Error::UserInput("Expected Fleet resource to be namespaced.".to_owned())
    })?;
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context.metrics.record_reconcile(&namespace, &name);
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let label = describe(&instance);
    log_if_changed(&context, &namespace, &name, &label).await;

    let result = if instance.meta().deletion_timestamp.is_some() {
        if has_finalizer(&instance) {
            teardown(client, &instance).await?
        } else {
            Action::await_change()
        }
    } else if !has_finalizer(&instance) {
        install_finalizer(client, &instance).await?;
        Action::requeue(Duration::from_secs(1))
    } else {
        evaluate(client, &context.bus, &namespace, &instance).await?
    };

    #[cfg(feature = "metrics")]
    context.metrics.observe_write_phase(start.elapsed());
    #[cfg(feature = "metrics")]
    context.metrics.record_action(&label);

    Ok(result)
}

fn describe(instance: &Fleet) -> String {
    if instance.meta().deletion_timestamp.is_some() {
        return "Teardown".to_string();
    }
    if !has_finalizer(instance) {
        return "InstallFinalizer".to_string();
    }
    if instance.spec.suspended {
        return "Suspend".to_string();
    }
    "Evaluate".to_string()
}

async fn log_if_changed(context: &ContextData, namespace: &str, name: &str, action: &str) {
    let mut la = context.last_action.lock().await;
    let previous = la.insert((namespace.to_string(), name.to_string()), (action.to_string(), Instant::now()));
    if previous.as_ref().map(|(a, _)| a.as_str()) != Some(action) {
        println!(
            "🔧 {}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " ACTION: ".color(FG1),
            action.color(FG2),
        );
    }
}

async fn install_finalizer(client: Client, instance: &Fleet) -> Result<(), Error> {
    let namespace = instance.namespace().unwrap();
    let api: Api<Fleet> = Api::namespaced(client, &namespace);
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

/// Member Agents are discovered by label selector, not owned, so there is
/// nothing for the Fleet to cascade-delete - the finalizer only clears
/// itself (`spec.md` §4.4: "Fleet holds no owned children").
async fn teardown(client: Client, instance: &Fleet) -> Result<Action, Error> {
    let namespace = instance.namespace().unwrap();
    let api: Api<Fleet> = Api::namespaced(client, &namespace);
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
    Ok(Action::await_change())
}

/// The per-reconcile aggregation pass (`spec.md` §4.4 steps 1-5).
async fn evaluate(client: Client, bus: &Bus, namespace: &str, instance: &Fleet) -> Result<Action, Error> {
    if instance.spec.suspended {
        let generation = instance.meta().generation.unwrap_or(0);
        patch_status::<FleetStatus, Fleet>(client, instance, |s| {
            s.phase = FleetPhase::Suspended;
            set_condition(
                &mut s.conditions,
                "Available",
                false,
                "Suspended",
                "spec.suspended is true".to_string(),
                generation,
            );
        })
        .await?;
        return Ok(Action::requeue(FORCE_RECONCILE_INTERVAL));
    }

    if let Err(e) = actions::ensure_streams(bus, namespace, instance).await {
        eprintln!("🛑 stream provisioning for fleet {} failed: {e}", instance.name_any());
    }

    let agents = actions::discover_agents(client.clone(), namespace, instance).await?;
    let (summaries, total_cost, tasks_completed) = actions::summarize_agents(&agents);
    let (ready, total) = super::planner::summarize(&summaries);
    let active_missions = actions::count_active_missions(client.clone(), namespace, instance.name_any().as_str()).await?;
    let budget = instance.spec.policies.parsed_budget();
    let phase = compute_phase(instance.spec.suspended, ready, total, total_cost, budget);

    let (cond_status, reason, message) = match phase {
        FleetPhase::Ready => (true, "AllAgentsReady", format!("{ready}/{total} agents ready")),
        FleetPhase::Degraded => (false, "AgentsNotReady", format!("{ready}/{total} agents ready")),
        FleetPhase::OverBudget => (false, "BudgetExceeded", format!("total cost {total_cost:.2} exceeds budget")),
        FleetPhase::Provisioning => (false, "NoAgentsYet", "no matching agents discovered".to_string()),
        FleetPhase::Suspended => (false, "Suspended", "spec.suspended is true".to_string()),
    };

    let generation = instance.meta().generation.unwrap_or(0);
    patch_status::<FleetStatus, Fleet>(client, instance, |s| {
        s.phase = phase;
        s.ready_agents = ready;
        s.total_agents = total;
        s.agents = summaries.clone();
        s.tasks_completed = tasks_completed;
        s.total_cost = super::planner::format_cost(total_cost);
        s.active_missions = active_missions;
        s.last_updated = Some(actions::now());
        set_condition(&mut s.conditions, "Available", cond_status, reason, message, generation);
    })
    .await?;

    Ok(Action::requeue(FORCE_RECONCILE_INTERVAL))
}

fn on_error(instance: Arc<Fleet>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!("{}", format!("Fleet reconciliation error: {error:?} {instance:?}").red());
    Action::requeue(Duration::from_secs(5))
}
