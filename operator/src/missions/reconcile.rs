use chrono::Utc;
use futures::stream::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
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

use super::{actions, planner};
use crate::util::{
    Error, MANAGER_NAME, PROBE_INTERVAL,
    colors::{FG1, FG2},
    patch::patch_status,
};

#[cfg(feature = "metrics")]
use roundtable_common::metrics::ControllerMetrics;

const FINALIZER: &str = "roundtable.ai/mission-cleanup";

/// Entrypoint for the `Mission` controller.
pub async fn run(client: Client, default_bus_url: String, leader_election: bool) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Mission controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), default_bus_url));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("roundtable-mission-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "roundtable-mission-controller-lock".to_string();
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
    println!("{}", "🌱 Starting Mission controller...".green());
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
                println!("{}", "👑 Acquired leadership; starting Mission controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<Mission> = Api::namespaced(client_for_controller.clone(), &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Mission controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .owns(
                            Api::<Agent>::namespaced(client_for_controller, &controller_namespace),
                            Default::default(),
                        )
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping Mission controller");
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
                metrics: ControllerMetrics::new("missions"),
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

fn has_finalizer(instance: &Mission) -> bool {
    instance.finalizers().iter().any(|f| f == FINALIZER)
}

async fn reconcile(instance: Arc<Mission>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = instance.namespace().ok_or_else(|| {
        Error::UserInput("Expected Mission resource to be namespaced.".to_owned())
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
    } else if matches!(
        instance.status.as_ref().map(|s| s.phase).unwrap_or_default(),
        MissionPhase::Assembling
    ) && let Err(msg) = instance.spec.validate()
    {
        mark(client, &instance, MissionPhase::Failed, false, "InvalidSpec", msg).await?;
        Action::requeue(PROBE_INTERVAL)
    } else {
        advance(client, &context.bus, &instance).await?
    };

    #[cfg(feature = "metrics")]
    context.metrics.observe_write_phase(start.elapsed());
    #[cfg(feature = "metrics")]
    context.metrics.record_action(&label);

    Ok(result)
}

fn describe(instance: &Mission) -> String {
    if instance.meta().deletion_timestamp.is_some() {
        return "Teardown".to_string();
    }
    if !has_finalizer(instance) {
        return "InstallFinalizer".to_string();
    }
    format!("Phase({})", instance.status.as_ref().map(|s| s.phase).unwrap_or_default())
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

async fn install_finalizer(client: Client, instance: &Mission) -> Result<(), Error> {
    let namespace = instance.namespace().unwrap();
    let api: Api<Mission> = Api::namespaced(client, &namespace);
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

/// Ephemeral Agent children are deleted by cluster GC via owner
/// references; the finalizer only needs to clear itself
/// (`spec.md` §3 "Lifecycle & Ownership").
async fn teardown(client: Client, instance: &Mission) -> Result<Action, Error> {
    let namespace = instance.namespace().unwrap();
    let api: Api<Mission> = Api::namespaced(client, &namespace);
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

async fn mark(
    client: Client,
    instance: &Mission,
    phase: MissionPhase,
    cond_status: bool,
    reason: &str,
    message: String,
) -> Result<(), Error> {
    let generation = instance.meta().generation.unwrap_or(0);
    patch_status::<MissionStatus, Mission>(client, instance, |s| {
        s.phase = phase;
        if matches!(phase, MissionPhase::Succeeded | MissionPhase::Failed | MissionPhase::Expired)
            && s.completed_at.is_none()
        {
            s.completed_at = Some(actions::now());
        }
        set_condition(&mut s.conditions, "Available", cond_status, reason, message, generation);
    })
    .await?;
    Ok(())
}

/// The phase machine, run once the finalizer is in place and the Mission
/// is not being deleted (`spec.md` §4.3 state table).
async fn advance(client: Client, bus: &Bus, instance: &Mission) -> Result<Action, Error> {
    let now = Utc::now();

    // First sight: initialize status (Assembling, startedAt, expiresAt).
    if instance.status.is_none() {
        let expires_at = planner::compute_expiry(now, instance.spec.ttl_seconds);
        patch_status::<MissionStatus, Mission>(client, instance, |s| {
            s.phase = MissionPhase::Assembling;
            s.started_at = Some(Time(now));
            s.expires_at = Some(Time(expires_at));
        })
        .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let status = instance.status.clone().unwrap_or_default();
    let phase = status.phase;
    let expires_at = status.expires_at.as_ref().map(|t| t.0).unwrap_or(now);
    let started_at = status.started_at.as_ref().map(|t| t.0).unwrap_or(now);

    if !matches!(phase, MissionPhase::Expired | MissionPhase::CleaningUp)
        && planner::is_expired(expires_at, now)
    {
        mark(client, instance, MissionPhase::Expired, false, "Expired", "mission TTL elapsed".to_string()).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let namespace = actions::instance_namespace(instance)?;

    match phase {
        MissionPhase::Assembling => handle_assembling(client, instance, namespace).await,
        MissionPhase::Briefing => handle_briefing(client, bus, instance, namespace).await,
        MissionPhase::Active => handle_active(client, instance, namespace, started_at, now).await,
        MissionPhase::Succeeded | MissionPhase::Failed => {
            mark(
                client,
                instance,
                MissionPhase::CleaningUp,
                false,
                "CleaningUp",
                "tearing down mission resources".to_string(),
            )
            .await?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        MissionPhase::Expired => {
            mark(
                client,
                instance,
                MissionPhase::CleaningUp,
                false,
                "CleaningUp",
                "tearing down expired mission".to_string(),
            )
            .await?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        MissionPhase::CleaningUp => handle_cleaning_up(client, instance, namespace, expires_at, now).await,
    }
}

async fn handle_assembling(client: Client, instance: &Mission, namespace: &str) -> Result<Action, Error> {
    actions::ensure_ephemeral_agents(client.clone(), instance).await?;

    if instance.spec.all_ephemeral() {
        mark(
            client,
            instance,
            MissionPhase::Failed,
            false,
            "AllEphemeralUnsupported",
            "missions composed entirely of ephemeral agents are not supported in this version".to_string(),
        )
        .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let (readiness, total_cost) = actions::non_ephemeral_readiness(client.clone(), namespace, instance).await;
    let all_ready = planner::non_ephemeral_agents_ready(&readiness);
    let generation = instance.meta().generation.unwrap_or(0);
    let next_phase = if all_ready { MissionPhase::Briefing } else { MissionPhase::Assembling };
    patch_status::<MissionStatus, Mission>(client, instance, |s| {
        s.phase = next_phase;
        s.agents = readiness.clone();
        s.total_cost = planner::format_cost(total_cost);
        set_condition(
            &mut s.conditions,
            "KnightsReady",
            all_ready,
            if all_ready { "AllAgentsReady" } else { "AgentsNotReady" },
            format!("{}/{} non-ephemeral agents ready", readiness.iter().filter(|a| a.ready).count(), readiness.len()),
            generation,
        );
    })
    .await?;
    Ok(Action::requeue(if all_ready {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(5)
    }))
}

async fn handle_briefing(client: Client, bus: &Bus, instance: &Mission, namespace: &str) -> Result<Action, Error> {
    if instance.spec.briefing.trim().is_empty() {
        mark(client, instance, MissionPhase::Active, true, "NoBriefing", "no briefing configured".to_string()).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }
    let prefix = actions::resolve_prefix(client.clone(), namespace, instance).await;
    match actions::publish_briefing(client.clone(), bus, &prefix, instance).await {
        Ok(()) => {
            mark(client, instance, MissionPhase::Active, true, "BriefingPublished", "briefing delivered".to_string()).await?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        Err(e) => {
            mark(client, instance, MissionPhase::Briefing, false, "BriefingPublishFailed", e.to_string()).await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }
    }
}

async fn handle_active(
    client: Client,
    instance: &Mission,
    namespace: &str,
    started_at: chrono::DateTime<Utc>,
    now: chrono::DateTime<Utc>,
) -> Result<Action, Error> {
    if planner::timed_out(started_at, now, instance.spec.timeout_seconds) {
        mark(client, instance, MissionPhase::Failed, false, "Timeout", "mission exceeded its overall timeout".to_string()).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    match actions::active_pipelines_outcome(client.clone(), namespace, instance).await {
        Some(true) => {
            mark(client, instance, MissionPhase::Succeeded, true, "PipelinesSucceeded", "active-stage pipelines completed".to_string()).await?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        Some(false) => {
            mark(client, instance, MissionPhase::Failed, false, "PipelineFailed", "an active-stage pipeline failed".to_string()).await?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        None => Ok(Action::requeue(Duration::from_secs(5))),
    }
}

async fn handle_cleaning_up(
    client: Client,
    instance: &Mission,
    namespace: &str,
    expires_at: chrono::DateTime<Utc>,
    now: chrono::DateTime<Utc>,
) -> Result<Action, Error> {
    actions::launch_teardown_pipelines(client.clone(), namespace, instance).await?;
    if !actions::teardown_pipelines_terminal(client.clone(), namespace, instance).await {
        return Ok(Action::requeue(Duration::from_secs(5)));
    }
    if instance.spec.cleanup_policy == CleanupPolicy::Delete && now >= expires_at {
        actions::delete_self(client, instance).await?;
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(PROBE_INTERVAL))
}

fn on_error(instance: Arc<Mission>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!("{}", format!("Mission reconciliation error: {error:?} {instance:?}").red());
    Action::requeue(Duration::from_secs(5))
}
