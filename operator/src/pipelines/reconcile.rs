use chrono::Utc;
use futures::stream::StreamExt;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use roundtable_common::{bus::Bus, cron::CronScheduler};
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

const FINALIZER: &str = "roundtable.ai/pipeline-cleanup";

/// Entrypoint for the `Pipeline` controller.
pub async fn run(client: Client, default_bus_url: String, leader_election: bool) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Pipeline controller...".green());

    let (scheduler, mut cron_rx) = CronScheduler::new();
    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), default_bus_url, scheduler));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("roundtable-pipeline-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "roundtable-pipeline-controller-lock".to_string();
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
    println!("{}", "🌱 Starting Pipeline controller...".green());
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
            _ = tick.tick() => {},
            Some(key) = cron_rx.recv() => {
                kick(client.clone(), &key).await;
                continue;
            }
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
                println!("{}", "👑 Acquired leadership; starting Pipeline controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<Pipeline> = Api::namespaced(client_for_controller, &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Pipeline controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping Pipeline controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    bus: Bus,
    scheduler: CronScheduler,
    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
    last_action: Mutex<HashMap<(String, String), (String, Instant)>>,
}

impl ContextData {
    fn new(client: Client, default_bus_url: String, scheduler: CronScheduler) -> Self {
        let bus = Bus::new(default_bus_url);
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                bus,
                scheduler,
                metrics: ControllerMetrics::new("pipelines"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                bus,
                scheduler,
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }
}

fn has_finalizer(instance: &Pipeline) -> bool {
    instance.finalizers().iter().any(|f| f == FINALIZER)
}

async fn reconcile(instance: Arc<Pipeline>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = instance.namespace().ok_or_else(|| {
        Error::UserInput("Expected Pipeline resource to be namespaced.".to_owned())
    })?;
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context.metrics.record_reconcile(&namespace, &name);
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let label = log_action(&context, &namespace, &name, describe(&instance)).await;
    if !label.is_empty() {
        println!(
            "🔧 {}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " ACTION: ".color(FG1),
            label.color(FG2),
        );
    }

    if instance.meta().deletion_timestamp.is_some() {
        let result = if has_finalizer(&instance) {
            teardown(client, &context.scheduler, &instance).await?
        } else {
            Action::await_change()
        };
        #[cfg(feature = "metrics")]
        context.metrics.observe_write_phase(start.elapsed());
        return Ok(result);
    }
    if !has_finalizer(&instance) {
        install_finalizer(client, &instance).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    match validate(client.clone(), &instance).await {
        Err((reason, message)) => {
            mark_valid(client, &instance, false, reason, message).await?;
            return Ok(Action::requeue(PROBE_INTERVAL));
        }
        Ok(()) => {
            mark_valid(
                client.clone(),
                &instance,
                true,
                "Validated",
                "agent references resolve and the step graph is acyclic".to_string(),
            )
            .await?;
        }
    }

    actions::sync_schedule(&context.scheduler, &instance);

    let result = if instance.spec.suspended {
        suspend(client, &instance).await?
    } else {
        let phase = instance.status.as_ref().map(|s| s.phase).unwrap_or_default();
        match phase {
            PipelinePhase::Running => execute(client, &context.bus, &instance).await?,
            _ => Action::requeue(PROBE_INTERVAL),
        }
    };

    #[cfg(feature = "metrics")]
    context.metrics.observe_write_phase(start.elapsed());
    #[cfg(feature = "metrics")]
    context.metrics.record_action(&label);

    Ok(result)
}

fn describe(instance: &Pipeline) -> String {
    if instance.meta().deletion_timestamp.is_some() {
        return "Teardown".to_string();
    }
    if !has_finalizer(instance) {
        return "InstallFinalizer".to_string();
    }
    if instance.spec.suspended {
        return "Suspend".to_string();
    }
    match instance.status.as_ref().map(|s| s.phase).unwrap_or_default() {
        PipelinePhase::Running => "Execute".to_string(),
        other => format!("Idle({other})"),
    }
}

async fn log_action(context: &ContextData, namespace: &str, name: &str, action: String) -> String {
    let mut la = context.last_action.lock().await;
    let previous = la.insert((namespace.to_string(), name.to_string()), (action.clone(), Instant::now()));
    if previous.as_ref().map(|(a, _)| a.as_str()) != Some(action.as_str()) {
        action
    } else {
        String::new()
    }
}

async fn install_finalizer(client: Client, instance: &Pipeline) -> Result<(), Error> {
    let namespace = instance.namespace().unwrap();
    let api: Api<Pipeline> = Api::namespaced(client, &namespace);
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

async fn teardown(client: Client, scheduler: &CronScheduler, instance: &Pipeline) -> Result<Action, Error> {
    let key = format!("{}/{}", instance.namespace().unwrap_or_default(), instance.name_any());
    scheduler.remove(&key);
    let namespace = instance.namespace().unwrap();
    let api: Api<Pipeline> = Api::namespaced(client, &namespace);
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

/// Every-reconcile validation: agent resolution then DAG acyclicity
/// (`spec.md` §4.2 "Validation pass").
async fn validate(client: Client, instance: &Pipeline) -> Result<(), (&'static str, String)> {
    let namespace = actions::instance_namespace(instance).map_err(|e| ("InvalidAgentRef", e.to_string()))?;
    if let Some(missing) = actions::first_missing_agent_ref(client, namespace, &instance.spec.steps).await {
        return Err(("InvalidAgentRef", format!("step references unknown agent {missing:?}")));
    }
    instance
        .spec
        .validate_dag()
        .map(|_| ())
        .map_err(|e| (e.reason(), e.to_string()))
}

async fn mark_valid(client: Client, instance: &Pipeline, valid: bool, reason: &str, message: String) -> Result<(), Error> {
    let generation = instance.meta().generation.unwrap_or(0);
    patch_status::<PipelineStatus, Pipeline>(client, instance, |s| {
        set_condition(&mut s.conditions, "Valid", valid, reason, message, generation);
    })
    .await?;
    Ok(())
}

async fn suspend(client: Client, instance: &Pipeline) -> Result<Action, Error> {
    let already_suspended = instance.status.as_ref().map(|s| s.phase) == Some(PipelinePhase::Suspended);
    if !already_suspended {
        let generation = instance.meta().generation.unwrap_or(0);
        patch_status::<PipelineStatus, Pipeline>(client, instance, |s| {
            s.phase = PipelinePhase::Suspended;
            set_condition(
                &mut s.conditions,
                "Complete",
                false,
                "Suspended",
                "spec.suspended is true".to_string(),
                generation,
            );
        })
        .await?;
    }
    Ok(Action::requeue(PROBE_INTERVAL))
}

/// Re-initializes a Pipeline for a fresh scheduled run when its cron entry
/// fires (`spec.md` §4.2 "Schedule management").
async fn kick(client: Client, key: &str) {
    let Some((namespace, name)) = key.split_once('/') else {
        return;
    };
    let api: Api<Pipeline> = Api::namespaced(client.clone(), namespace);
    let Ok(instance) = api.get(name).await else {
        return;
    };
    if instance.spec.suspended {
        return;
    }
    let generation = instance.meta().generation.unwrap_or(0);
    let reset = planner::reset_steps(&instance.spec.steps);
    let result = patch_status::<PipelineStatus, Pipeline>(client, &instance, |s| {
        s.phase = PipelinePhase::Running;
        s.steps = reset;
        s.started_at = Some(actions::now());
        s.completed_at = None;
        s.last_scheduled_at = Some(actions::now());
        set_condition(
            &mut s.conditions,
            "Complete",
            false,
            "Running",
            "scheduled run started".to_string(),
            generation,
        );
    })
    .await;
    if let Err(e) = result {
        eprintln!("🛑 cron trigger for {key} failed: {e}");
    }
}

async fn finish(client: Client, instance: &Pipeline, phase: PipelinePhase, reason: &str, message: String, is_failure: bool) -> Result<(), Error> {
    let generation = instance.meta().generation.unwrap_or(0);
    let runs_completed = instance.status.as_ref().map(|s| s.runs_completed).unwrap_or(0);
    let runs_failed = instance.status.as_ref().map(|s| s.runs_failed).unwrap_or(0);
    patch_status::<PipelineStatus, Pipeline>(client, instance, |s| {
        s.phase = phase;
        if is_failure {
            s.runs_failed = runs_failed + 1;
        } else {
            s.runs_completed = runs_completed + 1;
        }
        s.completed_at = Some(actions::now());
        set_condition(&mut s.conditions, "Complete", !is_failure, reason, message, generation);
    })
    .await?;
    Ok(())
}

/// The execution pass, run only while `phase == Running`
/// (`spec.md` §4.2 "Execution pass").
async fn execute(client: Client, bus: &Bus, instance: &Pipeline) -> Result<Action, Error> {
    let namespace = actions::instance_namespace(instance)?;
    let name = actions::instance_name(instance)?;
    let now = Utc::now();
    let status = instance.status.clone().unwrap_or_default();
    let started_at = status.started_at.as_ref().map(|t| t.0).unwrap_or(now);

    if planner::timed_out(started_at, now, instance.spec.timeout_seconds) {
        finish(
            client,
            instance,
            PipelinePhase::Failed,
            "Timeout",
            "pipeline exceeded its overall timeout".to_string(),
            true,
        )
        .await?;
        return Ok(Action::requeue(PROBE_INTERVAL));
    }

    let prefix = actions::resolve_prefix(client.clone(), namespace, &instance.spec.fleet_ref).await;
    let mut statuses = status.steps.clone();
    if statuses.is_empty() {
        statuses = planner::reset_steps(&instance.spec.steps);
    }

    for st in statuses.iter_mut() {
        if st.phase != StepPhase::Running {
            continue;
        }
        let Some(step_def) = instance.spec.steps.iter().find(|s| s.name == st.name) else {
            continue;
        };
        let step_started = st.started_at.as_ref().map(|t| t.0).unwrap_or(now);
        if planner::timed_out(step_started, now, step_def.timeout_seconds) {
            st.phase = StepPhase::Failed;
            st.error = Some("step timed out".to_string());
            st.completed_at = Some(actions::now());
            continue;
        }
        match actions::poll_step_result(bus, &prefix, name, &st.name).await {
            Ok(Some(result)) => {
                if let Some(err) = result.error {
                    if st.retries < instance.spec.retry_policy.max_retries {
                        st.phase = StepPhase::Pending;
                        st.retries += 1;
                        st.completed_at = Some(actions::now());
                        st.error = None;
                    } else {
                        st.phase = StepPhase::Failed;
                        st.error = Some(err);
                        st.completed_at = Some(actions::now());
                    }
                } else {
                    st.phase = StepPhase::Succeeded;
                    st.output = result.output;
                    st.error = None;
                    st.completed_at = Some(actions::now());
                }
            }
            Ok(None) => {}
            Err(e) => eprintln!("🛑 poll for step {} of {name} failed: {e}", st.name),
        }
    }

    for step_def in &instance.spec.steps {
        if !planner::step_is_ready(step_def, &statuses, &instance.spec.steps) {
            continue;
        }
        let backed_off = statuses
            .iter()
            .find(|s| s.name == step_def.name)
            .is_some_and(|s| planner::in_backoff(s, now, instance.spec.retry_policy.backoff_seconds));
        if backed_off {
            continue;
        }

        let ctx = planner::template_context(instance.spec.input.as_deref(), &statuses);
        let rendered = match roundtable_common::template::render(&step_def.task, &ctx) {
            Ok(r) => r,
            Err(e) => {
                if let Some(st) = statuses.iter_mut().find(|s| s.name == step_def.name) {
                    st.phase = StepPhase::Failed;
                    st.error = Some(e.to_string());
                    st.completed_at = Some(actions::now());
                }
                continue;
            }
        };

        let domain = match actions::agent_domain(client.clone(), namespace, &step_def.agent_ref).await {
            Ok(d) => d,
            Err(e) => {
                if let Some(st) = statuses.iter_mut().find(|s| s.name == step_def.name) {
                    st.phase = StepPhase::Failed;
                    st.error = Some(e.to_string());
                    st.completed_at = Some(actions::now());
                }
                continue;
            }
        };

        let task_id = planner::task_id(name, &step_def.name, now);
        if let Err(e) = actions::publish_task(
            bus,
            &prefix,
            &domain,
            &step_def.agent_ref,
            name,
            &step_def.name,
            rendered,
            &task_id,
        )
        .await
        {
            eprintln!("🛑 publish for step {} of {name} failed: {e}", step_def.name);
            continue;
        }
        if let Some(st) = statuses.iter_mut().find(|s| s.name == step_def.name) {
            st.phase = StepPhase::Running;
            st.started_at = Some(actions::now());
        }
    }

    let mut phase = PipelinePhase::Running;
    let mut runs_completed = status.runs_completed;
    let mut runs_failed = status.runs_failed;
    let mut completed_at = status.completed_at.clone();
    if planner::all_terminal(&statuses) {
        if planner::any_hard_failure(&statuses, &instance.spec.steps) {
            for st in statuses.iter_mut() {
                if st.phase == StepPhase::Pending {
                    st.phase = StepPhase::Skipped;
                }
            }
            phase = PipelinePhase::Failed;
            runs_failed += 1;
        } else {
            phase = PipelinePhase::Succeeded;
            runs_completed += 1;
        }
        completed_at = Some(actions::now());
    }

    let (cond_status, reason, message) = match phase {
        PipelinePhase::Succeeded => (true, "AllStepsSucceeded", "all steps completed".to_string()),
        PipelinePhase::Failed => (false, "StepFailed", "one or more steps failed".to_string()),
        _ => (false, "Running", "pipeline is executing".to_string()),
    };

    let generation = instance.meta().generation.unwrap_or(0);
    patch_status::<PipelineStatus, Pipeline>(client, instance, |s| {
        s.phase = phase;
        s.steps = statuses.clone();
        s.runs_completed = runs_completed;
        s.runs_failed = runs_failed;
        s.completed_at = completed_at.clone();
        set_condition(&mut s.conditions, "Complete", cond_status, reason, message, generation);
    })
    .await?;

    Ok(Action::requeue(if phase == PipelinePhase::Running {
        Duration::from_secs(5)
    } else {
        PROBE_INTERVAL
    }))
}

fn on_error(instance: Arc<Pipeline>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!("{}", format!("Pipeline reconciliation error: {error:?} {instance:?}").red());
    Action::requeue(Duration::from_secs(5))
}
