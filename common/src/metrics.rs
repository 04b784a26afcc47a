use axum::{Router, routing::get};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use owo_colors::OwoColorize;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

use crate::shutdown::shutdown_signal;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static SERVER_STARTED: OnceLock<()> = OnceLock::new();

fn install_recorder_once() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install global metrics recorder")
    })
}

/// Spawns the `/metrics` + `/healthz` + `/readyz` server exactly once per
/// process, guarded by a `OnceLock` so multiple controllers calling this
/// don't each try to bind the port.
pub fn maybe_spawn_metrics_server(port: u16) {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    if SERVER_STARTED.set(()).is_ok() {
        let _ = install_recorder_once();
        tokio::spawn(run_metrics_server(port));
    }
}

async fn run_metrics_server(port: u16) {
    let handle = install_recorder_once().clone();
    let metrics_route = get(move || async move { handle.render() });
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", metrics_route);
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            eprintln!("🛑 Failed to bind metrics server to {}: {}", addr, e);
            e
        })
        .unwrap();
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    let started = Instant::now();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to serve metrics");
    println!(
        "{} {}",
        "🛑 Metrics server stopped gracefully • uptime was".red(),
        format!("{:.2?}", started.elapsed()).red().dimmed()
    );
}

/// Per-controller reconcile metrics, one instance per CRD kind
/// (`agents`, `pipelines`, `missions`, `fleets`).
#[derive(Clone)]
pub struct ControllerMetrics {
    controller: &'static str,
}

impl ControllerMetrics {
    pub fn new(controller: &'static str) -> Self {
        Self { controller }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str) {
        counter!(
            "operator_reconcile_total",
            "controller" => self.controller,
            "namespace" => namespace.to_string(),
            "name" => name.to_string()
        )
        .increment(1);
    }

    pub fn record_action(&self, action: &str) {
        counter!(
            "operator_action_total",
            "controller" => self.controller,
            "action" => action.to_string()
        )
        .increment(1);
    }

    pub fn observe_read_phase(&self, elapsed: Duration) {
        histogram!(
            "operator_reconcile_read_seconds",
            "controller" => self.controller
        )
        .record(elapsed.as_secs_f64());
    }

    pub fn observe_write_phase(&self, elapsed: Duration) {
        histogram!(
            "operator_reconcile_write_seconds",
            "controller" => self.controller
        )
        .record(elapsed.as_secs_f64());
    }
}
