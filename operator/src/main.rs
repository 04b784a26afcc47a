use clap::Parser;
use owo_colors::OwoColorize;
use roundtable_common::args::OperatorArgs;

mod agents;
mod fleets;
mod missions;
mod pipelines;
mod util;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    roundtable_common::init();

    let args = OperatorArgs::parse();
    // Each controller's leader-election loop reads NAMESPACE directly
    // rather than threading it through `run()`; mirror the parsed flag
    // into the environment so both paths agree on one value.
    unsafe {
        std::env::set_var("NAMESPACE", &args.namespace);
    }

    #[cfg(feature = "metrics")]
    roundtable_common::metrics::maybe_spawn_metrics_server(args.metrics_port);

    println!(
        "{}",
        format!(
            "🫡 roundtable-operator starting • bus={} namespace={} leader_election={}",
            args.bus_url, args.namespace, args.leader_election
        )
        .green()
    );

    let client = kube::Client::try_default().await?;

    let agents = agents::reconcile::run(client.clone(), args.bus_url.clone(), args.leader_election);
    let pipelines = pipelines::reconcile::run(client.clone(), args.bus_url.clone(), args.leader_election);
    let missions = missions::reconcile::run(client.clone(), args.bus_url.clone(), args.leader_election);
    let fleets = fleets::reconcile::run(client, args.bus_url.clone(), args.leader_election);

    let (agents, pipelines, missions, fleets) = tokio::join!(agents, pipelines, missions, fleets);
    agents?;
    pipelines?;
    missions?;
    fleets?;

    Ok(())
}
