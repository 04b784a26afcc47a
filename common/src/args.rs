use clap::Parser;

/// Operator process configuration (`spec.md` §6 "Configuration"). Flat
/// struct, no subcommands - the operator has exactly one mode of
/// operation, unlike the platform's other binaries.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct OperatorArgs {
    /// Message-bus connection URL.
    #[arg(long, env = "BUS_URL", default_value = "nats://roundtable-nats:4222")]
    pub bus_url: String,

    /// Enable leader election so only one replica runs each controller.
    #[arg(long, env = "LEADER_ELECTION", default_value_t = true)]
    pub leader_election: bool,

    /// Port the Prometheus `/metrics` + `/healthz` + `/readyz` server listens on.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Namespace the leader-election Lease objects live in.
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,
}
