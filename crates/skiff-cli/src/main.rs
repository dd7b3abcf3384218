use anyhow::Result;
use clap::{Parser, Subcommand};

use skiff_core::config::HarnessConfig;
use skiff_core::harness::{Harness, TestFlow};

#[derive(Parser)]
#[command(name = "skiff", about = "End-to-end test harness for the provisioning control plane")]
struct Cli {
    /// Leave resources in place after the run (overrides SKIFF_CLEANUP)
    #[arg(long, global = true)]
    keep: bool,

    /// Attempts per workflow step (1 disables retry)
    #[arg(long, global = true)]
    retries: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, reprovision, resize, and delete a cluster
    ClusterLifecycle,
    /// Exercise a full installation lifecycle on a fresh cluster
    InstallationLifecycle,
    /// Migrate an installation between multitenant databases
    DbMigration {
        /// Commit the migration instead of rolling it back
        #[arg(long)]
        commit: bool,
    },
}

fn flow_of(command: &Commands) -> TestFlow {
    match command {
        Commands::ClusterLifecycle => TestFlow::ClusterLifecycle,
        Commands::InstallationLifecycle => TestFlow::InstallationLifecycle,
        Commands::DbMigration { commit } => TestFlow::DbMigration { commit: *commit },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = HarnessConfig::from_env()?;
    if cli.keep {
        config.cleanup = false;
    }

    let flow = flow_of(&cli.command);
    let mut harness = Harness::build(config, flow)?;
    if let Some(retries) = cli.retries {
        harness = harness.with_retry_attempts(retries);
    }
    harness.run().await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if std::env::var("SKIFF_DEBUG").is_ok_and(|v| v == "true" || v == "1") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(err) = run(cli).await {
        tracing::error!(error = %format!("{err:#}"), "e2e run failed");
        std::process::exit(1);
    }
}
