//! medfed-coordinator
//!
//! - `serve`: coordinator HTTP server (registry, rounds, ensemble routes)
//! - `participant`: remote participant training on its own data
//! - `simulate`: in-process federated run over simulated clients

mod catalog;
mod federation;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medfed_core::config::load_config_from;
use medfed_core::DataSplit;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

use catalog::{load_catalog, load_examples, load_optional};
use federation::{run_participant, FederationModule};

#[derive(Parser)]
#[command(name = "medfed-coordinator", version, about = "Adaptive ensemble recommender with federated weight learning")]
struct Cli {
    /// Config file (YAML/TOML/JSON); defaults to $MEDFED_CONFIG_FILE.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides storage.data_dir.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    Participant {
        #[arg(long)]
        id: String,
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        examples: PathBuf,
    },
    Simulate {
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long)]
        examples: Option<PathBuf>,
        #[arg(long)]
        rounds: Option<u32>,
        #[arg(long)]
        clients: Option<usize>,
        #[arg(long)]
        non_iid: bool,
        #[arg(long)]
        seed: Option<u64>,
        /// Install the final global weights into the local ensemble.
        #[arg(long)]
        apply: bool,
    },
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown_signal_received");
}

#[tokio::main]
async fn main() -> Result<()> {
    medfed_core::init_tracing("medfed-coordinator")?;
    let cli = Cli::parse();
    let file = cli.config.or_else(|| std::env::var("MEDFED_CONFIG_FILE").ok().map(PathBuf::from));
    let mut config = load_config_from(file.as_deref()).context("loading configuration")?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    match cli.command {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind_addr.clone());
            let module = FederationModule::new(config)?;
            module.serve(&bind, shutdown_signal()).await?;
            module.shutdown().await?;
        }
        Command::Participant { id, server, catalog, examples } => {
            if let Some(url) = server {
                config.server.server_url = url;
            }
            let catalog = load_catalog(&catalog)?;
            let examples = load_examples(&examples)?;
            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = stop_tx.send(true);
            });
            run_participant(&config.server, &id, &config, catalog, examples, stop_rx).await?;
        }
        Command::Simulate { catalog, examples, rounds, clients, non_iid, seed, apply } => {
            if let Some(r) = rounds { config.federated.num_rounds = r; }
            if let Some(c) = clients { config.federated.num_simulated_clients = c; }
            if non_iid { config.federated.data_split = DataSplit::NonIid; }
            if seed.is_some() { config.federated.seed = seed; }
            let catalog = load_optional(catalog.as_deref(), load_catalog)?;
            let examples = load_optional(examples.as_deref(), load_examples)?;
            let module = FederationModule::new(config)?;
            let summary = module.simulate(catalog, examples, apply).await?;
            module.shutdown().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}
