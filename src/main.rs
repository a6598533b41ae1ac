//! canteen-sync entry point.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::signal;
use tokio::time::interval;

use canteen_sync::mutation::{Encryptor, PlaintextSealer};
use canteen_sync::registry::rpc::RpcClient;
use canteen_sync::registry::{resolve_handle, ContractRegistry, RegistryLink};
use canteen_sync::report::Report;
use canteen_sync::{Config, SyncEngine};

#[derive(Parser)]
#[command(version, about = "Keeps a local view of the cluster registry in sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Follow the registry and log every change (default)
    Watch,
    /// Print active members and images once
    Status,
    /// Request deployment of an image
    Add { image: String, replicas: u64 },
    /// Deactivate an image
    Remove { image: String },
}

/// Probes the ledger and builds a link to the registry if one resolves.
async fn connect(cfg: &Config, rpc: &Arc<RpcClient>) -> (Option<RegistryLink>, bool) {
    let resolution = resolve_handle(cfg, rpc).await;
    let link = resolution.handle.map(|handle| {
        RegistryLink::from_contract(Arc::new(ContractRegistry::new(
            Arc::clone(rpc),
            handle,
            cfg.from_account.clone(),
            cfg.poll_interval(),
            cfg.receipt_timeout(),
        )))
    });
    (link, resolution.connected)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting canteen-sync with config: {:?}", cfg);

    let rpc = Arc::new(RpcClient::new(cfg.provider_url.clone()));
    let (link, connected) = connect(&cfg, &rpc).await;
    if !connected {
        warn!("Ledger at {} is unreachable", cfg.provider_url);
    } else if link.is_none() {
        warn!("No registry resolved on this network; running with empty collections");
    }
    let encryptor = cfg
        .encrypt_replicas
        .then(|| Arc::new(PlaintextSealer) as Arc<dyn Encryptor>);
    let engine = Arc::new(SyncEngine::new(link, connected, encryptor, cfg.poll_interval()));

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(cfg, rpc, engine).await,
        Command::Status => {
            print!("{}", Report::gather(&engine).await);
            Ok(())
        }
        Command::Add { image, replicas } => {
            let result = engine.add_image(&image, replicas).await;
            println!("{}", engine.view().message);
            result.map(drop).map_err(Into::into)
        }
        Command::Remove { image } => {
            let result = engine.remove_image(&image).await;
            println!("{}", engine.view().message);
            result.map(drop).map_err(Into::into)
        }
    }
}

async fn watch(cfg: Config, rpc: Arc<RpcClient>, engine: Arc<SyncEngine>) -> anyhow::Result<()> {
    // Synchronization
    let engine_for_run = Arc::clone(&engine);
    let sync_handle = tokio::spawn(async move {
        engine_for_run.run().await;
        error!("Synchronization stopped");
    });

    // Network watcher
    let engine_for_network = Arc::clone(&engine);
    let network_handle = tokio::spawn(async move {
        let mut ticker = interval(cfg.poll_interval());
        loop {
            ticker.tick().await;
            let (link, connected) = connect(&cfg, &rpc).await;
            engine_for_network.set_registry(link, connected);
        }
    });

    // View logger
    let engine_for_log = Arc::clone(&engine);
    let log_handle = tokio::spawn(async move {
        let mut watcher = engine_for_log.watch();
        while let Some(view) = watcher.changed(&engine_for_log).await {
            info!(
                "{} active members, {} active images{}{}",
                view.members_count,
                view.images_count,
                if view.is_processing { " (processing)" } else { "" },
                if view.message.is_empty() {
                    String::new()
                } else {
                    format!(": {}", view.message)
                }
            );
            match serde_json::to_string(&view) {
                Ok(json) => log::debug!("View: {}", json),
                Err(e) => error!("Failed to serialize view: {}", e),
            }
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    sync_handle.abort();
    network_handle.abort();
    log_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
