//! pvm-lite-node: a scheduler node.
//!
//! Loads the engine configuration, deploys every YAML definition found in the
//! definitions directory, optionally starts an instance, and runs the job
//! executor until Ctrl-C.

mod node;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use pvm_lite_core::{EngineConfig, MemoryStore, ProcessEngine, Variables};

#[derive(Parser, Debug)]
#[command(name = "pvm-lite-node")]
#[command(about = "Run a pvm-lite job executor node")]
struct Args {
    /// Engine configuration (YAML). Defaults apply when absent.
    #[arg(long, short = 'c', env = "PVM_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of process definitions (*.yaml)
    #[arg(long, short = 'd', env = "PVM_DEFINITIONS", default_value = "definitions")]
    definitions: PathBuf,

    /// Start one instance of this definition key after deployment
    #[arg(long, short = 's')]
    start: Option<String>,

    /// Lock owner id for acquired jobs
    #[arg(long, env = "PVM_NODE_ID")]
    node_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(node_id) = args.node_id {
        config.job_executor.node_id = Some(node_id);
    }

    let store = Arc::new(MemoryStore::new());
    let engine = ProcessEngine::builder(store).config(config).build();

    let deployed = node::deploy_definitions(&engine, &args.definitions)
        .with_context(|| format!("Deploying definitions from {}", args.definitions.display()))?;
    tracing::info!(count = deployed.len(), "Definitions deployed");

    if let Some(key) = &args.start {
        let instance_id = engine
            .start_process_instance(key.as_str(), Variables::new())
            .await
            .with_context(|| format!("Starting instance of '{key}'"))?;
        tracing::info!(instance_id = %instance_id, definition = %key, "Started instance");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let executor = engine.job_executor();
    let worker = tokio::spawn(executor.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Waiting for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    shutdown_tx.send(true).ok();

    worker.await.context("Job executor task failed")?;
    Ok(())
}
