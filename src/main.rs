//! `ocap-kernel` — host process for the object-capability kernel: vat
//! lifecycle, c-list translation, the crank-at-a-time run queue, and
//! (when configured) remote transport between kernels.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ocap_kernel_core::config::KernelConfig;
use ocap_kernel_core::kernel::Kernel;
use ocap_kernel_core::subcluster::SubclusterConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = KernelConfig::load(cli.config.as_deref()).context("failed to load kernel configuration")?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Launch { file } => launch(config, &file).await,
        Commands::Status => status(config),
    }
}

async fn run(config: KernelConfig) -> Result<()> {
    let kernel = Arc::new(Kernel::new(config));
    kernel
        .recover(Vec::new(), Vec::new(), &[])
        .await
        .context("recovering persisted kernel state")?;
    info!("kernel started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    kernel.shutdown().await;
    Ok(())
}

async fn launch(config: KernelConfig, file: &std::path::Path) -> Result<()> {
    let kernel = Kernel::new(config);
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading subcluster config {}", file.display()))?;
    let subcluster_config: SubclusterConfig =
        serde_json::from_str(&raw).context("parsing subcluster config")?;

    let outcome = kernel.launch_subcluster(subcluster_config).await?;
    println!(
        "{}",
        serde_json::json!({
            "subcluster": outcome.subcluster_id.to_string(),
            "root": outcome.root_kref.to_string(),
            "bootstrapResult": outcome.bootstrap_result,
        })
    );
    kernel.shutdown().await;
    Ok(())
}

fn status(config: KernelConfig) -> Result<()> {
    let kernel = Kernel::new(config);
    println!("{}", serde_json::to_string_pretty(&kernel.status())?);
    Ok(())
}
