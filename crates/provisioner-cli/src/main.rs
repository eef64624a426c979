//! Entry point: parse arguments, load configuration, provision, print env.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use provisioner_cli::{object_store_root, render_env_lines, Cli, Commands, ProvisionTarget};
use provisioner_core::build::SetupContext;
use provisioner_core::dispatch;
use provisioner_core::metrics::TracingMetricsSink;
use provisioner_core::object_store::{LocalBlobStore, LocalObjectStore};
use provisioner_core::ProvisioningConfig;
use provisioner_schema::Revision;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = ProvisioningConfig::from_env().context("loading provisioning configuration from environment")?;

    let root = object_store_root();
    let object_store = LocalObjectStore::new(&root);
    let blob_store = LocalBlobStore::new(&root);
    let http_client = reqwest::Client::new();
    let metrics = TracingMetricsSink;

    let ctx = SetupContext {
        config: &config,
        object_store: &object_store,
        blob_store: &blob_store,
        http_client: &http_client,
        metrics: &metrics,
        fuchsia: None,
    };

    let build = match cli.command {
        Commands::Provision { target } => match target {
            ProvisionTarget::Trunk => dispatch::setup_trunk_build(&ctx).await,
            ProvisionTarget::Revision { revision } => dispatch::setup_regular_build(&ctx, Revision::new(revision)).await,
            ProvisionTarget::Custom => dispatch::setup_custom_binary(&ctx).await,
            ProvisionTarget::Symbolized { revision } => dispatch::setup_symbolized_builds(&ctx, Revision::new(revision)).await,
        },
    };

    let build = build.context("provisioning build")?;
    for line in render_env_lines(&build) {
        println!("{line}");
    }
    Ok(())
}
