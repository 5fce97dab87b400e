use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fabricfs_connect::{ClusterConnector, RestConnector, RestCredentials};
use fabricfs_csi::driver::{Driver, DRIVER_NAME};
use fabricfs_csi::settings::Settings;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "fabricfs-csi", about = "FabricFS CSI controller service")]
struct Cli {
    /// Endpoint the controller service listens on; a Unix socket path,
    /// optionally prefixed with `unix://`.
    #[arg(long, env = "CSI_ENDPOINT", default_value = "/run/fabricfs/csi.sock")]
    endpoint: String,

    /// Cluster configuration document.
    #[arg(long, default_value = "/etc/fabricfs/clusters.json")]
    config: PathBuf,

    /// Node this controller instance runs on.
    #[arg(long, env = "NODE_ID", default_value = "")]
    node_id: String,

    /// Driver name advertised to the orchestrator.
    #[arg(long, default_value = DRIVER_NAME)]
    driver_name: String,
}

fn socket_path(endpoint: &str) -> PathBuf {
    PathBuf::from(endpoint.strip_prefix("unix://").unwrap_or(endpoint))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let settings = Settings::from_file(&cli.config)
        .with_context(|| format!("loading cluster configuration {}", cli.config.display()))?;
    settings.validate()?;

    let mut connectors: HashMap<String, Arc<dyn ClusterConnector>> = HashMap::new();
    for cluster in &settings.clusters {
        let endpoint = cluster
            .rest_api
            .first()
            .with_context(|| format!("cluster {} has no management endpoint", cluster.id))?;
        let credentials = RestCredentials::from_file(Path::new(&cluster.secrets))
            .with_context(|| format!("loading credentials for cluster {}", cluster.id))?;
        let connector = RestConnector::new(
            &endpoint.gui_host,
            endpoint.gui_port,
            credentials,
            !cluster.secure_ssl_mode,
        )?;
        connectors.insert(cluster.id.clone(), Arc::new(connector));
    }

    let driver = Driver::setup(&cli.driver_name, &cli.node_id, settings, connectors).await?;
    driver.run(&socket_path(&cli.endpoint)).await?;
    Ok(())
}
