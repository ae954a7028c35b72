use std::sync::Arc;

use kube::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use etcdcat_controller::{cluster, node, nodedeployment, nodeset, prober, Config, Context, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kube=warn")),
        )
        .init();

    let config = Config::from_env()?;
    let client = Client::try_default().await?;
    let ctx = Arc::new(Context::new(client, config));

    info!("starting etcdcat controllers");
    tokio::join!(
        cluster::run(ctx.clone()),
        prober::run(ctx.clone()),
        nodedeployment::run(ctx.clone()),
        nodeset::run(ctx.clone()),
        node::run(ctx.clone()),
    );
    info!("controllers drained; shutting down");
    Ok(())
}
