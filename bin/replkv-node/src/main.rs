//! ReplKV Node
//!
//! Serves the key-value API, replicates writes to the peers listed in the
//! cluster file and compacts its log in the background.

use anyhow::Result;
use clap::Parser;
use replkv_node::{Args, Node, Supervisor};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = args.resolve()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ReplKV node");
    info!("Data directory: {}", config.storage.data_dir.display());
    info!("Cluster file: {}", config.cluster.cluster_file.display());

    let mut supervisor = Supervisor::new();
    let node = Node::build(config, supervisor.reporter()).await?;

    let listener = TcpListener::bind(&node.config().node.listen).await?;
    info!("Listening on {}", listener.local_addr()?);

    node.spawn_background(&mut supervisor);
    node.spawn_server(&mut supervisor, listener);

    let outcome = supervisor
        .wait(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await;
    node.close();
    outcome?;
    Ok(())
}
