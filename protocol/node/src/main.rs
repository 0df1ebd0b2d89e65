mod config;
mod pipeline;
mod routes;

use anyhow::Context;
use config::NodeConfig;
use pipeline::Pipeline;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = NodeConfig::load()?;
    info!(listen = %config.listen, "roboid node starting");
    if config.identities.is_empty() {
        warn!("no identities configured; every append will be refused");
    }

    let pipeline = Pipeline::build(&config).await?;
    let tasks = pipeline.spawn_background();

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen))?;
    let listener = TcpListener::bind(addr).await?;
    info!("exports listening on {}", addr);

    let server = axum::serve(listener, routes::router(pipeline.clone()).into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {err}");
            }
        });
    if let Err(err) = server.await {
        warn!("server error: {err}");
    }

    info!("shutting down");
    pipeline.shutdown();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
