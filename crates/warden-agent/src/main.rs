use std::net::SocketAddr;

use warden_agent::http::{self, AppState};
use warden_agent::proxy::RequestProxy;
use warden_agent::reaper::Reaper;
use warden_agent::registry::InstancePool;
use warden_agent::settings::PoolConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = PoolConfig::from_env()?;
    tracing::info!(
        port_start = cfg.port_start,
        port_end = cfg.port_end,
        worker = %cfg.worker_command.join(" "),
        "pool configured"
    );

    let pool = InstancePool::new(cfg);
    Reaper::new(pool.clone()).spawn();

    let state = AppState {
        proxy: RequestProxy::new(pool.clone()),
        pool,
    };

    let addr: SocketAddr = std::env::var("WARDEN_LISTEN")
        .unwrap_or_else(|_| "127.0.0.1:8600".to_string())
        .parse()?;
    tracing::info!(%addr, "warden-agent listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
