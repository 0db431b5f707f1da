use exam_backend::config::Config;
use exam_backend::{build_state, routes::build_router};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let state = build_state(config)?;
    let autosaver = state.autosaver.clone();
    let worker = state.spawn_autosave_worker();
    let eviction = state.spawn_eviction_worker();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("backend listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    eviction.abort();
    worker.abort();
    let flushed = autosaver.flush_all().await;
    tracing::info!(flushed, "pending autosaves flushed on shutdown");
    Ok(())
}
