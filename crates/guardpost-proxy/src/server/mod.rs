//! Server bootstrap: state construction, routing, and graceful shutdown.

pub mod router;
pub mod state;

use std::net::SocketAddr;

use guardpost_core::config::ProxyConfig;

pub use router::build as build_router;
pub use state::ProxyState;

/// Start the proxy and serve until shutdown.
pub async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.proxy_host, config.proxy_port).parse()?;

    tracing::info!(
        ollama_url = %config.ollama_url,
        input_guard = config.enable_input_guard,
        output_guard = config.enable_output_guard,
        "starting guardpost proxy"
    );

    let state = ProxyState::new(config).await?;
    let app = router::build(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "guardpost listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("could not install ctrl-c handler");
        return;
    }
    tracing::info!("shutdown signal received");
}
