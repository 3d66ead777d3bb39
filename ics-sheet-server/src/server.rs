use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpListener;

use crate::{config::ServerConfig, handlers::create_app};

pub async fn start_server(config: ServerConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = create_app(config)?;

    tracing::info!("ICS Sheet Server starting on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
