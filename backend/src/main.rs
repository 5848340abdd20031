use std::sync::Arc;

use tokio::net::TcpListener;

use bigmodel_backend::{logging, routes, AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    logging::init(&config.logging.level);
    tracing::info!("Starting bigmodel inference core");

    let state = Arc::new(AppState::build(config.clone())?);
    for pool in state.pools.status() {
        tracing::info!("Pool {}: {} endpoint(s)", pool.kind, pool.capacity);
    }

    // Batch admission runs until shutdown
    let admission = Arc::new(state.admission());
    let admission_task = tokio::spawn(admission.run(state.shutdown.clone()));

    let app = routes::app(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    if let Err(e) = admission_task.await {
        tracing::error!("Admission controller panicked: {}", e);
    }
    state.workers.shutdown().await;

    Ok(())
}
