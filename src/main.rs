use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tus_engine::{tus_router, Config, ExpirySweeper, LocalFileStore, UploadEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tus_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        temp_dir = %config.engine.temp_dir.display(),
        upload_dir = %config.engine.upload_dir.display(),
        session_ttl_secs = config.engine.session_ttl.as_secs(),
        max_size = ?config.engine.max_size,
        "loaded configuration"
    );

    let file_store = Arc::new(LocalFileStore::new(&config.engine.upload_dir).await?);
    let engine = Arc::new(UploadEngine::open(config.engine.clone(), file_store).await?);
    tracing::info!(sessions = engine.sessions().len(), "restored upload sessions");

    let sweeper = ExpirySweeper::spawn(Arc::clone(&engine), config.engine.sweep_interval);

    let app = tus_router(engine, &config.server.base_path).layer(TraceLayer::new_for_http());

    tracing::info!(
        addr = %config.server.bind_addr,
        base_path = %config.server.base_path,
        "tus server listening"
    );

    axum::Server::bind(&config.server.bind_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.shutdown().await;
    tracing::info!("server shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
