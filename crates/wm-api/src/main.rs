mod auth;
mod config;
mod dto;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use wm_core::{EventBus, HttpRecipeLoader, MachineManager};
use wm_db::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore};

use crate::config::AppConfig;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    // Snapshot store
    let snapshots: Arc<dyn SnapshotStore> = match &config.database_url {
        Some(url) => {
            let db = wm_db::create_pool(url)
                .await
                .expect("failed to connect to database");
            wm_db::run_migrations(&db)
                .await
                .expect("failed to run migrations");
            Arc::new(PgSnapshotStore::new(db))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, snapshots are kept in memory");
            Arc::new(MemorySnapshotStore::new())
        }
    };

    // Machine providers
    let providers = wm_infra::build_providers().expect("failed to build machine providers");
    tracing::info!(machine_types = ?providers.available(), "machine providers ready");

    let manager = MachineManager::new(
        config.manager_config(),
        providers,
        snapshots,
        Arc::new(HttpRecipeLoader::new(config.api_endpoint.clone())),
        EventBus::default(),
    );
    manager.start().expect("failed to start machine manager");

    let state = AppState {
        manager: manager.clone(),
        config: config.clone(),
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.listen_addr, "starting machine API");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    if !manager.shutdown().await {
        tracing::warn!("background tasks were still running at exit");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
