use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use eventodb_store::StoreFacade;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::{self, ServerConfig};
use crate::pubsub::Hub;
use crate::{import, rpc, subscribe};

#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<StoreFacade>,
    pub hub: Arc<Hub>,
    pub config: Arc<ServerConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(rpc::handle_rpc))
        .route("/subscribe", get(subscribe::handle_subscribe))
        .route("/import", post(import::handle_import))
        .with_state(state)
}

/// Opens the backend, runs both migration levels, and guarantees the
/// default namespace: everything that must finish before traffic.
pub async fn build_state(config: ServerConfig) -> Result<AppState> {
    let store = config::build_store(&config).await?;
    let facade = Arc::new(StoreFacade::new(store, config.handle_cache_size));

    facade
        .migrate_on_startup()
        .await
        .context("applying migrations")?;

    if let Some(token) = facade
        .ensure_default_namespace(config.default_token.as_deref())
        .await?
    {
        // Printed exactly once; the hash is all that survives.
        info!(%token, "generated default namespace token");
    }

    Ok(AppState {
        facade,
        hub: Hub::new(),
        config: Arc::new(config),
    })
}

pub async fn serve(config: ServerConfig) -> Result<()> {
    let port = config.port;
    let state = build_state(config).await?;
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "eventodb listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}
