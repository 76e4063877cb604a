pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::forge::{ForgeRunner, ForgeScheduler};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::store::ForgeStore;

pub use router::build_api_router;

pub struct ApiServerConfig {
    pub store: ForgeStore,
    pub runner: ForgeRunner,
    pub scheduler: ForgeScheduler,
    pub log_tx: tokio::sync::broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
    pub admin_token: Option<String>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: ForgeStore,
    pub(crate) runner: ForgeRunner,
    pub(crate) scheduler: ForgeScheduler,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) api_host: String,
    pub(crate) api_port: u16,
    /// Hex SHA-256 of the admin token, if one is configured.
    pub(crate) admin_token_hash: Option<String>,
}

impl AppState {
    pub(crate) fn from_config(config: ApiServerConfig) -> Self {
        Self {
            store: config.store,
            runner: config.runner,
            scheduler: config.scheduler,
            log_tx: config.log_tx,
            api_host: config.api_host,
            api_port: config.api_port,
            admin_token_hash: config.admin_token.as_deref().map(auth::token_digest),
        }
    }
}

pub struct ApiServer {
    state: AppState,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, shutdown: CancellationToken) -> Self {
        Self {
            state: AppState::from_config(config),
            shutdown,
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(log) => Ok(Event::default().data(log)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let state = self.state.clone();
        let addr = format!("{}:{}", state.api_host, state.api_port);
        // Bind here so a taken port fails startup instead of a background task.
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let shutdown = self.shutdown.clone();
        let app = build_api_router(state);

        tokio::spawn(async move {
            info!("API Server running at http://{addr}");
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                error!("API Server crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        self.shutdown.cancel();
        Ok(())
    }
}
