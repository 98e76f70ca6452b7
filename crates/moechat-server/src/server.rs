//! `RelayServer` — axum application assembly.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use moechat_llm::directory::{InMemoryModelDirectory, ModelDirectory};
use moechat_llm::{UpstreamClient, UpstreamClientConfig};

use crate::config::RelayConfig;
use crate::error::RelayResult;
use crate::metrics;
use crate::persistence::MessageStore;
use crate::routes;
use crate::shutdown::ShutdownCoordinator;
use crate::telemetry::TelemetryPublisher;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<RelayConfig>,
    /// Model lookup.
    pub directory: Arc<dyn ModelDirectory>,
    /// Message repository.
    pub store: Arc<dyn MessageStore>,
    /// Expert-activation publishing handle.
    pub telemetry: TelemetryPublisher,
    /// Upstream inference client.
    pub upstream: UpstreamClient,
    /// When the server started.
    pub start_time: Instant,
    /// Sessions currently streaming.
    pub active_sessions: Arc<AtomicUsize>,
    /// Prometheus render handle.
    pub metrics_handle: PrometheusHandle,
}

/// The relay server.
pub struct RelayServer {
    state: AppState,
    shutdown: Arc<ShutdownCoordinator>,
}

impl RelayServer {
    /// Assemble a server. Must run inside a tokio runtime (the telemetry
    /// forwarder task is spawned here).
    pub fn new(
        config: RelayConfig,
        directory: Arc<dyn ModelDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> RelayResult<Self> {
        let upstream = UpstreamClient::new(&UpstreamClientConfig {
            request_timeout_secs: config.request_timeout_secs,
            ..UpstreamClientConfig::default()
        })?;
        let (telemetry, _forwarder) = TelemetryPublisher::spawn(config.telemetry_buffer);

        let state = AppState {
            config: Arc::new(config),
            directory,
            store,
            telemetry,
            upstream,
            start_time: Instant::now(),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            metrics_handle: metrics::install_recorder(),
        };
        Ok(Self {
            state,
            shutdown: Arc::new(ShutdownCoordinator::new()),
        })
    }

    /// Server assembled from config alone: directory seeded from the
    /// config's model mappings, in-memory message store.
    pub fn from_config(config: RelayConfig) -> RelayResult<Self> {
        let directory = Arc::new(InMemoryModelDirectory::with_models(config.seed_models()));
        let store = Arc::new(crate::persistence::InMemoryMessageStore::new());
        Self::new(config, directory, store)
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route(
                "/api/v1/chats/{chat_id}/messages/stream",
                post(routes::stream_message),
            )
            .route(
                "/api/v1/chats/{chat_id}/messages",
                post(routes::send_message),
            )
            .route("/api/v1/models", get(routes::list_models))
            .route("/health", get(routes::health_handler))
            .route("/metrics", get(routes::metrics_handler))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Spawn the model service heartbeat loop.
    ///
    /// Only meaningful when the directory is the in-memory implementation;
    /// external directories refresh themselves.
    pub fn spawn_heartbeat(&self, directory: Arc<InMemoryModelDirectory>) {
        let interval = Duration::from_secs(self.state.config.heartbeat_interval_secs.max(1));
        let client = self.state.upstream.clone();
        let token = self.shutdown.token();
        self.shutdown.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => directory.probe_services(&client).await,
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    /// Serve until the shutdown token fires.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "relay server listening");
        let token = self.shutdown.token();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    }
}
