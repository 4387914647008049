//! Registry of live reload connections and its HTTP endpoints.
//!
//! # Endpoints
//! - `upgrade_path`: websocket upgrade, gated by the `Origin` check
//! - `reload_path`: broadcast a reload, replies `{"connections": <targeted>}`
//! - `status_path`: replies `{"connections": <n>, "ids": [...]}`

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use dashmap::DashMap;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::ReloaderConfig;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::reload::connection::{Connection, ConnectionError};
use crate::reload::origin::check_origin;

/// Endpoint paths and delivery limits for a registry.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub allowed_origin: String,
    pub delivery_timeout: Duration,
    pub queue_depth: usize,
    pub upgrade_path: String,
    pub reload_path: String,
    pub status_path: String,
}

impl RegistrySettings {
    pub fn from_config(config: &ReloaderConfig) -> Self {
        Self {
            allowed_origin: config
                .allowed_origin()
                .unwrap_or_else(|| "http://localhost".to_string()),
            delivery_timeout: Duration::from_millis(config.reload.delivery_timeout_ms),
            queue_depth: config.reload.queue_depth,
            upgrade_path: config.reload.upgrade_path.clone(),
            reload_path: config.reload.reload_path.clone(),
            status_path: config.reload.status_path.clone(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&ReloaderConfig::default())
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Connections registered when the broadcast started.
    pub targeted: usize,
    /// Connections whose queue accepted the signal.
    pub delivered: usize,
    /// Connections that were gone, full past the timeout, or not running.
    pub failed: usize,
}

/// Body of the status endpoint.
#[derive(Debug, Serialize)]
pub struct RegistryStatus {
    pub connections: usize,
    pub ids: Vec<Uuid>,
}

/// Thread-safe set of live connections, keyed by id.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<Uuid, Arc<Connection>>>,
    settings: Arc<RegistrySettings>,
    // Raised by `stop_all`; connections not yet started end as soon as they start
    closing: Arc<watch::Sender<bool>>,
}

impl ConnectionRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            connections: Arc::new(DashMap::new()),
            settings: Arc::new(settings),
            closing: Arc::new(closing),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.connections.contains_key(id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    fn register(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id(), connection);
        metrics::record_connections(self.connections.len());
    }

    fn deregister(&self, id: &Uuid) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(id).map(|(_, connection)| connection);
        metrics::record_connections(self.connections.len());
        removed
    }

    /// Copy of the current members; no map lock is held afterwards.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Send one reload signal to every connection registered right now.
    ///
    /// Deliveries run concurrently, each bounded by the delivery timeout, so a
    /// stalled client never holds up the others.
    pub async fn broadcast(&self) -> BroadcastReport {
        let targets = self.snapshot();
        metrics::record_broadcast();

        let timeout = self.settings.delivery_timeout;
        let deliveries = targets.iter().map(|connection| async move {
            (connection.id(), connection.reload(timeout).await)
        });
        let results = futures_util::future::join_all(deliveries).await;

        let mut report = BroadcastReport {
            targeted: targets.len(),
            ..Default::default()
        };
        for (id, result) in results {
            match result {
                Ok(()) => {
                    report.delivered += 1;
                    metrics::record_delivery("queued");
                }
                Err(ConnectionError::DeliveryTimeout { .. }) => {
                    report.failed += 1;
                    metrics::record_delivery("timeout");
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::record_delivery("failed");
                    tracing::debug!(connection_id = %id, error = %e, "Reload not delivered");
                }
            }
        }

        tracing::info!(
            targeted = report.targeted,
            delivered = report.delivered,
            failed = report.failed,
            "Reload broadcast"
        );
        report
    }

    /// Stop every running connection. Returns how many were asked to stop.
    ///
    /// Connections that are registered but not yet started stop as soon as
    /// they start.
    pub fn stop_all(&self) -> usize {
        self.closing.send_replace(true);
        let stopped = self
            .snapshot()
            .iter()
            .filter(|connection| connection.stop().is_ok())
            .count();
        tracing::info!(stopped, "Stopped reload connections");
        stopped
    }

    /// Stop every connection once `shutdown` fires.
    pub fn stop_on(&self, shutdown: &Shutdown) {
        let registry = self.clone();
        let signalled = shutdown.signalled();
        tokio::spawn(async move {
            signalled.await;
            registry.stop_all();
        });
    }

    /// Drive one upgraded socket: open, register, run, then deregister and close.
    pub async fn serve(&self, connection: Arc<Connection>, socket: WebSocket) {
        let id = connection.id();
        if let Err(e) = connection.open(socket) {
            tracing::warn!(connection_id = %id, error = %e, "Failed to open connection");
            return;
        }

        self.register(connection.clone());
        tracing::info!(connection_id = %id, active = self.len(), "Connection registered");

        if let Err(e) = connection.start_until(self.closing.subscribe()).await {
            tracing::warn!(connection_id = %id, error = %e, "Connection ended with an error");
        }

        self.deregister(&id);
        if let Err(e) = connection.close().await {
            tracing::debug!(connection_id = %id, error = %e, "Close after termination failed");
        }
        tracing::info!(connection_id = %id, active = self.len(), "Connection removed");
    }

    /// Router serving the upgrade, reload and status endpoints.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.settings.upgrade_path, get(upgrade_handler))
            .route(&self.settings.reload_path, any(reload_handler))
            .route(&self.settings.status_path, get(status_handler))
            .with_state(self.clone())
    }

    /// Serve the registry on its own listener until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: Shutdown,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Connection registry listening");

        self.stop_on(&shutdown);
        let app = self.router().layer(TraceLayer::new_for_http());
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.signalled())
            .await?;

        tracing::info!("Connection registry stopped");
        Ok(())
    }
}

async fn upgrade_handler(
    State(registry): State<ConnectionRegistry>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            tracing::debug!(error = %rejection.body_text(), "Rejected upgrade request");
            return (
                rejection.status(),
                format!("failed to open a connection: {}", rejection.body_text()),
            )
                .into_response();
        }
    };

    if let Err(e) = check_origin(&headers, &registry.settings.allowed_origin) {
        tracing::warn!(error = %e, "Rejected upgrade from disallowed origin");
        return (
            StatusCode::FORBIDDEN,
            format!("failed to open a connection: {}", e),
        )
            .into_response();
    }

    let connection = Arc::new(Connection::new(registry.settings.queue_depth));
    upgrade
        .on_failed_upgrade(|e| tracing::warn!(error = %e, "Websocket upgrade failed"))
        .on_upgrade(move |socket| async move { registry.serve(connection, socket).await })
}

async fn reload_handler(State(registry): State<ConnectionRegistry>) -> impl IntoResponse {
    let report = registry.broadcast().await;
    Json(serde_json::json!({ "connections": report.targeted }))
}

async fn status_handler(State(registry): State<ConnectionRegistry>) -> Json<RegistryStatus> {
    Json(RegistryStatus {
        connections: registry.len(),
        ids: registry.ids(),
    })
}
