//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the reverse proxy with the live-reload interceptor
//! - Build the connection registry
//! - Serve the registry endpoints on the public address, or on their own
//!   address when `reload.bind_address` is set
//! - Wire up middleware (request ID, tracing)
//! - Stop every reload connection on shutdown

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ReloaderConfig;
use crate::http::proxy::{ProxyError, ReverseProxy};
use crate::interceptor::{LiveReload, LiveReloadError};
use crate::lifecycle::Shutdown;
use crate::reload::{ConnectionRegistry, RegistrySettings};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    LiveReload(#[from] LiveReloadError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// The public proxy plus its connection registry.
pub struct HttpServer {
    proxy: ReverseProxy,
    registry: ConnectionRegistry,
    public_address: String,
    registry_address: Option<String>,
}

impl HttpServer {
    /// Assemble the proxy and registry from a validated configuration.
    pub fn new(config: &ReloaderConfig, snippet: &str) -> Result<Self, ServerError> {
        let origin = config
            .origin_url()
            .ok_or(ProxyError::MissingAddress("origin"))?;
        let public = config
            .public_url()
            .ok_or(ProxyError::MissingAddress("public"))?;
        let public_address = config
            .public_bind_address()
            .ok_or(ProxyError::MissingAddress("public"))?;
        let upgrade_endpoint = config.upgrade_endpoint().unwrap_or_default();

        let livereload = LiveReload::new(snippet, &upgrade_endpoint)?;
        tracing::debug!(upgrade_endpoint = %upgrade_endpoint, "Reload snippet resolved");

        let proxy = ReverseProxy::builder()
            .origin(origin)
            .public(public)
            .upgrade_target(config.upgrade_target_url())
            .max_body_size(config.proxy.max_body_size)
            .interceptor("livereload", livereload)
            .build()?;

        Ok(Self {
            proxy,
            registry: ConnectionRegistry::new(RegistrySettings::from_config(config)),
            public_address,
            registry_address: config.reload.bind_address.clone(),
        })
    }

    pub fn proxy(&self) -> &ReverseProxy {
        &self.proxy
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Router for the public address with all middleware layers.
    pub fn router(&self) -> Router {
        let mut app = Router::new();
        if self.registry_address.is_none() {
            app = app.merge(self.registry.router());
        }

        app.merge(self.proxy.router()).layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
    }

    /// Bind the configured addresses and serve until `shutdown` fires.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ServerError> {
        let public = bind(&self.public_address).await?;
        let registry = match &self.registry_address {
            Some(address) => Some(bind(address).await?),
            None => None,
        };
        self.serve(public, registry, shutdown).await
    }

    /// Serve on already bound listeners.
    ///
    /// `registry` must be given exactly when the registry runs standalone.
    pub async fn serve(
        self,
        public: TcpListener,
        registry: Option<TcpListener>,
        shutdown: Shutdown,
    ) -> Result<(), ServerError> {
        let addr = public.local_addr().map_err(ServerError::Serve)?;
        tracing::info!(
            address = %addr,
            origin = %self.proxy.origin(),
            "Live-reload proxy listening"
        );

        let registry_task = match registry {
            Some(listener) => Some(tokio::spawn(
                self.registry.clone().run(listener, shutdown.clone()),
            )),
            None => {
                self.registry.stop_on(&shutdown);
                None
            }
        };

        axum::serve(public, self.router())
            .with_graceful_shutdown(shutdown.signalled())
            .await
            .map_err(ServerError::Serve)?;

        if let Some(task) = registry_task {
            match task.await {
                Ok(result) => result.map_err(ServerError::Serve)?,
                Err(e) => tracing::error!(error = %e, "Connection registry task failed"),
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn bind(address: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.to_string(),
            source,
        })
}
