//! Reverse proxy forwarding and response modification.
//!
//! # Responsibilities
//! - Direct each request at the origin, or at the upgrade target for
//!   websocket upgrades
//! - Strip hop-by-hop headers from ordinary exchanges
//! - Tunnel upgraded connections byte for byte
//! - Run the interceptor chain over every upstream response

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{self, HeaderName, HeaderValue},
        request, HeaderMap, Request, StatusCode, Uri, Version,
    },
    response::{IntoResponse, Response},
    Router,
};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioIo},
};
use thiserror::Error;
use url::Url;

use crate::interceptor::{ChainError, InterceptedResponse, Interceptor, InterceptorChain};
use crate::observability::metrics;

/// Default cap on a buffered response body (8MB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

static HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0} address is required")]
    MissingAddress(&'static str),

    #[error("failed to register interceptor: {0}")]
    Registration(#[source] ChainError),

    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("upstream request failed: {0}")]
    Upstream(#[source] hyper_util::client::legacy::Error),

    #[error("failed to modify the response: {0}")]
    Interceptor(#[source] ChainError),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::Upstream(_) | ProxyError::Interceptor(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Which upstream a request was directed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Origin,
    Upgrade,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Origin => "origin",
            Target::Upgrade => "upgrade",
        }
    }
}

/// Builder for [`ReverseProxy`].
///
/// Interceptor registration errors are held until [`ProxyBuilder::build`].
pub struct ProxyBuilder {
    origin: Option<Url>,
    public: Option<Url>,
    upgrade_target: Option<Url>,
    max_body_size: usize,
    interceptors: InterceptorChain,
    registration_error: Option<ChainError>,
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self {
            origin: None,
            public: None,
            upgrade_target: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            interceptors: InterceptorChain::new(),
            registration_error: None,
        }
    }
}

impl ProxyBuilder {
    pub fn origin(mut self, origin: Url) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn public(mut self, public: Url) -> Self {
        self.public = Some(public);
        self
    }

    /// Upstream for websocket upgrades; upgrades go to the origin when unset.
    pub fn upgrade_target(mut self, target: Option<Url>) -> Self {
        self.upgrade_target = target;
        self
    }

    pub fn max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    /// Append an interceptor under a unique name.
    pub fn interceptor<I>(mut self, name: impl Into<String>, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        if let Err(e) = self.interceptors.register(name, interceptor) {
            self.registration_error.get_or_insert(e);
        }
        self
    }

    pub fn build(self) -> Result<ReverseProxy, ProxyError> {
        if let Some(e) = self.registration_error {
            return Err(ProxyError::Registration(e));
        }
        let origin = self.origin.ok_or(ProxyError::MissingAddress("origin"))?;
        let public = self.public.ok_or(ProxyError::MissingAddress("public"))?;

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(ReverseProxy {
            inner: Arc::new(Inner {
                origin,
                public,
                upgrade_target: self.upgrade_target,
                interceptors: self.interceptors,
                client,
                max_body_size: self.max_body_size,
            }),
        })
    }
}

struct Inner {
    origin: Url,
    public: Url,
    upgrade_target: Option<Url>,
    interceptors: InterceptorChain,
    client: Client<HttpConnector, Body>,
    max_body_size: usize,
}

/// Forwards requests upstream and rewrites qualifying responses.
#[derive(Clone)]
pub struct ReverseProxy {
    inner: Arc<Inner>,
}

impl ReverseProxy {
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::default()
    }

    pub fn origin(&self) -> &Url {
        &self.inner.origin
    }

    pub fn public(&self) -> &Url {
        &self.inner.public
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.inner.interceptors
    }

    /// Point the request at its upstream, rewriting scheme, authority and `Host`.
    pub fn direct(&self, parts: &mut request::Parts) -> Result<Target, ProxyError> {
        let (target, url) = match &self.inner.upgrade_target {
            Some(url) if is_upgrade_request(&parts.headers) => (Target::Upgrade, url),
            _ => (Target::Origin, &self.inner.origin),
        };

        let authority = authority_of(url)?;
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let invalid = |reason: String| ProxyError::InvalidTarget {
            target: url.to_string(),
            reason,
        };

        parts.uri = Uri::builder()
            .scheme(url.scheme())
            .authority(authority.as_str())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| invalid(e.to_string()))?;
        parts.version = Version::HTTP_11;
        parts.headers.insert(
            header::HOST,
            HeaderValue::from_str(&authority).map_err(|e| invalid(e.to_string()))?,
        );
        Ok(target)
    }

    /// Direct the request and drop the headers that must not travel upstream.
    ///
    /// Ordinary requests also lose `Accept-Encoding`, so the origin answers
    /// with a body the interceptors can read. Upgrades keep every header.
    pub fn prepare(&self, parts: &mut request::Parts) -> Result<Target, ProxyError> {
        let upgrade = is_upgrade_request(&parts.headers);
        let target = self.direct(parts)?;
        if !upgrade {
            strip_hop_by_hop(&mut parts.headers);
            parts.headers.remove(header::ACCEPT_ENCODING);
        }
        Ok(target)
    }

    /// Run the interceptor chain over an upstream response.
    pub async fn modify(&self, response: Response<Body>) -> Result<Response<Body>, ProxyError> {
        if self.inner.interceptors.is_empty() {
            return Ok(response);
        }

        let mut intercepted = InterceptedResponse::new(response, self.inner.max_body_size);
        match self.inner.interceptors.apply(&mut intercepted).await {
            Ok(applied) => {
                tracing::trace!(applied, "Interceptors applied");
                Ok(intercepted.into_response())
            }
            Err(e) => {
                metrics::record_interceptor_failure();
                Err(ProxyError::Interceptor(e))
            }
        }
    }

    /// Forward one request, always producing a response.
    pub async fn forward(&self, request: Request<Body>) -> Response {
        match self.try_forward(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Proxy request failed");
                e.into_response()
            }
        }
    }

    async fn try_forward(&self, mut request: Request<Body>) -> Result<Response, ProxyError> {
        let client_upgrade = if is_upgrade_request(request.headers()) {
            Some(hyper::upgrade::on(&mut request))
        } else {
            None
        };

        let (mut parts, body) = request.into_parts();
        let target = self.prepare(&mut parts)?;
        metrics::record_request(target.as_str());
        tracing::debug!(target = target.as_str(), uri = %parts.uri, "Forwarding request");

        let response = self
            .inner
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(ProxyError::Upstream)?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                return Ok(tunnel(response, client_upgrade));
            }
        }

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        self.modify(Response::from_parts(parts, Body::new(body))).await
    }

    /// Router sending every request through [`ReverseProxy::forward`].
    pub fn router(&self) -> Router {
        Router::new().fallback(proxy_handler).with_state(self.clone())
    }
}

async fn proxy_handler(State(proxy): State<ReverseProxy>, request: Request<Body>) -> Response {
    proxy.forward(request).await
}

/// Join the client's and the upstream's upgraded streams.
fn tunnel(mut upstream: Response<Incoming>, client: OnUpgrade) -> Response {
    let upstream_upgrade = hyper::upgrade::on(&mut upstream);

    tokio::spawn(async move {
        let (client_io, upstream_io) = match tokio::try_join!(client, upstream_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "Upgrade tunnel could not be established");
                return;
            }
        };

        let mut client_io = TokioIo::new(client_io);
        let mut upstream_io = TokioIo::new(upstream_io);
        match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
            Ok((sent, received)) => tracing::debug!(sent, received, "Upgrade tunnel closed"),
            Err(e) => tracing::debug!(error = %e, "Upgrade tunnel ended"),
        }
    });

    upstream.map(Body::new)
}

/// `Connection: upgrade` together with `Upgrade: websocket`, case-insensitively.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    let websocket = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_upgrade && websocket
}

/// Remove hop-by-hop headers, including any the `Connection` header names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn authority_of(url: &Url) -> Result<String, ProxyError> {
    let host = url.host_str().ok_or_else(|| ProxyError::InvalidTarget {
        target: url.to_string(),
        reason: "missing host".to_string(),
    })?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
