//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use livereload_proxy::reload::ConnectionRegistry;
use livereload_proxy::{HttpServer, ReloaderConfig, Shutdown};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A canned upstream response.
#[derive(Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: String,
}

impl MockResponse {
    pub fn html(body: &str) -> Self {
        Self {
            status: 200,
            content_type: Some("text/html; charset=utf-8"),
            body: body.to_string(),
        }
    }
}

/// Start a mock upstream that always returns `response`.
pub async fn start_mock_backend(response: MockResponse) -> SocketAddr {
    start_programmable_backend(move || {
        let response = response.clone();
        async move { response }
    })
    .await
}

/// Start a programmable mock upstream on an ephemeral port.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MockResponse> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let response = f().await;
                        let status_text = match response.status {
                            200 => "200 OK",
                            304 => "304 Not Modified",
                            404 => "404 Not Found",
                            500 => "500 Internal Server Error",
                            _ => "200 OK",
                        };
                        let content_type = response
                            .content_type
                            .map(|ct| format!("Content-Type: {}\r\n", ct))
                            .unwrap_or_default();

                        let response_str = format!(
                            "HTTP/1.1 {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            content_type,
                            response.body.len(),
                            response.body
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// A running proxy and the handles tests poke at.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub registry_addr: SocketAddr,
    pub registry: ConnectionRegistry,
    pub shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.registry_addr, path)
    }
}

/// Start the proxy in front of `origin` on ephemeral ports.
///
/// `configure` runs after the addresses are filled in. Setting
/// `reload.bind_address` to anything moves the registry onto its own listener.
pub async fn start_proxy(
    origin: SocketAddr,
    snippet: &str,
    configure: impl FnOnce(&mut ReloaderConfig),
) -> TestProxy {
    let public = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = public.local_addr().unwrap();

    let mut config = ReloaderConfig::default();
    config.proxy.origin = format!("http://{}", origin);
    config.proxy.public = format!("http://{}", addr);
    config.reload.delivery_timeout_ms = 500;
    configure(&mut config);

    let (registry_listener, registry_addr) = if config.reload.bind_address.is_some() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry_addr = listener.local_addr().unwrap();
        config.reload.bind_address = Some(registry_addr.to_string());
        (Some(listener), registry_addr)
    } else {
        (None, addr)
    };

    let server = HttpServer::new(&config, snippet).unwrap();
    let registry = server.registry().clone();
    let shutdown = Shutdown::new();

    let serve_shutdown = shutdown.clone();
    tokio::spawn(async move {
        server
            .serve(public, registry_listener, serve_shutdown)
            .await
            .unwrap();
    });

    TestProxy {
        addr,
        registry_addr,
        registry,
        shutdown,
    }
}

/// Open a websocket with the given `Origin` header.
pub async fn connect_ws(
    url: &str,
    origin: &str,
) -> Result<WsClient, tokio_tungstenite::tungstenite::Error> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_str(origin).unwrap());
    let (stream, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
