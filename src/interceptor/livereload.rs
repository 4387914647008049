//! Reload-script injection.
//!
//! Splices a snippet immediately before the first `</body>` of eligible HTML
//! pages so the browser opens a websocket to the connection registry and
//! reloads itself when told to.

use axum::body::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::interceptor::rules::{
    tag_positions, BodyTagRule, ContentTypeRule, StatusRule, CLOSING_BODY_TAG,
};
use crate::interceptor::{InterceptError, InterceptedResponse, Interceptor, Rule};
use crate::observability::metrics;

/// Replaced with the resolved upgrade-notification URL when the interceptor is built.
pub const UPGRADE_ENDPOINT_PLACEHOLDER: &str = "{{upgrade_endpoint}}";

/// Snippet used when no snippet file is configured.
pub const DEFAULT_SNIPPET: &str = r#"<script>
(function () {
    if (window.__livereloadProxy) { return; }
    window.__livereloadProxy = true;

    var delay = 250;
    function connect() {
        var socket = new WebSocket("{{upgrade_endpoint}}");
        socket.onopen = function () { delay = 250; };
        socket.onmessage = function (event) {
            if (event.data === "reload") { window.location.reload(); }
        };
        socket.onclose = function () {
            setTimeout(connect, delay);
            delay = Math.min(delay * 2, 5000);
        };
    }
    connect();
})();
</script>"#;

/// Construction errors for [`LiveReload`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LiveReloadError {
    #[error("a reload snippet is required")]
    EmptySnippet,

    #[error("an upgrade endpoint is required")]
    EmptyUpgradeEndpoint,
}

/// Interceptor injecting the reload snippet into HTML pages.
pub struct LiveReload {
    snippet: String,
    rules: Vec<Box<dyn Rule>>,
}

impl LiveReload {
    /// Build the interceptor, resolving the snippet's upgrade endpoint placeholder.
    pub fn new(snippet: &str, upgrade_endpoint: &str) -> Result<Self, LiveReloadError> {
        if snippet.trim().is_empty() {
            return Err(LiveReloadError::EmptySnippet);
        }
        if upgrade_endpoint.trim().is_empty() {
            return Err(LiveReloadError::EmptyUpgradeEndpoint);
        }

        Ok(Self {
            snippet: snippet.replace(UPGRADE_ENDPOINT_PLACEHOLDER, upgrade_endpoint),
            rules: vec![
                Box::new(StatusRule),
                Box::new(ContentTypeRule),
                Box::new(BodyTagRule),
            ],
        })
    }

    /// The resolved snippet as it is injected.
    pub fn snippet(&self) -> &str {
        &self.snippet
    }
}

impl Interceptor for LiveReload {
    fn rules(&self) -> &[Box<dyn Rule>] {
        &self.rules
    }

    fn handle<'a>(
        &'a self,
        response: &'a mut InterceptedResponse,
    ) -> BoxFuture<'a, Result<(), InterceptError>> {
        Box::pin(async move {
            let content = response.read_body().await?;
            let modified = inject(&content, &self.snippet).ok_or_else(|| {
                InterceptError::Malformed("no closing body tag to inject before".to_string())
            })?;

            tracing::trace!(
                original = content.len(),
                modified = modified.len(),
                "Reload snippet injected"
            );
            response.replace_body(Bytes::from(modified));
            metrics::record_injection();
            Ok(())
        })
    }
}

/// Insert `snippet`, wrapped in newlines, before the first closing body tag.
///
/// Returns `None` when the content has no closing body tag.
pub fn inject(content: &[u8], snippet: &str) -> Option<Vec<u8>> {
    let at = tag_positions(content, CLOSING_BODY_TAG).next()?;

    let mut modified = Vec::with_capacity(content.len() + snippet.len() + 2);
    modified.extend_from_slice(&content[..at]);
    modified.push(b'\n');
    modified.extend_from_slice(snippet.as_bytes());
    modified.push(b'\n');
    modified.extend_from_slice(&content[at..]);
    Some(modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::InterceptorChain;
    use axum::body::Body;
    use axum::http::{header, Response, StatusCode};

    const SNIPPET: &str = "<script>ping()</script>";

    fn html(status: StatusCode, body: &'static str) -> InterceptedResponse {
        let response = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/html")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap();
        InterceptedResponse::new(response, 64 * 1024)
    }

    async fn run(response: InterceptedResponse) -> (Option<u64>, Vec<u8>) {
        let mut chain = InterceptorChain::new();
        chain
            .register("livereload", LiveReload::new(SNIPPET, "ws://localhost:9090/ws").unwrap())
            .unwrap();

        let mut response = response;
        chain.apply(&mut response).await.unwrap();
        let declared = response.content_length();
        let body = axum::body::to_bytes(response.into_response().into_body(), 64 * 1024)
            .await
            .unwrap();
        (declared, body.to_vec())
    }

    #[test]
    fn test_construction_requires_snippet_and_endpoint() {
        assert_eq!(
            LiveReload::new("", "ws://localhost/ws").err(),
            Some(LiveReloadError::EmptySnippet)
        );
        assert_eq!(
            LiveReload::new(SNIPPET, "").err(),
            Some(LiveReloadError::EmptyUpgradeEndpoint)
        );
    }

    #[test]
    fn test_placeholder_resolved_once() {
        let interceptor = LiveReload::new(DEFAULT_SNIPPET, "ws://localhost:9090/ws").unwrap();
        assert!(interceptor.snippet().contains("new WebSocket(\"ws://localhost:9090/ws\")"));
        assert!(!interceptor.snippet().contains(UPGRADE_ENDPOINT_PLACEHOLDER));
    }

    #[test]
    fn test_inject_before_first_closing_tag() {
        let out = inject(b"<html><body>hi</body></html>", SNIPPET).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "<html><body>hi\n<script>ping()</script>\n</body></html>"
        );
        assert!(inject(b"<html></html>", SNIPPET).is_none());
    }

    #[tokio::test]
    async fn test_injects_and_fixes_length() {
        let (declared, body) = run(html(StatusCode::OK, "<html><body>hi</body></html>")).await;

        let expected = "<html><body>hi\n<script>ping()</script>\n</body></html>";
        assert_eq!(String::from_utf8(body).unwrap(), expected);
        assert_eq!(declared, Some(expected.len() as u64));
    }

    #[tokio::test]
    async fn test_non_success_status_untouched() {
        let original = "<html><body>missing</body></html>";
        let (declared, body) = run(html(StatusCode::NOT_FOUND, original)).await;
        assert_eq!(body, original.as_bytes());
        assert_eq!(declared, Some(original.len() as u64));
    }

    #[tokio::test]
    async fn test_ambiguous_body_tags_untouched() {
        for original in [
            "<html>fragment</html>",
            "<body>a</body><body>b</body>",
            "<body>a</body></body>",
        ] {
            let (_, body) = run(html(StatusCode::OK, original)).await;
            assert_eq!(body, original.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_non_html_untouched() {
        let raw = Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"body\":\"<body></body>\"}"))
            .unwrap();
        let (_, body) = run(InterceptedResponse::new(raw, 1024)).await;
        assert_eq!(body, b"{\"body\":\"<body></body>\"}");
    }
}
