//! Buffer-and-restore view over an upstream response.
//!
//! Rules and handlers may need the full body. The first read drains the
//! upstream stream into memory and every later reader gets the same bytes,
//! so evaluation order never starves a downstream reader.

use axum::body::{Body, Bytes};
use axum::http::{header, response::Parts, HeaderMap, HeaderValue, Response, StatusCode};
use futures_util::{stream, StreamExt};
use thiserror::Error;

/// Errors raised while reading or rewriting an intercepted response.
#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("failed to read the body: {0}")]
    ReadBody(#[source] axum::Error),

    #[error("body of {declared} bytes exceeds the {limit} byte interception limit")]
    TooLarge { declared: u64, limit: usize },

    #[error("streamed body exceeds the {limit} byte interception limit")]
    LimitExceeded { limit: usize },

    #[error("the body was lost by an earlier failed read")]
    BodyUnavailable,

    #[error("malformed content: {0}")]
    Malformed(String),
}

/// An upstream response travelling through the interceptor chain.
#[derive(Debug)]
pub struct InterceptedResponse {
    parts: Parts,
    body: Body,
    buffered: Option<Bytes>,
    body_lost: bool,
    oversized: bool,
    limit: usize,
}

impl InterceptedResponse {
    /// Wrap a response; at most `limit` body bytes are ever buffered.
    pub fn new(response: Response<Body>, limit: usize) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            parts,
            body,
            buffered: None,
            body_lost: false,
            oversized: false,
            limit,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.parts.headers
    }

    /// Declared `Content-Length`, if present and well formed.
    pub fn content_length(&self) -> Option<u64> {
        self.parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// True once a failed read has consumed the upstream stream.
    pub fn body_lost(&self) -> bool {
        self.body_lost
    }

    /// Read the complete body, leaving it in place for later readers.
    ///
    /// A body that turns out larger than the limit is not lost: the chunks
    /// already read are put back in front of the unread rest of the stream.
    pub async fn read_body(&mut self) -> Result<Bytes, InterceptError> {
        if let Some(bytes) = &self.buffered {
            return Ok(bytes.clone());
        }
        if self.body_lost {
            return Err(InterceptError::BodyUnavailable);
        }
        if self.oversized {
            return Err(InterceptError::LimitExceeded { limit: self.limit });
        }
        if let Some(declared) = self.content_length() {
            if declared > self.limit as u64 {
                // Nothing consumed yet, the stream still passes through untouched
                return Err(InterceptError::TooLarge {
                    declared,
                    limit: self.limit,
                });
            }
        }

        let mut rest = std::mem::take(&mut self.body).into_data_stream();
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut received = 0usize;

        while let Some(chunk) = rest.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.body_lost = true;
                    return Err(InterceptError::ReadBody(e));
                }
            };
            received += chunk.len();
            chunks.push(chunk);

            if received > self.limit {
                let read = stream::iter(chunks).map(Ok::<Bytes, axum::Error>);
                self.body = Body::from_stream(read.chain(rest));
                self.oversized = true;
                return Err(InterceptError::LimitExceeded { limit: self.limit });
            }
        }

        let bytes = match chunks.len() {
            0 => Bytes::new(),
            1 => chunks.swap_remove(0),
            _ => Bytes::from(chunks.concat()),
        };
        self.buffered = Some(bytes.clone());
        Ok(bytes)
    }

    /// Swap in a fully built body and fix up the length framing.
    pub fn replace_body(&mut self, bytes: Bytes) {
        let headers = &mut self.parts.headers;
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
        self.buffered = Some(bytes);
        self.body_lost = false;
        self.oversized = false;
    }

    /// Rebuild the response handed to the client.
    pub fn into_response(self) -> Response<Body> {
        let body = match self.buffered {
            Some(bytes) => Body::from(bytes),
            None => self.body,
        };
        Response::from_parts(self.parts, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html(body: &'static str) -> InterceptedResponse {
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html")
            .body(Body::from(body))
            .unwrap();
        InterceptedResponse::new(response, 1024)
    }

    #[tokio::test]
    async fn test_read_body_restores_stream() {
        let mut response = html("<html></html>");

        let first = response.read_body().await.unwrap();
        let second = response.read_body().await.unwrap();
        assert_eq!(first, second);

        let body = axum::body::to_bytes(response.into_response().into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"<html></html>");
    }

    #[tokio::test]
    async fn test_replace_body_sets_content_length() {
        let mut response = html("short");
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("5"));

        response.replace_body(Bytes::from_static(b"a longer body"));
        assert_eq!(response.content_length(), Some(13));

        let response = response.into_response();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body.len(), 13);
    }

    #[tokio::test]
    async fn test_declared_oversize_body_is_not_consumed() {
        let response = Response::builder()
            .header(header::CONTENT_LENGTH, "4096")
            .body(Body::from(vec![b'x'; 4096]))
            .unwrap();
        let mut response = InterceptedResponse::new(response, 1024);

        assert!(matches!(
            response.read_body().await,
            Err(InterceptError::TooLarge { declared: 4096, limit: 1024 })
        ));
        assert!(!response.body_lost());

        let body = axum::body::to_bytes(response.into_response().into_body(), 8192)
            .await
            .unwrap();
        assert_eq!(body.len(), 4096);
    }

    fn streamed(chunks: &[&'static str]) -> Body {
        let chunks: Vec<Result<Bytes, std::io::Error>> = chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        Body::from_stream(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_undeclared_oversize_body_is_restored() {
        let response = Response::new(streamed(&["<html><body>", "0123456789", "</body></html>"]));
        let mut response = InterceptedResponse::new(response, 16);

        assert!(matches!(
            response.read_body().await,
            Err(InterceptError::LimitExceeded { limit: 16 })
        ));
        assert!(!response.body_lost());
        assert!(matches!(
            response.read_body().await,
            Err(InterceptError::LimitExceeded { .. })
        ));

        let body = axum::body::to_bytes(response.into_response().into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"<html><body>0123456789</body></html>");
    }

    #[tokio::test]
    async fn test_failed_stream_loses_the_body() {
        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"<html>")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let response = Response::new(Body::from_stream(failing));
        let mut response = InterceptedResponse::new(response, 1024);

        assert!(matches!(response.read_body().await, Err(InterceptError::ReadBody(_))));
        assert!(response.body_lost());
        assert!(matches!(
            response.read_body().await,
            Err(InterceptError::BodyUnavailable)
        ));
    }
}
