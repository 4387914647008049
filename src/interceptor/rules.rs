//! Built-in eligibility rules for HTML rewriting.

use axum::http::{header, StatusCode};
use futures_util::future::BoxFuture;

use crate::interceptor::{InterceptedResponse, Rule};

pub const OPENING_BODY_TAG: &[u8] = b"<body";
pub const CLOSING_BODY_TAG: &[u8] = b"</body>";

/// Accepts only `200 OK` and `304 Not Modified`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusRule;

impl StatusRule {
    pub fn accepts(status: StatusCode) -> bool {
        matches!(status, StatusCode::OK | StatusCode::NOT_MODIFIED)
    }
}

impl Rule for StatusRule {
    fn name(&self) -> &'static str {
        "status"
    }

    fn check<'a>(&'a self, response: &'a mut InterceptedResponse) -> BoxFuture<'a, bool> {
        let passed = Self::accepts(response.status());
        Box::pin(futures_util::future::ready(passed))
    }
}

/// Accepts a missing `Content-Type`, or any value mentioning `text/html`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentTypeRule;

impl ContentTypeRule {
    pub fn accepts(response: &InterceptedResponse) -> bool {
        let mut values = response.headers().get_all(header::CONTENT_TYPE).iter().peekable();
        if values.peek().is_none() {
            return true;
        }

        values.any(|value| {
            value
                .to_str()
                .map(|v| v.to_ascii_lowercase().contains("text/html"))
                .unwrap_or(false)
        })
    }
}

impl Rule for ContentTypeRule {
    fn name(&self) -> &'static str {
        "content-type"
    }

    fn check<'a>(&'a self, response: &'a mut InterceptedResponse) -> BoxFuture<'a, bool> {
        let passed = Self::accepts(response);
        Box::pin(futures_util::future::ready(passed))
    }
}

/// Accepts bodies holding exactly one opening and one closing body tag.
///
/// Reads and buffers the whole body; later readers see it unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct BodyTagRule;

impl BodyTagRule {
    pub fn accepts(content: &[u8]) -> bool {
        count_opening_tags(content) == 1 && count_tag(content, CLOSING_BODY_TAG) == 1
    }
}

impl Rule for BodyTagRule {
    fn name(&self) -> &'static str {
        "body-tag"
    }

    fn check<'a>(&'a self, response: &'a mut InterceptedResponse) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match response.read_body().await {
                Ok(content) => Self::accepts(&content),
                Err(e) => {
                    tracing::debug!(error = %e, "Body not inspectable");
                    false
                }
            }
        })
    }
}

/// Offsets of every ASCII case-insensitive occurrence of `tag`.
pub fn tag_positions<'a>(content: &'a [u8], tag: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
    content
        .windows(tag.len())
        .enumerate()
        .filter(move |(_, window)| window.eq_ignore_ascii_case(tag))
        .map(|(offset, _)| offset)
}

fn count_tag(content: &[u8], tag: &[u8]) -> usize {
    tag_positions(content, tag).count()
}

/// `<body` only counts when it is the whole tag name (`<body>`, `<body class=..>`).
fn count_opening_tags(content: &[u8]) -> usize {
    tag_positions(content, OPENING_BODY_TAG)
        .filter(|&offset| {
            match content.get(offset + OPENING_BODY_TAG.len()) {
                Some(next) => *next == b'>' || *next == b'/' || next.is_ascii_whitespace(),
                None => false,
            }
        })
        .count()
}
