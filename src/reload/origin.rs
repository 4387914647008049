//! Same-origin gate for websocket upgrade requests.

use axum::http::{header, HeaderMap};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginRejection {
    #[error("missing Origin header")]
    Missing,

    #[error("expected exactly one Origin header, got {0}")]
    Ambiguous(usize),

    #[error("malformed Origin header")]
    Malformed,

    #[error("origin '{origin}' is not allowed, expected '{expected}'")]
    NotAllowed { origin: String, expected: String },
}

/// Require exactly one `Origin` header that starts with `expected_prefix`.
pub fn check_origin(headers: &HeaderMap, expected_prefix: &str) -> Result<(), OriginRejection> {
    let values: Vec<_> = headers.get_all(header::ORIGIN).iter().collect();
    let origin = match values.as_slice() {
        [] => return Err(OriginRejection::Missing),
        [single] => single.to_str().map_err(|_| OriginRejection::Malformed)?,
        many => return Err(OriginRejection::Ambiguous(many.len())),
    };

    if origin.is_empty() {
        return Err(OriginRejection::Malformed);
    }

    if !origin.starts_with(expected_prefix) {
        return Err(OriginRejection::NotAllowed {
            origin: origin.to_string(),
            expected: expected_prefix.to_string(),
        });
    }

    Ok(())
}
