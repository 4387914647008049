//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every address parses as an absolute http URL (no TLS on either side)
//! - Validate value ranges (timeouts > 0, queue depth > 0)
//! - Detect conflicting endpoint paths
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ReloaderConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;
use url::Url;

use crate::config::schema::ReloaderConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{field} '{value}' is not a valid http URL: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("{field} '{value}' must start with '/'")]
    InvalidPath { field: &'static str, value: String },

    #[error("{first} and {second} must differ (both are '{value}')")]
    ConflictingPaths {
        first: &'static str,
        second: &'static str,
        value: String,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("watch.enabled requires at least one watch.paths entry")]
    NothingToWatch,
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ReloaderConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_url(&mut errors, "proxy.origin", &config.proxy.origin);
    check_url(&mut errors, "proxy.public", &config.proxy.public);
    if let Some(target) = &config.proxy.upgrade_target {
        check_url(&mut errors, "proxy.upgrade_target", target);
    }

    let paths = [
        ("reload.upgrade_path", &config.reload.upgrade_path),
        ("reload.reload_path", &config.reload.reload_path),
        ("reload.status_path", &config.reload.status_path),
    ];
    for (field, value) in paths {
        if !value.starts_with('/') {
            errors.push(ValidationError::InvalidPath {
                field,
                value: value.clone(),
            });
        }
    }
    for (i, (first, a)) in paths.iter().enumerate() {
        for (second, b) in paths.iter().skip(i + 1) {
            if a == b {
                errors.push(ValidationError::ConflictingPaths {
                    first: *first,
                    second: *second,
                    value: a.to_string(),
                });
            }
        }
    }

    if config.reload.delivery_timeout_ms == 0 {
        errors.push(ValidationError::Zero("reload.delivery_timeout_ms"));
    }
    if config.reload.queue_depth == 0 {
        errors.push(ValidationError::Zero("reload.queue_depth"));
    }
    if config.proxy.max_body_size == 0 {
        errors.push(ValidationError::Zero("proxy.max_body_size"));
    }
    if config.watch.enabled && config.watch.paths.is_empty() {
        errors.push(ValidationError::NothingToWatch);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_url(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.trim().is_empty() {
        errors.push(ValidationError::MissingField(field));
        return;
    }

    let invalid = |reason: String| ValidationError::InvalidUrl {
        field,
        value: value.to_string(),
        reason,
    };

    match Url::parse(value) {
        Ok(url) if url.scheme() != "http" => {
            errors.push(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        Ok(url) if url.host_str().is_none() => {
            errors.push(invalid("missing host".to_string()));
        }
        Ok(_) => {}
        Err(e) => errors.push(invalid(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ReloaderConfig {
        let mut config = ReloaderConfig::default();
        config.proxy.origin = "http://localhost:8080".to_string();
        config
    }

    #[test]
    fn test_default_with_origin_is_valid() {
        assert_eq!(validate_config(&valid()), Ok(()));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = valid();
        config.proxy.origin = "https://files.local".to_string();
        config.proxy.public = "not a url".to_string();
        config.reload.delivery_timeout_ms = 0;
        config.reload.reload_path = "reload".to_string();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(matches!(errors[0], ValidationError::InvalidUrl { field: "proxy.origin", .. }));
        assert!(matches!(errors[1], ValidationError::InvalidUrl { field: "proxy.public", .. }));
    }

    #[test]
    fn test_detects_conflicting_paths() {
        let mut config = valid();
        config.reload.reload_path = "/ws".to_string();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::ConflictingPaths {
                first: "reload.upgrade_path",
                second: "reload.reload_path",
                value: "/ws".to_string(),
            }]
        );
    }

    #[test]
    fn test_watch_requires_paths() {
        let mut config = valid();
        config.watch.enabled = true;
        assert_eq!(
            validate_config(&config),
            Err(vec![ValidationError::NothingToWatch])
        );

        config.watch.paths.push("./site".to_string());
        assert_eq!(validate_config(&config), Ok(()));
    }

    #[test]
    fn test_upgrade_target_checked_when_present() {
        let mut config = valid();
        config.proxy.upgrade_target = Some("localhost".to_string());
        assert!(validate_config(&config).is_err());

        config.proxy.upgrade_target = Some("http://localhost:9091".to_string());
        assert!(validate_config(&config).is_ok());
    }
}
