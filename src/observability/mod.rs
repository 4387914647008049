//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (tracing-subscriber fmt layer)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Structured fields (`connection_id`, `interceptor`, `target`) over formatted strings
//! - Request ID (`x-request-id`) attached at the edge of the public router
//! - Metrics are cheap (atomic increments) and no-ops without an installed recorder

pub mod logging;
pub mod metrics;
