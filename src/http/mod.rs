//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! client request
//!     → server.rs (request ID, tracing, registry routes)
//!     → proxy.rs: direct (origin or upgrade target)
//!         ├─ 101 Switching Protocols → byte tunnel
//!         └─ otherwise → interceptor chain → client
//! ```

pub mod proxy;
pub mod server;

pub use proxy::{ProxyError, ReverseProxy, Target};
pub use server::{HttpServer, ServerError};
