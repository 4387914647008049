//! Live-reload development proxy library.

pub mod config;
pub mod http;
pub mod interceptor;
pub mod lifecycle;
pub mod observability;
pub mod reload;

pub use config::schema::ReloaderConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
