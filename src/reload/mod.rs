//! Reload signalling subsystem.
//!
//! # Data Flow
//! ```text
//! browser tab ── GET upgrade_path ──▶ origin.rs (same-origin gate)
//!     → connection.rs (open → start: liveness reader + notifier)
//!     → registry.rs (member until start returns, then deregistered and closed)
//!
//! reload_path / watcher.rs ──▶ registry.broadcast()
//!     → snapshot of members
//!     → per connection: bounded queue, delivery timeout, slow clients stopped
//! ```

pub mod connection;
pub mod origin;
pub mod registry;
pub mod watcher;

pub use connection::{Connection, ConnectionError, ConnectionState, RELOAD_MESSAGE};
pub use origin::{check_origin, OriginRejection};
pub use registry::{BroadcastReport, ConnectionRegistry, RegistrySettings, RegistryStatus};
pub use watcher::ReloadWatcher;
