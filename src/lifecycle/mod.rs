//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → servers stop accepting → registry stops live connections → exit
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
