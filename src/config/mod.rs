//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)                 CLI flags
//!     → loader.rs (parse)                │
//!     → ReloaderConfig ◀─────────────────┘ (overrides)
//!     → validation.rs (semantic checks)
//!     → ReloaderConfig (validated, immutable)
//!     → handed to the proxy, the registry and the watcher
//! ```
//!
//! # Design Decisions
//! - Config is immutable once validated; nothing binds before validation passes
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_snippet, read_config, ConfigError};
pub use schema::ObservabilityConfig;
pub use schema::ProxySection;
pub use schema::ReloadSection;
pub use schema::ReloaderConfig;
pub use schema::WatchSection;
pub use validation::{validate_config, ValidationError};
