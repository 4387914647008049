//! Live-reload development proxy.
//!
//! ```text
//!   browser ──▶ public address ──▶ ReverseProxy ──▶ origin
//!      ▲              │                  │
//!      │              │                  └─ LiveReload injects the snippet
//!      │              ▼                     before </body>
//!      └──── ws ── ConnectionRegistry ◀── reload endpoint / file watcher
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;

use livereload_proxy::config::{
    load_snippet, read_config, validate_config, ConfigError, ReloaderConfig,
};
use livereload_proxy::interceptor::DEFAULT_SNIPPET;
use livereload_proxy::lifecycle::signals::wait_for_signal;
use livereload_proxy::observability::{logging, metrics};
use livereload_proxy::reload::ReloadWatcher;
use livereload_proxy::{HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "livereload-proxy")]
#[command(about = "Development proxy that reloads the browser on demand", long_about = None)]
struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upstream server to proxy, e.g. http://localhost:8080
    #[arg(short, long)]
    origin: Option<String>,

    /// Address clients use to reach the proxy
    #[arg(short, long)]
    public: Option<String>,

    /// File holding the snippet injected before </body>
    #[arg(short, long)]
    snippet: Option<PathBuf>,

    /// Upstream for websocket upgrade requests
    #[arg(short, long)]
    upgrade_target: Option<String>,

    /// Serve the reload endpoints on their own address
    #[arg(long)]
    registry_address: Option<String>,

    /// Reload whenever a file under this path changes (repeatable)
    #[arg(short, long = "watch")]
    watch: Vec<String>,

    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut ReloaderConfig) {
        if let Some(origin) = self.origin {
            config.proxy.origin = origin;
        }
        if let Some(public) = self.public {
            config.proxy.public = public;
        }
        if let Some(snippet) = self.snippet {
            config.reload.snippet_path = Some(snippet.to_string_lossy().into_owned());
        }
        if let Some(target) = self.upgrade_target {
            config.proxy.upgrade_target = Some(target);
        }
        if let Some(address) = self.registry_address {
            config.reload.bind_address = Some(address);
        }
        if !self.watch.is_empty() {
            config.watch.enabled = true;
            config.watch.paths = self.watch;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => read_config(path)?,
        None => ReloaderConfig::default(),
    };
    cli.apply(&mut config);

    logging::init(&config.observability);
    tracing::info!("livereload-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            tracing::error!(error = %error, "Invalid configuration");
        }
        return Err(ConfigError::Validation(errors).into());
    }

    tracing::info!(
        origin = %config.proxy.origin,
        public = %config.proxy.public,
        upgrade_target = ?config.proxy.upgrade_target,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let snippet = match &config.reload.snippet_path {
        Some(path) => load_snippet(Path::new(path))?,
        None => DEFAULT_SNIPPET.to_string(),
    };

    let server = HttpServer::new(&config, &snippet)?;
    let shutdown = Shutdown::new();

    // Dropping the watcher stops it
    let _watcher = if config.watch.enabled {
        let watcher = ReloadWatcher::new(&config.watch, server.registry().clone());
        Some(watcher.run(&shutdown)?)
    } else {
        None
    };

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.trigger();
    });

    server.run(shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
