//! File watcher that triggers a reload broadcast.

use std::path::PathBuf;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::WatchSection;
use crate::lifecycle::Shutdown;
use crate::reload::registry::ConnectionRegistry;

/// Broadcasts a reload whenever one of the watched paths changes.
pub struct ReloadWatcher {
    paths: Vec<PathBuf>,
    debounce: Duration,
    registry: ConnectionRegistry,
}

impl ReloadWatcher {
    pub fn new(config: &WatchSection, registry: ConnectionRegistry) -> Self {
        Self {
            paths: config.paths.iter().map(PathBuf::from).collect(),
            debounce: Duration::from_millis(config.debounce_ms),
            registry,
        }
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self, shutdown: &Shutdown) -> Result<RecommendedWatcher, notify::Error> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        tracing::debug!(paths = ?event.paths, "Change detected");
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default(),
        )?;

        for path in &self.paths {
            watcher.watch(path, RecursiveMode::Recursive)?;
        }
        tracing::info!(paths = ?self.paths, debounce = ?self.debounce, "Reload watcher started");

        tokio::spawn(forward_changes(rx, self.debounce, self.registry, shutdown.signalled()));
        Ok(watcher)
    }
}

async fn forward_changes(
    mut changes: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    registry: ConnectionRegistry,
    shutdown: impl std::future::Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        let burst = tokio::select! {
            burst = next_burst(&mut changes, debounce) => burst,
            _ = &mut shutdown => false,
        };
        if !burst {
            break;
        }
        registry.broadcast().await;
    }
    tracing::debug!("Reload watcher stopped");
}

/// Wait for a change, then absorb follow-ups until `quiet` passes without one.
///
/// Returns `false` when the sender is gone before any change arrives.
async fn next_burst(changes: &mut mpsc::UnboundedReceiver<()>, quiet: Duration) -> bool {
    if changes.recv().await.is_none() {
        return false;
    }
    while let Ok(Some(())) = tokio::time::timeout(quiet, changes.recv()).await {}
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_collapses_to_one() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..5 {
            tx.send(()).unwrap();
        }

        assert!(next_burst(&mut rx, Duration::from_millis(20)).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_ends_watch() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        drop(tx);
        assert!(!next_burst(&mut rx, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_run_watches_existing_directory() {
        let dir = std::env::temp_dir().join(format!("livereload-watch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let config = WatchSection {
            enabled: true,
            paths: vec![dir.to_string_lossy().into_owned()],
            debounce_ms: 10,
        };
        let registry = ConnectionRegistry::new(Default::default());
        let shutdown = Shutdown::new();

        let watcher = ReloadWatcher::new(&config, registry).run(&shutdown);
        assert!(watcher.is_ok());

        shutdown.trigger();
        std::fs::remove_dir_all(&dir).ok();
    }
}
