//! Config hot-reload.
//!
//! Watches the config file, diffs the dependency table against the running
//! configuration, and hands valid changes to
//! [`ResilienceLayer::apply_reload`]. A file that fails to load or validate
//! is logged and ignored; the previous configuration stays live.
//!
//! # Example
//!
//! ```no_run
//! use std::{path::PathBuf, sync::Arc};
//! use tokio::sync::broadcast;
//! use depguard::{config::Config, config_reload::ConfigWatcher, layer::ResilienceLayer};
//!
//! # tokio_test::block_on(async {
//! let (shutdown_tx, _) = broadcast::channel(1);
//! let layer = Arc::new(ResilienceLayer::init(Config::default()).unwrap());
//!
//! let _watcher = ConfigWatcher::start(
//!     PathBuf::from("depguard.yaml"),
//!     layer,
//!     shutdown_tx.subscribe(),
//! );
//! # });
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::layer::ResilienceLayer;
use crate::{Error, Result};

/// Changes to the dependency table between two configs
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigDiff {
    /// Dependencies present only in the new config
    pub added: Vec<String>,
    /// Dependencies present only in the old config
    pub removed: Vec<String>,
    /// Dependencies whose settings changed
    pub modified: Vec<String>,
    /// Anything outside `dependencies` changed
    pub other_changed: bool,
}

impl ConfigDiff {
    /// Returns `true` when no changes were detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty() && !self.other_changed
    }

    /// One line per change type
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("added dependencies: [{}]", self.added.join(", ")));
        }
        if !self.removed.is_empty() {
            parts.push(format!("removed dependencies: [{}]", self.removed.join(", ")));
        }
        if !self.modified.is_empty() {
            parts.push(format!("modified dependencies: [{}]", self.modified.join(", ")));
        }
        if self.other_changed {
            parts.push("other settings changed".to_string());
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Compute the diff between two configs. Pure; applies nothing.
#[must_use]
pub fn compute_diff(old: &Config, new: &Config) -> ConfigDiff {
    let mut diff = ConfigDiff::default();

    for (name, cfg) in &new.dependencies {
        match old.dependencies.get(name) {
            None => diff.added.push(name.clone()),
            Some(previous) if previous != cfg => diff.modified.push(name.clone()),
            Some(_) => {}
        }
    }
    diff.removed = old
        .dependencies
        .keys()
        .filter(|name| !new.dependencies.contains_key(*name))
        .cloned()
        .collect();

    diff.other_changed = old.server != new.server
        || old.admin != new.admin
        || old.resolver != new.resolver
        || old.auth != new.auth
        || old.health != new.health
        || old.env_files != new.env_files;

    diff
}

/// Load `path` and apply it to `layer`
///
/// Returns the applied diff. An empty diff is not applied.
///
/// # Errors
///
/// Returns [`Error::Config`] when the file cannot be loaded or is invalid;
/// the layer is left untouched.
pub fn reload_from(path: &Path, layer: &ResilienceLayer) -> Result<ConfigDiff> {
    let new_config = Config::load(Some(path))?;
    let diff = compute_diff(&layer.config(), &new_config);

    if diff.is_empty() {
        debug!("Config reload: no changes detected");
        return Ok(diff);
    }

    info!(changes = %diff.summary(), "Config reload: applying changes");
    layer.apply_reload(new_config)?;
    Ok(diff)
}

/// Watches the config file and reloads it on change
pub struct ConfigWatcher {
    /// Kept alive to prevent the OS watcher from being dropped.
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Start watching `config_path`
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `notify` watcher cannot be created.
    pub fn start(
        config_path: PathBuf,
        layer: Arc<ResilienceLayer>,
        shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel(32);
        let watcher = Self::create_notify_watcher(event_tx, &config_path)?;
        Self::spawn_reload_task(config_path, layer, event_rx, shutdown_rx);

        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }

    fn create_notify_watcher(
        event_tx: tokio::sync::mpsc::Sender<()>,
        config_path: &Path,
    ) -> Result<RecommendedWatcher> {
        let watch_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let path_for_closure = config_path.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let is_relevant = result.as_ref().is_ok_and(|e| is_config_event(e, &path_for_closure));
                if is_relevant {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Internal(format!("Failed to create config watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("Failed to watch config path: {e}")))?;

        Ok(watcher)
    }

    /// Debounce bursts of events (editors write in several steps)
    fn spawn_reload_task(
        config_path: PathBuf,
        layer: Arc<ResilienceLayer>,
        mut event_rx: tokio::sync::mpsc::Receiver<()>,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            const DEBOUNCE: Duration = Duration::from_millis(500);
            let mut last_event: Option<Instant> = None;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                    }
                    _ = ticker.tick() => {
                        if last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                            last_event = None;
                            if let Err(e) = reload_from(&config_path, &layer) {
                                warn!(error = %e, "Config reload rejected, keeping current config");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Config watcher shutting down");
                        break;
                    }
                }
            }
        });
    }
}

/// Create/modify events on the watched file
fn is_config_event(event: &Event, config_path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| p.file_name() == config_path.file_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DependencyConfig, DependencyKind};

    fn dep(host: &str) -> DependencyConfig {
        DependencyConfig {
            kind: DependencyKind::Http,
            host: Some(host.to_string()),
            port: Some(8081),
            probe: false,
            ..Default::default()
        }
    }

    fn config_with(deps: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        for (name, host) in deps {
            config.dependencies.insert((*name).to_string(), dep(host));
        }
        config
    }

    #[test]
    fn diff_identical_configs_is_empty() {
        let config = config_with(&[("tracking", "127.0.0.1")]);
        let diff = compute_diff(&config, &config.clone());
        assert!(diff.is_empty());
        assert_eq!(diff.summary(), "no changes");
    }

    #[test]
    fn diff_classifies_dependencies() {
        let old = config_with(&[("tracking", "127.0.0.1"), ("legacy", "127.0.0.1")]);
        let new = config_with(&[("tracking", "127.0.0.2"), ("cache", "127.0.0.1")]);
        let diff = compute_diff(&old, &new);
        assert_eq!(diff.added, vec!["cache"]);
        assert_eq!(diff.removed, vec!["legacy"]);
        assert_eq!(diff.modified, vec!["tracking"]);
        assert!(!diff.other_changed);
        assert!(diff.summary().contains("removed dependencies: [legacy]"));
    }

    #[test]
    fn diff_detects_other_sections() {
        let old = Config::default();
        let mut new = Config::default();
        new.health.poll_interval = Duration::from_secs(1);
        assert!(compute_diff(&old, &new).other_changed);
    }

    #[test]
    fn reload_from_applies_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depguard.yaml");
        let layer = ResilienceLayer::init(config_with(&[("tracking", "127.0.0.1")])).unwrap();

        std::fs::write(
            &path,
            "dependencies:\n  tracking:\n    kind: http\n    host: 127.0.0.1\n    port: 9000\n    probe: false\n",
        )
        .unwrap();
        let diff = reload_from(&path, &layer).unwrap();
        assert_eq!(diff.modified, vec!["tracking"]);
        assert_eq!(layer.target("tracking").unwrap().port, 9000);
    }

    #[test]
    fn reload_from_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depguard.yaml");
        let layer = ResilienceLayer::init(config_with(&[("tracking", "127.0.0.1")])).unwrap();

        std::fs::write(&path, "dependencies:\n  tracking:\n    kind: http\n    probe: false\n").unwrap();
        assert!(matches!(reload_from(&path, &layer), Err(Error::Config(_))));
        assert_eq!(layer.target("tracking").unwrap().port, 8081);
    }
}
