//! Hot reload of the game finder settings

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::app::GameFinderSettings;

/// Polls a configuration file and publishes changed game finder settings
/// through a watch channel.
///
/// A file that fails to parse or validate is logged and skipped; subscribers
/// keep the last good settings.
pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    sender: watch::Sender<GameFinderSettings>,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(
        path: impl Into<PathBuf>,
        initial: GameFinderSettings,
        poll_interval: Duration,
    ) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            path: path.into(),
            poll_interval,
            sender,
            last_modified: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receiver observing every accepted settings change
    pub fn subscribe(&self) -> watch::Receiver<GameFinderSettings> {
        self.sender.subscribe()
    }

    /// Re-read the file if its modification time moved. Returns true when new
    /// settings were published.
    pub async fn check_for_changes(&mut self) -> Result<bool> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("Failed to stat {}", self.path.display()))?;
        let modified = metadata.modified()?;
        if self.last_modified == Some(modified) {
            return Ok(false);
        }
        self.last_modified = Some(modified);

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let settings = GameFinderSettings::from_toml_str(&content)
            .with_context(|| format!("Rejected settings from {}", self.path.display()))?;

        let changed = self.sender.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        });
        if changed {
            info!("Reloaded game finder settings from {}", self.path.display());
        } else {
            debug!("{} touched without settings changes", self.path.display());
        }
        Ok(changed)
    }

    /// Poll until `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        info!(
            "Watching {} for configuration changes every {:?}",
            self.path.display(),
            self.poll_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_for_changes().await {
                        warn!("Configuration reload failed: {:#}", e);
                    }
                }
            }
        }

        debug!("Configuration watcher stopped");
    }
}
