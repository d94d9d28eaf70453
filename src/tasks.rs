use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Settings;

/// Deletes artifacts once they outlive the retention window.
#[derive(Clone, Debug)]
pub struct Reclaimer {
    dir: PathBuf,
    retention: Duration,
}

impl Reclaimer {
    pub fn new(dir: PathBuf, retention: Duration) -> Self {
        Self { dir, retention }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.download_dir.clone(), settings.retention())
    }

    pub fn sweep_once(&self) -> usize {
        self.sweep_at(SystemTime::now())
    }

    /// Removes every file modified more than `retention` before `now`.
    /// Entries that cannot be read or removed are logged and skipped.
    pub fn sweep_at(&self, now: SystemTime) -> usize {
        let mut removed = 0;
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("Skipping unreadable entry in {:?}: {}", self.dir, e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let modified = match entry.metadata().map(|m| m.modified()) {
                Ok(Ok(t)) => t,
                Ok(Err(e)) => {
                    warn!("Cannot read mtime of {:?}: {}", entry.path(), e);
                    continue;
                }
                Err(e) => {
                    warn!("Cannot stat {:?}: {}", entry.path(), e);
                    continue;
                }
            };

            let age = now.duration_since(modified).unwrap_or_default();
            if age > self.retention {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        info!("Reclaimed {:?} (age {:?})", entry.path(), age);
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to reclaim {:?}: {}", entry.path(), e),
                }
            }
        }
        removed
    }

    /// Drops the whole artifact directory. Errors are ignored.
    pub fn remove_all(&self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => info!("Removed download directory {:?}", self.dir),
            Err(e) => debug!("Could not remove {:?}: {}", self.dir, e),
        }
    }

    /// Sweeps immediately, then every `interval`, until `shutdown` fires.
    pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let reclaimer = self.clone();
                match tokio::task::spawn_blocking(move || reclaimer.sweep_once()).await {
                    Ok(0) => debug!("Reclaim sweep found nothing to delete"),
                    Ok(n) => info!("Reclaim sweep deleted {} file(s)", n),
                    Err(e) => warn!("Reclaim sweep aborted: {}", e),
                }
            }
            info!("Storage reclaimer stopped.");
        })
    }
}

pub fn start_background_tasks(settings: &Settings, shutdown: CancellationToken) -> JoinHandle<()> {
    info!(
        "Reclaiming files in {:?} older than {:?} every {:?}",
        settings.download_dir,
        settings.retention(),
        settings.reclaim_interval()
    );
    Reclaimer::from_settings(settings).spawn(settings.reclaim_interval(), shutdown)
}
