// Config file watcher
//
// Polls the config file's modification time and, when it increases, re-reads
// the file and fans the new settings out through AppContext::apply_settings
// (registry reload, proxy pool reload, checker reconfigure) plus any
// subscriber callback. Reload errors are logged and the loop keeps running.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::models::config::AppSettings;
use crate::AppContext;

type ReloadCallback = Box<dyn Fn(&AppSettings) + Send + Sync>;

pub struct ConfigWatcher {
    path: PathBuf,
    check_interval: Duration,
    reload_callback: Option<ReloadCallback>,
}

impl ConfigWatcher {
    pub fn new(path: &Path, check_interval: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            check_interval,
            reload_callback: None,
        }
    }

    /// Register a callback invoked after each successful reload.
    pub fn set_reload_callback(&mut self, callback: ReloadCallback) {
        self.reload_callback = Some(callback);
    }

    fn file_mtime(path: &Path) -> Option<SystemTime> {
        match fs::metadata(path) {
            Ok(meta) => meta.modified().ok(),
            Err(e) => {
                warn!("[ConfigWatcher] Failed to stat {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Spawn the polling loop.
    pub fn spawn(self, ctx: Arc<AppContext>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "[ConfigWatcher] Watching {} every {:?}",
                self.path.display(),
                self.check_interval
            );
            let mut last_mtime = Self::file_mtime(&self.path);

            loop {
                sleep(self.check_interval).await;

                let current = match Self::file_mtime(&self.path) {
                    Some(mtime) => mtime,
                    None => continue,
                };

                match last_mtime {
                    Some(previous) if current > previous => {
                        info!("[ConfigWatcher] Config file changed, triggering reload");
                        last_mtime = Some(current);
                        self.trigger_reload(&ctx).await;
                    }
                    None => {
                        last_mtime = Some(current);
                    }
                    _ => {}
                }
            }
        })
    }

    async fn trigger_reload(&self, ctx: &AppContext) {
        let settings = match AppSettings::load(&self.path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("[ConfigWatcher] Reload aborted: {}", e);
                return;
            }
        };

        match ctx.apply_settings(settings.clone()).await {
            Ok(()) => {
                if let Some(callback) = &self.reload_callback {
                    callback(&settings);
                }
                info!("[ConfigWatcher] Hot reload completed");
            }
            Err(e) => error!("[ConfigWatcher] Reload failed: {}", e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
