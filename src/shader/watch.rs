// Shader hot-reload
//
// Watches shader roots and remembers which files changed. Nothing is reloaded
// from the notification thread: the render thread drains the stale set between
// frames (`ShaderReflector::invalidate_stale`) so a module is never swapped
// while draws that use it are being recorded.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    stale: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ShaderWatcher {
    /// Starts watching every existing directory in `roots`, recursively.
    pub fn new<P: AsRef<Path>>(roots: &[P]) -> Result<Self> {
        let stale = Arc::new(Mutex::new(HashSet::new()));
        let sink = Arc::clone(&stale);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) => {
                let mut stale = sink.lock();
                for path in event.paths {
                    log::debug!("Shader changed on disk: {}", path.display());
                    stale.insert(path);
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Shader watch error: {}", e),
        })
        .context("Failed to create shader file watcher")?;

        for root in roots {
            let root = root.as_ref();
            if !root.is_dir() {
                log::debug!("Not watching {}: not a directory", root.display());
                continue;
            }
            watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {}", root.display()))?;
            log::info!("Watching {} for shader changes", root.display());
        }

        Ok(Self {
            _watcher: watcher,
            stale,
        })
    }

    /// Takes every path reported as changed since the last call.
    pub fn drain_stale(&self) -> Vec<PathBuf> {
        self.stale.lock().drain().collect()
    }

    pub fn has_stale(&self) -> bool {
        !self.stale.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn mark_stale(&self, path: impl Into<PathBuf>) {
        self.stale.lock().insert(path.into());
    }
}
