//! Live file sync from the project directory into running containers.
//!
//! Each bind-mounted volume of a service becomes a [`SyncTarget`]. The
//! [`Syncer`] watches the local side with `notify`, skips events whose file
//! content did not change and debounces bursts. Changed files are copied into
//! the service's container and deleted ones removed from it, both through the
//! [`DevBackend`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use super::backend::DevBackend;
use super::manifest::Manifest;

/// Quiet period after the last change before a batch is synced.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

const TICK: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq)]
pub struct SyncTarget {
    pub service: String,
    pub local: PathBuf,
    pub remote: String,
}

impl SyncTarget {
    /// All bind-mounted volumes in the manifest whose local side exists.
    pub fn from_manifest(manifest: &Manifest, dir: &Path) -> Vec<Self> {
        manifest
            .services
            .iter()
            .flat_map(|service| {
                service
                    .sync_paths(dir)
                    .into_iter()
                    .filter_map(|(local, remote)| {
                        let local = local.canonicalize().ok()?;
                        Some(Self {
                            service: service.name.clone(),
                            local,
                            remote,
                        })
                    })
            })
            .collect()
    }

    /// Container path for a changed local file, if it lives under this target.
    pub fn remote_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.local).ok()?;
        if relative.as_os_str().is_empty() {
            return Some(self.remote.clone());
        }
        let relative = relative.to_string_lossy().replace('\\', "/");
        Some(format!("{}/{}", self.remote.trim_end_matches('/'), relative))
    }
}

/// What happened to a synced path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncChange {
    Copied,
    Removed,
}

/// Pending changes waiting out the debounce window. The latest change to a
/// path wins.
#[derive(Debug, Default)]
struct PendingChanges {
    paths: HashMap<PathBuf, SyncChange>,
    last_change: Option<Instant>,
}

impl PendingChanges {
    fn add(&mut self, path: PathBuf, change: SyncChange) {
        self.paths.insert(path, change);
        self.last_change = Some(Instant::now());
    }

    fn ready(&self) -> bool {
        self.last_change
            .is_some_and(|last| !self.paths.is_empty() && last.elapsed() >= DEBOUNCE)
    }

    fn take(&mut self) -> Vec<(PathBuf, SyncChange)> {
        self.last_change = None;
        let mut paths: Vec<_> = self.paths.drain().collect();
        paths.sort_by(|a, b| a.0.cmp(&b.0));
        paths
    }
}

fn content_hash(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    Some(format!("{:x}", Sha256::digest(&bytes)))
}

pub struct Syncer {
    app: String,
    targets: Vec<SyncTarget>,
    backend: Arc<dyn DevBackend>,
}

impl Syncer {
    pub fn new(app: impl Into<String>, targets: Vec<SyncTarget>, backend: Arc<dyn DevBackend>) -> Self {
        Self {
            app: app.into(),
            targets,
            backend,
        }
    }

    pub fn targets(&self) -> &[SyncTarget] {
        &self.targets
    }

    /// Watch and sync until the watcher goes away. `on_sync` is told about
    /// every path copied into or removed from a container.
    pub async fn run(self, on_sync: impl Fn(&SyncTarget, &Path, SyncChange) + Send + Sync) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            },
            Config::default(),
        )
        .context("Failed to create file watcher")?;

        for target in &self.targets {
            watcher
                .watch(&target.local, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {}", target.local.display()))?;
        }

        // Seed hashes so the first event for an untouched file is ignored.
        let mut hashes: HashMap<PathBuf, String> = HashMap::new();
        for target in &self.targets {
            for entry in WalkDir::new(&target.local)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if let Some(hash) = content_hash(entry.path()) {
                    hashes.insert(entry.path().to_path_buf(), hash);
                }
            }
        }
        tracing::debug!(app = %self.app, targets = self.targets.len(), files = hashes.len(), "sync watching");

        let mut pending = PendingChanges::default();
        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                changed = rx.recv() => {
                    let Some(path) = changed else { break };
                    if path.is_file() {
                        let Some(hash) = content_hash(&path) else { continue };
                        if hashes.get(&path) == Some(&hash) {
                            continue;
                        }
                        hashes.insert(path.clone(), hash);
                        pending.add(path, SyncChange::Copied);
                    } else if !path.exists() {
                        // Only paths that were seeded or synced before.
                        let before = hashes.len();
                        hashes.retain(|known, _| !known.starts_with(&path));
                        if hashes.len() != before {
                            pending.add(path, SyncChange::Removed);
                        }
                    }
                }
                _ = tick.tick() => {
                    if pending.ready() {
                        for (path, change) in pending.take() {
                            self.sync_one(&path, change, &on_sync).await;
                        }
                    }
                }
            }
        }

        drop(watcher);
        Ok(())
    }

    async fn sync_one(
        &self,
        path: &Path,
        change: SyncChange,
        on_sync: &(impl Fn(&SyncTarget, &Path, SyncChange) + Send + Sync),
    ) {
        for target in &self.targets {
            let Some(remote) = target.remote_path(path) else {
                continue;
            };
            let result = match change {
                SyncChange::Copied => {
                    self.backend
                        .sync_file(&self.app, &target.service, path, &remote)
                        .await
                }
                SyncChange::Removed => {
                    self.backend
                        .remove_file(&self.app, &target.service, &remote)
                        .await
                }
            };
            match result {
                Ok(()) => {
                    tracing::debug!(service = %target.service, path = %path.display(), remote = %remote, change = ?change, "synced");
                    on_sync(target, path, change);
                }
                Err(e) => {
                    tracing::warn!(service = %target.service, path = %path.display(), error = %format!("{:#}", e), "sync failed");
                }
            }
        }
    }
}
