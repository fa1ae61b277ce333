//! `dockyard start` pipeline.
//!
//! ```text
//! ResolveManifest → ValidatePorts → ValidateEnv → Build → (Run ∥ Sync) → AwaitRun
//! ```
//!
//! Every stage before Run aborts the invocation on failure; nothing already
//! done is undone. Run executes in a background task and reports through a
//! one-shot channel. Sync, when enabled, runs in the foreground next to it and
//! is dropped as soon as Run reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::oneshot;

use super::backend::DevBackend;
use super::manifest::{self, EnvLookup, Manifest};
use super::sync::{SyncChange, SyncTarget, Syncer};
use crate::config::Settings;
use crate::errors::DevError;

/// Options for one `start` invocation.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub dir: PathBuf,
    pub file: String,
    /// App name; defaults to the directory name.
    pub app: Option<String>,
    /// `false` forces fresh pulls and no-cache builds, and ignores the cached
    /// app environment.
    pub cache: bool,
    pub sync: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            file: manifest::DEFAULT_MANIFEST.to_string(),
            app: None,
            cache: true,
            sync: true,
        }
    }
}

impl StartOptions {
    pub fn app_name(&self) -> String {
        if let Some(app) = self.app.as_deref().filter(|a| !a.is_empty()) {
            return app.to_string();
        }
        self.dir
            .canonicalize()
            .ok()
            .and_then(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "app".to_string())
    }
}

/// Progress notifications for the caller to render.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Generated(Vec<String>),
    Building { service: String },
    Running { services: Vec<String> },
    Syncing { targets: usize },
    Synced { service: String, path: PathBuf },
    Removed { service: String, path: PathBuf },
}

/// What a successful start did.
#[derive(Debug, Clone, PartialEq)]
pub struct StartReport {
    pub app: String,
    pub generated: Vec<String>,
    pub services: Vec<String>,
    pub synced: bool,
}

pub struct Orchestrator {
    backend: Arc<dyn DevBackend>,
    settings: Settings,
    progress: Arc<dyn Fn(Progress) + Send + Sync>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn DevBackend>, settings: Settings) -> Self {
        Self {
            backend,
            settings,
            progress: Arc::new(|_| {}),
        }
    }

    pub fn with_progress(mut self, progress: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    fn report(&self, event: Progress) {
        (self.progress)(event);
    }

    pub async fn start(&self, opts: &StartOptions) -> Result<StartReport, DevError> {
        let app = opts.app_name();
        let (manifest, generated) = self.resolve_manifest(&opts.dir, &opts.file)?;

        let conflicts = manifest.port_conflicts();
        if !conflicts.is_empty() {
            return Err(DevError::PortsInUse { ports: conflicts });
        }

        let lookup = EnvLookup::new(&opts.dir, self.settings.state_dir());
        let missing = manifest
            .missing_environment(opts.cache, &app, &lookup)
            .map_err(DevError::Config)?;
        if !missing.is_empty() {
            return Err(DevError::MissingEnvironment { vars: missing });
        }

        self.build(&app, &opts.dir, &manifest, opts.cache).await?;

        if let Err(e) = manifest.save_environment(&app, &lookup) {
            tracing::warn!(app = %app, error = %format!("{:#}", e), "could not cache app environment");
        }

        let manifest = Arc::new(manifest);
        let run = self.spawn_run(&app, &opts.dir, Arc::clone(&manifest));

        let sync_enabled = opts.sync && !self.settings.sync_disabled();
        let targets = if sync_enabled {
            SyncTarget::from_manifest(&manifest, &opts.dir)
        } else {
            Vec::new()
        };
        let synced = !targets.is_empty();

        let errors = if synced {
            self.report(Progress::Syncing {
                targets: targets.len(),
            });
            self.run_with_sync(&app, targets, run).await
        } else {
            if sync_enabled {
                tracing::debug!(app = %app, "no bind-mounted volumes to sync");
            }
            run.await
        };
        let errors = errors.unwrap_or_else(|_| vec!["run task ended unexpectedly".to_string()]);
        if !errors.is_empty() {
            return Err(DevError::Run { errors });
        }

        tracing::info!(app = %app, "all services exited");
        Ok(StartReport {
            app,
            generated,
            services: manifest.services.iter().map(|s| s.name.clone()).collect(),
            synced,
        })
    }

    /// Read the manifest, generating defaults first when it cannot be read.
    fn resolve_manifest(&self, dir: &Path, file: &str) -> Result<(Manifest, Vec<String>), DevError> {
        match Manifest::read(dir, file) {
            Ok(m) => Ok((m, Vec::new())),
            Err(read_err) => {
                tracing::debug!(error = %format!("{:#}", read_err), "manifest unreadable, generating defaults");
                let generated = manifest::init(dir, file).map_err(DevError::Config)?;
                if !generated.is_empty() {
                    self.report(Progress::Generated(generated.clone()));
                }
                let m = Manifest::read(dir, file).map_err(DevError::Config)?;
                Ok((m, generated))
            }
        }
    }

    /// Build every service in manifest order, collecting all failures.
    async fn build(&self, app: &str, dir: &Path, manifest: &Manifest, cache: bool) -> Result<(), DevError> {
        let mut errors = Vec::new();
        for service in &manifest.services {
            self.report(Progress::Building {
                service: service.name.clone(),
            });
            if let Err(e) = self.backend.build_service(app, dir, service, cache).await {
                tracing::warn!(app = %app, service = %service.name, error = %format!("{:#}", e), "build failed");
                errors.push(format!("{}: {:#}", service.name, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DevError::Build { errors })
        }
    }

    /// Start all services in a background task; the receiver yields the
    /// collected run errors once every service has exited.
    fn spawn_run(&self, app: &str, dir: &Path, manifest: Arc<Manifest>) -> oneshot::Receiver<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        let backend = Arc::clone(&self.backend);
        let (app, dir) = (app.to_string(), dir.to_path_buf());

        self.report(Progress::Running {
            services: manifest.services.iter().map(|s| s.name.clone()).collect(),
        });
        tokio::spawn(async move {
            let runs = manifest.services.iter().map(|service| {
                let backend = Arc::clone(&backend);
                let (app, dir) = (app.clone(), dir.clone());
                async move {
                    backend
                        .run_service(&app, &dir, service)
                        .await
                        .map_err(|e| format!("{}: {:#}", service.name, e))
                }
            });
            let errors: Vec<String> = join_all(runs)
                .await
                .into_iter()
                .filter_map(|r| r.err())
                .collect();
            let _ = tx.send(errors);
        });
        rx
    }

    async fn run_with_sync(
        &self,
        app: &str,
        targets: Vec<SyncTarget>,
        mut run: oneshot::Receiver<Vec<String>>,
    ) -> Result<Vec<String>, oneshot::error::RecvError> {
        let progress = Arc::clone(&self.progress);
        let syncer = Syncer::new(app, targets, Arc::clone(&self.backend));
        let sync = syncer.run(move |target, path, change| {
            let (service, path) = (target.service.clone(), path.to_path_buf());
            progress(match change {
                SyncChange::Copied => Progress::Synced { service, path },
                SyncChange::Removed => Progress::Removed { service, path },
            })
        });
        tokio::pin!(sync);

        let finished = tokio::select! {
            result = &mut run => Some(result),
            result = &mut sync => {
                if let Err(e) = result {
                    tracing::warn!(app = %app, error = %format!("{:#}", e), "file sync stopped");
                }
                None
            }
        };
        match finished {
            Some(result) => result,
            None => run.await,
        }
    }
}
