use std::collections::HashMap;
use std::io::Read;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, watch};

use super::db::DbHandle;
use super::models::{Build, BuildSource, BuildStatus};

/// The image-build subsystem a build is handed to.
/// Real implementation: `crate::docker::DockerCli`. Test double: `ScriptedBackend`.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Materialize a remote source reference into `dest`.
    async fn fetch(&self, reference: &str, dest: &Path, log: &BuildWriter) -> Result<()>;

    /// Build the image for `app` from the source tree in `dir`, streaming
    /// output into `log`.
    async fn build_image(&self, app: &str, build_id: &str, dir: &Path, log: &BuildWriter)
    -> Result<()>;
}

/// The only write path into a build record.
///
/// Not `Clone`: one executor owns it for the whole lifetime of the build, so
/// there is exactly one writer per build. Everyone else reads snapshots
/// through `DbHandle`.
pub struct BuildWriter {
    db: DbHandle,
    app: String,
    id: String,
    status: BuildStatus,
}

impl BuildWriter {
    pub(crate) fn new(db: DbHandle, build: &Build) -> Self {
        Self {
            db,
            app: build.app.clone(),
            id: build.id.clone(),
            status: build.status,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    /// Append raw text to the build's logs.
    pub async fn append(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        if text.is_empty() {
            return Ok(());
        }
        let (app, id) = (self.app.clone(), self.id.clone());
        let appended = self
            .db
            .call(move |db| db.append_logs(&app, &id, &text))
            .await?;
        if !appended {
            anyhow::bail!("build {} no longer accepts log output", self.id);
        }
        Ok(())
    }

    /// Append one line, adding the trailing newline.
    pub async fn line(&self, line: impl AsRef<str>) -> Result<()> {
        self.append(format!("{}\n", line.as_ref())).await
    }

    async fn transition(&mut self, next: BuildStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            anyhow::bail!(
                "build {}: illegal status change {} -> {}",
                self.id,
                self.status,
                next
            );
        }
        let (app, id) = (self.app.clone(), self.id.clone());
        let updated = self
            .db
            .call(move |db| db.update_status(&app, &id, next))
            .await?;
        if !updated {
            anyhow::bail!("build {}: store refused status {}", self.id, next);
        }
        self.status = next;
        Ok(())
    }
}

/// Runs one build from start to a terminal status.
pub struct BuildExecutor {
    writer: BuildWriter,
    backend: Arc<dyn BuildBackend>,
}

impl BuildExecutor {
    pub fn new(writer: BuildWriter, backend: Arc<dyn BuildBackend>) -> Self {
        Self { writer, backend }
    }

    /// Drive the build to completion and return its terminal status.
    ///
    /// Failures never escape: unpack, fetch and build errors (and panics in
    /// the backend) are appended to the logs and the build is marked failed.
    pub async fn run(mut self, source: BuildSource) -> BuildStatus {
        let (app, id) = (self.writer.app.clone(), self.writer.id.clone());

        if let Err(e) = self.writer.transition(BuildStatus::Running).await {
            tracing::error!(app = %app, build = %id, error = %format!("{:#}", e), "build.start failed");
            return self.finish(Some(format!("{:#}", e))).await;
        }
        tracing::info!(app = %app, build = %id, source = source.kind(), "build.running");

        let outcome = AssertUnwindSafe(self.execute(source)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(panic) => Some(format!("executor panicked: {}", panic_message(&*panic))),
        };
        self.finish(failure).await
    }

    async fn execute(&self, source: BuildSource) -> Result<()> {
        let workdir = tempfile::Builder::new()
            .prefix("source")
            .tempdir()
            .context("Failed to create source directory")?;

        match source {
            BuildSource::Archive(bytes) => {
                self.writer
                    .line(format!("unpacking source archive ({} bytes)", bytes.len()))
                    .await?;
                let dest = workdir.path().to_path_buf();
                tokio::task::spawn_blocking(move || unpack_archive(&bytes, &dest))
                    .await
                    .context("unpack task panicked")??;
            }
            BuildSource::Remote(reference) => {
                self.writer.line(format!("fetching {}", reference)).await?;
                self.backend
                    .fetch(&reference, workdir.path(), &self.writer)
                    .await
                    .with_context(|| format!("fetch {} failed", reference))?;
            }
        }

        self.backend
            .build_image(&self.writer.app, &self.writer.id, workdir.path(), &self.writer)
            .await
    }

    async fn finish(mut self, failure: Option<String>) -> BuildStatus {
        let (app, id) = (self.writer.app.clone(), self.writer.id.clone());
        let terminal = match failure {
            None => BuildStatus::Complete,
            Some(detail) => {
                // Logs freeze at the terminal transition, so the detail goes first.
                if let Err(e) = self.writer.line(format!("ERROR: {}", detail)).await {
                    tracing::warn!(app = %app, build = %id, error = %format!("{:#}", e), "build.logs append failed");
                }
                BuildStatus::Failed
            }
        };

        if let Err(e) = self.writer.transition(terminal).await {
            tracing::error!(app = %app, build = %id, error = %format!("{:#}", e), "build.finish failed");
        }
        match self.writer.status() {
            BuildStatus::Complete => tracing::info!(app = %app, build = %id, "build.complete"),
            status => tracing::warn!(app = %app, build = %id, status = %status, "build.failed"),
        }
        self.writer.status()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Unpack a tarball (gzip-compressed or plain) into `dest`.
pub fn unpack_archive(bytes: &[u8], dest: &Path) -> Result<()> {
    let reader: Box<dyn Read + '_> = if bytes.starts_with(&[0x1f, 0x8b]) {
        Box::new(flate2::read::GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };
    tar::Archive::new(reader)
        .unpack(dest)
        .context("Failed to unpack source archive")?;
    Ok(())
}

/// Handle on a dispatched executor's completion.
pub struct ExecutorHandle {
    pub id: String,
    done: watch::Receiver<Option<BuildStatus>>,
}

impl ExecutorHandle {
    /// Wait for the executor to reach a terminal status.
    pub async fn finished(mut self) -> Option<BuildStatus> {
        let status = self.done.wait_for(|s| s.is_some()).await.ok()?;
        *status
    }
}

/// Supervises background executors.
///
/// Dispatch is fire-and-forget from the request's point of view; the runner
/// keeps a completion channel per active build until its executor finishes.
pub struct BuildRunner {
    backend: Arc<dyn BuildBackend>,
    /// Map from "app/id" to the completion channel of an active build.
    active: Arc<Mutex<HashMap<String, watch::Receiver<Option<BuildStatus>>>>>,
}

impl BuildRunner {
    pub fn new(backend: Arc<dyn BuildBackend>) -> Self {
        Self {
            backend,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn an executor for `build`. Returns as soon as the task is running.
    pub async fn dispatch(&self, db: DbHandle, build: &Build, source: BuildSource) -> ExecutorHandle {
        let key = format!("{}/{}", build.app, build.id);
        let (done_tx, done_rx) = watch::channel(None);
        self.active.lock().await.insert(key.clone(), done_rx.clone());

        let executor = BuildExecutor::new(BuildWriter::new(db, build), Arc::clone(&self.backend));
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            let status = executor.run(source).await;
            active.lock().await.remove(&key);
            let _ = done_tx.send(Some(status));
        });

        ExecutorHandle {
            id: build.id.clone(),
            done: done_rx,
        }
    }

    /// Wait for an active build's executor to finish. `None` when the build
    /// is not (or no longer) running under this runner.
    pub async fn wait(&self, app: &str, id: &str) -> Option<BuildStatus> {
        let rx = self.active.lock().await.get(&format!("{}/{}", app, id)).cloned()?;
        ExecutorHandle {
            id: id.to_string(),
            done: rx,
        }
        .finished()
        .await
    }

    /// Keys ("app/id") of builds whose executors are still running.
    pub async fn active_builds(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.active.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
