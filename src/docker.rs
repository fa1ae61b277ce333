//! Container engine backend driven through the `docker` and `git` CLIs.
//!
//! One [`DockerCli`] serves both seams: [`BuildBackend`] for server-side
//! builds (clone, image build with output appended to the build log) and
//! [`DevBackend`] for `dockyard start` (build or pull, run, copy synced files).
//!
//! The docker command can be overridden with `DOCKER_CMD` (e.g. `podman`),
//! split on whitespace so wrappers like `sudo docker` work.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::builds::executor::{BuildBackend, BuildWriter};
use crate::dev::backend::{DevBackend, container_name, image_name};
use crate::dev::manifest::Service;

#[derive(Debug, Clone)]
pub struct DockerCli {
    docker: Vec<String>,
    git: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        let docker = std::env::var("DOCKER_CMD").unwrap_or_else(|_| "docker".to_string());
        let git = std::env::var("GIT_CMD").unwrap_or_else(|_| "git".to_string());
        Self::with_commands(&docker, &git)
    }

    pub fn with_commands(docker: &str, git: &str) -> Self {
        let mut docker: Vec<String> = docker.split_whitespace().map(str::to_string).collect();
        if docker.is_empty() {
            docker.push("docker".to_string());
        }
        Self {
            docker,
            git: git.to_string(),
        }
    }

    fn docker<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.docker[0]);
        cmd.args(&self.docker[1..]).args(args);
        cmd
    }

    /// Run a command inside a running container, failing with its stderr.
    async fn docker_exec(&self, container: &str, command: &[&str]) -> Result<()> {
        let output = self
            .docker(["exec", container].iter().chain(command))
            .output()
            .await
            .context("Failed to run docker exec")?;
        if !output.status.success() {
            anyhow::bail!(
                "docker exec {} {} failed: {}",
                container,
                command.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Run a docker command, printing its output prefixed with `service`.
    async fn docker_prefixed(&self, service: &str, args: Vec<String>) -> Result<ExitStatus> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cmd = self.docker(&args);
        cmd.kill_on_drop(true);
        let printer = async {
            while let Some(line) = rx.recv().await {
                println!("{} | {}", service, line);
            }
        };
        let (status, ()) = tokio::join!(run_streaming(cmd, tx), printer);
        status
    }
}

/// Directory that must exist in the container before `remote` can be copied.
pub fn remote_parent(remote: &str) -> Option<&str> {
    let (parent, _) = remote.trim_end_matches('/').rsplit_once('/')?;
    (!parent.is_empty()).then_some(parent)
}

/// Split `url#ref` into the clone URL and an optional branch or tag.
pub fn split_reference(reference: &str) -> (&str, Option<&str>) {
    match reference.rsplit_once('#') {
        Some((url, git_ref)) if !git_ref.is_empty() => (url, Some(git_ref)),
        Some((url, _)) => (url, None),
        None => (reference, None),
    }
}

pub fn clone_args(url: &str, git_ref: Option<&str>, dest: &Path) -> Vec<String> {
    let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
    if let Some(r) = git_ref {
        args.extend(["--branch".to_string(), r.to_string()]);
    }
    args.push(url.to_string());
    args.push(dest.display().to_string());
    args
}

/// Image tags must be lowercase.
pub fn build_tag(app: &str, build_id: &str) -> String {
    format!("{}:{}", app, build_id).to_lowercase()
}

pub fn service_build_args(app: &str, dir: &Path, service: &Service, cache: bool) -> Option<Vec<String>> {
    let build = service.build.as_ref()?;
    let context = dir.join(&build.context);
    let mut args = vec!["build".to_string()];
    if !cache {
        args.extend(["--pull".to_string(), "--no-cache".to_string()]);
    }
    args.extend(["-t".to_string(), image_name(app, &service.name).to_lowercase()]);
    if let Some(dockerfile) = &build.dockerfile {
        args.extend(["-f".to_string(), context.join(dockerfile).display().to_string()]);
    }
    args.push(context.display().to_string());
    Some(args)
}

pub fn run_args(app: &str, dir: &Path, service: &Service) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name(app, &service.name),
    ];
    for port in &service.ports {
        let mapping = match port.host {
            Some(host) => format!("{}:{}", host, port.container),
            None => port.container.to_string(),
        };
        args.extend(["-p".to_string(), mapping]);
    }
    let env_file = dir.join(".env");
    if env_file.is_file() {
        args.extend(["--env-file".to_string(), env_file.display().to_string()]);
    }
    for var in &service.environment {
        let value = match &var.value {
            Some(v) => format!("{}={}", var.name, v),
            // docker reads the value from its own environment
            None => var.name.clone(),
        };
        args.extend(["-e".to_string(), value]);
    }
    for volume in &service.volumes {
        let host = if volume.host.starts_with('.') {
            dir.join(&volume.host).display().to_string()
        } else {
            volume.host.clone()
        };
        args.extend(["-v".to_string(), format!("{}:{}", host, volume.container)]);
    }
    let image = match &service.image {
        Some(image) if service.build.is_none() => image.clone(),
        _ => image_name(app, &service.name).to_lowercase(),
    };
    args.push(image);
    args
}

/// Strip the line terminator and decode, replacing invalid UTF-8.
fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Spawn `cmd` and send every stdout/stderr line to `tx` as it arrives.
///
/// Output is read as raw bytes until both pipes close, so bytes that are not
/// UTF-8 never cut a stream short. The exit status decides success.
async fn run_streaming(mut cmd: Command, tx: mpsc::UnboundedSender<String>) -> Result<ExitStatus> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;

    let stdout = child.stdout.take().context("child stdout not captured")?;
    let stderr = child.stderr.take().context("child stderr not captured")?;
    let mut out = BufReader::new(stdout);
    let mut err = BufReader::new(stderr);
    let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
    let (mut out_done, mut err_done) = (false, false);

    while !(out_done && err_done) {
        tokio::select! {
            read = out.read_until(b'\n', &mut out_buf), if !out_done => {
                out_done = forward_read(read, &mut out_buf, &tx, &program);
            },
            read = err.read_until(b'\n', &mut err_buf), if !err_done => {
                err_done = forward_read(read, &mut err_buf, &tx, &program);
            },
        }
    }

    child
        .wait()
        .await
        .with_context(|| format!("Failed to wait for {}", program))
}

/// Send the line held in `buf`; returns true once the pipe is finished.
fn forward_read(
    read: std::io::Result<usize>,
    buf: &mut Vec<u8>,
    tx: &mpsc::UnboundedSender<String>,
    program: &str,
) -> bool {
    match read {
        Ok(0) => {
            if !buf.is_empty() {
                let _ = tx.send(decode_line(buf));
                buf.clear();
            }
            true
        }
        Ok(_) => {
            let _ = tx.send(decode_line(buf));
            buf.clear();
            false
        }
        Err(e) => {
            tracing::warn!(program = %program, error = %e, "output pipe read failed");
            true
        }
    }
}

/// Run `cmd`, appending its output to the build log line by line.
async fn run_logged(cmd: Command, log: &BuildWriter) -> Result<ExitStatus> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let forward = async {
        while let Some(line) = rx.recv().await {
            log.line(line).await?;
        }
        Ok::<_, anyhow::Error>(())
    };
    let (status, forwarded) = tokio::join!(run_streaming(cmd, tx), forward);
    forwarded?;
    status
}

#[async_trait]
impl BuildBackend for DockerCli {
    async fn fetch(&self, reference: &str, dest: &Path, log: &BuildWriter) -> Result<()> {
        let (url, git_ref) = split_reference(reference);
        let mut cmd = Command::new(&self.git);
        cmd.args(clone_args(url, git_ref, dest));
        let status = run_logged(cmd, log).await?;
        if !status.success() {
            anyhow::bail!("git clone exited with {}", status);
        }
        Ok(())
    }

    async fn build_image(&self, app: &str, build_id: &str, dir: &Path, log: &BuildWriter) -> Result<()> {
        let tag = build_tag(app, build_id);
        log.line(format!("building image {}", tag)).await?;
        let cmd = self.docker(["build".to_string(), "-t".to_string(), tag.clone(), dir.display().to_string()]);
        let status = run_logged(cmd, log).await?;
        if !status.success() {
            anyhow::bail!("docker build exited with {}", status);
        }
        tracing::debug!(app = %app, build = %build_id, tag = %tag, "image built");
        Ok(())
    }
}

#[async_trait]
impl DevBackend for DockerCli {
    async fn build_service(&self, app: &str, dir: &Path, service: &Service, cache: bool) -> Result<()> {
        let args = match service_build_args(app, dir, service, cache) {
            Some(args) => args,
            None => {
                let image = service
                    .image
                    .clone()
                    .context("service has neither build nor image")?;
                if cache {
                    let present = self
                        .docker(["image", "inspect", image.as_str()])
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .status()
                        .await
                        .context("Failed to run docker image inspect")?;
                    if present.success() {
                        return Ok(());
                    }
                }
                vec!["pull".to_string(), image]
            }
        };
        let status = self.docker_prefixed(&service.name, args).await?;
        if !status.success() {
            anyhow::bail!("docker exited with {}", status);
        }
        Ok(())
    }

    async fn run_service(&self, app: &str, dir: &Path, service: &Service) -> Result<()> {
        let container = container_name(app, &service.name);
        // A container left over from an earlier start would block the name.
        let _ = self
            .docker(["rm", "-f", container.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        let status = self
            .docker_prefixed(&service.name, run_args(app, dir, service))
            .await?;
        if !status.success() {
            anyhow::bail!("container {} exited with {}", container, status);
        }
        Ok(())
    }

    async fn sync_file(&self, app: &str, service: &str, local: &Path, remote: &str) -> Result<()> {
        let container = container_name(app, service);
        if let Some(parent) = remote_parent(remote) {
            self.docker_exec(&container, &["mkdir", "-p", parent]).await?;
        }
        let target = format!("{}:{}", container, remote);
        let output = self
            .docker(["cp".to_string(), local.display().to_string(), target.clone()])
            .output()
            .await
            .context("Failed to run docker cp")?;
        if !output.status.success() {
            anyhow::bail!(
                "docker cp to {} failed: {}",
                target,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn remove_file(&self, app: &str, service: &str, remote: &str) -> Result<()> {
        self.docker_exec(&container_name(app, service), &["rm", "-rf", remote])
            .await
    }
}
