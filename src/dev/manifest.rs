//! docker-compose manifest model.
//!
//! Only the parts the dev orchestrator needs are modelled: services in file
//! order with their build context or image, host port bindings, declared
//! environment and bind-mounted volumes. Both the v1 layout (services at the
//! top level) and the v2+ layout (under `services:`) are accepted.

use std::collections::HashSet;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

/// Default manifest file name.
pub const DEFAULT_MANIFEST: &str = "docker-compose.yml";

static VAR_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:?[-?][^}]*)?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub name: String,
    pub build: Option<BuildSpec>,
    pub image: Option<String>,
    pub ports: Vec<PortMapping>,
    pub environment: Vec<EnvVar>,
    pub volumes: Vec<VolumeMapping>,
    /// Variables referenced with `$VAR` / `${VAR}` anywhere in the service
    /// definition that carry no inline default.
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildSpec {
    pub context: String,
    pub dockerfile: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    /// Host side; `None` when only a container port is exposed.
    pub host: Option<u16>,
    pub container: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvVar {
    pub name: String,
    /// `None` when the variable is declared without a value and must come
    /// from the developer's environment.
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMapping {
    pub host: String,
    pub container: String,
}

// ── Raw serde shapes ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBuild {
    Context(String),
    Detailed {
        context: Option<String>,
        dockerfile: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u16),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEnvironment {
    List(Vec<String>),
    Map(Mapping),
}

impl Default for RawEnvironment {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct RawService {
    build: Option<RawBuild>,
    image: Option<String>,
    #[serde(default)]
    ports: Vec<RawPort>,
    #[serde(default)]
    environment: RawEnvironment,
    #[serde(default)]
    volumes: Vec<String>,
}

impl Manifest {
    /// Read and parse `{dir}/{file}`.
    pub fn read(dir: &Path, file: &str) -> Result<Self> {
        let path = dir.join(file);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(content).context("invalid YAML")?;
        let Value::Mapping(mut root) = root else {
            anyhow::bail!("manifest must be a mapping of services");
        };

        let services = match root.remove("services") {
            Some(Value::Mapping(services)) => services,
            Some(_) => anyhow::bail!("`services` must be a mapping"),
            None => {
                root.remove("version");
                root
            }
        };

        let mut parsed = Vec::new();
        for (name, body) in services {
            let name = name
                .as_str()
                .context("service names must be strings")?
                .to_string();
            parsed.push(
                Service::from_value(&name, body)
                    .with_context(|| format!("invalid service `{}`", name))?,
            );
        }
        if parsed.is_empty() {
            anyhow::bail!("manifest defines no services");
        }
        Ok(Self { services: parsed })
    }

    /// Host ports the manifest wants that are already bound on this machine,
    /// in manifest order without duplicates.
    pub fn port_conflicts(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut conflicts = Vec::new();
        for port in self.services.iter().flat_map(|s| &s.ports) {
            let Some(host) = port.host else { continue };
            if !seen.insert(host) {
                continue;
            }
            if TcpListener::bind(("0.0.0.0", host)).is_err() {
                conflicts.push(host.to_string());
            }
        }
        conflicts
    }

    /// Variable names the manifest needs from the developer's environment.
    pub fn required_environment(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let declared = self.services.iter().flat_map(|s| {
            s.environment
                .iter()
                .filter(|e| e.value.is_none())
                .map(|e| e.name.clone())
        });
        let referenced = self.services.iter().flat_map(|s| s.references.iter().cloned());
        declared
            .chain(referenced)
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Required variables not available from any source. With `cache` the
    /// app's cached environment from a previous start also counts.
    pub fn missing_environment(&self, cache: bool, app: &str, lookup: &EnvLookup) -> Result<Vec<String>> {
        let available = lookup.available(cache, app)?;
        Ok(self
            .required_environment()
            .into_iter()
            .filter(|name| !available.contains(name))
            .collect())
    }

    /// Record the currently resolvable values of required variables so a
    /// later cached start can reuse them.
    pub fn save_environment(&self, app: &str, lookup: &EnvLookup) -> Result<()> {
        let values = lookup.values(true, app)?;
        let mut out = String::new();
        for name in self.required_environment() {
            if let Some(value) = values.iter().find(|(k, _)| *k == name).map(|(_, v)| v) {
                let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                out.push_str(&format!("{}=\"{}\"\n", name, escaped));
            }
        }
        let path = lookup.cache_file(app);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, out).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }
}

impl Service {
    fn from_value(name: &str, body: Value) -> Result<Self> {
        let mut references = Vec::new();
        collect_references(&body, &mut references);

        let raw: RawService = if body.is_null() {
            anyhow::bail!("service has no definition")
        } else {
            serde_yaml::from_value(body)?
        };

        let build = raw.build.map(|b| match b {
            RawBuild::Context(context) => BuildSpec {
                context,
                dockerfile: None,
            },
            RawBuild::Detailed {
                context,
                dockerfile,
            } => BuildSpec {
                context: context.unwrap_or_else(|| ".".to_string()),
                dockerfile,
            },
        });
        if build.is_none() && raw.image.is_none() {
            anyhow::bail!("service needs either `build` or `image`");
        }

        let ports = raw
            .ports
            .into_iter()
            .map(|p| match p {
                RawPort::Number(container) => Ok(PortMapping {
                    host: None,
                    container,
                }),
                RawPort::Text(spec) => parse_port(&spec),
            })
            .collect::<Result<Vec<_>>>()?;

        let environment = match raw.environment {
            RawEnvironment::List(items) => items
                .into_iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => EnvVar {
                        name: k.trim().to_string(),
                        value: Some(v.to_string()),
                    },
                    None => EnvVar {
                        name: item.trim().to_string(),
                        value: None,
                    },
                })
                .collect(),
            RawEnvironment::Map(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let name = k.as_str().context("environment keys must be strings")?;
                    Ok(EnvVar {
                        name: name.to_string(),
                        value: scalar_to_string(&v),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let volumes = raw
            .volumes
            .iter()
            .filter_map(|v| {
                let mut parts = v.splitn(3, ':');
                let host = parts.next()?;
                let container = parts.next()?;
                Some(VolumeMapping {
                    host: host.to_string(),
                    container: container.to_string(),
                })
            })
            .collect();

        let declared: HashSet<_> = environment
            .iter()
            .filter(|e: &&EnvVar| e.value.is_some())
            .map(|e| e.name.clone())
            .collect();
        references.retain(|r| !declared.contains(r));
        references.dedup();

        Ok(Self {
            name: name.to_string(),
            build,
            image: raw.image,
            ports,
            environment,
            volumes,
            references,
        })
    }

    /// Bind-mounted local paths (relative to `dir`) paired with their
    /// container destination. Named volumes are skipped.
    pub fn sync_paths(&self, dir: &Path) -> Vec<(PathBuf, String)> {
        self.volumes
            .iter()
            .filter(|v| v.host.starts_with('.') || v.host.starts_with('/'))
            .map(|v| (dir.join(&v.host), v.container.clone()))
            .collect()
    }
}

/// Parse `"5000:3000"`, `"127.0.0.1:5000:3000"`, `"3000"` or `"5000:3000/udp"`.
fn parse_port(spec: &str) -> Result<PortMapping> {
    let spec = spec.split('/').next().unwrap_or(spec);
    let parts: Vec<&str> = spec.rsplitn(3, ':').collect();
    let parse = |s: &str| {
        s.trim()
            .parse::<u16>()
            .with_context(|| format!("invalid port `{}`", spec))
    };
    match parts.as_slice() {
        [container] => Ok(PortMapping {
            host: None,
            container: parse(container)?,
        }),
        [container, host, ..] => Ok(PortMapping {
            host: Some(parse(host)?),
            container: parse(container)?,
        }),
        [] => anyhow::bail!("empty port mapping"),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => serde_yaml::to_string(other).ok().map(|s| s.trim().to_string()),
    }
}

fn collect_references(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for caps in VAR_REF.captures_iter(s) {
                // `${VAR-default}` and `${VAR:-default}` are satisfied without VAR;
                // `${VAR?err}` and `${VAR:?err}` demand it.
                if caps
                    .get(2)
                    .is_some_and(|m| m.as_str().trim_start_matches(':').starts_with('-'))
                {
                    continue;
                }
                let Some(name) = caps.get(1).or_else(|| caps.get(3)) else {
                    continue;
                };
                if !out.iter().any(|n| n == name.as_str()) {
                    out.push(name.as_str().to_string());
                }
            }
        }
        Value::Sequence(items) => items.iter().for_each(|v| collect_references(v, out)),
        Value::Mapping(map) => map.values().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}

// ── Environment sources ──────────────────────────────────────────────

/// Where required variables may be found: the process environment, the
/// project's `.env` file and (for cached starts) the app's saved environment.
#[derive(Debug, Clone)]
pub struct EnvLookup {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl EnvLookup {
    pub fn new(project_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn cache_file(&self, app: &str) -> PathBuf {
        self.state_dir.join("apps").join(format!("{}.env", app))
    }

    fn available(&self, cache: bool, app: &str) -> Result<HashSet<String>> {
        Ok(self.values(cache, app)?.into_iter().map(|(k, _)| k).collect())
    }

    /// Resolved (name, value) pairs; earlier sources win.
    fn values(&self, cache: bool, app: &str) -> Result<Vec<(String, String)>> {
        let mut values: Vec<(String, String)> = std::env::vars().collect();
        let mut push_file = |path: PathBuf| -> Result<()> {
            if !path.exists() {
                return Ok(());
            }
            for item in dotenvy::from_path_iter(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?
            {
                let (k, v) = item.with_context(|| format!("Failed to parse {}", path.display()))?;
                if !values.iter().any(|(existing, _)| *existing == k) {
                    values.push((k, v));
                }
            }
            Ok(())
        };
        push_file(self.project_dir.join(".env"))?;
        if cache {
            push_file(self.cache_file(app))?;
        }
        Ok(values)
    }
}

// ── Init: default manifest generation ────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectKind {
    Node,
    Python,
    Ruby,
    Go,
    Rust,
    Generic,
}

impl ProjectKind {
    fn detect(dir: &Path) -> Self {
        let has = |f: &str| dir.join(f).exists();
        if has("package.json") {
            Self::Node
        } else if has("requirements.txt") || has("setup.py") || has("pyproject.toml") {
            Self::Python
        } else if has("Gemfile") {
            Self::Ruby
        } else if has("go.mod") {
            Self::Go
        } else if has("Cargo.toml") {
            Self::Rust
        } else {
            Self::Generic
        }
    }

    fn port(self) -> u16 {
        match self {
            Self::Node | Self::Ruby => 3000,
            Self::Python => 5000,
            Self::Go | Self::Rust | Self::Generic => 8080,
        }
    }

    fn dockerfile(self) -> &'static str {
        match self {
            Self::Node => {
                "FROM node:22-slim\nWORKDIR /app\nCOPY package*.json ./\nRUN npm install\nCOPY . .\nCMD [\"npm\", \"start\"]\n"
            }
            Self::Python => {
                "FROM python:3.12-slim\nWORKDIR /app\nCOPY requirements.txt* ./\nRUN if [ -f requirements.txt ]; then pip install -r requirements.txt; fi\nCOPY . .\nCMD [\"python\", \"app.py\"]\n"
            }
            Self::Ruby => {
                "FROM ruby:3.3-slim\nWORKDIR /app\nCOPY Gemfile* ./\nRUN bundle install\nCOPY . .\nCMD [\"bundle\", \"exec\", \"rackup\", \"-o\", \"0.0.0.0\", \"-p\", \"3000\"]\n"
            }
            Self::Go => {
                "FROM golang:1.22\nWORKDIR /app\nCOPY . .\nRUN go build -o /bin/app .\nCMD [\"/bin/app\"]\n"
            }
            Self::Rust => {
                "FROM rust:1-slim\nWORKDIR /app\nCOPY . .\nRUN cargo build --release\nCMD [\"cargo\", \"run\", \"--release\"]\n"
            }
            Self::Generic => "FROM alpine:3\nWORKDIR /app\nCOPY . .\nCMD [\"sh\"]\n",
        }
    }
}

const DOCKERIGNORE: &str = ".git\n.env\nnode_modules\ntarget\n";

/// Generate whatever default artifacts are missing from `dir`: a
/// `Dockerfile`, the manifest `file` and a `.dockerignore`. Returns the names
/// of generated files; empty when everything already exists.
pub fn init(dir: &Path, file: &str) -> Result<Vec<String>> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    let kind = ProjectKind::detect(dir);
    let mut generated = Vec::new();

    let mut write_missing = |name: &str, content: String| -> Result<()> {
        let path = dir.join(name);
        if path.exists() {
            return Ok(());
        }
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        generated.push(name.to_string());
        Ok(())
    };

    write_missing("Dockerfile", kind.dockerfile().to_string())?;
    write_missing(
        file,
        format!(
            "web:\n  build: .\n  environment:\n    - PORT={port}\n  ports:\n    - \"{port}:{port}\"\n  volumes:\n    - .:/app\n",
            port = kind.port()
        ),
    )?;
    write_missing(".dockerignore", DOCKERIGNORE.to_string())?;

    Ok(generated)
}
