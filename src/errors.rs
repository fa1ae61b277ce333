//! Typed error hierarchy for dockyard.
//!
//! Two top-level enums cover the two subsystems:
//! - `BuildError`: build store, executor, controller and log relay failures
//! - `DevError`: dev orchestrator pipeline failures

use thiserror::Error;

/// Errors from the build subsystem (store, executor, controller, relay).
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0}")]
    Validation(String),

    #[error("no such build: {id} (app {app})")]
    NotFound { app: String, id: String },

    #[error("build step failed: {0}")]
    Execution(String),

    #[error("stream error: {0}")]
    Transport(String),

    #[error("store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

impl BuildError {
    pub fn not_found(app: &str, id: &str) -> Self {
        Self::NotFound {
            app: app.to_string(),
            id: id.to_string(),
        }
    }
}

/// Errors from a single dev orchestrator invocation.
#[derive(Debug, Error)]
pub enum DevError {
    #[error("ports in use: {}", .ports.join(", "))]
    PortsInUse { ports: Vec<String> },

    #[error("env expected: {}", .vars.join(", "))]
    MissingEnvironment { vars: Vec<String> },

    #[error("manifest error: {0:#}")]
    Config(#[source] anyhow::Error),

    #[error("{}", summarize("build", .errors))]
    Build { errors: Vec<String> },

    #[error("{}", summarize("run", .errors))]
    Run { errors: Vec<String> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// First error is the headline; the rest are counted and listed after it.
fn summarize(stage: &str, errors: &[String]) -> String {
    match errors {
        [] => format!("{} failed", stage),
        [only] => only.clone(),
        [first, rest @ ..] => format!(
            "{} (+{} more {} error{}: {})",
            first,
            rest.len(),
            stage,
            if rest.len() == 1 { "" } else { "s" },
            rest.join("; ")
        ),
    }
}
