use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, SharedState};
use super::db::{BuildDb, DbHandle};
use super::executor::BuildBackend;
use super::stream::{RelayConfig, RelayPolicy};

/// Configuration for the build server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    /// Keep log streams open after the build finishes.
    pub literal_relay: bool,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            db_path: PathBuf::from(".dockyard/builds.db"),
            poll_interval: Duration::from_secs(1),
            literal_relay: false,
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            interval: self.poll_interval,
            policy: if self.literal_relay {
                RelayPolicy::UntilDisconnect
            } else {
                RelayPolicy::CloseOnTerminal
            },
        }
    }
}

/// Build the full application router with request tracing.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the build server and serve until Ctrl+C.
pub async fn start_server(config: ServerConfig, backend: Arc<dyn BuildBackend>) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = BuildDb::new(&config.db_path).context("Failed to initialize build database")?;
    let state = AppState::new(DbHandle::new(db), backend, config.relay());

    let mut app = build_router(state.clone());
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, db = %config.db_path.display(), "dockyard build server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let unfinished = state.runner.active_builds().await;
    if !unfinished.is_empty() {
        tracing::warn!(builds = ?unfinished, "shutting down with builds still running");
    }
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builds::executor::tests::ScriptedBackend;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> (Router, SharedState) {
        let db = DbHandle::new(BuildDb::new_in_memory().unwrap());
        let state = AppState::new(
            db,
            Arc::new(ScriptedBackend::default()),
            ServerConfig::default().relay(),
        );
        (build_router(state.clone()), state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let (app, _) = test_router();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_create_build_via_full_router() {
        let (app, state) = test_router();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/apps/demo/builds")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("repo=https%3A%2F%2Fexample%2Frepo.git%23main"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = String::from_utf8(
            response.into_body().collect().await.unwrap().to_bytes().to_vec(),
        )
        .unwrap();
        state.runner.wait("demo", &id).await;
        assert!(state.runner.active_builds().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (app, _) = test_router();
        let response = app
            .oneshot(Request::builder().uri("/apps").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3141);
        assert_eq!(config.db_path, PathBuf::from(".dockyard/builds.db"));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(!config.dev_mode);
        assert_eq!(config.relay().policy, RelayPolicy::CloseOnTerminal);
    }

    #[test]
    fn test_literal_relay_flag_selects_policy() {
        let config = ServerConfig {
            literal_relay: true,
            poll_interval: Duration::from_millis(250),
            ..Default::default()
        };
        let relay = config.relay();
        assert_eq!(relay.policy, RelayPolicy::UntilDisconnect);
        assert_eq!(relay.interval, Duration::from_millis(250));
    }
}
