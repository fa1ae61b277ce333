//! End-to-end tests for the dockyard CLI.
//!
//! None of these reach the container engine: every `start` scenario fails in
//! validation before the build stage.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::net::TcpListener;
use tempfile::TempDir;

/// Helper to create a dockyard Command isolated from the user's settings.
fn dockyard(state: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("dockyard");
    cmd.env("DOCKYARD_STATE_DIR", state.path())
        .env("HOME", state.path())
        .env("DOCKER_CMD", "/nonexistent/docker")
        .env_remove("RUST_LOG");
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let state = TempDir::new().unwrap();
        dockyard(&state)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("start"))
            .stdout(predicate::str::contains("init"))
            .stdout(predicate::str::contains("serve"));
    }

    #[test]
    fn test_version() {
        let state = TempDir::new().unwrap();
        dockyard(&state).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        let state = TempDir::new().unwrap();
        dockyard(&state).arg("deploy").assert().failure();
    }
}

mod init {
    use super::*;

    #[test]
    fn test_init_generates_then_reports_nothing() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("requirements.txt"), "flask\n").unwrap();

        dockyard(&state)
            .arg("init")
            .arg(project.path())
            .assert()
            .success()
            .stdout(predicate::str::contains(
                "Generated: Dockerfile, docker-compose.yml, .dockerignore",
            ));
        assert!(
            fs::read_to_string(project.path().join("Dockerfile"))
                .unwrap()
                .starts_with("FROM python")
        );

        dockyard(&state)
            .arg("init")
            .arg(project.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("Generated").not());
    }

    #[test]
    fn test_init_custom_manifest_name() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();

        dockyard(&state)
            .current_dir(project.path())
            .args(["init", "-f", "compose.dev.yml"])
            .assert()
            .success()
            .stdout(predicate::str::contains("compose.dev.yml"));
        assert!(project.path().join("compose.dev.yml").exists());
    }

    #[test]
    fn test_init_missing_directory_fails() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();

        dockyard(&state)
            .arg("init")
            .arg(project.path().join("nope"))
            .assert()
            .failure()
            .stderr(predicate::str::starts_with("ERROR:"));
    }
}

mod start {
    use super::*;

    #[test]
    fn test_start_reports_ports_in_use() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let busy = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = busy.local_addr().unwrap().port();
        fs::write(
            project.path().join("docker-compose.yml"),
            format!("web:\n  build: .\n  ports:\n    - \"{port}:3000\"\n"),
        )
        .unwrap();

        dockyard(&state)
            .arg("start")
            .arg(project.path())
            .assert()
            .code(1)
            .stderr(predicate::str::contains(format!("ERROR: ports in use: {}", port)));
    }

    #[test]
    fn test_start_reports_missing_environment() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        fs::write(
            project.path().join("docker-compose.yml"),
            "web:\n  build: .\n  environment:\n    - DOCKYARD_CLI_TEST_TOKEN\n  image: \"${DOCKYARD_CLI_TEST_REGISTRY}/web\"\n",
        )
        .unwrap();

        dockyard(&state)
            .arg("start")
            .arg(project.path())
            .env_remove("DOCKYARD_CLI_TEST_TOKEN")
            .env_remove("DOCKYARD_CLI_TEST_REGISTRY")
            .assert()
            .code(1)
            .stderr(predicate::str::contains(
                "ERROR: env expected: DOCKYARD_CLI_TEST_TOKEN, DOCKYARD_CLI_TEST_REGISTRY",
            ));
    }

    #[test]
    fn test_start_with_unparseable_manifest_fails_once() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("docker-compose.yml"), "web: [oops").unwrap();

        let output = dockyard(&state)
            .arg("start")
            .arg(project.path())
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        let error_lines: Vec<_> = stderr.lines().filter(|l| l.starts_with("ERROR:")).collect();
        assert_eq!(error_lines.len(), 1);
        assert!(error_lines[0].contains("manifest error"));
    }

    #[test]
    fn test_start_rejects_bad_sync_value() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();

        dockyard(&state)
            .arg("start")
            .arg(project.path())
            .arg("--sync=maybe")
            .assert()
            .failure();
    }
}
