//! Build server: `dockyard serve`.

use std::sync::Arc;

use anyhow::Result;

use dockyard::builds::server::{ServerConfig, start_server};
use dockyard::docker::DockerCli;

pub async fn cmd_serve(config: ServerConfig) -> Result<()> {
    start_server(config, Arc::new(DockerCli::new())).await
}
