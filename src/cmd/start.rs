//! Local development run: `dockyard start`.

use std::sync::Arc;

use anyhow::Result;
use console::style;

use dockyard::config::Settings;
use dockyard::dev::orchestrator::{Orchestrator, Progress, StartOptions};
use dockyard::docker::DockerCli;

pub async fn cmd_start(opts: StartOptions) -> Result<()> {
    let settings = Settings::load()?;
    let orchestrator =
        Orchestrator::new(Arc::new(DockerCli::new()), settings).with_progress(print_progress);

    let report = orchestrator.start(&opts).await?;

    println!(
        "{} {} finished ({} service{})",
        style("✓").green().bold(),
        report.app,
        report.services.len(),
        if report.services.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

fn print_progress(progress: Progress) {
    match progress {
        Progress::Generated(files) => println!("Generated: {}", files.join(", ")),
        Progress::Building { service } => {
            println!("{} building {}", style("::").cyan().bold(), service)
        }
        Progress::Running { services } => {
            println!("{} running {}", style("::").cyan().bold(), services.join(", "))
        }
        Progress::Syncing { targets } => println!(
            "{} syncing {} path{}",
            style("::").cyan().bold(),
            targets,
            if targets == 1 { "" } else { "s" }
        ),
        Progress::Synced { service, path } => println!(
            "  {} {} {}",
            style("synced").dim(),
            service,
            style(path.display()).dim()
        ),
        Progress::Removed { service, path } => println!(
            "  {} {} {}",
            style("removed").dim(),
            service,
            style(path.display()).dim()
        ),
    }
}
