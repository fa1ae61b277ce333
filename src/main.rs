use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dockyard::builds::server::ServerConfig;
use dockyard::dev::manifest::DEFAULT_MANIFEST;
use dockyard::dev::orchestrator::StartOptions;
use dockyard::errors::DevError;

mod cmd;

#[derive(Parser)]
#[command(name = "dockyard")]
#[command(version, about = "Build, run and stream container apps")]
pub struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build and run the app described by a docker-compose manifest
    Start {
        /// Project directory
        dir: Option<PathBuf>,

        /// Manifest file, relative to the project directory
        #[arg(short = 'f', long, default_value = DEFAULT_MANIFEST)]
        file: String,

        /// Pull fresh images, build without cache and ignore the cached app environment
        #[arg(long)]
        no_cache: bool,

        /// Sync local changes into running containers
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        sync: bool,

        /// App name (defaults to the directory name)
        #[arg(long)]
        app: Option<String>,
    },
    /// Generate a Dockerfile, manifest and .dockerignore where missing
    Init {
        /// Project directory
        dir: Option<PathBuf>,

        /// Manifest file, relative to the project directory
        #[arg(short = 'f', long, default_value = DEFAULT_MANIFEST)]
        file: String,
    },
    /// Run the build server
    Serve {
        #[arg(short, long, default_value = "3141")]
        port: u16,

        #[arg(long, default_value = ".dockyard/builds.db")]
        db_path: PathBuf,

        /// How often log streams poll for new output
        #[arg(long, default_value = "1000")]
        poll_interval_ms: u64,

        /// Keep log streams open after builds finish
        #[arg(long)]
        literal_relay: bool,

        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose {
        "dockyard=debug,tower_http=debug"
    } else {
        "dockyard=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// One-line rendering for the CLI; typed orchestrator errors already carry
/// their full message.
fn render_error(err: &anyhow::Error) -> String {
    match err.downcast_ref::<DevError>() {
        Some(DevError::Other(inner)) => format!("{:#}", inner),
        Some(dev) => dev.to_string(),
        None => format!("{:#}", err),
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Start {
            dir,
            file,
            no_cache,
            sync,
            app,
        } => {
            cmd::cmd_start(StartOptions {
                dir: dir.unwrap_or_else(|| PathBuf::from(".")),
                file,
                app,
                cache: !no_cache,
                sync,
            })
            .await
        }
        Commands::Init { dir, file } => {
            cmd::cmd_init(&dir.unwrap_or_else(|| PathBuf::from(".")), &file)
        }
        Commands::Serve {
            port,
            db_path,
            poll_interval_ms,
            literal_relay,
            dev,
        } => {
            cmd::cmd_serve(ServerConfig {
                port,
                db_path,
                poll_interval: Duration::from_millis(poll_interval_ms),
                literal_relay,
                dev_mode: dev,
            })
            .await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{} {}",
                console::style("ERROR:").red().bold().for_stderr(),
                render_error(&e)
            );
            ExitCode::FAILURE
        }
    }
}
