use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use deskbox::runtime::DockerRuntime;
use deskbox::{Orchestrator, OrchestratorConfig, ProvisionOptions};

#[derive(Parser)]
#[command(name = "deskbox")]
#[command(
    author,
    version,
    about = "Disposable desktop sandboxes with remote-framebuffer control"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to deskbox.toml (defaults to the current directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision one sandbox, stream its navigation events, and wait
    /// for the generated task to be completed over VNC
    Run {
        /// Seconds to wait for task completion (0 = forever)
        #[arg(long, default_value = "300")]
        task_timeout: u64,

        /// Seed for the sandbox's random choices
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Remove containers left behind by earlier runs
    Clean,

    /// Populate a template file into a scratch directory and print the
    /// resulting tree
    Template {
        /// Template file to validate
        file: PathBuf,

        /// Seed for the timestamp randomization
        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("deskbox=debug")
    } else {
        EnvFilter::new("deskbox=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { task_timeout, seed } => run(config, task_timeout, seed).await?,
        Commands::Clean => clean(config).await?,
        Commands::Template { file, seed } => template(&file, seed)?,
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::load_file(path),
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            OrchestratorConfig::load(&cwd)
        }
    }
}

async fn run(config: OrchestratorConfig, task_timeout: u64, seed: Option<u64>) -> Result<()> {
    let runtime = Arc::new(DockerRuntime::connect().await?);
    let orchestrator = Orchestrator::new(config, runtime)?;

    let reaped = orchestrator.cleanup_orphaned().await?;
    if reaped > 0 {
        println!("Reaped {reaped} orphaned containers");
    }

    let mut sandbox = orchestrator
        .provision(ProvisionOptions {
            seed,
            on_navigate: Some(Box::new(|path, view| {
                println!("{} {} ({})", "navigate".cyan(), path, view);
            })),
            ..Default::default()
        })
        .await?;

    println!(
        "{} sandbox {} at {}",
        "up".green().bold(),
        sandbox.id(),
        sandbox.address()
    );
    println!("home tree:\n{}", sandbox.directory_tree().dimmed());
    if let Some(instruction) = sandbox.instruction() {
        println!("{} {}", "task".yellow().bold(), instruction);
    }

    let timeout = (task_timeout > 0).then(|| Duration::from_secs(task_timeout));
    let done = sandbox.wait_for_task(Duration::from_secs(1), timeout).await;
    if done {
        println!("{}", "task completed".green().bold());
    } else {
        println!("{}", "timed out waiting for task".red());
    }

    sandbox.teardown().await;
    Ok(())
}

async fn clean(config: OrchestratorConfig) -> Result<()> {
    let runtime = Arc::new(DockerRuntime::connect().await?);
    let orchestrator = Orchestrator::new(config, runtime)?;

    let reaped = orchestrator.cleanup_orphaned().await?;
    if reaped == 0 {
        println!("No orphaned containers found");
    } else {
        println!("Removed {reaped} orphaned containers");
    }
    Ok(())
}

fn template(file: &std::path::Path, seed: u64) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read template file: {}", file.display()))?;

    let tree = deskbox::sandbox::preview_template(&text, seed)
        .with_context(|| format!("Template {} is invalid", file.display()))?;

    println!("{tree}");
    Ok(())
}
