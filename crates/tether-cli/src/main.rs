mod announcer;
mod config;
mod list_cmd;
mod reconcile_cmd;
mod show_cmd;
mod sweep_cmd;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use config::TetherConfig;

#[derive(Parser)]
#[command(name = "tether", about = "Subagent run registry and completion pipeline")]
struct Cli {
    /// Registry file (overrides TETHER_REGISTRY_PATH env var)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a tether config file
    Init {
        /// Registry file location
        #[arg(long)]
        registry_path: Option<PathBuf>,
        /// Session index the reconciler checks child sessions against
        #[arg(long)]
        sessions_index: Option<PathBuf>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// List the runs spawned by a requester session
    List {
        /// Requester session key (e.g. agent:main:main)
        requester: String,
    },
    /// Show one run record
    Show {
        /// Run ID to show
        run_id: String,
    },
    /// Load, migrate and reconcile the registry against the session index
    Reconcile,
    /// Remove settled runs past their archive deadline
    Sweep,
}

/// Execute the `tether init` command: write config file.
fn cmd_init(
    registry_path: Option<PathBuf>,
    sessions_index: Option<PathBuf>,
    force: bool,
) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let registry_path = registry_path.unwrap_or_else(tether_core::RegistryConfig::default_path);
    let sessions_index = sessions_index.unwrap_or_else(config::default_sessions_index);

    let cfg = config::ConfigFile {
        registry: config::RegistrySection {
            path: Some(registry_path.clone()),
            archive_after_minutes: None,
        },
        sessions: config::SessionsSection {
            index_path: Some(sessions_index.clone()),
        },
        hooks: config::HooksSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  registry.path = {}", registry_path.display());
    println!("  sessions.index_path = {}", sessions_index.display());
    println!();
    println!("Add [hooks] subagent_ended = [\"cmd\", ...] to run a command per ended run.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            registry_path,
            sessions_index,
            force,
        } => {
            cmd_init(registry_path, sessions_index, force)?;
        }
        Commands::List { requester } => {
            let resolved = TetherConfig::resolve(cli.registry.as_deref())?;
            list_cmd::run_list(&resolved.registry.registry_path, &requester)?;
        }
        Commands::Show { run_id } => {
            let resolved = TetherConfig::resolve(cli.registry.as_deref())?;
            show_cmd::run_show(&resolved.registry.registry_path, &run_id)?;
        }
        Commands::Reconcile => {
            let resolved = TetherConfig::resolve(cli.registry.as_deref())?;
            reconcile_cmd::run_reconcile(&resolved).await?;
        }
        Commands::Sweep => {
            let resolved = TetherConfig::resolve(cli.registry.as_deref())?;
            sweep_cmd::run_sweep(&resolved.registry.registry_path)?;
        }
    }

    Ok(())
}
