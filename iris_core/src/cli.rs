//! # Iris CLI
//!
//! Subcommand surface of the `iris` binary:
//!
//! - `iris server start` — run the MCP server over stdio, with graceful
//!   shutdown on SIGINT/SIGTERM.
//! - `iris dashboard start` — run the HTTP status dashboard.
//! - `iris team add|list|remove` — administer the config file through the
//!   comment-preserving editor.
//!
//! Exit code 0 on success, non-zero on user error.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::signal;

use crate::{
    config::{self, ConfigHandle, IrisConfig, TeamConfig},
    config_edit, dashboard,
    mcp_service::IrisMcpService,
    notification::NotificationStore,
    orchestrator::Orchestrator,
    pool::ProcessPool,
    session::SessionStore,
    utils::logging::init_logging,
};

/// Iris: orchestrator for a fleet of assistant subprocesses.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    debug: bool,

    /// Override $IRIS_HOME (default ~/.iris).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator server.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// Run the HTTP status dashboard.
    Dashboard {
        #[command(subcommand)]
        action: DashboardAction,
    },
    /// Administer teams in the config file.
    Team {
        #[command(subcommand)]
        action: TeamAction,
    },
}

#[derive(Subcommand, Debug)]
enum ServerAction {
    /// Start the MCP server.
    Start {
        /// Transport to serve on.
        #[arg(long, default_value = "stdio")]
        transport: String,
    },
}

#[derive(Subcommand, Debug)]
enum DashboardAction {
    /// Start the dashboard HTTP server.
    Start {
        /// Port to bind; defaults to the dashboard config, else 9120.
        #[arg(long)]
        port: Option<u16>,
        /// Host to bind; defaults to the dashboard config, else 127.0.0.1.
        #[arg(long)]
        host: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum TeamAction {
    /// Add a team to the config file.
    Add {
        /// Team name ([A-Za-z0-9_-]+).
        name: String,
        /// Working directory for the team's assistant.
        path: PathBuf,
        /// Human-readable description.
        #[arg(long, default_value = "")]
        description: String,
        /// Per-team idle timeout in milliseconds.
        #[arg(long)]
        idle_timeout: Option<u64>,
        /// Skip the assistant's permission prompts.
        #[arg(long)]
        skip_permissions: bool,
        /// Display color (#RRGGBB).
        #[arg(long)]
        color: Option<String>,
    },
    /// List configured teams.
    List,
    /// Remove a team from the config file.
    Remove { name: String },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.debug { "debug" } else { "info" };
    let home = cli.home.clone().unwrap_or_else(config::iris_home);

    match cli.command {
        Commands::Server {
            action: ServerAction::Start { transport },
        } => {
            // Stdout belongs to the MCP wire protocol.
            init_logging(log_level, true)?;
            if transport != "stdio" {
                bail!(
                    "unsupported transport '{}'; the server speaks stdio (the dashboard provides the HTTP surface)",
                    transport
                );
            }
            run_server(&home).await
        }
        Commands::Dashboard {
            action: DashboardAction::Start { port, host },
        } => {
            init_logging(log_level, false)?;
            run_dashboard(&home, port, host).await
        }
        Commands::Team { action } => {
            init_logging(log_level, false)?;
            run_team_command(&home, action)
        }
    }
}

async fn build_orchestrator(home: &std::path::Path) -> Result<Arc<Orchestrator>> {
    let config = IrisConfig::load(home)?;
    let config = Arc::new(ConfigHandle::new(config));
    let data_dir = config::data_dir(home);
    let sessions = Arc::new(SessionStore::open(&data_dir)?);
    let notifications = Arc::new(NotificationStore::open(&data_dir)?);
    let pool = Arc::new(ProcessPool::new(Arc::clone(&config)));
    Ok(Arc::new(Orchestrator::new(
        config,
        pool,
        sessions,
        notifications,
    )))
}

async fn run_server(home: &std::path::Path) -> Result<()> {
    use rmcp::ServiceExt;

    tracing::info!("Starting iris server (home: {})", home.display());
    let orchestrator = build_orchestrator(home).await?;
    orchestrator.start_background_tasks();

    // Dashboard rides along when enabled in config.
    if let Some(dash) = orchestrator.config().snapshot().dashboard.clone()
        && dash.enabled
    {
        let addr: SocketAddr = format!("{}:{}", dash.host, dash.port)
            .parse()
            .with_context(|| format!("invalid dashboard address {}:{}", dash.host, dash.port))?;
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if let Err(e) = dashboard::start_dashboard(orchestrator, addr).await {
                tracing::error!("Dashboard failed: {}", e);
            }
        });
    }

    let service = IrisMcpService::new(Arc::clone(&orchestrator))
        .serve(rmcp::transport::stdio())
        .await?;

    // SIGINT/SIGTERM drain the fleet under the global deadline.
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("Shutdown signal received; terminating fleet");
            orchestrator.shutdown().await;
            std::process::exit(0);
        });
    }

    service.waiting().await?;
    orchestrator.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = async {
            #[cfg(unix)]
            {
                let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                term.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

async fn run_dashboard(
    home: &std::path::Path,
    port: Option<u16>,
    host: Option<String>,
) -> Result<()> {
    let orchestrator = build_orchestrator(home).await?;
    orchestrator.start_background_tasks();

    let dash = orchestrator.config().snapshot().dashboard.clone();
    let host = host
        .or_else(|| dash.as_ref().map(|d| d.host.clone()))
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = port.or_else(|| dash.as_ref().map(|d| d.port)).unwrap_or(9120);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid dashboard address {}:{}", host, port))?;

    dashboard::start_dashboard(orchestrator, addr).await
}

fn run_team_command(home: &std::path::Path, action: TeamAction) -> Result<()> {
    let path = config::config_path(home).with_context(|| {
        format!(
            "no config.yaml or config.yml under {} (create one first)",
            home.display()
        )
    })?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read {}", path.display()))?;

    match action {
        TeamAction::Add {
            name,
            path: team_path,
            description,
            idle_timeout,
            skip_permissions,
            color,
        } => {
            let team = TeamConfig {
                path: team_path,
                description,
                idle_timeout,
                session_init_timeout: None,
                skip_permissions: skip_permissions.then_some(true),
                color,
                command: None,
            };
            let edited = config_edit::add_team(&text, &name, &team)?;
            std::fs::write(&path, edited)
                .with_context(|| format!("cannot write {}", path.display()))?;
            println!("Added team '{}'", name);
            Ok(())
        }
        TeamAction::List => {
            let config = IrisConfig::from_yaml(&text)?;
            if config.teams.is_empty() {
                println!("No teams configured");
            }
            for (name, team) in &config.teams {
                println!("{}\t{}\t{}", name, team.path.display(), team.description);
            }
            Ok(())
        }
        TeamAction::Remove { name } => {
            let edited = config_edit::remove_team(&text, &name)?;
            std::fs::write(&path, edited)
                .with_context(|| format!("cannot write {}", path.display()))?;
            println!("Removed team '{}'", name);
            Ok(())
        }
    }
}
