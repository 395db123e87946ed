//! SiteScope Server
//!
//! Command-line host for the audit orchestrator: serves the HTTP/SSE API,
//! runs one-off audits from the terminal, and reports agent health.

mod api;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sitescope_core::config::DEFAULT_CONFIG_PATH;
use sitescope_core::state::db::DEFAULT_DB_PATH;
use sitescope_core::{AuditRequest, AuditStatus, Orchestrator, OrchestratorConfig, RunContext};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::{prelude::*, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info,sitescope_core=debug";

#[derive(Parser)]
#[command(name = "sitescope")]
#[command(about = "SiteScope - Multi-agent site audit orchestrator", long_about = None)]
struct Args {
    /// Path to the JSON config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start the HTTP API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },
    /// Run one audit and print its progress and results
    Run {
        /// URL the crawl starts from
        seed_url: String,
        /// Upper bound on fetched pages
        #[arg(long, default_value_t = 20)]
        max_pages: usize,
        /// Audit identifier (generated when omitted)
        #[arg(long)]
        audit_id: Option<String>,
    },
    /// Print registered agents and their health
    Agents,
}

/// Shared state handed to every API handler
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .try_init()?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn generated_audit_id() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("audit-{}", millis)
}

// === Commands ===

async fn serve(orchestrator: Arc<Orchestrator>, port: u16) -> anyhow::Result<()> {
    let app = api::router(AppState {
        orchestrator: Arc::clone(&orchestrator),
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    println!("SiteScope server running at http://{}", addr);
    println!("   Audits:  /api/v1/audits (POST, GET), /:id, /:id/events, /:id/cancel, /:id/results");
    println!("   Agents:  /api/v1/agents");
    println!("   Schemas: /api/v1/schema/request, /api/v1/schema/progress");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown().await?;
    Ok(())
}

async fn run_audit(
    orchestrator: Arc<Orchestrator>,
    seed_url: String,
    max_pages: usize,
    audit_id: Option<String>,
) -> anyhow::Result<()> {
    let audit_id = audit_id.unwrap_or_else(generated_audit_id);
    let ctx = RunContext::new();

    let interrupt = ctx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        interrupt.cancel();
    });

    let mut progress = orchestrator
        .start_audit(&ctx, AuditRequest::new(&audit_id, seed_url, max_pages))
        .await?;

    while let Some(update) = progress.recv().await {
        match (&update.agent_name, &update.agent_status) {
            (Some(agent), Some(status)) => {
                println!("[{:>3}%] {} {} {}", update.progress, update.step, agent, status)
            }
            _ => println!("[{:>3}%] {}", update.progress, update.step),
        }
        if let Some(error) = &update.error {
            println!("       {}", error);
        }
    }

    let execution = orchestrator.get_audit_status(&audit_id).await?;
    println!("Audit {} finished: {}", audit_id, execution.status);
    if execution.status == AuditStatus::Completed {
        let results = orchestrator.get_results(&audit_id).await?;
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if let Some(error) = &execution.error {
        eprintln!("Last error: {}", error);
    }

    orchestrator.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let args = Args::parse();
    let mut config = OrchestratorConfig::load(&args.config)?.merge_env();

    let command = args.command.unwrap_or(CliCommand::Serve { port: 8080 });
    if matches!(command, CliCommand::Serve { .. }) && config.database_path.is_none() {
        config.database_path = Some(PathBuf::from(DEFAULT_DB_PATH));
    }

    let orchestrator = Arc::new(Orchestrator::from_config(config)?);
    orchestrator.restore_from_store().await?;

    match command {
        CliCommand::Serve { port } => serve(orchestrator, port).await,
        CliCommand::Run {
            seed_url,
            max_pages,
            audit_id,
        } => run_audit(orchestrator, seed_url, max_pages, audit_id).await,
        CliCommand::Agents => {
            let stats = orchestrator.registry_stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}
