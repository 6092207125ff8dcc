//! Remediator CLI
//!
//! Runs the Alertmanager webhook server and offers offline helpers for
//! classifying label sets and validating runbook definitions.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use remediator::alerts::{classify, Labels};
use remediator::coordinator::IncidentCoordinator;
use remediator::ledger::{IncidentLedger, MemoryLedger};
use remediator::oracle;
use remediator::runbook::{parse_runbook, RunbookStore};
use remediator::server::{run_server, AppState};
use remediator::tools::{KubeCluster, ToolRegistry};
use remediator::workflow::{WorkflowExecutor, WorkflowSettings};
use remediator_config::RemediatorConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Alert-driven runbook remediation controller
#[derive(Parser)]
#[command(name = "remediator")]
#[command(about = "Classifies Alertmanager alerts and drives gated remediation runbooks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Alertmanager webhook server
    Serve {
        /// Path to a JSON configuration file
        #[arg(long, env = "REMEDIATOR_CONFIG")]
        config: Option<PathBuf>,

        /// Listen address (overrides the configuration)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Print the runbook an alert with these labels would run
    Classify {
        /// Alert label as key=value (repeatable)
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Parse every runbook definition and report problems
    CheckRunbooks {
        /// Runbook directory
        #[arg(long, env = "RUNBOOKS_DIR", default_value = "runbooks")]
        dir: PathBuf,
    },
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,remediator=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Serve { config, addr } => serve(config.as_deref(), addr).await,
        Commands::Classify { labels } => {
            let labels: Labels = labels.into_iter().collect();
            println!("{}", classify(&labels));
            Ok(())
        }
        Commands::CheckRunbooks { dir } => check_runbooks(&dir),
    }
}

async fn serve(config_path: Option<&Path>, addr: Option<String>) -> Result<()> {
    let config = RemediatorConfig::load(config_path).context("Failed to load configuration")?;
    let addr = addr.unwrap_or_else(|| config.server.addr.clone());
    info!(
        cluster = %config.cluster_name,
        mode = %config.agent_mode,
        runbooks_dir = %config.runbooks_dir.display(),
        "Starting remediator"
    );

    let runbooks = RunbookStore::load_dir(&config.runbooks_dir)
        .with_context(|| format!("Failed to load runbooks from {}", config.runbooks_dir.display()))?;

    let cluster = KubeCluster::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let tools = ToolRegistry::from_config(Arc::new(cluster), &config.tools)
        .context("Invalid tool configuration")?;

    let oracle = oracle::from_config(&config.oracle).context("Failed to build decision oracle")?;
    info!(oracle = oracle.name(), "Decision oracle ready");

    let ledger = open_ledger(config.ledger.database_url.as_deref()).await?;

    let executor = WorkflowExecutor::new(
        Arc::new(runbooks),
        oracle,
        Arc::new(tools),
        WorkflowSettings::from_config(&config),
    );
    let coordinator = IncidentCoordinator::new(
        ledger,
        Arc::new(executor),
        config.cluster_name.clone(),
        config.tools.clone(),
    );

    let state = Arc::new(AppState::new(coordinator));
    run_server(
        state,
        &addr,
        Duration::from_secs(config.server.request_timeout_secs),
    )
    .await
}

#[cfg(feature = "postgres")]
async fn open_ledger(database_url: Option<&str>) -> Result<Arc<dyn IncidentLedger>> {
    if let Some(url) = database_url {
        let ledger = remediator::ledger::PgLedger::connect(url)
            .await
            .context("Failed to open incident database")?;
        return Ok(Arc::new(ledger));
    }
    info!("No database configured, using in-memory incident ledger");
    Ok(Arc::new(MemoryLedger::new()))
}

#[cfg(not(feature = "postgres"))]
async fn open_ledger(database_url: Option<&str>) -> Result<Arc<dyn IncidentLedger>> {
    if database_url.is_some() {
        tracing::warn!("Database URL set but built without the postgres feature, using in-memory ledger");
    } else {
        info!("No database configured, using in-memory incident ledger");
    }
    Ok(Arc::new(MemoryLedger::new()))
}

fn check_runbooks(dir: &Path) -> Result<()> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
        .collect();
    paths.sort();

    let mut definitions = Vec::new();
    let mut failures = 0usize;
    for path in &paths {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let parsed = std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|content| parse_runbook(path, stem, &content).map_err(anyhow::Error::from));
        match parsed {
            Ok(rb) => {
                println!(
                    "{} {} ({:?}, {} steps, {} actions)",
                    "✓".green(),
                    rb.id.bold(),
                    rb.mode,
                    rb.steps.len(),
                    rb.actions.len()
                );
                definitions.push(rb);
            }
            Err(e) => {
                failures += 1;
                println!("{} {}: {e:#}", "✗".red(), path.display());
            }
        }
    }

    let store = RunbookStore::from_definitions(definitions);
    for id in store.missing_known() {
        println!("{} no definition for {}", "!".yellow(), id.as_str().bold());
    }

    if failures > 0 {
        bail!("{failures} of {} runbook(s) failed to parse", paths.len());
    }
    println!("{} {} runbook(s) OK", "✓".green(), store.len());
    Ok(())
}
