mod config;
mod demo;

use clap::{Parser, Subcommand};
use config::MaestroConfig;
use maestro_channels::{LogNotifier, NotifierManager, WebhookNotifier};
use maestro_core::{RiskCeilingReviewer, RiskLevel};
use maestro_orchestrator::{ExecutionPreferences, WorkflowExecutor};
use maestro_security::AuditLog;
use maestro_session::FileStateStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro: hierarchical multi-agent orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompose a request and run it with the demo specialists
    Run {
        /// Natural-language request
        request: String,
        /// Quality threshold for this run (overrides config)
        #[arg(long)]
        threshold: Option<f64>,
        /// Score reported by the demo specialists
        #[arg(long, default_value_t = 0.9)]
        demo_score: f64,
        /// Print the execution id and exit without waiting
        #[arg(long)]
        detach: bool,
        /// Accept below-threshold output up to this risk level
        /// (low, medium, high, critical)
        #[arg(long)]
        auto_approve: Option<RiskLevel>,
    },
    /// Show the stored status of an execution
    Status {
        /// Execution id printed by `run`
        id: Uuid,
        /// Include the plan and execution record
        #[arg(long)]
        verbose: bool,
    },
    /// Print a health snapshot of a freshly started hierarchy
    Health,
}

fn build_notifier(config: &MaestroConfig) -> anyhow::Result<NotifierManager> {
    let mut notifier = NotifierManager::new();
    if config.notifications.log {
        notifier.add_notifier(Box::new(LogNotifier));
    }
    for hook in &config.notifications.webhooks {
        notifier.add_notifier(Box::new(WebhookNotifier::new(hook.clone())?));
        info!(name = %hook.name, "Webhook notifier registered");
    }
    Ok(notifier)
}

async fn build_executor(
    config: &MaestroConfig,
    demo_score: f64,
    auto_approve: Option<RiskLevel>,
) -> anyhow::Result<WorkflowExecutor> {
    let store = FileStateStore::new(config.data_dir.join("state")).await?;
    let audit = AuditLog::new(config.data_dir.join("audit"));
    let mut builder = WorkflowExecutor::builder(config.orchestrator.clone())
        .specialists(demo::demo_registry(demo_score))
        .store(Arc::new(store))
        .audit(audit)
        .notifier(build_notifier(config)?);
    if let Some(ceiling) = auto_approve {
        info!(ceiling = %ceiling, "Overrides approved up to risk ceiling");
        builder = builder.reviewer(Arc::new(RiskCeilingReviewer::new(ceiling)));
    }
    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring .env: {e}");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = MaestroConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Run {
            request,
            threshold,
            demo_score,
            detach,
            auto_approve,
        } => {
            let executor = build_executor(&config, demo_score, auto_approve).await?;
            let preferences = ExecutionPreferences {
                quality_threshold: threshold,
                ..Default::default()
            };
            let id = executor.execute(&request, preferences).await?;
            info!(execution_id = %id, "Workflow submitted");

            if detach {
                println!("{id}");
                warn!(execution_id = %id, "Detached; the workflow stops with this process");
            } else {
                let report = tokio::select! {
                    report = executor.wait(id) => report?,
                    _ = tokio::signal::ctrl_c() => {
                        executor.cancel(id).await?;
                        executor.wait(id).await?
                    }
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            executor.audit().flush().await;
            executor.shutdown().await;
        }
        Commands::Status { id, verbose } => {
            let executor = build_executor(&config, 0.0, None).await?;
            let report = executor.status(id).await?;
            if verbose {
                let out = serde_json::json!({
                    "report": report,
                    "plan": executor.plan(id).await?,
                    "record": executor.record(id).await?,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            executor.shutdown().await;
        }
        Commands::Health => {
            let executor = build_executor(&config, 0.0, None).await?;
            let report = executor.health_report();
            println!("{}", serde_json::to_string_pretty(&report)?);
            println!(
                "{}",
                serde_json::to_string_pretty(&executor.metrics().to_json().await)?
            );
            executor.shutdown().await;
        }
    }

    Ok(())
}
