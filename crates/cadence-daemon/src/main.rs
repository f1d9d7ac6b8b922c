use std::path::Path;

use cadence_core::CadenceConfig;
use cadence_scheduler::{CallableRegistry, Scheduler};
use clap::Parser;
use tracing::{info, warn};

mod builtins;

#[derive(Debug, Parser)]
#[command(name = "cadence", version, about = "Run the jobs declared in a cadence config")]
struct Cli {
    /// Config file; defaults to ~/.cadence/cadence.toml.
    #[arg(long, env = "CADENCE_CONFIG")]
    config: Option<String>,

    /// Start with job processing paused.
    #[arg(long)]
    paused: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = CadenceConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });
    for store in config.jobstores.values() {
        if let Some(path) = &store.path {
            ensure_parent_dir(path);
        }
    }

    let callables = CallableRegistry::new();
    builtins::register(&callables);

    let scheduler = Scheduler::from_config(&config, callables)?;
    scheduler.start(cli.paused)?;
    for job in scheduler.get_jobs(None)? {
        info!(job_id = %job.id, jobstore = %job.jobstore, "scheduled {job}");
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, waiting for running jobs");
    scheduler.shutdown(true).await?;
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
