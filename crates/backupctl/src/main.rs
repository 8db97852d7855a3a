mod commands;
mod config;
mod registry;

use std::time::Duration;

use anyhow::bail;
use backup_core::JobPhase;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use commands::Context;
use config::{Command, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    info!("Starting backupctl");
    let ctx = Context::open(&config).await?;

    match config.command {
        Command::Destination(command) => commands::destination(&ctx, command).await,
        Command::Create(args) => commands::create(&ctx, &args).await.map(|_| ()),
        Command::Build(args) => {
            let job_id = commands::create(&ctx, &args).await?;
            let snapshot = commands::advance(&ctx, &job_id, true).await?;
            commands::print_snapshot(&snapshot);
            if snapshot.phase != JobPhase::Complete {
                bail!("job {} ended in {}", job_id, snapshot.phase);
            }
            Ok(())
        }
        Command::Advance { job_id, until_done } => {
            let snapshot = commands::advance(&ctx, &job_id, until_done).await?;
            commands::print_snapshot(&snapshot);
            Ok(())
        }
        Command::Cancel { job_id } => commands::cancel(&ctx, &job_id).await,
        Command::Status { job_id, json } => commands::status(&ctx, job_id.as_deref(), json).await,
        Command::Reconcile {
            min_interval_secs,
            delete,
            all,
        } => {
            commands::reconcile(&ctx, Duration::from_secs(min_interval_secs), delete, all).await
        }
        Command::Download {
            destination,
            remote_path,
            target,
        } => commands::download(&ctx, &destination, &remote_path, &target).await,
        Command::Delete { job_id } => commands::delete(&ctx, &job_id).await,
        Command::Lock(command) => commands::lock(&ctx, command).await,
    }
}
