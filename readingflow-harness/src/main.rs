use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use readingflow::{
    Coordinator, CrashGuard, JobId, ReclaimerBuilder, Settings, SqliteTaskStore, TaskId,
    TracingNotifier,
};
use readingflow_harness::{install_shutdown_handler, CoordinatorHarnessExt};

#[derive(Parser, Debug)]
#[command(name = "readingflow")]
#[command(version)]
#[command(about = "Job intake, status and stale-task reclaiming for readingflow")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API and run the reclaimer until interrupted
    Serve {
        /// Port to listen on (overrides READINGFLOW_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Do not run the reclaimer in this process
        #[arg(long)]
        no_reclaimer: bool,
    },

    /// Run the stale-task reclaimer until interrupted
    Reclaim {
        /// Sweep once and exit
        #[arg(long)]
        once: bool,
    },

    /// Create or update the database schema
    Migrate,

    /// Print the progress snapshot of a job as JSON
    Status {
        /// The job ID
        job_id: i64,
    },

    /// Cancel a queued or processing job
    Cancel {
        /// The job ID
        job_id: i64,
    },

    /// Put a processing task back to pending
    ResetTask {
        /// The task ID
        task_id: i64,
    },
}

async fn open(settings: &Settings) -> anyhow::Result<Arc<Coordinator<SqliteTaskStore>>> {
    let store = SqliteTaskStore::connect(&settings.database_url, settings.max_connections)
        .await
        .with_context(|| format!("failed to open {}", settings.database_url))?;
    store
        .run_migrations()
        .await
        .context("failed to run migrations")?;

    Ok(Arc::new(Coordinator::new(
        Arc::new(store),
        settings.pipeline.clone(),
        Arc::new(TracingNotifier),
    )))
}

async fn serve(settings: Settings, port: Option<u16>, no_reclaimer: bool) -> anyhow::Result<()> {
    let coordinator = open(&settings).await?;
    let shutdown = install_shutdown_handler().context("failed to install signal handlers")?;

    let reclaimer = if no_reclaimer {
        None
    } else {
        let reclaimer = ReclaimerBuilder::new(coordinator.clone())
            .config(settings.reclaimer.clone())
            .build();
        let token = shutdown.clone();
        Some(tokio::spawn(async move { reclaimer.run(token).await }))
    };

    let port = port.unwrap_or(settings.port);
    let server = coordinator.spawn_http(port, shutdown.clone());

    let result = server.await.context("HTTP server task panicked")?;
    // A server error should still stop the reclaimer.
    shutdown.cancel();
    if let Some(handle) = reclaimer {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "reclaimer task ended abnormally");
        }
    }
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    CrashGuard::<SqliteTaskStore>::install_panic_hook();

    let settings = Settings::from_env().context("invalid configuration")?;

    match args.command {
        Commands::Serve { port, no_reclaimer } => {
            serve(settings, port, no_reclaimer).await?;
        }
        Commands::Reclaim { once } => {
            let coordinator = open(&settings).await?;
            let reclaimer = ReclaimerBuilder::new(coordinator)
                .config(settings.reclaimer.clone())
                .build();
            if once {
                let report = reclaimer.sweep_once().await?;
                println!(
                    "reset {} task(s), failed {} task(s), repaired {} expansion(s)",
                    report.reclaimed.reset.len(),
                    report.reclaimed.failed.len(),
                    report.repaired
                );
            } else {
                let shutdown =
                    install_shutdown_handler().context("failed to install signal handlers")?;
                reclaimer.run(shutdown).await;
            }
        }
        Commands::Migrate => {
            open(&settings).await?;
            println!("schema is up to date");
        }
        Commands::Status { job_id } => {
            let coordinator = open(&settings).await?;
            let snapshot = coordinator.snapshot(JobId(job_id)).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Cancel { job_id } => {
            let coordinator = open(&settings).await?;
            if coordinator.cancel(JobId(job_id)).await? {
                println!("job {} cancelled", job_id);
            } else {
                println!("job {} is not live, nothing to cancel", job_id);
            }
        }
        Commands::ResetTask { task_id } => {
            let coordinator = open(&settings).await?;
            if coordinator.reset_task(TaskId(task_id)).await? {
                println!("task {} reset to pending", task_id);
            } else {
                println!("task {} is not processing, nothing to reset", task_id);
            }
        }
    }

    Ok(())
}
