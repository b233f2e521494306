use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::run::EtlRunner;

/// Cron-driven runs of one runner. A tick that fires while the previous run is still in
/// flight is skipped, so at most one run per target is ever active.
pub async fn build_scheduler(runner: Arc<EtlRunner>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_flight = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = runner.clone();
        let in_flight = in_flight.clone();
        Box::pin(async move {
            let Ok(_guard) = in_flight.try_lock() else {
                warn!("previous run still in progress; skipping scheduled tick");
                return;
            };
            info!("scheduled run triggered");
            match runner.run_once().await {
                Ok(summary) => info!(
                    job_id = %summary.job_id,
                    rows = summary.rows_written,
                    window = %summary.window,
                    "scheduled run succeeded"
                ),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Starts the scheduler and blocks until ctrl-c.
pub async fn run_scheduled(runner: Arc<EtlRunner>, cron: &str) -> Result<()> {
    let mut sched = build_scheduler(runner, cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron, "scheduler started; waiting for next run");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
