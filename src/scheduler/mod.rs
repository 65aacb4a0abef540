pub mod cron;

use crate::config::ScheduleConfig;
use crate::pipeline::{Pipeline, RunError};
use chrono::{DateTime, Local, TimeZone};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

use self::cron::{CronError, CronSchedule};

/// Fires the pipeline at fixed wall-clock times (process local time zone).
pub struct Scheduler {
    jobs: Vec<CronSchedule>,
}

impl Scheduler {
    pub fn new(jobs: Vec<CronSchedule>) -> Self {
        Self { jobs }
    }

    pub fn from_config(config: &ScheduleConfig) -> Result<Self, CronError> {
        let jobs = config
            .crons
            .iter()
            .map(|c| c.parse())
            .collect::<Result<Vec<CronSchedule>, _>>()?;
        Ok(Self::new(jobs))
    }

    pub fn jobs(&self) -> &[CronSchedule] {
        &self.jobs
    }

    /// Earliest upcoming fire time across all jobs.
    pub fn next_fire<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<(DateTime<Tz>, &CronSchedule)> {
        self.jobs
            .iter()
            .filter_map(|job| job.next_after(after).map(|t| (t, job)))
            .min_by(|a, b| a.0.cmp(&b.0))
    }

    /// Sleep until each fire time and await `trigger`. Returns only when no
    /// job has a future fire time.
    pub async fn run<F, Fut>(&self, mut trigger: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        if self.jobs.is_empty() {
            warn!("Scheduler has no jobs");
            return;
        }

        loop {
            let now = Local::now();
            let Some((next, job)) = self.next_fire(&now) else {
                warn!("No upcoming fire time; scheduler stopping");
                return;
            };
            let wait = (next.clone() - now).to_std().unwrap_or_default();
            info!("Next scheduled scrape at {} ({}), in {:?}", next.format("%a %Y-%m-%d %H:%M %Z"), job, wait);

            tokio::time::sleep(wait).await;
            info!("Scheduled trigger ({}) firing", job);
            trigger().await;
        }
    }
}

/// Scheduled runs only report through the log.
pub async fn run_scheduled(pipeline: Arc<Pipeline>) {
    match pipeline.run().await {
        Ok(summary) => info!("Scheduled run ok: {}", summary.message()),
        Err(RunError::AlreadyRunning) => warn!("Scheduled run skipped: another run is in progress"),
        Err(e) => error!("Scheduled run failed: {}", e),
    }
}
