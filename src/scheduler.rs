//! # Permissions Sync Scheduler
//!
//! Background task that enqueues low priority sync jobs for users and private
//! repositories whose permissions were never synced or have gone stale. Each
//! tick runs under the `perms-sync-scheduler` rcache mutex so only one
//! instance schedules at a time.

use std::time::Duration;

use metrics::{counter, histogram};
use sea_orm::{DatabaseConnection, DbErr};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::models::permission_sync_job::reasons::{
    REASON_REPO_NO_PERMS, REASON_REPO_OUTDATED_PERMS, REASON_USER_NO_PERMS,
    REASON_USER_OUTDATED_PERMS,
};
use crate::models::permission_sync_job::JobPriority;
use crate::rcache::{CacheError, MutexOptions, Rcache};
use crate::repositories::permission_sync_job::{CreateJobOptions, SyncSubject};
use crate::repositories::{JobStoreError, PermissionSyncJobStore, PermsStore};

pub const SCHEDULER_MUTEX: &str = "perms-sync-scheduler";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub enqueued: u64,
    pub skipped: u64,
    /// The mutex lease was lost before every subject was visited.
    pub stopped_early: bool,
}

pub struct PermsSyncScheduler {
    config: SchedulerConfig,
    db: DatabaseConnection,
    rcache: Rcache,
}

impl PermsSyncScheduler {
    pub fn new(config: SchedulerConfig, db: DatabaseConnection, rcache: Rcache) -> Self {
        Self { config, db, rcache }
    }

    /// Run ticks until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            tick_interval_seconds = self.config.tick_interval_seconds,
            batch_size = self.config.batch_size,
            "Starting permissions sync scheduler"
        );
        let tick_interval = Duration::from_secs(self.config.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(tick_interval) => {
                    let started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Scheduler tick failed");
                    }
                    histogram!("permsync_scheduler_tick_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                }
            }
        }

        info!("Permissions sync scheduler stopped");
    }

    /// Schedule one batch if the mutex can be taken. `None` means another
    /// instance holds it.
    pub async fn tick(&self) -> Result<Option<TickStats>, SchedulerError> {
        let options = MutexOptions {
            tries: 1,
            ..MutexOptions::default()
        };
        let Some(guard) = self.rcache.try_acquire_mutex(SCHEDULER_MUTEX, options).await? else {
            debug!("Scheduler mutex held elsewhere, skipping tick");
            counter!("permsync_scheduler_ticks_total", "outcome" => "skipped").increment(1);
            return Ok(None);
        };

        let result = self.schedule(&guard.lease_lost()).await;
        match guard.release().await {
            Ok(true) => {}
            Ok(false) => warn!("Scheduler mutex was already lost at release"),
            Err(err) => warn!(error = %err, "Failed to release scheduler mutex"),
        }

        let stats = result?;
        counter!("permsync_scheduler_ticks_total", "outcome" => "ran").increment(1);
        counter!("permsync_scheduler_jobs_enqueued_total").increment(stats.enqueued);
        debug!(
            enqueued = stats.enqueued,
            skipped = stats.skipped,
            stopped_early = stats.stopped_early,
            "Scheduler tick completed"
        );
        Ok(Some(stats))
    }

    async fn schedule(&self, lease_lost: &CancellationToken) -> Result<TickStats, SchedulerError> {
        let perms = PermsStore::new(self.db.clone());
        let stale_after = self.config.stale_after();
        let batch = self.config.batch_size;

        let users = perms.user_ids_needing_sync(stale_after, batch).await?;
        let repos = perms.repo_ids_needing_sync(stale_after, batch).await?;

        let plan = [
            (users.no_perms, REASON_USER_NO_PERMS, true, SyncSubject::User as fn(i32) -> SyncSubject),
            (users.stale, REASON_USER_OUTDATED_PERMS, false, SyncSubject::User),
            (repos.no_perms, REASON_REPO_NO_PERMS, true, SyncSubject::Repo),
            (repos.stale, REASON_REPO_OUTDATED_PERMS, false, SyncSubject::Repo),
        ];

        let jobs = PermissionSyncJobStore::new(self.db.clone());
        let mut stats = TickStats::default();
        for (ids, reason, no_perms, subject) in plan {
            for id in ids {
                if lease_lost.is_cancelled() {
                    warn!("Scheduler mutex lease lost, stopping tick early");
                    stats.stopped_early = true;
                    return Ok(stats);
                }
                let opts = CreateJobOptions {
                    priority: JobPriority::Low,
                    reason: reason.to_string(),
                    no_perms,
                    ..CreateJobOptions::default()
                };
                match jobs.create(subject(id), opts).await? {
                    Some(_) => stats.enqueued += 1,
                    None => stats.skipped += 1,
                }
            }
        }

        Ok(stats)
    }
}
