//! Permissions sync worker
//!
//! Background worker that claims queued permission sync jobs, asks the
//! configured authz providers for the subject's permissions, writes the result
//! and moves the job to its final state with backoff and retry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use rand::{Rng, thread_rng};
use sea_orm::{DatabaseConnection, DbErr};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::authz::{AuthzError, AuthzProvider, FetchPermsOptions, Providers, Repo};
use crate::config::WorkerConfig;
use crate::extsvc::{CodeHostError, ExternalAccount, SERVICE_TYPE_GITHUB};
use crate::models::permission_sync_job::{self as job, CodeHostStatus, JobState, count_statuses};
use crate::repositories::perms::{SOURCE_SYNC, SetPermissionsResult};
use crate::repositories::permission_sync_job::SyncSubject;
use crate::repositories::{
    ExternalAccountRepository, JobStoreError, PermissionSyncJobStore, PermsStore, RepoRepository,
    UserRepository,
};

const BACKOFF_JITTER_FACTOR: f64 = 0.1;
const ACTION_FETCH_USER_PERMS: &str = "FetchUserPerms";
const ACTION_FETCH_REPO_PERMS: &str = "FetchRepoPerms";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Database(#[from] DbErr),

    #[error(transparent)]
    JobStore(#[from] JobStoreError),

    #[error("{kind} {id} not found")]
    SubjectNotFound { kind: &'static str, id: i32 },

    #[error("job {0} has no subject")]
    InvalidJob(i32),

    #[error("{message}")]
    CodeHosts {
        message: String,
        statuses: Vec<CodeHostStatus>,
        retry_after: Option<Duration>,
    },

    #[error("job timed out after {0}s")]
    Timeout(u64),
}

impl SyncError {
    fn statuses(&self) -> Option<&[CodeHostStatus]> {
        match self {
            SyncError::CodeHosts { statuses, .. } => Some(statuses),
            _ => None,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::CodeHosts { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Default)]
struct SyncOutcome {
    result: Option<SetPermissionsResult>,
    statuses: Vec<CodeHostStatus>,
}

fn retry_after_of(err: &AuthzError) -> Option<Duration> {
    match err {
        AuthzError::CodeHost(CodeHostError::RateLimited { retry_after }) => {
            Some(retry_after.unwrap_or_default())
        }
        _ => None,
    }
}

#[derive(Clone)]
pub struct PermsSyncWorker {
    db: DatabaseConnection,
    providers: Arc<Providers>,
    config: WorkerConfig,
    hostname: String,
    semaphore: Arc<Semaphore>,
}

impl PermsSyncWorker {
    pub fn new(db: DatabaseConnection, providers: Arc<Providers>, config: WorkerConfig) -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("permsync-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            db,
            providers,
            config,
            hostname,
            semaphore,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn jobs(&self) -> PermissionSyncJobStore {
        PermissionSyncJobStore::new(self.db.clone())
    }

    fn stalled_after(&self) -> Duration {
        Duration::from_secs(self.config.stalled_after_seconds.max(1))
    }

    /// Poll for jobs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(hostname = %self.hostname, concurrency = self.config.concurrency, "Starting permissions sync worker");
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut last_reset: Option<Instant> = None;

        loop {
            if last_reset.is_none_or(|at| at.elapsed() >= self.stalled_after()) {
                let stalled = chrono::Duration::seconds(self.config.stalled_after_seconds as i64);
                if let Err(err) = self.jobs().reset_stalled(stalled).await {
                    error!(error = %err, "Failed to reset stalled jobs");
                }
                last_reset = Some(Instant::now());
            }

            let started = Instant::now();
            match self.claim_and_run_jobs().await {
                Ok(count) if count > 0 => debug!(count, "Executed permission sync jobs"),
                Ok(_) => {}
                Err(err) => error!(error = %err, "Error executing permission sync jobs"),
            }

            let elapsed = started.elapsed();
            let wait = poll_interval.saturating_sub(elapsed);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }

        info!("Permissions sync worker stopped");
    }

    /// Claim up to `concurrency` jobs and run them to completion, heartbeating
    /// while they run. Returns the number of jobs run.
    #[instrument(skip(self), fields(hostname = %self.hostname))]
    pub async fn claim_and_run_jobs(&self) -> Result<usize, SyncError> {
        let jobs = self
            .jobs()
            .claim_next(&self.hostname, self.config.concurrency as u64)
            .await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        let count = jobs.len();
        let ids: Vec<i32> = jobs.iter().map(|job| job.id).collect();
        info!(count, "Claimed permission sync jobs");

        let mut set = JoinSet::new();
        for job in jobs {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| DbErr::Custom("worker semaphore closed".to_string()))?;
            let worker = self.clone();
            set.spawn(async move {
                let _permit = permit;
                worker.run_job(job).await
            });
        }

        let mut heartbeat = interval((self.stalled_after() / 3).max(Duration::from_secs(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(Err(err))) => error!(error = %err, "Failed to record job outcome"),
                    Some(Err(err)) => error!(error = %err, "Permission sync job task panicked"),
                    Some(Ok(Ok(_))) => {}
                },
                _ = heartbeat.tick() => {
                    if let Err(err) = self.jobs().heartbeat(&ids).await {
                        warn!(error = %err, "Failed to heartbeat permission sync jobs");
                    }
                }
            }
        }

        Ok(count)
    }

    /// Run one claimed job and record its outcome. Returns the final state.
    #[instrument(skip(self, job), fields(job_id = job.id, user_id = job.user_id, repo_id = job.repository_id))]
    pub async fn run_job(&self, job: job::Model) -> Result<JobState, SyncError> {
        let started = Instant::now();
        let subject = SyncSubject::of(&job);
        let kind = subject.map(|subject| subject.kind()).unwrap_or("unknown");

        let max_run = self.config.max_run_seconds;
        let result = match tokio::time::timeout(Duration::from_secs(max_run), self.execute(&job, subject)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(max_run)),
        };

        let store = self.jobs();
        let state = match result {
            Ok(outcome) => {
                store
                    .save_sync_result(job.id, true, outcome.result.as_ref(), &outcome.statuses)
                    .await?;
                store.mark_completed(job.id).await?;
                info!(
                    added = outcome.result.map(|r| r.added).unwrap_or_default(),
                    removed = outcome.result.map(|r| r.removed).unwrap_or_default(),
                    "Permission sync job completed"
                );
                JobState::Completed
            }
            Err(err) => {
                if let Some(statuses) = err.statuses() {
                    store.save_sync_result(job.id, false, None, statuses).await?;
                }
                let backoff = self.backoff(job.num_failures, err.retry_after());
                let state = store
                    .mark_errored(
                        job.id,
                        &err.to_string(),
                        self.config.max_attempts,
                        chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::MAX),
                    )
                    .await?;
                warn!(
                    error = %err,
                    state = %state,
                    backoff_secs = backoff.as_secs_f64(),
                    "Permission sync job failed"
                );
                state
            }
        };

        counter!("permsync_sync_jobs_total", "subject" => kind, "outcome" => state.as_str())
            .increment(1);
        histogram!("permsync_sync_job_duration_seconds", "subject" => kind)
            .record(started.elapsed().as_secs_f64());
        Ok(state)
    }

    /// `base * 2^failures` capped at the maximum, never shorter than the
    /// code host's retry-after, plus jitter.
    fn backoff(&self, failures: i32, retry_after: Option<Duration>) -> Duration {
        let base = self.config.backoff_base_seconds as f64;
        let max = self.config.backoff_max_seconds as f64;
        let mut backoff = (base * 2_f64.powi(failures.max(0))).min(max);
        if let Some(retry_after) = retry_after {
            backoff = backoff.max(retry_after.as_secs_f64());
        }
        let jitter = if backoff > 0.0 {
            thread_rng().gen_range(0.0..(BACKOFF_JITTER_FACTOR * backoff))
        } else {
            0.0
        };
        Duration::from_secs_f64(backoff + jitter)
    }

    async fn execute(
        &self,
        job: &job::Model,
        subject: Option<SyncSubject>,
    ) -> Result<SyncOutcome, SyncError> {
        let opts = FetchPermsOptions {
            invalidate_caches: job.invalidate_caches,
        };
        match subject {
            Some(SyncSubject::User(user_id)) => self.sync_user(user_id, job.no_perms, opts).await,
            Some(SyncSubject::Repo(repo_id)) => self.sync_repo(repo_id, opts).await,
            None => Err(SyncError::InvalidJob(job.id)),
        }
    }

    async fn sync_user(
        &self,
        user_id: i32,
        no_perms: bool,
        opts: FetchPermsOptions,
    ) -> Result<SyncOutcome, SyncError> {
        UserRepository::new(self.db.clone())
            .get_by_id(user_id)
            .await?
            .ok_or(SyncError::SubjectNotFound { kind: "user", id: user_id })?;

        let accounts = ExternalAccountRepository::new(self.db.clone())
            .list_for_user(user_id)
            .await?;
        let repos = RepoRepository::new(self.db.clone());

        let mut statuses = Vec::new();
        let mut repo_ids = BTreeSet::new();
        let mut failed_service_ids = Vec::new();
        let mut retry_after = None;

        for account in accounts {
            let Some(provider) = self.provider_for(&account.service_type, &account.service_id) else {
                debug!(account_id = account.id, service_id = %account.service_id, "No provider for external account");
                continue;
            };
            let account = ExternalAccount::from(account);

            match provider.fetch_user_perms(Some(&account), opts).await {
                Ok(external_ids) => {
                    let found = repos
                        .get_by_external_ids(provider.service_type(), provider.service_id(), &external_ids)
                        .await?;
                    debug!(
                        service_id = provider.service_id(),
                        fetched = external_ids.len(),
                        matched = found.len(),
                        "Fetched user permissions"
                    );
                    repo_ids.extend(found.into_iter().map(|repo| repo.id));
                    statuses.push(CodeHostStatus::success(
                        provider.service_id(),
                        provider.service_type(),
                        ACTION_FETCH_USER_PERMS,
                    ));
                }
                Err(err) => {
                    warn!(service_id = provider.service_id(), error = %err, "Failed to fetch user permissions");
                    retry_after = retry_after.max(retry_after_of(&err));
                    failed_service_ids.push(provider.service_id().to_string());
                    statuses.push(CodeHostStatus::error(
                        provider.service_id(),
                        provider.service_type(),
                        ACTION_FETCH_USER_PERMS,
                        &err.to_string(),
                    ));
                }
            }
        }

        let (succeeded, failed) = count_statuses(&statuses);
        if failed > 0 && succeeded == 0 && !no_perms {
            return Err(SyncError::CodeHosts {
                message: format!("fetching user permissions failed on all {failed} code host(s)"),
                statuses,
                retry_after,
            });
        }

        let perms = PermsStore::new(self.db.clone());
        if !failed_service_ids.is_empty() {
            // Keep what a failing code host granted previously.
            let existing = perms.repo_ids_for_user(user_id, SOURCE_SYNC).await?;
            let kept = repos
                .get_by_ids(&existing)
                .await?
                .into_iter()
                .filter(|repo| failed_service_ids.contains(&repo.external_service_id));
            repo_ids.extend(kept.map(|repo| repo.id));
        }

        let repo_ids: Vec<i32> = repo_ids.into_iter().collect();
        let result = perms
            .set_user_repo_permissions(user_id, &repo_ids, SOURCE_SYNC)
            .await?;
        Ok(SyncOutcome {
            result: Some(result),
            statuses,
        })
    }

    async fn sync_repo(&self, repo_id: i32, opts: FetchPermsOptions) -> Result<SyncOutcome, SyncError> {
        let repo = RepoRepository::new(self.db.clone())
            .get_by_id(repo_id)
            .await?
            .ok_or(SyncError::SubjectNotFound { kind: "repo", id: repo_id })?;
        let perms = PermsStore::new(self.db.clone());

        if !repo.private {
            debug!("Public repository, nothing to sync");
            perms.mark_repo_synced(repo_id).await?;
            return Ok(SyncOutcome::default());
        }
        let Some(provider) = self.provider_for(&repo.external_service_type, &repo.external_service_id) else {
            debug!(service_id = %repo.external_service_id, "No provider for repository");
            perms.mark_repo_synced(repo_id).await?;
            return Ok(SyncOutcome::default());
        };

        let authz_repo = Repo {
            id: repo.id,
            name: repo.name.clone(),
            external_repo: repo.external_repo(),
        };

        let account_ids = match provider.fetch_repo_perms(&authz_repo, opts).await {
            Ok(ids) => ids,
            Err(err) if err.is_not_found() && provider.service_type() == SERVICE_TYPE_GITHUB => {
                info!("Repository not found on code host, ignoring");
                perms.mark_repo_synced(repo_id).await?;
                return Ok(SyncOutcome {
                    result: None,
                    statuses: vec![CodeHostStatus::success(
                        provider.service_id(),
                        provider.service_type(),
                        ACTION_FETCH_REPO_PERMS,
                    )],
                });
            }
            Err(err) => {
                let status = CodeHostStatus::error(
                    provider.service_id(),
                    provider.service_type(),
                    ACTION_FETCH_REPO_PERMS,
                    &err.to_string(),
                );
                return Err(SyncError::CodeHosts {
                    message: err.to_string(),
                    retry_after: retry_after_of(&err),
                    statuses: vec![status],
                });
            }
        };

        let user_ids: BTreeSet<i32> = ExternalAccountRepository::new(self.db.clone())
            .get_by_account_ids(provider.service_type(), provider.service_id(), &account_ids)
            .await?
            .into_iter()
            .map(|account| account.user_id)
            .collect();
        let user_ids: Vec<i32> = user_ids.into_iter().collect();

        let result = perms
            .set_repo_permissions(repo_id, &user_ids, SOURCE_SYNC)
            .await?;
        Ok(SyncOutcome {
            result: Some(result),
            statuses: vec![CodeHostStatus::success(
                provider.service_id(),
                provider.service_type(),
                ACTION_FETCH_REPO_PERMS,
            )],
        })
    }

    fn provider_for(&self, service_type: &str, service_id: &str) -> Option<Arc<dyn AuthzProvider>> {
        self.providers
            .get(service_id)
            .filter(|provider| provider.service_type() == service_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(base: u64, max: u64) -> PermsSyncWorker {
        let config = WorkerConfig {
            backoff_base_seconds: base,
            backoff_max_seconds: max,
            ..WorkerConfig::default()
        };
        PermsSyncWorker::new(DatabaseConnection::default(), Arc::new(Providers::new()), config)
            .with_hostname("test-host")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let worker = worker(10, 100);
        let first = worker.backoff(0, None).as_secs_f64();
        assert!((10.0..11.0).contains(&first), "{first}");
        let third = worker.backoff(2, None).as_secs_f64();
        assert!((40.0..44.0).contains(&third), "{third}");
        let capped = worker.backoff(10, None).as_secs_f64();
        assert!((100.0..110.0).contains(&capped), "{capped}");
    }

    #[test]
    fn backoff_respects_retry_after() {
        let worker = worker(1, 60);
        let backoff = worker.backoff(0, Some(Duration::from_secs(30))).as_secs_f64();
        assert!((30.0..33.0).contains(&backoff), "{backoff}");
    }

    #[test]
    fn rate_limited_errors_carry_retry_after() {
        let err = AuthzError::CodeHost(CodeHostError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        });
        assert_eq!(retry_after_of(&err), Some(Duration::from_secs(5)));
        assert_eq!(retry_after_of(&AuthzError::NoAccount), None);
    }
}
