//! # Permission Sync Job Store
//!
//! Queue operations and read-side projections for the `permission_sync_jobs`
//! table.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Alias, Expr, Func, NullOrdering, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, Order,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{ApiError, is_unique_violation, not_found};
use crate::models::permission_sync_job::{
    ActiveModel, CodeHostStatus, Column, Entity, JobPriority, JobState, Model, ReasonGroup,
    count_statuses,
};
use crate::models::{repo, user};
use crate::repositories::perms::SetPermissionsResult;

/// Reason recorded on a queued job that is replaced by a higher-priority one.
pub const HIGHER_PRIORITY_CANCELLATION: &str = "A job with higher priority was added.";

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("permission sync job not found")]
    NotFound,
    #[error(transparent)]
    Db(#[from] DbErr),
}

impl From<JobStoreError> for ApiError {
    fn from(error: JobStoreError) -> Self {
        match error {
            JobStoreError::NotFound => not_found("Permission sync job not found"),
            JobStoreError::Db(err) => err.into(),
        }
    }
}

/// The user or repository a job recomputes permissions for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncSubject {
    User(i32),
    Repo(i32),
}

impl SyncSubject {
    pub fn of(job: &Model) -> Option<Self> {
        match (job.user_id, job.repository_id) {
            (Some(user_id), None) => Some(SyncSubject::User(user_id)),
            (None, Some(repo_id)) => Some(SyncSubject::Repo(repo_id)),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncSubject::User(_) => "user",
            SyncSubject::Repo(_) => "repo",
        }
    }

    fn condition(&self) -> Condition {
        match *self {
            SyncSubject::User(id) => Condition::all().add(Column::UserId.eq(id)),
            SyncSubject::Repo(id) => Condition::all().add(Column::RepositoryId.eq(id)),
        }
    }
}

/// Parameters for a new job.
#[derive(Debug, Clone, Default)]
pub struct CreateJobOptions {
    pub priority: JobPriority,
    pub reason: String,
    pub triggered_by_user_id: Option<i32>,
    pub no_perms: bool,
    pub invalidate_caches: bool,
    /// Delayed jobs skip deduplication.
    pub process_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    Repository,
    User,
}

impl FromStr for SearchType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "REPOSITORY" => Ok(SearchType::Repository),
            "USER" => Ok(SearchType::User),
            other => Err(format!("unknown search type: {other}")),
        }
    }
}

/// Filters for [`PermissionSyncJobStore::list`] and [`PermissionSyncJobStore::count`].
#[derive(Debug, Clone, Default)]
pub struct ListJobsOptions {
    pub id: Option<i32>,
    pub user_id: Option<i32>,
    pub repo_id: Option<i32>,
    pub reason: Option<String>,
    /// Ignored when `reason` is set.
    pub reason_group: Option<ReasonGroup>,
    pub state: Option<JobState>,
    /// Completed jobs with both successful and failed code hosts. Overrides `state`.
    pub partial_success: bool,
    pub with_null_process_after: bool,
    pub with_non_null_process_after: bool,
    pub not_canceled: bool,
    pub search_type: Option<SearchType>,
    pub query: Option<String>,
    pub first: Option<u64>,
    /// Only jobs with an id greater than this.
    pub after: Option<i32>,
    pub with_place_in_queue: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListedJob {
    pub job: Model,
    /// 1-based position among queued jobs, when requested and the job is queued.
    pub place_in_queue: Option<i32>,
}

pub struct PermissionSyncJobStore {
    db: DatabaseConnection,
}

impl PermissionSyncJobStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create_user_sync_job(
        &self,
        user_id: i32,
        opts: CreateJobOptions,
    ) -> Result<Option<Model>, JobStoreError> {
        self.create(SyncSubject::User(user_id), opts).await
    }

    pub async fn create_repo_sync_job(
        &self,
        repo_id: i32,
        opts: CreateJobOptions,
    ) -> Result<Option<Model>, JobStoreError> {
        self.create(SyncSubject::Repo(repo_id), opts).await
    }

    /// Insert a job unless an equal or higher priority one is already waiting.
    ///
    /// A waiting job of lower priority is canceled in favour of the new one.
    /// Returns `None` when nothing was inserted.
    pub async fn create(
        &self,
        subject: SyncSubject,
        opts: CreateJobOptions,
    ) -> Result<Option<Model>, JobStoreError> {
        let now = Utc::now().fixed_offset();

        if opts.process_after.is_some() {
            let job = new_job(subject, &opts, now).insert(&self.db).await?;
            info!(job_id = job.id, subject = subject.kind(), reason = %job.reason, "Delayed permission sync job enqueued");
            return Ok(Some(job));
        }

        let txn = self.db.begin().await?;
        let existing = Entity::find()
            .filter(subject.condition())
            .filter(Column::State.eq(JobState::Queued.as_str()))
            .filter(Column::Cancel.eq(false))
            .filter(Column::ProcessAfter.is_null())
            .one(&txn)
            .await?;

        if let Some(existing) = existing {
            if existing.priority >= opts.priority.value() {
                debug!(
                    existing_job_id = existing.id,
                    subject = subject.kind(),
                    "Queued job with equal or higher priority exists, skipping"
                );
                txn.commit().await?;
                return Ok(None);
            }

            let existing_id = existing.id;
            let mut active: ActiveModel = existing.into();
            active.cancel = Set(true);
            active.state = Set(JobState::Canceled.as_str().to_string());
            active.finished_at = Set(Some(now));
            active.cancellation_reason = Set(Some(HIGHER_PRIORITY_CANCELLATION.to_string()));
            active.update(&txn).await?;
            debug!(job_id = existing_id, "Canceled lower priority queued job");
        }

        match new_job(subject, &opts, now).insert(&txn).await {
            Ok(job) => {
                txn.commit().await?;
                info!(job_id = job.id, subject = subject.kind(), reason = %job.reason, priority = job.priority, "Permission sync job enqueued");
                Ok(Some(job))
            }
            Err(err) if is_unique_violation(&err) => {
                txn.rollback().await?;
                debug!(subject = subject.kind(), "Concurrent enqueue won, skipping");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find_by_id(&self, id: i32) -> Result<Option<Model>, JobStoreError> {
        Ok(Entity::find_by_id(id).one(&self.db).await?)
    }

    /// Cancel a job that is still queued. Returns `NotFound` otherwise.
    pub async fn cancel_queued_job(
        &self,
        id: i32,
        reason: Option<String>,
    ) -> Result<(), JobStoreError> {
        let result = Entity::update_many()
            .col_expr(Column::Cancel, Expr::value(true))
            .col_expr(Column::State, Expr::value(JobState::Canceled.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(Utc::now().fixed_offset()))
            .col_expr(Column::CancellationReason, Expr::value(reason))
            .filter(Column::Id.eq(id))
            .filter(Column::State.eq(JobState::Queued.as_str()))
            .filter(Column::Cancel.eq(false))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(JobStoreError::NotFound);
        }
        info!(job_id = id, "Permission sync job canceled");
        Ok(())
    }

    /// Record the outcome counters and per-code-host states of a run.
    pub async fn save_sync_result(
        &self,
        id: i32,
        finished_successfully: bool,
        result: Option<&SetPermissionsResult>,
        code_host_states: &[CodeHostStatus],
    ) -> Result<(), JobStoreError> {
        let (succeeded, failed) = count_statuses(code_host_states);
        let partial = finished_successfully && succeeded > 0 && failed > 0;
        let result = result.copied().unwrap_or_default();
        let states = serde_json::to_value(code_host_states)
            .map_err(|err| DbErr::Custom(format!("encode code host states: {err}")))?;

        let updated = Entity::update_many()
            .col_expr(Column::PermissionsAdded, Expr::value(result.added))
            .col_expr(Column::PermissionsRemoved, Expr::value(result.removed))
            .col_expr(Column::PermissionsFound, Expr::value(result.found))
            .col_expr(Column::CodeHostStates, Expr::value(states))
            .col_expr(Column::IsPartialSuccess, Expr::value(partial))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if updated.rows_affected == 0 {
            return Err(JobStoreError::NotFound);
        }
        Ok(())
    }

    fn filter_condition(opts: &ListJobsOptions) -> Condition {
        let mut cond = Condition::all();

        if let Some(id) = opts.id {
            cond = cond.add(Column::Id.eq(id));
        }
        if let Some(user_id) = opts.user_id {
            cond = cond.add(Column::UserId.eq(user_id));
        }
        if let Some(repo_id) = opts.repo_id {
            cond = cond.add(Column::RepositoryId.eq(repo_id));
        }

        match (&opts.reason, opts.reason_group) {
            (Some(reason), _) => cond = cond.add(Column::Reason.eq(reason.as_str())),
            // Unknown has no reasons of its own and filters nothing.
            (None, Some(group)) if !group.reasons().is_empty() => {
                cond = cond.add(Column::Reason.is_in(group.reasons().iter().copied()))
            }
            (None, _) => {}
        }

        if opts.partial_success {
            cond = cond
                .add(Column::IsPartialSuccess.eq(true))
                .add(Column::State.eq(JobState::Completed.as_str()));
        } else if let Some(state) = opts.state {
            cond = cond
                .add(Column::State.eq(state.as_str()))
                .add(Column::IsPartialSuccess.eq(false));
        }

        if opts.with_null_process_after {
            cond = cond.add(Column::ProcessAfter.is_null());
        }
        if opts.with_non_null_process_after {
            cond = cond.add(Column::ProcessAfter.is_not_null());
        }
        if opts.not_canceled {
            cond = cond.add(Column::Cancel.eq(false));
        }

        let pattern = opts
            .query
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .map(|query| format!("%{}%", query.to_lowercase()));

        match opts.search_type {
            Some(SearchType::Repository) => {
                cond = cond.add(Column::RepositoryId.is_not_null());
                if let Some(pattern) = pattern {
                    cond = cond.add(
                        Column::RepositoryId.in_subquery(
                            Query::select()
                                .column(repo::Column::Id)
                                .from(repo::Entity)
                                .and_where(
                                    Expr::expr(Func::lower(Expr::col((
                                        repo::Entity,
                                        repo::Column::Name,
                                    ))))
                                    .like(pattern),
                                )
                                .to_owned(),
                        ),
                    );
                }
            }
            Some(SearchType::User) => {
                cond = cond.add(Column::UserId.is_not_null());
                if let Some(pattern) = pattern {
                    cond = cond.add(
                        Column::UserId.in_subquery(
                            Query::select()
                                .column(user::Column::Id)
                                .from(user::Entity)
                                .cond_where(
                                    Condition::any()
                                        .add(
                                            Expr::expr(Func::lower(Expr::col((
                                                user::Entity,
                                                user::Column::Username,
                                            ))))
                                            .like(pattern.clone()),
                                        )
                                        .add(
                                            Expr::expr(Func::lower(Expr::col((
                                                user::Entity,
                                                user::Column::DisplayName,
                                            ))))
                                            .like(pattern),
                                        ),
                                )
                                .to_owned(),
                        ),
                    );
                }
            }
            None => {}
        }

        cond
    }

    /// Jobs matching `opts`, ordered by id ascending.
    pub async fn list(&self, opts: &ListJobsOptions) -> Result<Vec<ListedJob>, JobStoreError> {
        let mut cond = Self::filter_condition(opts);
        if let Some(after) = opts.after {
            cond = cond.add(Column::Id.gt(after));
        }

        let mut query = Entity::find().filter(cond).order_by_asc(Column::Id);
        if let Some(first) = opts.first {
            query = query.limit(first);
        }
        let jobs = query.all(&self.db).await?;

        let places = if opts.with_place_in_queue
            && jobs.iter().any(|job| job.job_state() == JobState::Queued)
        {
            self.queue_positions().await?
        } else {
            HashMap::new()
        };

        Ok(jobs
            .into_iter()
            .map(|job| ListedJob {
                place_in_queue: places.get(&job.id).copied(),
                job,
            })
            .collect())
    }

    /// Number of jobs matching `opts`, ignoring pagination.
    pub async fn count(&self, opts: &ListJobsOptions) -> Result<u64, JobStoreError> {
        Ok(Entity::find()
            .filter(Self::filter_condition(opts))
            .count(&self.db)
            .await?)
    }

    /// Queued jobs in dequeue order, mapped to their 1-based position.
    async fn queue_positions(&self) -> Result<HashMap<i32, i32>, JobStoreError> {
        let ids: Vec<i32> = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::State.eq(JobState::Queued.as_str()))
            .order_by(Column::Priority, Order::Desc)
            .order_by_with_nulls(Column::ProcessAfter, Order::Asc, NullOrdering::First)
            .order_by(Column::Id, Order::Asc)
            .into_tuple()
            .all(&self.db)
            .await?;

        Ok(ids
            .into_iter()
            .zip(1..)
            .collect())
    }

    /// Most recently finished job for `subject`.
    pub async fn get_latest_finished_sync_job(
        &self,
        subject: SyncSubject,
        not_canceled: bool,
    ) -> Result<Option<Model>, JobStoreError> {
        let mut query = Entity::find()
            .filter(subject.condition())
            .filter(Column::FinishedAt.is_not_null());
        if not_canceled {
            query = query.filter(Column::Cancel.eq(false));
        }
        Ok(query
            .order_by_desc(Column::FinishedAt)
            .order_by_desc(Column::Id)
            .one(&self.db)
            .await?)
    }

    pub async fn count_users_with_failing_sync_job(&self) -> Result<u64, JobStoreError> {
        self.count_subjects_with_failing_job(Column::UserId).await
    }

    pub async fn count_repos_with_failing_sync_job(&self) -> Result<u64, JobStoreError> {
        self.count_subjects_with_failing_job(Column::RepositoryId)
            .await
    }

    /// Subjects whose latest completed or failed job failed. A failed job
    /// counts only when no later finished job exists for its subject.
    async fn count_subjects_with_failing_job(&self, subject: Column) -> Result<u64, JobStoreError> {
        let finished_states = [JobState::Completed.as_str(), JobState::Failed.as_str()];
        let newer = Alias::new("newer");
        let newer_finished_job = Query::select()
            .expr(Expr::val(1))
            .from_as(Entity, newer.clone())
            .and_where(Expr::col((newer.clone(), subject)).equals((Entity, subject)))
            .and_where(Expr::col((newer.clone(), Column::FinishedAt)).is_not_null())
            .and_where(Expr::col((newer.clone(), Column::State)).is_in(finished_states))
            .cond_where(
                Condition::any()
                    .add(
                        Expr::col((newer.clone(), Column::FinishedAt))
                            .gt(Expr::col((Entity, Column::FinishedAt))),
                    )
                    .add(
                        Condition::all()
                            .add(
                                Expr::col((newer.clone(), Column::FinishedAt))
                                    .eq(Expr::col((Entity, Column::FinishedAt))),
                            )
                            .add(Expr::col((newer, Column::Id)).gt(Expr::col((Entity, Column::Id)))),
                    ),
            )
            .to_owned();

        Ok(Entity::find()
            .filter(subject.is_not_null())
            .filter(Column::FinishedAt.is_not_null())
            .filter(Column::State.eq(JobState::Failed.as_str()))
            .filter(Expr::exists(newer_finished_job).not())
            .count(&self.db)
            .await?)
    }

    /// Number of jobs waiting to run.
    pub async fn queue_size(&self) -> Result<u64, JobStoreError> {
        Ok(Entity::find()
            .filter(Column::State.eq(JobState::Queued.as_str()))
            .filter(Column::Cancel.eq(false))
            .count(&self.db)
            .await?)
    }

    /// Move up to `limit` runnable jobs to `processing` and return them.
    pub async fn claim_next(
        &self,
        hostname: &str,
        limit: u64,
    ) -> Result<Vec<Model>, JobStoreError> {
        let now = Utc::now().fixed_offset();
        let runnable = Condition::all()
            .add(Column::State.is_in([JobState::Queued.as_str(), JobState::Errored.as_str()]))
            .add(Column::Cancel.eq(false))
            .add(
                Condition::any()
                    .add(Column::ProcessAfter.is_null())
                    .add(Column::ProcessAfter.lte(now)),
            );

        let ids: Vec<i32> = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(runnable.clone())
            .order_by(Column::Priority, Order::Desc)
            .order_by_with_nulls(Column::ProcessAfter, Order::Asc, NullOrdering::First)
            .order_by(Column::Id, Order::Asc)
            .limit(limit)
            .into_tuple()
            .all(&self.db)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut claimed = Entity::update_many()
            .col_expr(Column::State, Expr::value(JobState::Processing.as_str()))
            .col_expr(Column::StartedAt, Expr::value(now))
            .col_expr(Column::LastHeartbeatAt, Expr::value(now))
            .col_expr(Column::FinishedAt, Expr::value(Option::<DateTime<chrono::FixedOffset>>::None))
            .col_expr(Column::WorkerHostname, Expr::value(hostname))
            .filter(Column::Id.is_in(ids))
            .filter(runnable)
            .exec_with_returning(&self.db)
            .await?;

        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.process_after.cmp(&b.process_after))
                .then(a.id.cmp(&b.id))
        });
        Ok(claimed)
    }

    pub async fn mark_completed(&self, id: i32) -> Result<(), JobStoreError> {
        let result = Entity::update_many()
            .col_expr(Column::State, Expr::value(JobState::Completed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(Utc::now().fixed_offset()))
            .col_expr(Column::FailureMessage, Expr::value(Option::<String>::None))
            .filter(Column::Id.eq(id))
            .filter(Column::State.eq(JobState::Processing.as_str()))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(JobStoreError::NotFound);
        }
        Ok(())
    }

    /// Record a failed run. The job is retried after `backoff` until it has
    /// failed `max_attempts` times, then it becomes `failed`.
    pub async fn mark_errored(
        &self,
        id: i32,
        message: &str,
        max_attempts: i32,
        backoff: Duration,
    ) -> Result<JobState, JobStoreError> {
        let job = Entity::find_by_id(id)
            .filter(Column::State.eq(JobState::Processing.as_str()))
            .one(&self.db)
            .await?
            .ok_or(JobStoreError::NotFound)?;

        let now = Utc::now().fixed_offset();
        let failures = job.num_failures + 1;
        let state = if failures >= max_attempts {
            JobState::Failed
        } else {
            JobState::Errored
        };

        let mut active: ActiveModel = job.into();
        active.state = Set(state.as_str().to_string());
        active.num_failures = Set(failures);
        active.failure_message = Set(Some(message.to_string()));
        active.finished_at = Set(Some(now));
        if state == JobState::Errored {
            active.process_after = Set(Some(now + backoff));
        }
        active.update(&self.db).await?;
        Ok(state)
    }

    pub async fn heartbeat(&self, ids: &[i32]) -> Result<u64, JobStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = Entity::update_many()
            .col_expr(Column::LastHeartbeatAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.is_in(ids.iter().copied()))
            .filter(Column::State.eq(JobState::Processing.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Requeue `processing` jobs whose last heartbeat is older than `older_than`.
    ///
    /// Requeued jobs get a non-null `process_after` so they never collide with
    /// a fresh job in the per-subject dedup index.
    pub async fn reset_stalled(&self, older_than: Duration) -> Result<u64, JobStoreError> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::State, Expr::value(JobState::Queued.as_str()))
            .col_expr(Column::NumResets, Expr::col(Column::NumResets).add(1))
            .col_expr(Column::ProcessAfter, Expr::value(now))
            .col_expr(Column::StartedAt, Expr::value(Option::<DateTime<chrono::FixedOffset>>::None))
            .col_expr(Column::WorkerHostname, Expr::value(""))
            .filter(Column::State.eq(JobState::Processing.as_str()))
            .filter(
                Condition::any()
                    .add(Column::LastHeartbeatAt.is_null())
                    .add(Column::LastHeartbeatAt.lt(now - older_than)),
            )
            .exec(&self.db)
            .await?;
        if result.rows_affected > 0 {
            info!(count = result.rows_affected, "Reset stalled permission sync jobs");
        }
        Ok(result.rows_affected)
    }
}

fn new_job(
    subject: SyncSubject,
    opts: &CreateJobOptions,
    now: DateTime<chrono::FixedOffset>,
) -> ActiveModel {
    let (user_id, repository_id) = match subject {
        SyncSubject::User(id) => (Some(id), None),
        SyncSubject::Repo(id) => (None, Some(id)),
    };
    ActiveModel {
        state: Set(JobState::Queued.as_str().to_string()),
        failure_message: Set(None),
        reason: Set(opts.reason.clone()),
        cancellation_reason: Set(None),
        triggered_by_user_id: Set(opts.triggered_by_user_id),
        queued_at: Set(now),
        started_at: Set(None),
        finished_at: Set(None),
        process_after: Set(opts.process_after.map(|at| at.fixed_offset())),
        num_resets: Set(0),
        num_failures: Set(0),
        last_heartbeat_at: Set(None),
        worker_hostname: Set(String::new()),
        cancel: Set(false),
        repository_id: Set(repository_id),
        user_id: Set(user_id),
        priority: Set(opts.priority.value()),
        no_perms: Set(opts.no_perms),
        invalidate_caches: Set(opts.invalidate_caches),
        permissions_added: Set(0),
        permissions_removed: Set(0),
        permissions_found: Set(0),
        code_host_states: Set(None),
        is_partial_success: Set(false),
        ..Default::default()
    }
}
