//! # Permissions API Handlers
//!
//! Admin endpoints for inspecting and steering permission syncs. Operation
//! names follow the `permissionsSyncJobs` family of admin operations.

use std::collections::HashMap;

use axum::{
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    response::Json,
};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use utoipa::ToSchema;

use crate::auth::Actor;
use crate::cursor::{NodeKind, decode_job_cursor, encode_job_cursor, marshal_node_id, unmarshal_node_id};
use crate::error::{ApiError, not_found, validation_error};
use crate::models::permission_sync_job::{
    CodeHostStatus, JobPriority, JobState, ReasonGroup, reasons,
};
use crate::models::{repo, user};
use crate::repositories::permission_sync_job::{
    CreateJobOptions, ListJobsOptions, ListedJob, SearchType,
};
use crate::repositories::perms::SOURCE_API;
use crate::repositories::{
    JobStoreError, PermissionSyncJobStore, PermsStore, RepoRepository, UserRepository,
};
use crate::server::AppState;

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 100;

/// Query parameters for `permissionsSyncJobs`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPermissionsSyncJobsQuery {
    pub first: Option<u64>,
    pub after: Option<String>,
    pub reason_group: Option<String>,
    pub state: Option<String>,
    pub search_type: Option<String>,
    pub query: Option<String>,
    #[serde(rename = "userID")]
    pub user_id: Option<String>,
    #[serde(rename = "repoID")]
    pub repo_id: Option<String>,
    pub partial: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobReason {
    pub group: ReasonGroup,
    pub reason: String,
}

/// The user or repository a job syncs.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "__typename")]
pub enum JobSubject {
    Repository {
        id: String,
        name: String,
    },
    User {
        id: String,
        username: String,
        #[serde(rename = "displayName")]
        display_name: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsSyncJobNode {
    /// Node ID of the job
    #[schema(example = "UGVybWlzc2lvbnNTeW5jSm9iOjE=")]
    pub id: String,
    pub state: JobState,
    pub failure_message: Option<String>,
    pub reason: JobReason,
    pub cancellation_reason: Option<String>,
    #[serde(rename = "triggeredByUserID")]
    pub triggered_by_user_id: Option<String>,
    pub queued_at: DateTime<FixedOffset>,
    pub started_at: Option<DateTime<FixedOffset>>,
    pub finished_at: Option<DateTime<FixedOffset>>,
    pub process_after: Option<DateTime<FixedOffset>>,
    pub ran_for_ms: i64,
    pub num_resets: i32,
    pub num_failures: i32,
    pub last_heartbeat_at: Option<DateTime<FixedOffset>>,
    pub worker_hostname: String,
    pub cancel: bool,
    /// Missing when the subject row no longer exists
    pub subject: Option<JobSubject>,
    pub priority: JobPriority,
    pub no_perms: bool,
    pub invalidate_caches: bool,
    pub permissions_added: i32,
    pub permissions_removed: i32,
    pub permissions_found: i32,
    pub code_host_states: Vec<CodeHostStatus>,
    pub partial_success: bool,
    pub place_in_queue: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsSyncJobsConnection {
    pub total_count: u64,
    pub page_info: PageInfo,
    pub nodes: Vec<PermissionsSyncJobNode>,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct CancelPermissionsSyncJobRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelResultMessage {
    Success,
    NotFound,
    Error,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelPermissionsSyncJobResponse {
    pub result: CancelResultMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchPermissionsOptions {
    #[serde(default)]
    pub invalidate_caches: bool,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct ScheduleSyncRequest {
    #[serde(default)]
    pub options: FetchPermissionsOptions,
}

/// Mutation result carrying no data
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmptyResponse {
    pub always_nil: Option<String>,
}

impl EmptyResponse {
    fn new() -> Json<Self> {
        Json(Self { always_nil: None })
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissionInput {
    /// Username of the user to grant
    #[serde(rename = "bindID")]
    pub bind_id: String,
    #[schema(example = "READ")]
    pub permission: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetRepositoryPermissionsRequest {
    pub user_permissions: Vec<UserPermissionInput>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsSyncingStats {
    pub queue_size: u64,
    pub users_with_latest_job_failing: u64,
    pub repos_with_latest_job_failing: u64,
    pub users_with_no_permissions: u64,
    pub repos_with_no_permissions: u64,
    pub users_with_stale_permissions: u64,
    pub repos_with_stale_permissions: u64,
}

fn parse_enum<T: std::str::FromStr<Err = String>>(field: &str, value: Option<&str>) -> Result<Option<T>, ApiError> {
    value
        .filter(|value| !value.is_empty())
        .map(|value| {
            value.parse::<T>().map_err(|err| {
                validation_error(&format!("Invalid {field}"), serde_json::json!({ field: err }))
            })
        })
        .transpose()
}

/// List permission sync jobs
#[utoipa::path(
    get,
    path = "/permissions-sync-jobs",
    security(("bearer_auth" = [])),
    params(
        ("first" = Option<u64>, Query, description = "Page size (default 50, max 100)"),
        ("after" = Option<String>, Query, description = "Cursor from a previous page's endCursor"),
        ("reasonGroup" = Option<ReasonGroup>, Query, description = "Filter by reason group"),
        ("state" = Option<JobState>, Query, description = "Filter by state"),
        ("searchType" = Option<String>, Query, description = "REPOSITORY or USER"),
        ("query" = Option<String>, Query, description = "Repository name, username or display name substring"),
        ("userID" = Option<String>, Query, description = "User node ID"),
        ("repoID" = Option<String>, Query, description = "Repository node ID"),
        ("partial" = Option<bool>, Query, description = "Only partially successful jobs"),
        ("X-Actor-User-Id" = i32, Header, description = "Acting user")
    ),
    responses(
        (status = 200, description = "Matching jobs", body = PermissionsSyncJobsConnection),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 401, description = "Missing or invalid credentials", body = ApiError),
        (status = 403, description = "Not a site admin or the same user", body = ApiError)
    ),
    tag = "permissions"
)]
pub async fn list_permissions_sync_jobs(
    State(state): State<AppState>,
    actor: Actor,
    params: Result<Query<ListPermissionsSyncJobsQuery>, QueryRejection>,
) -> Result<Json<PermissionsSyncJobsConnection>, ApiError> {
    let Query(params) = params?;
    let user_id = params
        .user_id
        .as_deref()
        .map(|id| unmarshal_node_id(NodeKind::User, id, "userID"))
        .transpose()?;
    match user_id {
        Some(user_id) => actor.require_site_admin_or_same_user(user_id)?,
        None => actor.require_site_admin()?,
    }

    let first = params.first.unwrap_or(DEFAULT_PAGE_SIZE);
    if first == 0 || first > MAX_PAGE_SIZE {
        return Err(validation_error(
            "Invalid first",
            serde_json::json!({ "first": format!("must be between 1 and {MAX_PAGE_SIZE}") }),
        ));
    }

    let repo_id = params
        .repo_id
        .as_deref()
        .map(|id| unmarshal_node_id(NodeKind::Repository, id, "repoID"))
        .transpose()?;
    let after = params.after.as_deref().map(decode_job_cursor).transpose()?;

    let mut opts = ListJobsOptions {
        user_id,
        repo_id,
        reason_group: parse_enum("reasonGroup", params.reason_group.as_deref())?,
        state: parse_enum("state", params.state.as_deref())?,
        search_type: parse_enum::<SearchType>("searchType", params.search_type.as_deref())?,
        query: params.query.clone(),
        partial_success: params.partial.unwrap_or(false),
        ..ListJobsOptions::default()
    };

    let store = PermissionSyncJobStore::new(state.db.clone());
    let total_count = store.count(&opts).await?;

    opts.after = after;
    opts.first = Some(first + 1);
    opts.with_place_in_queue = true;
    let mut jobs = store.list(&opts).await?;

    let has_next_page = jobs.len() as u64 > first;
    jobs.truncate(first as usize);
    let end_cursor = jobs.last().map(|listed| encode_job_cursor(listed.job.id));

    let nodes = to_nodes(&state, jobs).await?;
    Ok(Json(PermissionsSyncJobsConnection {
        total_count,
        page_info: PageInfo {
            has_next_page,
            end_cursor,
        },
        nodes,
    }))
}

async fn to_nodes(state: &AppState, jobs: Vec<ListedJob>) -> Result<Vec<PermissionsSyncJobNode>, ApiError> {
    let user_ids: Vec<i32> = jobs.iter().filter_map(|listed| listed.job.user_id).collect();
    let repo_ids: Vec<i32> = jobs.iter().filter_map(|listed| listed.job.repository_id).collect();

    let users: HashMap<i32, user::Model> = UserRepository::new(state.db.clone())
        .get_by_ids(&user_ids)
        .await?
        .into_iter()
        .map(|user| (user.id, user))
        .collect();
    let repos: HashMap<i32, repo::Model> = RepoRepository::new(state.db.clone())
        .get_by_ids(&repo_ids)
        .await?
        .into_iter()
        .map(|repo| (repo.id, repo))
        .collect();

    Ok(jobs
        .into_iter()
        .map(|listed| {
            let subject = match (listed.job.user_id, listed.job.repository_id) {
                (Some(user_id), _) => users.get(&user_id).map(|user| JobSubject::User {
                    id: marshal_node_id(NodeKind::User, user.id),
                    username: user.username.clone(),
                    display_name: user.display_name.clone(),
                }),
                (None, Some(repo_id)) => repos.get(&repo_id).map(|repo| JobSubject::Repository {
                    id: marshal_node_id(NodeKind::Repository, repo.id),
                    name: repo.name.clone(),
                }),
                (None, None) => None,
            };
            job_node(listed, subject)
        })
        .collect())
}

fn job_node(listed: ListedJob, subject: Option<JobSubject>) -> PermissionsSyncJobNode {
    let ListedJob { job, place_in_queue } = listed;
    PermissionsSyncJobNode {
        id: marshal_node_id(NodeKind::PermissionsSyncJob, job.id),
        state: job.job_state(),
        reason: JobReason {
            group: job.reason_group(),
            reason: job.reason.clone(),
        },
        triggered_by_user_id: job
            .triggered_by_user_id
            .map(|id| marshal_node_id(NodeKind::User, id)),
        ran_for_ms: job.ran_for_ms(),
        priority: job.job_priority(),
        code_host_states: job.code_host_statuses(),
        subject,
        place_in_queue,
        failure_message: job.failure_message,
        cancellation_reason: job.cancellation_reason,
        queued_at: job.queued_at,
        started_at: job.started_at,
        finished_at: job.finished_at,
        process_after: job.process_after,
        num_resets: job.num_resets,
        num_failures: job.num_failures,
        last_heartbeat_at: job.last_heartbeat_at,
        worker_hostname: job.worker_hostname,
        cancel: job.cancel,
        no_perms: job.no_perms,
        invalidate_caches: job.invalidate_caches,
        permissions_added: job.permissions_added,
        permissions_removed: job.permissions_removed,
        permissions_found: job.permissions_found,
        partial_success: job.is_partial_success,
    }
}

/// Cancel a queued permission sync job
#[utoipa::path(
    post,
    path = "/permissions-sync-jobs/{job_id}/cancel",
    security(("bearer_auth" = [])),
    params(
        ("job_id" = String, Path, description = "Job node ID"),
        ("X-Actor-User-Id" = i32, Header, description = "Acting user")
    ),
    request_body(content = CancelPermissionsSyncJobRequest, description = "Optional cancellation reason"),
    responses(
        (status = 200, description = "Cancellation outcome", body = CancelPermissionsSyncJobResponse),
        (status = 400, description = "Malformed job ID", body = ApiError),
        (status = 403, description = "Not a site admin", body = ApiError)
    ),
    tag = "permissions"
)]
pub async fn cancel_permissions_sync_job(
    State(state): State<AppState>,
    actor: Actor,
    Path(job_id): Path<String>,
    body: Option<Json<CancelPermissionsSyncJobRequest>>,
) -> Result<Json<CancelPermissionsSyncJobResponse>, ApiError> {
    actor.require_site_admin()?;
    let id = unmarshal_node_id(NodeKind::PermissionsSyncJob, &job_id, "jobID")?;
    let reason = body.and_then(|Json(body)| body.reason);

    let store = PermissionSyncJobStore::new(state.db.clone());
    let (result, message) = match store.cancel_queued_job(id, reason).await {
        Ok(()) => {
            info!(job_id = id, actor_id = actor.user_id, "Permission sync job canceled by admin");
            (CancelResultMessage::Success, None)
        }
        Err(JobStoreError::NotFound) => (
            CancelResultMessage::NotFound,
            Some("No job that can be canceled found.".to_string()),
        ),
        Err(err) => {
            error!(job_id = id, error = %err, "Failed to cancel permission sync job");
            (CancelResultMessage::Error, Some(err.to_string()))
        }
    };

    Ok(Json(CancelPermissionsSyncJobResponse { result, message }))
}

/// Schedule a permissions sync for a user
#[utoipa::path(
    post,
    path = "/users/{user_id}/permissions-sync",
    security(("bearer_auth" = [])),
    params(
        ("user_id" = String, Path, description = "User node ID"),
        ("X-Actor-User-Id" = i32, Header, description = "Acting user")
    ),
    request_body(content = ScheduleSyncRequest, description = "Fetch options"),
    responses(
        (status = 200, description = "Job scheduled or already queued", body = EmptyResponse),
        (status = 403, description = "Not a site admin or the same user", body = ApiError),
        (status = 404, description = "User not found", body = ApiError)
    ),
    tag = "permissions"
)]
pub async fn schedule_user_permissions_sync(
    State(state): State<AppState>,
    actor: Actor,
    Path(user_id): Path<String>,
    body: Option<Json<ScheduleSyncRequest>>,
) -> Result<Json<EmptyResponse>, ApiError> {
    let user_id = unmarshal_node_id(NodeKind::User, &user_id, "userID")?;
    actor.require_site_admin_or_same_user(user_id)?;

    UserRepository::new(state.db.clone())
        .get_by_id(user_id)
        .await?
        .ok_or_else(|| not_found("User not found"))?;

    let options = body.map(|Json(body)| body.options).unwrap_or_default();
    PermissionSyncJobStore::new(state.db.clone())
        .create_user_sync_job(
            user_id,
            CreateJobOptions {
                priority: JobPriority::High,
                reason: reasons::REASON_MANUAL_USER_SYNC.to_string(),
                triggered_by_user_id: Some(actor.user_id),
                invalidate_caches: options.invalidate_caches,
                ..CreateJobOptions::default()
            },
        )
        .await?;

    Ok(EmptyResponse::new())
}

/// Schedule a permissions sync for a repository
#[utoipa::path(
    post,
    path = "/repositories/{repo_id}/permissions-sync",
    security(("bearer_auth" = [])),
    params(
        ("repo_id" = String, Path, description = "Repository node ID"),
        ("X-Actor-User-Id" = i32, Header, description = "Acting user")
    ),
    responses(
        (status = 200, description = "Job scheduled or already queued", body = EmptyResponse),
        (status = 403, description = "Not a site admin", body = ApiError),
        (status = 404, description = "Repository not found", body = ApiError)
    ),
    tag = "permissions"
)]
pub async fn schedule_repository_permissions_sync(
    State(state): State<AppState>,
    actor: Actor,
    Path(repo_id): Path<String>,
) -> Result<Json<EmptyResponse>, ApiError> {
    actor.require_site_admin()?;
    let repo_id = unmarshal_node_id(NodeKind::Repository, &repo_id, "repoID")?;

    RepoRepository::new(state.db.clone())
        .get_by_id(repo_id)
        .await?
        .ok_or_else(|| not_found("Repository not found"))?;

    PermissionSyncJobStore::new(state.db.clone())
        .create_repo_sync_job(
            repo_id,
            CreateJobOptions {
                priority: JobPriority::High,
                reason: reasons::REASON_MANUAL_REPO_SYNC.to_string(),
                triggered_by_user_id: Some(actor.user_id),
                ..CreateJobOptions::default()
            },
        )
        .await?;

    Ok(EmptyResponse::new())
}

/// Replace the explicit permissions of a repository
#[utoipa::path(
    put,
    path = "/repositories/{repo_id}/permissions",
    security(("bearer_auth" = [])),
    params(
        ("repo_id" = String, Path, description = "Repository node ID"),
        ("X-Actor-User-Id" = i32, Header, description = "Acting user")
    ),
    request_body(content = SetRepositoryPermissionsRequest, description = "Users to grant"),
    responses(
        (status = 200, description = "Permissions replaced", body = EmptyResponse),
        (status = 400, description = "Unknown users or unsupported permission", body = ApiError),
        (status = 403, description = "Not a site admin", body = ApiError),
        (status = 404, description = "Repository not found", body = ApiError)
    ),
    tag = "permissions"
)]
pub async fn set_repository_permissions_for_users(
    State(state): State<AppState>,
    actor: Actor,
    Path(repo_id): Path<String>,
    body: Result<Json<SetRepositoryPermissionsRequest>, JsonRejection>,
) -> Result<Json<EmptyResponse>, ApiError> {
    actor.require_site_admin()?;
    let Json(body) = body?;
    let repo_id = unmarshal_node_id(NodeKind::Repository, &repo_id, "repoID")?;

    if let Some(bad) = body
        .user_permissions
        .iter()
        .find(|perm| !perm.permission.eq_ignore_ascii_case("READ"))
    {
        return Err(validation_error(
            "Unsupported permission",
            serde_json::json!({ "permission": format!("only READ is supported, got {:?}", bad.permission) }),
        ));
    }

    RepoRepository::new(state.db.clone())
        .get_by_id(repo_id)
        .await?
        .ok_or_else(|| not_found("Repository not found"))?;

    let mut usernames: Vec<String> = body
        .user_permissions
        .into_iter()
        .map(|perm| perm.bind_id)
        .collect();
    usernames.sort();
    usernames.dedup();

    let users = UserRepository::new(state.db.clone())
        .get_by_usernames(&usernames)
        .await?;
    let unknown: Vec<&String> = usernames
        .iter()
        .filter(|name| !users.iter().any(|user| &user.username == *name))
        .collect();
    if !unknown.is_empty() {
        return Err(validation_error(
            "Unknown users",
            serde_json::json!({ "bindID": unknown }),
        ));
    }

    let user_ids: Vec<i32> = users.iter().map(|user| user.id).collect();
    let result = PermsStore::new(state.db.clone())
        .set_repo_permissions(repo_id, &user_ids, SOURCE_API)
        .await?;
    info!(
        repo_id,
        actor_id = actor.user_id,
        added = result.added,
        removed = result.removed,
        "Explicit repository permissions replaced"
    );

    Ok(EmptyResponse::new())
}

/// Permissions syncing statistics
#[utoipa::path(
    get,
    path = "/permissions-syncing-stats",
    security(("bearer_auth" = [])),
    params(("X-Actor-User-Id" = i32, Header, description = "Acting user")),
    responses(
        (status = 200, description = "Current statistics", body = PermissionsSyncingStats),
        (status = 403, description = "Not a site admin", body = ApiError)
    ),
    tag = "permissions"
)]
pub async fn permissions_syncing_stats(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<PermissionsSyncingStats>, ApiError> {
    actor.require_site_admin()?;

    let jobs = PermissionSyncJobStore::new(state.db.clone());
    let perms = PermsStore::new(state.db.clone());
    let stale_after = state.config.scheduler.stale_after();

    Ok(Json(PermissionsSyncingStats {
        queue_size: jobs.queue_size().await?,
        users_with_latest_job_failing: jobs.count_users_with_failing_sync_job().await?,
        repos_with_latest_job_failing: jobs.count_repos_with_failing_sync_job().await?,
        users_with_no_permissions: perms.count_users_with_no_permissions().await?,
        repos_with_no_permissions: perms.count_repos_with_no_permissions().await?,
        users_with_stale_permissions: perms.count_users_with_stale_permissions(stale_after).await?,
        repos_with_stale_permissions: perms.count_repos_with_stale_permissions(stale_after).await?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::permission_sync_job as job;

    fn queued_job() -> job::Model {
        let now = chrono::Utc::now().fixed_offset();
        job::Model {
            id: 3,
            state: "queued".into(),
            failure_message: None,
            reason: reasons::REASON_USER_NO_PERMS.into(),
            cancellation_reason: None,
            triggered_by_user_id: Some(9),
            queued_at: now,
            started_at: None,
            finished_at: None,
            process_after: None,
            num_resets: 0,
            num_failures: 0,
            last_heartbeat_at: None,
            worker_hostname: String::new(),
            cancel: false,
            repository_id: None,
            user_id: Some(1),
            priority: 10,
            no_perms: true,
            invalidate_caches: false,
            permissions_added: 0,
            permissions_removed: 0,
            permissions_found: 0,
            code_host_states: None,
            is_partial_success: false,
        }
    }

    #[test]
    fn job_node_uses_graphql_field_names() {
        let subject = JobSubject::User {
            id: marshal_node_id(NodeKind::User, 1),
            username: "alice".into(),
            display_name: None,
        };
        let node = job_node(
            ListedJob {
                job: queued_job(),
                place_in_queue: Some(1),
            },
            Some(subject),
        );
        let json = serde_json::to_value(&node).unwrap();

        assert_eq!(json["id"], marshal_node_id(NodeKind::PermissionsSyncJob, 3));
        assert_eq!(json["state"], "QUEUED");
        assert_eq!(json["priority"], "HIGH");
        assert_eq!(json["reason"]["group"], "SCHEDULE");
        assert_eq!(json["triggeredByUserID"], marshal_node_id(NodeKind::User, 9));
        assert_eq!(json["subject"]["__typename"], "User");
        assert_eq!(json["subject"]["username"], "alice");
        assert_eq!(json["placeInQueue"], 1);
        assert_eq!(json["ranForMs"], 0);
        assert_eq!(json["codeHostStates"], serde_json::json!([]));
    }

    #[test]
    fn enum_filters_are_case_insensitive() {
        assert_eq!(
            parse_enum::<JobState>("state", Some("errored")).unwrap(),
            Some(JobState::Errored)
        );
        assert_eq!(
            parse_enum::<SearchType>("searchType", Some("USER")).unwrap(),
            Some(SearchType::User)
        );
        assert_eq!(parse_enum::<ReasonGroup>("reasonGroup", None).unwrap(), None);
        assert!(parse_enum::<JobState>("state", Some("bogus")).is_err());
    }
}
