//! Permission sync job entity model
//!
//! This module contains the SeaORM entity for the `permission_sync_jobs` table
//! together with the value types stored in its text and JSON columns.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;

/// Permission sync job entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "permission_sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Lower-case [`JobState`]
    pub state: String,

    pub failure_message: Option<String>,

    /// One of the `REASON_*` constants in [`reasons`]
    pub reason: String,

    pub cancellation_reason: Option<String>,

    /// User who requested the job manually, if any
    pub triggered_by_user_id: Option<i32>,

    pub queued_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Job is not eligible for dequeue before this instant
    pub process_after: Option<DateTimeWithTimeZone>,

    pub num_resets: i32,

    pub num_failures: i32,

    pub last_heartbeat_at: Option<DateTimeWithTimeZone>,

    pub worker_hostname: String,

    pub cancel: bool,

    pub repository_id: Option<i32>,

    pub user_id: Option<i32>,

    /// Numeric [`JobPriority`]
    pub priority: i32,

    /// Subject had no permissions when the job was queued
    pub no_perms: bool,

    pub invalidate_caches: bool,

    pub permissions_added: i32,

    pub permissions_removed: i32,

    pub permissions_found: i32,

    /// JSON array of [`CodeHostStatus`]
    #[sea_orm(column_type = "JsonBinary")]
    pub code_host_states: Option<JsonValue>,

    pub is_partial_success: bool,
}

impl Model {
    pub fn job_state(&self) -> JobState {
        self.state.parse().unwrap_or(JobState::Queued)
    }

    pub fn job_priority(&self) -> JobPriority {
        JobPriority::from_value(self.priority)
    }

    pub fn reason_group(&self) -> ReasonGroup {
        ReasonGroup::for_reason(&self.reason)
    }

    /// Decoded code host states; malformed JSON yields an empty list.
    pub fn code_host_statuses(&self) -> Vec<CodeHostStatus> {
        self.code_host_states
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// Milliseconds between start and finish, 0 when either is missing.
    pub fn ran_for_ms(&self) -> i64 {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => (finished - started).num_milliseconds().max(0),
            _ => 0,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,
    #[sea_orm(
        belongs_to = "super::repo::Entity",
        from = "Column::RepositoryId",
        to = "super::repo::Column::Id"
    )]
    Repo,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::repo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Repo.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Lifecycle state of a job. Stored lower-case, exposed upper-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Processing,
    Errored,
    Failed,
    Completed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Errored => "errored",
            JobState::Failed => "failed",
            JobState::Completed => "completed",
            JobState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "errored" => Ok(JobState::Errored),
            "failed" => Ok(JobState::Failed),
            "completed" => Ok(JobState::Completed),
            "canceled" => Ok(JobState::Canceled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Dequeue priority. Higher values run first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    #[default]
    Low,
    Medium,
    High,
}

impl JobPriority {
    pub fn value(&self) -> i32 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Medium => 5,
            JobPriority::High => 10,
        }
    }

    pub fn from_value(value: i32) -> Self {
        match value {
            10 => JobPriority::High,
            5 => JobPriority::Medium,
            _ => JobPriority::Low,
        }
    }
}

/// Job reasons. Values are stored verbatim in the `reason` column.
pub mod reasons {
    pub const REASON_MANUAL_REPO_SYNC: &str = "REASON_MANUAL_REPO_SYNC";
    pub const REASON_MANUAL_USER_SYNC: &str = "REASON_MANUAL_USER_SYNC";

    pub const REASON_GITHUB_USER_EVENT: &str = "REASON_GITHUB_USER_EVENT";
    pub const REASON_GITHUB_USER_ADDED_EVENT: &str = "REASON_GITHUB_USER_ADDED_EVENT";
    pub const REASON_GITHUB_USER_REMOVED_EVENT: &str = "REASON_GITHUB_USER_REMOVED_EVENT";
    pub const REASON_GITHUB_USER_MEMBERSHIP_ADDED_EVENT: &str =
        "REASON_GITHUB_USER_MEMBERSHIP_ADDED_EVENT";
    pub const REASON_GITHUB_USER_MEMBERSHIP_REMOVED_EVENT: &str =
        "REASON_GITHUB_USER_MEMBERSHIP_REMOVED_EVENT";
    pub const REASON_GITHUB_TEAM_ADDED_TO_REPO_EVENT: &str =
        "REASON_GITHUB_TEAM_ADDED_TO_REPO_EVENT";
    pub const REASON_GITHUB_TEAM_REMOVED_FROM_REPO_EVENT: &str =
        "REASON_GITHUB_TEAM_REMOVED_FROM_REPO_EVENT";
    pub const REASON_GITHUB_ORG_MEMBER_ADDED_EVENT: &str = "REASON_GITHUB_ORG_MEMBER_ADDED_EVENT";
    pub const REASON_GITHUB_ORG_MEMBER_REMOVED_EVENT: &str =
        "REASON_GITHUB_ORG_MEMBER_REMOVED_EVENT";
    pub const REASON_GITHUB_REPO_EVENT: &str = "REASON_GITHUB_REPO_EVENT";
    pub const REASON_GITHUB_REPO_MADE_PRIVATE_EVENT: &str = "REASON_GITHUB_REPO_MADE_PRIVATE_EVENT";

    pub const REASON_USER_OUTDATED_PERMS: &str = "REASON_USER_OUTDATED_PERMS";
    pub const REASON_USER_NO_PERMS: &str = "REASON_USER_NO_PERMS";
    pub const REASON_REPO_OUTDATED_PERMS: &str = "REASON_REPO_OUTDATED_PERMS";
    pub const REASON_REPO_NO_PERMS: &str = "REASON_REPO_NO_PERMS";
    pub const REASON_REPO_UPDATED_FROM_CODE_HOST: &str = "REASON_REPO_UPDATED_FROM_CODE_HOST";

    pub const REASON_USER_EMAIL_REMOVED: &str = "REASON_USER_EMAIL_REMOVED";
    pub const REASON_USER_EMAIL_VERIFIED: &str = "REASON_USER_EMAIL_VERIFIED";
    pub const REASON_USER_ADDED_TO_ORG: &str = "REASON_USER_ADDED_TO_ORG";
    pub const REASON_USER_REMOVED_FROM_ORG: &str = "REASON_USER_REMOVED_FROM_ORG";
    pub const REASON_USER_ACCEPTED_ORG_INVITE: &str = "REASON_USER_ACCEPTED_ORG_INVITE";
    pub const REASON_USER_ADDED: &str = "REASON_USER_ADDED";
    pub const REASON_EXTERNAL_ACCOUNT_ADDED: &str = "REASON_EXTERNAL_ACCOUNT_ADDED";
    pub const REASON_EXTERNAL_ACCOUNT_DELETED: &str = "REASON_EXTERNAL_ACCOUNT_DELETED";
}

/// Coarse grouping of job reasons used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonGroup {
    Manual,
    Webhook,
    Schedule,
    Sourcegraph,
    Unknown,
}

const MANUAL_REASONS: &[&str] = &[
    reasons::REASON_MANUAL_REPO_SYNC,
    reasons::REASON_MANUAL_USER_SYNC,
];

const WEBHOOK_REASONS: &[&str] = &[
    reasons::REASON_GITHUB_USER_EVENT,
    reasons::REASON_GITHUB_USER_ADDED_EVENT,
    reasons::REASON_GITHUB_USER_REMOVED_EVENT,
    reasons::REASON_GITHUB_USER_MEMBERSHIP_ADDED_EVENT,
    reasons::REASON_GITHUB_USER_MEMBERSHIP_REMOVED_EVENT,
    reasons::REASON_GITHUB_TEAM_ADDED_TO_REPO_EVENT,
    reasons::REASON_GITHUB_TEAM_REMOVED_FROM_REPO_EVENT,
    reasons::REASON_GITHUB_ORG_MEMBER_ADDED_EVENT,
    reasons::REASON_GITHUB_ORG_MEMBER_REMOVED_EVENT,
    reasons::REASON_GITHUB_REPO_EVENT,
    reasons::REASON_GITHUB_REPO_MADE_PRIVATE_EVENT,
];

const SCHEDULE_REASONS: &[&str] = &[
    reasons::REASON_USER_OUTDATED_PERMS,
    reasons::REASON_USER_NO_PERMS,
    reasons::REASON_REPO_OUTDATED_PERMS,
    reasons::REASON_REPO_NO_PERMS,
    reasons::REASON_REPO_UPDATED_FROM_CODE_HOST,
];

const SOURCEGRAPH_REASONS: &[&str] = &[
    reasons::REASON_USER_EMAIL_REMOVED,
    reasons::REASON_USER_EMAIL_VERIFIED,
    reasons::REASON_USER_ADDED_TO_ORG,
    reasons::REASON_USER_REMOVED_FROM_ORG,
    reasons::REASON_USER_ACCEPTED_ORG_INVITE,
];

// Belong to the SOURCEGRAPH group but are not matched by its filter.
const SOURCEGRAPH_UNLISTED_REASONS: &[&str] = &[
    reasons::REASON_USER_ADDED,
    reasons::REASON_EXTERNAL_ACCOUNT_ADDED,
    reasons::REASON_EXTERNAL_ACCOUNT_DELETED,
];

impl ReasonGroup {
    /// Reasons matched when filtering by this group.
    pub fn reasons(&self) -> &'static [&'static str] {
        match self {
            ReasonGroup::Manual => MANUAL_REASONS,
            ReasonGroup::Webhook => WEBHOOK_REASONS,
            ReasonGroup::Schedule => SCHEDULE_REASONS,
            ReasonGroup::Sourcegraph => SOURCEGRAPH_REASONS,
            ReasonGroup::Unknown => &[],
        }
    }

    pub fn for_reason(reason: &str) -> Self {
        if MANUAL_REASONS.contains(&reason) {
            ReasonGroup::Manual
        } else if WEBHOOK_REASONS.contains(&reason) {
            ReasonGroup::Webhook
        } else if SCHEDULE_REASONS.contains(&reason) {
            ReasonGroup::Schedule
        } else if SOURCEGRAPH_REASONS.contains(&reason)
            || SOURCEGRAPH_UNLISTED_REASONS.contains(&reason)
        {
            ReasonGroup::Sourcegraph
        } else {
            ReasonGroup::Unknown
        }
    }
}

impl FromStr for ReasonGroup {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(ReasonGroup::Manual),
            "WEBHOOK" => Ok(ReasonGroup::Webhook),
            "SCHEDULE" => Ok(ReasonGroup::Schedule),
            "SOURCEGRAPH" => Ok(ReasonGroup::Sourcegraph),
            "UNKNOWN" => Ok(ReasonGroup::Unknown),
            other => Err(format!("unknown reason group: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CodeHostStatusKind {
    Success,
    Error,
}

/// Outcome of talking to one code host during a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CodeHostStatus {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    pub provider_type: String,
    pub status: CodeHostStatusKind,
    pub message: String,
}

impl CodeHostStatus {
    pub fn success(provider_id: &str, provider_type: &str, action: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            provider_type: provider_type.to_string(),
            status: CodeHostStatusKind::Success,
            message: action.to_string(),
        }
    }

    pub fn error(provider_id: &str, provider_type: &str, action: &str, error: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            provider_type: provider_type.to_string(),
            status: CodeHostStatusKind::Error,
            message: format!("{action}: {error}"),
        }
    }
}

/// Returns `(succeeded, failed)` counts.
pub fn count_statuses(statuses: &[CodeHostStatus]) -> (usize, usize) {
    statuses
        .iter()
        .fold((0, 0), |(ok, failed), status| match status.status {
            CodeHostStatusKind::Success => (ok + 1, failed),
            CodeHostStatusKind::Error => (ok, failed + 1),
        })
}
