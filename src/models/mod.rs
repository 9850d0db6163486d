//! # Data Models
//!
//! This module contains the SeaORM entities and shared response types.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod external_account;
pub mod permission_sync_job;
pub mod repo;
pub mod user;
pub mod user_repo_permission;

pub use external_account::Entity as ExternalAccount;
pub use permission_sync_job::Entity as PermissionSyncJob;
pub use repo::Entity as Repo;
pub use user::Entity as User;
pub use user_repo_permission::Entity as UserRepoPermission;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "permsync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
