//! Repository entity model
//!
//! A repository mirrors one code host project and carries the code-host
//! qualified identity used by authorization providers.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

use crate::extsvc::ExternalRepoSpec;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repos")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Full name, e.g. `github.com/owner/name`
    #[sea_orm(unique)]
    pub name: String,

    /// Private repositories are the only ones with restricted permissions
    pub private: bool,

    pub external_service_type: String,

    /// Normalized code host base URL, e.g. `https://github.com/`
    pub external_service_id: String,

    /// Code host identifier of the repository (GitHub node ID, GitLab project ID)
    pub external_id: String,

    pub created_at: DateTimeWithTimeZone,

    pub perms_synced_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    pub fn external_repo(&self) -> ExternalRepoSpec {
        ExternalRepoSpec {
            id: self.external_id.clone(),
            service_type: self.external_service_type.clone(),
            service_id: self.external_service_id.clone(),
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
