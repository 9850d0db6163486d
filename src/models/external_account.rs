//! External account entity model
//!
//! Links a user to their identity on a code host, including the OAuth token
//! used to fetch permissions on their behalf.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

use crate::extsvc::ExternalAccount;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "user_external_accounts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub user_id: i32,

    pub service_type: String,

    pub service_id: String,

    /// Account identifier on the code host (GitHub/GitLab numeric user ID)
    pub account_id: String,

    pub access_token: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

impl From<Model> for ExternalAccount {
    fn from(model: Model) -> Self {
        ExternalAccount {
            id: model.id,
            user_id: model.user_id,
            service_type: model.service_type,
            service_id: model.service_id,
            account_id: model.account_id,
            access_token: model.access_token,
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
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
