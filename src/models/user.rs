//! User entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Unique login name; also the bind ID for explicit permissions
    #[sea_orm(unique)]
    pub username: String,

    pub display_name: Option<String>,

    pub site_admin: bool,

    pub created_at: DateTimeWithTimeZone,

    /// Last time the user's permissions were recomputed, `None` if never
    pub perms_synced_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::external_account::Entity")]
    ExternalAccount,
}

impl Related<super::external_account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalAccount.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
