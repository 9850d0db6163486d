//! External account lookups

use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder};

use crate::models::external_account::{Column, Entity, Model};

pub struct ExternalAccountRepository {
    db: DatabaseConnection,
}

impl ExternalAccountRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn list_for_user(&self, user_id: i32) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await
    }

    /// Accounts on one code host whose account id is in `account_ids`.
    pub async fn get_by_account_ids(
        &self,
        service_type: &str,
        service_id: &str,
        account_ids: &[String],
    ) -> Result<Vec<Model>, DbErr> {
        if account_ids.is_empty() {
            return Ok(Vec::new());
        }
        Entity::find()
            .filter(Column::ServiceType.eq(service_type))
            .filter(Column::ServiceId.eq(service_id))
            .filter(Column::AccountId.is_in(account_ids.iter().cloned()))
            .all(&self.db)
            .await
    }
}
