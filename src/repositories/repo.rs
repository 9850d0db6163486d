//! Repository lookups

use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};

use crate::models::repo::{Column, Entity, Model};

pub struct RepoRepository {
    db: DatabaseConnection,
}

impl RepoRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get_by_id(&self, id: i32) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(id).one(&self.db).await
    }

    pub async fn get_by_ids(&self, ids: &[i32]) -> Result<Vec<Model>, DbErr> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Entity::find()
            .filter(Column::Id.is_in(ids.iter().copied()))
            .all(&self.db)
            .await
    }

    /// Repositories of one code host whose external id is in `external_ids`.
    pub async fn get_by_external_ids(
        &self,
        service_type: &str,
        service_id: &str,
        external_ids: &[String],
    ) -> Result<Vec<Model>, DbErr> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        Entity::find()
            .filter(Column::ExternalServiceType.eq(service_type))
            .filter(Column::ExternalServiceId.eq(service_id))
            .filter(Column::ExternalId.is_in(external_ids.iter().cloned()))
            .all(&self.db)
            .await
    }
}
