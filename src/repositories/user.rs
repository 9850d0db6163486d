//! User lookups

use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};

use crate::models::user::{Column, Entity, Model};

pub struct UserRepository {
    db: DatabaseConnection,
}

impl UserRepository {
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

    /// Users with any of the given usernames; unknown names are simply absent.
    pub async fn get_by_usernames(&self, usernames: &[String]) -> Result<Vec<Model>, DbErr> {
        if usernames.is_empty() {
            return Ok(Vec::new());
        }
        Entity::find()
            .filter(Column::Username.is_in(usernames.iter().cloned()))
            .all(&self.db)
            .await
    }
}
