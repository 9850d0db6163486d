//! Permission rows and per-subject sync bookkeeping.

use std::collections::{BTreeSet, HashMap};

use chrono::{Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use tracing::debug;

use crate::models::{repo, user, user_repo_permission as perm};

/// Grants computed by the sync worker.
pub const SOURCE_SYNC: &str = "sync";
/// Grants set explicitly through the admin API.
pub const SOURCE_API: &str = "api";

/// Rows per insert or delete statement. Five bound columns per row keeps a
/// batch under the Postgres and SQLite bind-parameter limits.
pub const DEFAULT_WRITE_BATCH_SIZE: usize = 5000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SetPermissionsResult {
    pub added: i32,
    pub removed: i32,
    pub found: i32,
}

/// Subjects the scheduler should enqueue, split by reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectsNeedingSync {
    pub no_perms: Vec<i32>,
    pub stale: Vec<i32>,
}

#[derive(Clone, Copy)]
enum Side {
    User,
    Repo,
}

pub struct PermsStore {
    db: DatabaseConnection,
    write_batch_size: usize,
}

impl PermsStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            write_batch_size: DEFAULT_WRITE_BATCH_SIZE,
        }
    }

    pub fn with_write_batch_size(mut self, size: usize) -> Self {
        self.write_batch_size = size.max(1);
        self
    }

    /// Replace the `source` grants of a user with `repo_ids`.
    pub async fn set_user_repo_permissions(
        &self,
        user_id: i32,
        repo_ids: &[i32],
        source: &str,
    ) -> Result<SetPermissionsResult, DbErr> {
        let txn = self.db.begin().await?;
        let result = replace_permissions(
            &txn,
            Side::User,
            user_id,
            repo_ids,
            source,
            self.write_batch_size,
        )
        .await?;
        user::Entity::update_many()
            .col_expr(
                user::Column::PermsSyncedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(user::Column::Id.eq(user_id))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        debug!(user_id, source, added = result.added, removed = result.removed, "User permissions replaced");
        Ok(result)
    }

    /// Replace the `source` grants on a repository with `user_ids`.
    pub async fn set_repo_permissions(
        &self,
        repo_id: i32,
        user_ids: &[i32],
        source: &str,
    ) -> Result<SetPermissionsResult, DbErr> {
        let txn = self.db.begin().await?;
        let result = replace_permissions(
            &txn,
            Side::Repo,
            repo_id,
            user_ids,
            source,
            self.write_batch_size,
        )
        .await?;
        repo::Entity::update_many()
            .col_expr(
                repo::Column::PermsSyncedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(repo::Column::Id.eq(repo_id))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        debug!(repo_id, source, added = result.added, removed = result.removed, "Repository permissions replaced");
        Ok(result)
    }

    /// Stamp `perms_synced_at` on a repository without touching its grants.
    pub async fn mark_repo_synced(&self, repo_id: i32) -> Result<(), DbErr> {
        repo::Entity::update_many()
            .col_expr(
                repo::Column::PermsSyncedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(repo::Column::Id.eq(repo_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Repository ids granted to the user with the given source.
    pub async fn repo_ids_for_user(&self, user_id: i32, source: &str) -> Result<Vec<i32>, DbErr> {
        perm::Entity::find()
            .select_only()
            .column(perm::Column::RepoId)
            .filter(perm::Column::UserId.eq(user_id))
            .filter(perm::Column::Source.eq(source))
            .order_by_asc(perm::Column::RepoId)
            .into_tuple()
            .all(&self.db)
            .await
    }

    /// User ids granted on the repository with the given source.
    pub async fn user_ids_for_repo(&self, repo_id: i32, source: &str) -> Result<Vec<i32>, DbErr> {
        perm::Entity::find()
            .select_only()
            .column(perm::Column::UserId)
            .filter(perm::Column::RepoId.eq(repo_id))
            .filter(perm::Column::Source.eq(source))
            .order_by_asc(perm::Column::UserId)
            .into_tuple()
            .all(&self.db)
            .await
    }

    /// Users whose permissions have never been synced.
    pub async fn count_users_with_no_permissions(&self) -> Result<u64, DbErr> {
        user::Entity::find()
            .filter(user::Column::PermsSyncedAt.is_null())
            .count(&self.db)
            .await
    }

    /// Private repositories whose permissions have never been synced.
    pub async fn count_repos_with_no_permissions(&self) -> Result<u64, DbErr> {
        repo::Entity::find()
            .filter(repo::Column::Private.eq(true))
            .filter(repo::Column::PermsSyncedAt.is_null())
            .count(&self.db)
            .await
    }

    pub async fn count_users_with_stale_permissions(
        &self,
        stale_after: Duration,
    ) -> Result<u64, DbErr> {
        let cutoff = Utc::now().fixed_offset() - stale_after;
        user::Entity::find()
            .filter(user::Column::PermsSyncedAt.lt(cutoff))
            .count(&self.db)
            .await
    }

    pub async fn count_repos_with_stale_permissions(
        &self,
        stale_after: Duration,
    ) -> Result<u64, DbErr> {
        let cutoff = Utc::now().fixed_offset() - stale_after;
        repo::Entity::find()
            .filter(repo::Column::Private.eq(true))
            .filter(repo::Column::PermsSyncedAt.lt(cutoff))
            .count(&self.db)
            .await
    }

    /// Never-synced and stale users, oldest first, at most `limit` of each.
    pub async fn user_ids_needing_sync(
        &self,
        stale_after: Duration,
        limit: u64,
    ) -> Result<SubjectsNeedingSync, DbErr> {
        let cutoff = Utc::now().fixed_offset() - stale_after;
        let no_perms = user::Entity::find()
            .select_only()
            .column(user::Column::Id)
            .filter(user::Column::PermsSyncedAt.is_null())
            .order_by_asc(user::Column::Id)
            .limit(limit)
            .into_tuple()
            .all(&self.db)
            .await?;
        let stale = user::Entity::find()
            .select_only()
            .column(user::Column::Id)
            .filter(user::Column::PermsSyncedAt.lt(cutoff))
            .order_by_asc(user::Column::PermsSyncedAt)
            .order_by_asc(user::Column::Id)
            .limit(limit)
            .into_tuple()
            .all(&self.db)
            .await?;
        Ok(SubjectsNeedingSync { no_perms, stale })
    }

    /// Never-synced and stale private repositories, oldest first, at most
    /// `limit` of each.
    pub async fn repo_ids_needing_sync(
        &self,
        stale_after: Duration,
        limit: u64,
    ) -> Result<SubjectsNeedingSync, DbErr> {
        let cutoff = Utc::now().fixed_offset() - stale_after;
        let no_perms = repo::Entity::find()
            .select_only()
            .column(repo::Column::Id)
            .filter(repo::Column::Private.eq(true))
            .filter(repo::Column::PermsSyncedAt.is_null())
            .order_by_asc(repo::Column::Id)
            .limit(limit)
            .into_tuple()
            .all(&self.db)
            .await?;
        let stale = repo::Entity::find()
            .select_only()
            .column(repo::Column::Id)
            .filter(repo::Column::Private.eq(true))
            .filter(repo::Column::PermsSyncedAt.lt(cutoff))
            .order_by_asc(repo::Column::PermsSyncedAt)
            .order_by_asc(repo::Column::Id)
            .limit(limit)
            .into_tuple()
            .all(&self.db)
            .await?;
        Ok(SubjectsNeedingSync { no_perms, stale })
    }
}

/// Diff the subject's rows for `source` against `wanted` and apply the
/// difference in batches of `batch_size` rows. Rows owned by another source
/// are left untouched.
async fn replace_permissions<C: ConnectionTrait>(
    conn: &C,
    side: Side,
    subject_id: i32,
    wanted: &[i32],
    source: &str,
    batch_size: usize,
) -> Result<SetPermissionsResult, DbErr> {
    let (subject_col, other_col) = match side {
        Side::User => (perm::Column::UserId, perm::Column::RepoId),
        Side::Repo => (perm::Column::RepoId, perm::Column::UserId),
    };

    let existing: HashMap<i32, String> = perm::Entity::find()
        .select_only()
        .column(other_col)
        .column(perm::Column::Source)
        .filter(subject_col.eq(subject_id))
        .into_tuple::<(i32, String)>()
        .all(conn)
        .await?
        .into_iter()
        .collect();

    let wanted: BTreeSet<i32> = wanted.iter().copied().collect();
    let to_remove: Vec<i32> = existing
        .iter()
        .filter(|(id, row_source)| row_source.as_str() == source && !wanted.contains(*id))
        .map(|(id, _)| *id)
        .collect();
    let to_add: Vec<i32> = wanted
        .iter()
        .copied()
        .filter(|id| !existing.contains_key(id))
        .collect();

    for batch in to_remove.chunks(batch_size) {
        perm::Entity::delete_many()
            .filter(
                Condition::all()
                    .add(subject_col.eq(subject_id))
                    .add(other_col.is_in(batch.iter().copied()))
                    .add(perm::Column::Source.eq(source)),
            )
            .exec(conn)
            .await?;
    }

    let now = Utc::now().fixed_offset();
    for batch in to_add.chunks(batch_size) {
        let rows = batch.iter().map(|&other_id| {
            let (user_id, repo_id) = match side {
                Side::User => (subject_id, other_id),
                Side::Repo => (other_id, subject_id),
            };
            perm::ActiveModel {
                user_id: Set(user_id),
                repo_id: Set(repo_id),
                source: Set(source.to_string()),
                created_at: Set(now),
                updated_at: Set(now),
            }
        });
        perm::Entity::insert_many(rows).exec(conn).await?;
    }

    Ok(SetPermissionsResult {
        added: to_add.len() as i32,
        removed: to_remove.len() as i32,
        found: wanted.len() as i32,
    })
}
