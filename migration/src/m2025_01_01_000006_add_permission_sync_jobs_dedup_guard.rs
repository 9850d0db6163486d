//! Adds partial unique indexes allowing at most one immediately runnable queued
//! job per user and per repository.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

const USER_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_permission_sync_jobs_unique_user \
     ON permission_sync_jobs (user_id) \
     WHERE state = 'queued' AND process_after IS NULL AND cancel = false AND user_id IS NOT NULL";

const REPO_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_permission_sync_jobs_unique_repo \
     ON permission_sync_jobs (repository_id) \
     WHERE state = 'queued' AND process_after IS NULL AND cancel = false AND repository_id IS NOT NULL";

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        for sql in [USER_INDEX, REPO_INDEX] {
            manager
                .get_connection()
                .execute(Statement::from_string(backend, sql.to_string()))
                .await?;
        }
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        for name in [
            "idx_permission_sync_jobs_unique_user",
            "idx_permission_sync_jobs_unique_repo",
        ] {
            manager
                .get_connection()
                .execute(Statement::from_string(
                    backend,
                    format!("DROP INDEX IF EXISTS {name}"),
                ))
                .await?;
        }
        Ok(())
    }
}
