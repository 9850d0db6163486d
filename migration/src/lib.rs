//! Database migrations for the permissions sync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_01_01_000001_create_users;
mod m2025_01_01_000002_create_repos;
mod m2025_01_01_000003_create_user_external_accounts;
mod m2025_01_01_000004_create_user_repo_permissions;
mod m2025_01_01_000005_create_permission_sync_jobs;
mod m2025_01_01_000006_add_permission_sync_jobs_dedup_guard;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_01_01_000001_create_users::Migration),
            Box::new(m2025_01_01_000002_create_repos::Migration),
            Box::new(m2025_01_01_000003_create_user_external_accounts::Migration),
            Box::new(m2025_01_01_000004_create_user_repo_permissions::Migration),
            Box::new(m2025_01_01_000005_create_permission_sync_jobs::Migration),
            Box::new(m2025_01_01_000006_add_permission_sync_jobs_dedup_guard::Migration),
        ]
    }
}
