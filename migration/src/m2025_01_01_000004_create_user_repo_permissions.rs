//! Migration to create the user_repo_permissions table.
//!
//! Each row grants read access on one repository to one user. `source` records
//! whether the grant came from a code host sync or was set explicitly.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UserRepoPermissions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserRepoPermissions::UserId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserRepoPermissions::RepoId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserRepoPermissions::Source)
                            .text()
                            .not_null()
                            .default("sync"),
                    )
                    .col(
                        ColumnDef::new(UserRepoPermissions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(UserRepoPermissions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(UserRepoPermissions::UserId)
                            .col(UserRepoPermissions::RepoId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_repo_permissions_user_id")
                            .from(UserRepoPermissions::Table, UserRepoPermissions::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_repo_permissions_repo_id")
                            .from(UserRepoPermissions::Table, UserRepoPermissions::RepoId)
                            .to(Repos::Table, Repos::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_repo_permissions_repo_id")
                    .table(UserRepoPermissions::Table)
                    .col(UserRepoPermissions::RepoId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserRepoPermissions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum UserRepoPermissions {
    Table,
    UserId,
    RepoId,
    Source,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Repos {
    Table,
    Id,
}
