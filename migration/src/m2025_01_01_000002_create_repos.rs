//! Migration to create the repos table.
//!
//! A repository is identified on its code host by the triple
//! (external_service_type, external_service_id, external_id).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Repos::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Repos::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Repos::Name).text().not_null().unique_key())
                    .col(
                        ColumnDef::new(Repos::Private)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Repos::ExternalServiceType).text().not_null())
                    .col(ColumnDef::new(Repos::ExternalServiceId).text().not_null())
                    .col(ColumnDef::new(Repos::ExternalId).text().not_null())
                    .col(
                        ColumnDef::new(Repos::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Repos::PermsSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repos_external_repo")
                    .table(Repos::Table)
                    .col(Repos::ExternalServiceType)
                    .col(Repos::ExternalServiceId)
                    .col(Repos::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_repos_external_repo").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Repos::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Repos {
    Table,
    Id,
    Name,
    Private,
    ExternalServiceType,
    ExternalServiceId,
    ExternalId,
    CreatedAt,
    PermsSyncedAt,
}
