//! Initial schema: tunnels, services, checks

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Tunnels::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Tunnels::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Tunnels::Name)
                            .string_len(255)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Tunnels::Token)
                            .string_len(128)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Tunnels::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Tunnels::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Services::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Services::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Services::TunnelId).string_len(64).not_null())
                    .col(ColumnDef::new(Services::Type).string_len(16).not_null())
                    .col(ColumnDef::new(Services::Domain).string_len(255).null())
                    .col(
                        ColumnDef::new(Services::PathPrefix)
                            .string_len(255)
                            .not_null()
                            .default("/"),
                    )
                    .col(
                        ColumnDef::new(Services::TlsMode)
                            .string_len(16)
                            .not_null()
                            .default("terminate"),
                    )
                    .col(ColumnDef::new(Services::ListenAddr).string_len(255).null())
                    .col(
                        ColumnDef::new(Services::TargetAddr)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Services::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Services::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_services_tunnel_id")
                            .from(Services::Table, Services::TunnelId)
                            .to(Tunnels::Table, Tunnels::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_services_tunnel_id")
                    .table(Services::Table)
                    .col(Services::TunnelId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Checks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Checks::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Checks::TunnelId).string_len(64).not_null())
                    .col(ColumnDef::new(Checks::Status).string_len(8).not_null())
                    .col(ColumnDef::new(Checks::LatencyMs).integer().null())
                    .col(ColumnDef::new(Checks::Error).text().null())
                    .col(
                        ColumnDef::new(Checks::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_checks_tunnel_id")
                            .from(Checks::Table, Checks::TunnelId)
                            .to(Tunnels::Table, Tunnels::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_checks_tunnel_time")
                    .table(Checks::Table)
                    .col(Checks::TunnelId)
                    .col((Checks::CreatedAt, IndexOrder::Desc))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Checks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Services::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tunnels::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Tunnels {
    Table,
    Id,
    Name,
    Token,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Services {
    Table,
    Id,
    TunnelId,
    Type,
    Domain,
    PathPrefix,
    TlsMode,
    ListenAddr,
    TargetAddr,
    Enabled,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Checks {
    Table,
    Id,
    TunnelId,
    Status,
    LatencyMs,
    Error,
    CreatedAt,
}
