//! Initial schema: relay nodes, tunnel registry, monitor history, settings

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Relay node directory
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(RelayNodes::Table)
                    .if_not_exists()
                    .col(pk_auto(RelayNodes::Id))
                    .col(string_len(RelayNodes::Name, 255).not_null().unique_key())
                    .col(string_len(RelayNodes::Role, 8).not_null())
                    .col(string_len(RelayNodes::Address, 255).not_null())
                    .col(integer(RelayNodes::SshPort).not_null().default(22))
                    .col(string_len_null(RelayNodes::SshUser, 64))
                    .col(
                        timestamp_with_time_zone(RelayNodes::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Tunnel registry
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Tunnels::Table)
                    .if_not_exists()
                    .col(pk_auto(Tunnels::Id))
                    .col(integer(Tunnels::NearNodeId).not_null())
                    .col(integer_null(Tunnels::FarNodeId))
                    .col(string_len(Tunnels::Engine, 32).not_null())
                    .col(string_len(Tunnels::Transport, 32).not_null())
                    .col(integer(Tunnels::Port).not_null())
                    .col(
                        string_len(Tunnels::Status, 16)
                            .not_null()
                            .default("inactive"),
                    )
                    .col(double(Tunnels::Score).not_null().default(0.0))
                    .col(double_null(Tunnels::LatencyMs))
                    .col(double_null(Tunnels::JitterMs))
                    .col(integer(Tunnels::Priority).not_null().default(0))
                    .col(text(Tunnels::Config).not_null())
                    .col(text_null(Tunnels::LastError))
                    .col(integer_null(Tunnels::Pid))
                    .col(
                        timestamp_with_time_zone(Tunnels::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Tunnels::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnels_near_node_id")
                            .from(Tunnels::Table, Tunnels::NearNodeId)
                            .to(RelayNodes::Table, RelayNodes::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnels_far_node_id")
                            .from(Tunnels::Table, Tunnels::FarNodeId)
                            .to(RelayNodes::Table, RelayNodes::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Port conflict checks filter on (port, status)
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_port_status")
                    .table(Tunnels::Table)
                    .col(Tunnels::Port)
                    .col(Tunnels::Status)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. Monitor sample history
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(MonitorSamples::Table)
                    .if_not_exists()
                    .col(pk_auto(MonitorSamples::Id))
                    .col(integer_null(MonitorSamples::TunnelId))
                    .col(string_len_null(MonitorSamples::Engine, 32))
                    .col(double(MonitorSamples::LatencyMs).not_null())
                    .col(double(MonitorSamples::JitterMs).not_null())
                    .col(double(MonitorSamples::PacketLoss).not_null())
                    .col(double(MonitorSamples::Score).not_null())
                    .col(string_len(MonitorSamples::Status, 16).not_null())
                    .col(
                        timestamp_with_time_zone(MonitorSamples::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_monitor_samples_tunnel_id")
                            .from(MonitorSamples::Table, MonitorSamples::TunnelId)
                            .to(Tunnels::Table, Tunnels::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Retention purge scans by age
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_monitor_samples_created_at")
                    .table(MonitorSamples::Table)
                    .col(MonitorSamples::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. Settings store
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Settings::Table)
                    .if_not_exists()
                    .col(string_len(Settings::Key, 64).primary_key())
                    .col(text(Settings::Value).not_null())
                    .col(
                        timestamp_with_time_zone(Settings::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Settings::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(MonitorSamples::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tunnels::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RelayNodes::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum RelayNodes {
    Table,
    Id,
    Name,
    Role,
    Address,
    SshPort,
    SshUser,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Tunnels {
    Table,
    Id,
    NearNodeId,
    FarNodeId,
    Engine,
    Transport,
    Port,
    Status,
    Score,
    LatencyMs,
    JitterMs,
    Priority,
    Config,
    LastError,
    Pid,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum MonitorSamples {
    Table,
    Id,
    TunnelId,
    Engine,
    LatencyMs,
    JitterMs,
    PacketLoss,
    Score,
    Status,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Settings {
    Table,
    Key,
    Value,
    UpdatedAt,
}
