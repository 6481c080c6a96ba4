//! Integration tests for relaymesh-relay-db
//!
//! Tests database operations with real SQLite in-memory database

use chrono::{Duration, Utc};
use relaymesh_relay_db::{
    connect,
    entities::{monitor_sample, relay_node, setting, tunnel},
    migrate,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, Set,
};

/// Helper to create a test database
async fn setup_test_db() -> sea_orm::DatabaseConnection {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    migrate(&db).await.expect("Failed to run migrations");

    db
}

async fn insert_node(db: &sea_orm::DatabaseConnection, name: &str, role: relay_node::NodeRole) -> i32 {
    relay_node::ActiveModel {
        name: Set(name.to_string()),
        role: Set(role),
        address: Set(format!("{}.relay.test", name)),
        ssh_port: Set(22),
        ssh_user: Set(Some("root".to_string())),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to insert node")
    .id
}

fn tunnel_row(near: i32, far: Option<i32>, port: i32, status: tunnel::TunnelStatus) -> tunnel::ActiveModel {
    tunnel::ActiveModel {
        near_node_id: Set(near),
        far_node_id: Set(far),
        engine: Set("gost".to_string()),
        transport: Set("tls".to_string()),
        port: Set(port),
        status: Set(status),
        score: Set(0.0),
        latency_ms: Set(None),
        jitter_ms: Set(None),
        priority: Set(0),
        config: Set("{}".to_string()),
        last_error: Set(None),
        pid: Set(None),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_database_connection() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let backend = db.get_database_backend();
    assert!(matches!(backend, sea_orm::DatabaseBackend::Sqlite));
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let result = migrate(&db).await;
    assert!(result.is_ok());

    // Re-running is a no-op
    assert!(migrate(&db).await.is_ok());
}

#[tokio::test]
async fn test_insert_and_read_tunnel() {
    let db = setup_test_db().await;
    let near = insert_node(&db, "near-1", relay_node::NodeRole::Near).await;
    let far = insert_node(&db, "far-1", relay_node::NodeRole::Far).await;

    let inserted = tunnel_row(near, Some(far), 24000, tunnel::TunnelStatus::Active)
        .insert(&db)
        .await
        .expect("Failed to insert tunnel");

    let found = tunnel::Entity::find_by_id(inserted.id)
        .one(&db)
        .await
        .expect("Failed to query")
        .expect("Tunnel not found");

    assert_eq!(found.port, 24000);
    assert_eq!(found.status, tunnel::TunnelStatus::Active);
    assert_eq!(found.far_node_id, Some(far));
}

#[tokio::test]
async fn test_filter_active_tunnels_by_port() {
    let db = setup_test_db().await;
    let near = insert_node(&db, "near-1", relay_node::NodeRole::Near).await;

    tunnel_row(near, None, 30000, tunnel::TunnelStatus::Inactive)
        .insert(&db)
        .await
        .unwrap();
    tunnel_row(near, None, 30000, tunnel::TunnelStatus::Active)
        .insert(&db)
        .await
        .unwrap();

    let active_on_port = tunnel::Entity::find()
        .filter(tunnel::Column::Port.eq(30000))
        .filter(tunnel::Column::Status.eq(tunnel::TunnelStatus::Active))
        .count(&db)
        .await
        .unwrap();

    assert_eq!(active_on_port, 1);
}

#[tokio::test]
async fn test_monitor_sample_without_tunnel() {
    let db = setup_test_db().await;

    let sample = monitor_sample::ActiveModel {
        tunnel_id: Set(None),
        engine: Set(Some("frp".to_string())),
        latency_ms: Set(42.0),
        jitter_ms: Set(3.5),
        packet_loss: Set(0.0),
        score: Set(85.6),
        status: Set("optimal".to_string()),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(&db)
    .await
    .expect("Failed to insert sample");

    assert!(sample.tunnel_id.is_none());
    assert_eq!(sample.engine.as_deref(), Some("frp"));
}

#[tokio::test]
async fn test_purge_old_samples() {
    let db = setup_test_db().await;

    for age_hours in [1, 200, 300] {
        monitor_sample::ActiveModel {
            tunnel_id: Set(None),
            engine: Set(Some("ssh".to_string())),
            latency_ms: Set(10.0),
            jitter_ms: Set(1.0),
            packet_loss: Set(0.0),
            score: Set(95.0),
            status: Set("optimal".to_string()),
            created_at: Set(Utc::now() - Duration::hours(age_hours)),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();
    }

    let cutoff = Utc::now() - Duration::hours(168);
    let result = monitor_sample::Entity::delete_many()
        .filter(monitor_sample::Column::CreatedAt.lt(cutoff))
        .exec(&db)
        .await
        .unwrap();

    assert_eq!(result.rows_affected, 2);
    assert_eq!(monitor_sample::Entity::find().count(&db).await.unwrap(), 1);
}

#[tokio::test]
async fn test_settings_roundtrip() {
    let db = setup_test_db().await;

    setting::ActiveModel {
        key: Set("autopilot_enabled".to_string()),
        value: Set("true".to_string()),
        updated_at: Set(Utc::now()),
    }
    .insert(&db)
    .await
    .unwrap();

    let found = setting::Entity::find_by_id("autopilot_enabled".to_string())
        .one(&db)
        .await
        .unwrap()
        .expect("setting not found");

    assert_eq!(found.value, "true");
}

#[tokio::test]
async fn test_tunnel_serializes_status_lowercase() {
    let db = setup_test_db().await;
    let near = insert_node(&db, "near-1", relay_node::NodeRole::Near).await;

    let row = tunnel_row(near, None, 41000, tunnel::TunnelStatus::Failed)
        .insert(&db)
        .await
        .unwrap();

    let json = serde_json::to_value(&row).unwrap();
    assert_eq!(json["status"], "failed");
}
