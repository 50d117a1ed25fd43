use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

// ── Snapshot ────────────────────────────────────────────────────────

/// Durable record of a saved machine.
///
/// `instance_key` is the provider's opaque handle to the saved state; it is
/// `null` until the provider has produced it.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub owner: String,
    pub workspace_id: String,
    pub env_name: String,
    pub machine_name: String,
    pub machine_type: String,
    pub description: Option<String>,
    pub dev: bool,
    pub created_at: DateTime<Utc>,
    pub instance_key: serde_json::Value,
}

impl Snapshot {
    pub async fn insert(pool: &PgPool, snapshot: &Snapshot) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO snapshots (id, owner, workspace_id, env_name, machine_name, machine_type,
                                      description, dev, created_at, instance_key)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.owner)
        .bind(&snapshot.workspace_id)
        .bind(&snapshot.env_name)
        .bind(&snapshot.machine_name)
        .bind(&snapshot.machine_type)
        .bind(&snapshot.description)
        .bind(snapshot.dev)
        .bind(snapshot.created_at)
        .bind(&snapshot.instance_key)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn get_by_id(pool: &PgPool, id: &str) -> sqlx::Result<Self> {
        sqlx::query_as("SELECT * FROM snapshots WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    /// Newest snapshot of a machine.
    pub async fn get_latest_for_machine(
        pool: &PgPool,
        workspace_id: &str,
        env_name: &str,
        machine_name: &str,
    ) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"SELECT * FROM snapshots
               WHERE workspace_id = $1 AND env_name = $2 AND machine_name = $3
               ORDER BY created_at DESC
               LIMIT 1"#,
        )
        .bind(workspace_id)
        .bind(env_name)
        .bind(machine_name)
        .fetch_one(pool)
        .await
    }

    pub async fn list_for_owner(pool: &PgPool, owner: &str, workspace_id: &str) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as(
            "SELECT * FROM snapshots WHERE owner = $1 AND workspace_id = $2 ORDER BY created_at",
        )
        .bind(owner)
        .bind(workspace_id)
        .fetch_all(pool)
        .await
    }

    /// Returns the number of deleted rows.
    pub async fn delete(pool: &PgPool, id: &str) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM snapshots WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
