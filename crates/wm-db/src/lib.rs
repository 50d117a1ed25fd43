pub mod memory;
pub mod models;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use models::Snapshot;

pub use memory::MemorySnapshotStore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Create a connection pool to PostgreSQL.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await?)
}

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Persistence of snapshot metadata.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Newest snapshot saved for a machine of an environment.
    async fn get_snapshot_for_machine(
        &self,
        workspace_id: &str,
        env_name: &str,
        machine_name: &str,
    ) -> Result<Snapshot>;

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn remove_snapshot(&self, id: &str) -> Result<()>;

    async fn find_snapshots(&self, owner: &str, workspace_id: &str) -> Result<Vec<Snapshot>>;
}

/// [`SnapshotStore`] backed by the `snapshots` table.
#[derive(Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn not_found(what: String) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| match e {
        sqlx::Error::RowNotFound => Error::NotFound(what),
        other => Error::Database(other),
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn get_snapshot_for_machine(
        &self,
        workspace_id: &str,
        env_name: &str,
        machine_name: &str,
    ) -> Result<Snapshot> {
        Snapshot::get_latest_for_machine(&self.pool, workspace_id, env_name, machine_name)
            .await
            .map_err(not_found(format!(
                "Snapshot for machine '{machine_name}' of environment '{env_name}' in workspace '{workspace_id}' not found"
            )))
    }

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        Snapshot::get_by_id(&self.pool, id)
            .await
            .map_err(not_found(format!("Snapshot with id '{id}' not found")))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        Ok(Snapshot::insert(&self.pool, snapshot).await?)
    }

    async fn remove_snapshot(&self, id: &str) -> Result<()> {
        if Snapshot::delete(&self.pool, id).await? == 0 {
            return Err(Error::NotFound(format!("Snapshot with id '{id}' not found")));
        }
        Ok(())
    }

    async fn find_snapshots(&self, owner: &str, workspace_id: &str) -> Result<Vec<Snapshot>> {
        Ok(Snapshot::list_for_owner(&self.pool, owner, workspace_id).await?)
    }
}
