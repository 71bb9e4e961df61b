pub mod models;
pub mod schema;

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::ReconcileRecord;
use crate::infrastructure::lock::{DistributedLock, LockError};

pub use models::DbReconcileRecord;
pub use schema::{get_schema_version, initialize_schema};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Schema error: {0}")]
    SchemaError(#[from] schema::SchemaError),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Storage collaborator for reconciliation audit rows
#[async_trait]
pub trait ReconcileStore: Send + Sync {
    async fn save_reconciliation(&self, record: &ReconcileRecord) -> Result<()>;
}

/// Audit database: reconciliation history and reconcile lock leases
#[derive(Clone)]
pub struct AuditDatabase {
    pool: PgPool,
}

impl AuditDatabase {
    /// Create new database connection and initialize schema
    pub async fn new(db_url: &str) -> Result<Self> {
        info!("Connecting to audit database");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(db_url)
            .await?;

        schema::initialize_schema(&pool).await?;

        match schema::get_schema_version(&pool).await? {
            Some(version) if version > schema::SCHEMA_VERSION => warn!(
                "Database schema v{} is newer than this build (v{})",
                version,
                schema::SCHEMA_VERSION
            ),
            version => debug!("Database schema v{}", version.unwrap_or_default()),
        }

        info!("Database initialized successfully");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn insert_reconciliation(&self, record: &ReconcileRecord) -> Result<()> {
        debug!(symbol = %record.symbol, diff = record.position_diff, "Inserting reconciliation row");

        sqlx::query(
            r#"
            INSERT INTO reconciliation_history (
                symbol, reconcile_time, local_position, exchange_position, position_diff,
                active_buy_orders, active_sell_orders, pending_sell_qty,
                total_buy_qty, total_sell_qty, estimated_profit
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&record.symbol)
        .bind(record.reconcile_time.to_rfc3339())
        .bind(record.local_position)
        .bind(record.exchange_position)
        .bind(record.position_diff)
        .bind(record.active_buy_orders as i32)
        .bind(record.active_sell_orders as i32)
        .bind(record.pending_sell_qty)
        .bind(record.total_buy_qty)
        .bind(record.total_sell_qty)
        .bind(record.estimated_profit)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent rows for `symbol`, newest first
    pub async fn recent_reconciliations(
        &self,
        symbol: &str,
        limit: i64,
    ) -> Result<Vec<ReconcileRecord>> {
        let rows = sqlx::query_as::<_, DbReconcileRecord>(
            r#"
            SELECT * FROM reconciliation_history
            WHERE symbol = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(symbol)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DbReconcileRecord::into_record).collect())
    }

    /// Lease-based lock sharing this database's pool
    pub fn lease_lock(&self) -> PgLeaseLock {
        PgLeaseLock::new(self.pool.clone())
    }
}

#[async_trait]
impl ReconcileStore for AuditDatabase {
    async fn save_reconciliation(&self, record: &ReconcileRecord) -> Result<()> {
        self.insert_reconciliation(record).await
    }
}

/// Cross-process lock backed by the `reconcile_locks` table
///
/// A lease is taken when the key is absent or its `expires_at` has passed.
/// Unlock only deletes a lease owned by this process.
pub struct PgLeaseLock {
    pool: PgPool,
    holder: String,
}

impl PgLeaseLock {
    pub fn new(pool: PgPool) -> Self {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self {
            pool,
            holder: format!("{}-{}", std::process::id(), nanos),
        }
    }
}

#[async_trait]
impl DistributedLock for PgLeaseLock {
    async fn lock(&self, key: &str, ttl: Duration) -> std::result::Result<(), LockError> {
        let result = sqlx::query(
            r#"
            INSERT INTO reconcile_locks (lock_key, holder, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (lock_key) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE reconcile_locks.expires_at < NOW()
            "#,
        )
        .bind(key)
        .bind(&self.holder)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(LockError::Busy(key.to_string()));
        }
        Ok(())
    }

    async fn unlock(&self, key: &str) -> std::result::Result<(), LockError> {
        sqlx::query("DELETE FROM reconcile_locks WHERE lock_key = $1 AND holder = $2")
            .bind(key)
            .bind(&self.holder)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(())
    }
}
