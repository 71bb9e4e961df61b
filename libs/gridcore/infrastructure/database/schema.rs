use sqlx::PgPool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// Database schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize database schema
pub async fn initialize_schema(pool: &PgPool) -> Result<()> {
    // One row per completed reconciliation round
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconciliation_history (
            id BIGSERIAL PRIMARY KEY,
            symbol TEXT NOT NULL,
            reconcile_time TEXT NOT NULL,
            local_position DOUBLE PRECISION NOT NULL,
            exchange_position DOUBLE PRECISION NOT NULL,
            position_diff DOUBLE PRECISION NOT NULL,
            active_buy_orders INTEGER NOT NULL,
            active_sell_orders INTEGER NOT NULL,
            pending_sell_qty DOUBLE PRECISION NOT NULL,
            total_buy_qty DOUBLE PRECISION NOT NULL,
            total_sell_qty DOUBLE PRECISION NOT NULL,
            estimated_profit DOUBLE PRECISION NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_reconciliation_symbol_time ON reconciliation_history(symbol, reconcile_time)",
    )
    .execute(pool)
    .await?;

    // Lease table backing the cross-process reconcile lock
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconcile_locks (
            lock_key TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Insert current schema version
    sqlx::query(
        "INSERT INTO schema_version (version, applied_at) VALUES ($1, NOW()) ON CONFLICT DO NOTHING",
    )
    .bind(SCHEMA_VERSION)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get current schema version
pub async fn get_schema_version(pool: &PgPool) -> Result<Option<i32>> {
    let row = sqlx::query_as::<_, (i32,)>(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(version,)| version))
}
