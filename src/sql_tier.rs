use log::{info, warn};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::{EngineError, EngineResult};
use crate::ohlc::Candle;
use crate::store::{Fill, Order, OrderSide, OrderStatus};

/// `#[repr(i16)]`-mapped column enums for the `orders`/`fills` status and
/// side columns.
#[derive(Debug, Clone, Copy, sqlx::Type)]
#[repr(i16)]
pub enum SqlOrderStatus {
    Created = 0,
    Sent = 1,
    Open = 2,
    PartiallyFilled = 3,
    Filled = 4,
    Cancelled = 5,
    Rejected = 6,
}

impl From<OrderStatus> for SqlOrderStatus {
    fn from(s: OrderStatus) -> Self {
        match s {
            OrderStatus::Created => SqlOrderStatus::Created,
            OrderStatus::Sent => SqlOrderStatus::Sent,
            OrderStatus::Open => SqlOrderStatus::Open,
            OrderStatus::PartiallyFilled => SqlOrderStatus::PartiallyFilled,
            OrderStatus::Filled => SqlOrderStatus::Filled,
            OrderStatus::Cancelled => SqlOrderStatus::Cancelled,
            OrderStatus::Rejected => SqlOrderStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, sqlx::Type)]
#[repr(i16)]
pub enum SqlSide {
    Buy = 0,
    Sell = 1,
}

impl From<OrderSide> for SqlSide {
    fn from(s: OrderSide) -> Self {
        match s {
            OrderSide::Buy => SqlSide::Buy,
            OrderSide::Sell => SqlSide::Sell,
        }
    }
}

/// Advisory-lock namespaces: schema migrations use one namespace, the
/// per-session redis-to-sql migration uses another, keyed by a hash of the
/// session id so concurrent sessions never contend on the same lock.
const SCHEMA_LOCK_NAMESPACE: i32 = 1;
const MIGRATION_LOCK_NAMESPACE: i32 = 2;

fn session_lock_key(session_id: &str) -> i32 {
    let mut hash: i32 = 0;
    for byte in session_id.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as i32);
    }
    hash
}

pub struct SqlTier {
    pool: PgPool,
}

impl SqlTier {
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> EngineResult<()> {
        self.with_advisory_lock(SCHEMA_LOCK_NAMESPACE, 0, |pool| async move {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    session_id TEXT PRIMARY KEY,
                    started_at TIMESTAMPTZ NOT NULL,
                    migrated BOOLEAN NOT NULL DEFAULT FALSE
                );
                CREATE TABLE IF NOT EXISTS orders (
                    client_order_id TEXT PRIMARY KEY,
                    exchange_order_id TEXT,
                    session_id TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    side SMALLINT NOT NULL,
                    price DOUBLE PRECISION,
                    size DOUBLE PRECISION NOT NULL,
                    status SMALLINT NOT NULL,
                    filled_size DOUBLE PRECISION NOT NULL,
                    msg_seq_num BIGINT,
                    updated_at TIMESTAMPTZ NOT NULL
                );
                CREATE TABLE IF NOT EXISTS fills (
                    fill_id TEXT PRIMARY KEY,
                    exec_id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    order_id TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    side SMALLINT NOT NULL,
                    quantity DOUBLE PRECISION NOT NULL,
                    price DOUBLE PRECISION NOT NULL,
                    ts TIMESTAMPTZ NOT NULL,
                    UNIQUE (session_id, exec_id)
                );
                CREATE TABLE IF NOT EXISTS ohlc (
                    symbol TEXT NOT NULL,
                    exchange TEXT NOT NULL,
                    interval_ms BIGINT NOT NULL,
                    bucket_ts BIGINT NOT NULL,
                    open DOUBLE PRECISION NOT NULL,
                    high DOUBLE PRECISION NOT NULL,
                    low DOUBLE PRECISION NOT NULL,
                    close DOUBLE PRECISION NOT NULL,
                    volume DOUBLE PRECISION NOT NULL,
                    UNIQUE (symbol, exchange, interval_ms, bucket_ts)
                );
                "#,
            )
            .execute(&pool)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// Runs the full Redis -> SQL migration for one session under a
    /// session-scoped advisory lock. Only marks the session migrated once
    /// every step reports zero failures.
    pub async fn migrate_from_redis(
        &self,
        session_id: &str,
        orders: &[Order],
        fills: &[Fill],
        candles: &[Candle],
    ) -> EngineResult<()> {
        let lock_key = session_lock_key(session_id);
        self.with_advisory_lock(MIGRATION_LOCK_NAMESPACE, lock_key, |pool| async move {
            let mut failures = 0usize;

            for order in orders {
                let status: SqlOrderStatus = order.status.into();
                let side: SqlSide = order.side.into();
                let result = sqlx::query(
                    r#"INSERT INTO orders (client_order_id, exchange_order_id, session_id, symbol, side, price, size, status, filled_size, msg_seq_num, updated_at)
                       VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
                       ON CONFLICT (client_order_id) DO UPDATE SET
                         exchange_order_id = EXCLUDED.exchange_order_id,
                         status = EXCLUDED.status,
                         filled_size = EXCLUDED.filled_size,
                         msg_seq_num = EXCLUDED.msg_seq_num,
                         updated_at = EXCLUDED.updated_at"#,
                )
                .bind(&order.client_order_id)
                .bind(&order.exchange_order_id)
                .bind(session_id)
                .bind(&order.symbol)
                .bind(side)
                .bind(order.price)
                .bind(order.size)
                .bind(status)
                .bind(order.filled_size)
                .bind(order.msg_seq_num.map(|v| v as i64))
                .bind(order.updated_at)
                .execute(&pool)
                .await;
                if result.is_err() {
                    failures += 1;
                }
            }

            for fill in fills {
                let side: SqlSide = fill.side.into();
                let result = sqlx::query(
                    r#"INSERT INTO fills (fill_id, exec_id, session_id, order_id, symbol, side, quantity, price, ts)
                       VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
                       ON CONFLICT (session_id, exec_id) DO NOTHING"#,
                )
                .bind(&fill.fill_id)
                .bind(&fill.exec_id)
                .bind(session_id)
                .bind(&fill.order_id)
                .bind(&fill.symbol)
                .bind(side)
                .bind(fill.quantity)
                .bind(fill.price)
                .bind(fill.timestamp)
                .execute(&pool)
                .await;
                if result.is_err() {
                    failures += 1;
                }
            }

            for candle in candles {
                let result = sqlx::query(
                    r#"INSERT INTO ohlc (symbol, exchange, interval_ms, bucket_ts, open, high, low, close, volume)
                       VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
                       ON CONFLICT (symbol, exchange, interval_ms, bucket_ts) DO UPDATE SET
                         high = GREATEST(ohlc.high, EXCLUDED.high),
                         low = LEAST(ohlc.low, EXCLUDED.low),
                         close = EXCLUDED.close,
                         volume = ohlc.volume + EXCLUDED.volume"#,
                )
                .bind(&candle.symbol)
                .bind(&candle.exchange)
                .bind(candle.interval_ms as i64)
                .bind(candle.bucket_ts as i64)
                .bind(candle.open)
                .bind(candle.high)
                .bind(candle.low)
                .bind(candle.close)
                .bind(candle.volume)
                .execute(&pool)
                .await;
                if result.is_err() {
                    failures += 1;
                }
            }

            if failures == 0 {
                sqlx::query(
                    "INSERT INTO sessions (session_id, started_at, migrated) VALUES ($1, now(), TRUE)
                     ON CONFLICT (session_id) DO UPDATE SET migrated = TRUE",
                )
                .bind(session_id)
                .execute(&pool)
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?;
                info!("session {} migrated to sql tier", session_id);
                Ok(())
            } else {
                warn!("session {} migration had {} failures, not marking migrated", session_id, failures);
                Err(EngineError::Storage(format!("{} rows failed to migrate", failures)))
            }
        })
        .await
    }

    async fn with_advisory_lock<F, Fut, T>(&self, namespace: i32, key: i32, f: F) -> EngineResult<T>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        sqlx::query("SELECT pg_advisory_lock($1, $2)")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let result = f(self.pool.clone()).await;

        let _ = sqlx::query("SELECT pg_advisory_unlock($1, $2)")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lock_key_is_deterministic() {
        assert_eq!(session_lock_key("session-1"), session_lock_key("session-1"));
    }

    #[test]
    fn test_session_lock_key_differs_across_sessions() {
        assert_ne!(session_lock_key("session-1"), session_lock_key("session-2"));
    }

    #[test]
    fn test_order_status_maps_to_sql_enum() {
        let sql_status: SqlOrderStatus = OrderStatus::Filled.into();
        assert!(matches!(sql_status, SqlOrderStatus::Filled));
    }
}
