use log::warn;
use redis::AsyncCommands;

use crate::error::{EngineError, EngineResult};
use crate::ohlc::Candle;
use crate::store::{Fill, Order};

#[derive(Debug, Default)]
pub struct FlushReport {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Deterministic key generator: `venue:strategy:symbol:session_id:<kind>[:sub]`.
pub fn order_key(venue: &str, strategy: &str, symbol: &str, session_id: &str, client_order_id: &str) -> String {
    format!("{}:{}:{}:{}:order:{}", venue, strategy, symbol, session_id, client_order_id)
}

pub fn fill_key(venue: &str, strategy: &str, symbol: &str, session_id: &str, exec_id: &str) -> String {
    format!("{}:{}:{}:{}:fill:{}", venue, strategy, symbol, session_id, exec_id)
}

pub fn ohlc_key(venue: &str, strategy: &str, symbol: &str, session_id: &str, interval_ms: u64, bucket_ts: u64) -> String {
    format!(
        "{}:{}:{}:{}:ohlc:{}:{}",
        venue, strategy, symbol, session_id, interval_ms, bucket_ts
    )
}

pub fn dedup_key(exec_id: &str) -> String {
    format!("dedup:exec:{}", exec_id)
}

/// Batched write-behind to Redis with dedup reservations for fills
/// (`SET NX EX` on `dedup:exec:<exec_id>`) and a deterministic key scheme.
pub struct RedisTier {
    client: redis::Client,
    venue: String,
    strategy: String,
    session_id: String,
    dedup_ttl_secs: u64,
}

impl RedisTier {
    pub fn new(redis_url: &str, venue: impl Into<String>, strategy: impl Into<String>, session_id: impl Into<String>) -> EngineResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(Self {
            client,
            venue: venue.into(),
            strategy: strategy.into(),
            session_id: session_id.into(),
            dedup_ttl_secs: 86_400,
        })
    }

    async fn connection(&self) -> EngineResult<redis::aio::Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn flush_orders(&self, batch: &[Order]) -> FlushReport {
        let mut report = FlushReport::default();
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(e) => {
                report.failed = batch.len();
                report.errors.push(e.to_string());
                return report;
            }
        };
        for order in batch {
            let key = order_key(&self.venue, &self.strategy, &order.symbol, &self.session_id, &order.client_order_id);
            let value = match serde_json::to_string(order) {
                Ok(v) => v,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(e.to_string());
                    continue;
                }
            };
            match conn.set::<_, _, ()>(&key, value).await {
                Ok(()) => report.success += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(e.to_string());
                }
            }
        }
        report
    }

    pub async fn flush_fills(&self, batch: &[Fill]) -> FlushReport {
        let mut report = FlushReport::default();
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(e) => {
                report.failed = batch.len();
                report.errors.push(e.to_string());
                return report;
            }
        };
        for fill in batch {
            let reservation_key = dedup_key(&fill.exec_id);
            let reserved: EngineResult<bool> = redis::cmd("SET")
                .arg(&reservation_key)
                .arg(1)
                .arg("NX")
                .arg("EX")
                .arg(self.dedup_ttl_secs)
                .query_async(&mut conn)
                .await
                .map(|v: Option<String>| v.is_some())
                .map_err(|e| EngineError::Storage(e.to_string()));

            match reserved {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(e.to_string());
                    continue;
                }
            }

            let key = fill_key(&self.venue, &self.strategy, &fill.symbol, &self.session_id, &fill.exec_id);
            let value = match serde_json::to_string(fill) {
                Ok(v) => v,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(e.to_string());
                    continue;
                }
            };
            match conn.set::<_, _, ()>(&key, value).await {
                Ok(()) => report.success += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(e.to_string());
                }
            }
        }
        report
    }

    pub async fn flush_ohlc(&self, batch: &[Candle]) -> FlushReport {
        let mut report = FlushReport::default();
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(e) => {
                report.failed = batch.len();
                report.errors.push(e.to_string());
                return report;
            }
        };
        for candle in batch {
            let key = ohlc_key(
                &self.venue,
                &self.strategy,
                &candle.symbol,
                &self.session_id,
                candle.interval_ms,
                candle.bucket_ts,
            );
            let value = match serde_json::to_string(&CandleWire::from(candle)) {
                Ok(v) => v,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(e.to_string());
                    continue;
                }
            };
            let index_key = format!(
                "{}:{}:{}:{}:ohlc:{}:index",
                self.venue, self.strategy, candle.symbol, self.session_id, candle.interval_ms
            );
            let pipe_result: redis::RedisResult<()> = redis::pipe()
                .atomic()
                .set(&key, value)
                .lpush(&index_key, candle.bucket_ts)
                .ltrim(&index_key, 0, 999)
                .query_async(&mut conn)
                .await;
            match pipe_result {
                Ok(()) => report.success += 1,
                Err(e) => {
                    warn!("ohlc flush failed for {}: {}", key, e);
                    report.failed += 1;
                    report.errors.push(e.to_string());
                }
            }
        }
        report
    }
}

#[derive(serde::Serialize)]
struct CandleWire {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    trade_count: u64,
    is_complete: bool,
}

impl From<&Candle> for CandleWire {
    fn from(c: &Candle) -> Self {
        Self {
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            trade_count: c.trade_count,
            is_complete: c.is_complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_key_format() {
        let key = order_key("truex", "mm", "BTC-PYUSD", "sess-1", "MM-1");
        assert_eq!(key, "truex:mm:BTC-PYUSD:sess-1:order:MM-1");
    }

    #[test]
    fn test_dedup_key_format() {
        assert_eq!(dedup_key("exec-123"), "dedup:exec:exec-123");
    }

    #[test]
    fn test_ohlc_key_includes_interval_and_bucket() {
        let key = ohlc_key("truex", "mm", "BTC-PYUSD", "sess-1", 60_000, 120_000);
        assert_eq!(key, "truex:mm:BTC-PYUSD:sess-1:ohlc:60000:120000");
    }
}
