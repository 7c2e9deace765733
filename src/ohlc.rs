use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleSource {
    Trades,
    Snapshot,
}

#[derive(Debug, Clone)]
pub struct Candle {
    pub symbol: String,
    pub exchange: String,
    pub interval_ms: u64,
    pub bucket_ts: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
    pub source: CandleSource,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CandleKey {
    symbol: String,
    exchange: String,
    interval_ms: u64,
    bucket_ts: u64,
}

fn bucket_ts(t_ms: u64, interval_ms: u64) -> u64 {
    (t_ms / interval_ms) * interval_ms
}

/// Aggregates trades and book snapshots into fixed-width candles, keyed by
/// `floor(t/interval)*interval`, with explicit late-flush semantics.
pub struct OhlcBuilder {
    candles: HashMap<CandleKey, Candle>,
}

impl OhlcBuilder {
    pub fn new() -> Self {
        Self {
            candles: HashMap::new(),
        }
    }

    pub fn on_trade(
        &mut self,
        symbol: &str,
        exchange: &str,
        interval_ms: u64,
        ts_ms: u64,
        price: f64,
        size: f64,
    ) {
        let key = CandleKey {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            interval_ms,
            bucket_ts: bucket_ts(ts_ms, interval_ms),
        };
        let candle = self.candles.entry(key.clone()).or_insert_with(|| Candle {
            symbol: key.symbol.clone(),
            exchange: key.exchange.clone(),
            interval_ms,
            bucket_ts: key.bucket_ts,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            trade_count: 0,
            source: CandleSource::Trades,
            is_complete: false,
        });
        candle.high = candle.high.max(price);
        candle.low = candle.low.min(price);
        candle.close = price;
        candle.volume += size;
        candle.trade_count += 1;
        candle.source = CandleSource::Trades;
    }

    pub fn on_snapshot(&mut self, symbol: &str, exchange: &str, interval_ms: u64, ts_ms: u64, mid: f64) {
        let key = CandleKey {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            interval_ms,
            bucket_ts: bucket_ts(ts_ms, interval_ms),
        };
        self.candles.insert(
            key.clone(),
            Candle {
                symbol: key.symbol,
                exchange: key.exchange,
                interval_ms,
                bucket_ts: key.bucket_ts,
                open: mid,
                high: mid,
                low: mid,
                close: mid,
                volume: 0.0,
                trade_count: 0,
                source: CandleSource::Snapshot,
                is_complete: false,
            },
        );
    }

    /// Removes and returns every bucket whose window has closed relative
    /// to `now_ms`, marking each `is_complete`.
    pub fn flush_complete(&mut self, now_ms: u64) -> Vec<Candle> {
        let done_keys: Vec<CandleKey> = self
            .candles
            .iter()
            .filter(|(k, _)| k.bucket_ts + k.interval_ms <= now_ms)
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = Vec::with_capacity(done_keys.len());
        for key in done_keys {
            if let Some(mut candle) = self.candles.remove(&key) {
                candle.is_complete = true;
                out.push(candle);
            }
        }
        out
    }

    pub fn open_bucket_count(&self) -> usize {
        self.candles.len()
    }
}

impl Default for OhlcBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trades_extend_high_low_and_close() {
        let mut builder = OhlcBuilder::new();
        builder.on_trade("BTC-PYUSD", "truex", 60_000, 0, 100.0, 1.0);
        builder.on_trade("BTC-PYUSD", "truex", 60_000, 1_000, 105.0, 1.0);
        builder.on_trade("BTC-PYUSD", "truex", 60_000, 2_000, 95.0, 1.0);
        let flushed = builder.flush_complete(60_000);
        assert_eq!(flushed.len(), 1);
        let c = &flushed[0];
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 105.0);
        assert_eq!(c.low, 95.0);
        assert_eq!(c.close, 95.0);
        assert_eq!(c.trade_count, 3);
        assert!(c.is_complete);
    }

    #[test]
    fn test_bucket_key_floors_to_interval() {
        let mut builder = OhlcBuilder::new();
        builder.on_trade("BTC-PYUSD", "truex", 60_000, 61_500, 100.0, 1.0);
        assert_eq!(builder.open_bucket_count(), 1);
        let flushed = builder.flush_complete(120_000);
        assert_eq!(flushed[0].bucket_ts, 60_000);
    }

    #[test]
    fn test_flush_does_not_remove_open_buckets() {
        let mut builder = OhlcBuilder::new();
        builder.on_trade("BTC-PYUSD", "truex", 60_000, 0, 100.0, 1.0);
        let flushed = builder.flush_complete(30_000);
        assert!(flushed.is_empty());
        assert_eq!(builder.open_bucket_count(), 1);
    }
}
