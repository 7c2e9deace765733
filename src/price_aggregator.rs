use std::collections::VecDeque;

use crate::book::L2Book;

#[derive(Debug, Clone, Copy)]
pub struct AggregatedPrice {
    pub weighted_mid: f64,
    pub confidence: f64,
    pub top_bid: f64,
    pub top_ask: f64,
    pub ts_ms: u64,
}

/// Produces a confidence-weighted mid price from an `L2Book`'s top of book
/// plus a short rolling history of recent trade prices, scoring confidence
/// from staleness, spread, and recent trade-price dispersion.
pub struct PriceAggregator {
    trade_history: VecDeque<(u64, f64)>,
    history_window_ms: u64,
    max_staleness_ms: u64,
}

impl PriceAggregator {
    pub fn new(history_window_ms: u64, max_staleness_ms: u64) -> Self {
        Self {
            trade_history: VecDeque::new(),
            history_window_ms,
            max_staleness_ms,
        }
    }

    pub fn record_trade(&mut self, ts_ms: u64, price: f64) {
        self.trade_history.push_back((ts_ms, price));
        while let Some((t, _)) = self.trade_history.front() {
            if ts_ms.saturating_sub(*t) > self.history_window_ms {
                self.trade_history.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn aggregate(&self, book: &L2Book, now_ms: u64) -> Option<AggregatedPrice> {
        let bid = book.best_bid()?;
        let ask = book.best_ask()?;
        let weighted_mid = (bid.price * ask.size + ask.price * bid.size) / (bid.size + ask.size);
        let confidence = self.confidence(book, now_ms, bid.price, ask.price);
        Some(AggregatedPrice {
            weighted_mid,
            confidence,
            top_bid: bid.price,
            top_ask: ask.price,
            ts_ms: now_ms,
        })
    }

    fn confidence(&self, book: &L2Book, now_ms: u64, bid: f64, ask: f64) -> f64 {
        let staleness_ms = now_ms.saturating_sub(book.last_update_ms);
        let staleness_score = if staleness_ms >= self.max_staleness_ms {
            0.0
        } else {
            1.0 - (staleness_ms as f64 / self.max_staleness_ms as f64)
        };

        let mid = (bid + ask) / 2.0;
        let spread_bps = if mid > 0.0 { (ask - bid) / mid * 10_000.0 } else { 0.0 };
        let spread_score = (1.0 - spread_bps / 50.0).clamp(0.0, 1.0);

        let imbalance_score = if self.trade_history.len() < 2 {
            0.5
        } else {
            let prices: Vec<f64> = self.trade_history.iter().map(|(_, p)| *p).collect();
            let mean = prices.iter().sum::<f64>() / prices.len() as f64;
            let variance =
                prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / prices.len() as f64;
            let stdev_bps = if mean > 0.0 {
                variance.sqrt() / mean * 10_000.0
            } else {
                0.0
            };
            (1.0 - stdev_bps / 100.0).clamp(0.0, 1.0)
        };

        (staleness_score * 0.4 + spread_score * 0.3 + imbalance_score * 0.3).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::PriceLevel;

    fn fresh_book() -> L2Book {
        let mut book = L2Book::new("BTC-PYUSD", 0.5);
        book.apply_snapshot(
            &[PriceLevel { price: 100.0, size: 2.0 }],
            &[PriceLevel { price: 100.5, size: 2.0 }],
            1_000,
        );
        book
    }

    #[test]
    fn test_weighted_mid_with_equal_sizes_is_simple_mid() {
        let agg = PriceAggregator::new(60_000, 5_000);
        let book = fresh_book();
        let price = agg.aggregate(&book, 1_000).unwrap();
        assert!((price.weighted_mid - 100.25).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_drops_with_staleness() {
        let agg = PriceAggregator::new(60_000, 5_000);
        let book = fresh_book();
        let fresh = agg.aggregate(&book, 1_000).unwrap();
        let stale = agg.aggregate(&book, 10_000).unwrap();
        assert!(stale.confidence < fresh.confidence);
    }

    #[test]
    fn test_aggregate_returns_none_without_both_sides() {
        let agg = PriceAggregator::new(60_000, 5_000);
        let book = L2Book::new("BTC-PYUSD", 0.5);
        assert!(agg.aggregate(&book, 1_000).is_none());
    }
}
