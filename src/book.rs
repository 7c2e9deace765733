use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Wraps a price with side-awareness so a single `BTreeMap` sorts bids
/// descending and asks ascending. Grounded in
/// `cooprefr-bettersys/rust-backend/src/backtest_v2/book.rs`'s `OrderedPrice`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedPrice {
    pub price: f64,
    pub is_bid: bool,
}

impl Eq for OrderedPrice {}

impl PartialOrd for OrderedPrice {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedPrice {
    fn cmp(&self, other: &Self) -> Ordering {
        let natural = self
            .price
            .partial_cmp(&other.price)
            .unwrap_or(Ordering::Equal);
        if self.is_bid {
            natural.reverse()
        } else {
            natural
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BookLevel {
    pub size: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone)]
pub struct L2Delta {
    pub is_bid: bool,
    pub price: f64,
    pub size: f64,
}

/// Two-sided sorted order book reconstructed from a snapshot plus a stream
/// of deltas. All prices are snapped to `tick_size` before insertion.
#[derive(Debug, Clone)]
pub struct L2Book {
    pub symbol: String,
    tick_size: f64,
    bids: BTreeMap<OrderedPrice, BookLevel>,
    asks: BTreeMap<OrderedPrice, BookLevel>,
    pub last_update_ms: u64,
}

pub fn snap_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    (price / tick_size).round() * tick_size
}

impl L2Book {
    pub fn new(symbol: impl Into<String>, tick_size: f64) -> Self {
        Self {
            symbol: symbol.into(),
            tick_size,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_ms: 0,
        }
    }

    pub fn apply_snapshot(&mut self, bids: &[PriceLevel], asks: &[PriceLevel], ts_ms: u64) {
        self.bids.clear();
        self.asks.clear();
        for level in bids {
            self.upsert_level(true, level.price, level.size);
        }
        for level in asks {
            self.upsert_level(false, level.price, level.size);
        }
        self.last_update_ms = ts_ms;
    }

    pub fn apply_deltas(&mut self, deltas: &[L2Delta], ts_ms: u64) {
        for d in deltas {
            self.upsert_level(d.is_bid, d.price, d.size);
        }
        self.last_update_ms = ts_ms;
    }

    fn upsert_level(&mut self, is_bid: bool, price: f64, size: f64) {
        let key = OrderedPrice {
            price: snap_to_tick(price, self.tick_size),
            is_bid,
        };
        let side = if is_bid { &mut self.bids } else { &mut self.asks };
        if size <= 0.0 {
            side.remove(&key);
        } else {
            side.insert(key, BookLevel { size });
        }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.iter().next().map(|(k, v)| PriceLevel {
            price: k.price,
            size: v.size,
        })
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.iter().next().map(|(k, v)| PriceLevel {
            price: k.price,
            size: v.size,
        })
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a.price - b.price),
            _ => None,
        }
    }

    pub fn depth(&self, n: usize) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        let bids = self
            .bids
            .iter()
            .take(n)
            .map(|(k, v)| PriceLevel {
                price: k.price,
                size: v.size,
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(n)
            .map(|(k, v)| PriceLevel {
                price: k.price,
                size: v.size,
            })
            .collect();
        (bids, asks)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}
