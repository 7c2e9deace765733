use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ohlc::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    Sent,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Monotone DAG: created -> sent -> open ->
    /// {partially_filled, filled, cancelled, rejected}.
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Created, Sent)
                | (Sent, Open)
                | (Sent, Rejected)
                | (Open, PartiallyFilled)
                | (Open, Filled)
                | (Open, Cancelled)
                | (Open, Rejected)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Option<f64>,
    pub size: f64,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub avg_fill_price: Option<f64>,
    pub msg_seq_num: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub ack_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(client_order_id: impl Into<String>, symbol: impl Into<String>, side: OrderSide, size: f64, price: Option<f64>) -> Self {
        let now = Utc::now();
        Self {
            client_order_id: client_order_id.into(),
            exchange_order_id: None,
            symbol: symbol.into(),
            side,
            price,
            size,
            status: OrderStatus::Created,
            filled_size: 0.0,
            avg_fill_price: None,
            msg_seq_num: None,
            created_at: now,
            sent_at: None,
            ack_at: None,
            updated_at: now,
            terminal_at: None,
        }
    }

    pub fn transition(&mut self, next: OrderStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        let now = Utc::now();
        self.updated_at = now;
        if next.is_terminal() {
            self.terminal_at = Some(now);
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub exec_id: String,
    pub order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub fee: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Authoritative in-memory store: `id -> Order`, `exchange_order_id ->
/// Order`, `exec_id -> Fill`, plus FIFO write-behind queues per entity
/// kind. Single-writer by convention (the orchestrator owns the only
/// `&mut MemoryStore`).
pub struct MemoryStore {
    orders_by_id: HashMap<String, Order>,
    order_id_by_exchange_id: HashMap<String, String>,
    fills_by_exec_id: HashMap<String, Fill>,
    seen_exec_ids: HashSet<String>,
    candles: Vec<Candle>,

    pending_orders: VecDeque<String>,
    pending_fills: VecDeque<String>,
    pending_ohlc: VecDeque<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            orders_by_id: HashMap::new(),
            order_id_by_exchange_id: HashMap::new(),
            fills_by_exec_id: HashMap::new(),
            seen_exec_ids: HashSet::new(),
            candles: Vec::new(),
            pending_orders: VecDeque::new(),
            pending_fills: VecDeque::new(),
            pending_ohlc: VecDeque::new(),
        }
    }

    /// Reserves `exec_id` against the dedup set. Returns `true` the first
    /// time an `exec_id` is seen, `false` on every subsequent call —
    /// regardless of whether the report carries a fill.
    pub fn reserve_exec_id(&mut self, exec_id: &str) -> bool {
        self.seen_exec_ids.insert(exec_id.to_string())
    }

    pub fn add_order(&mut self, order: Order) {
        let id = order.client_order_id.clone();
        if let Some(exch_id) = &order.exchange_order_id {
            self.order_id_by_exchange_id.insert(exch_id.clone(), id.clone());
        }
        self.orders_by_id.insert(id.clone(), order);
        self.pending_orders.push_back(id);
    }

    pub fn update_order(&mut self, client_order_id: &str, f: impl FnOnce(&mut Order)) -> bool {
        match self.orders_by_id.get_mut(client_order_id) {
            Some(order) => {
                f(order);
                if let Some(exch_id) = &order.exchange_order_id {
                    self.order_id_by_exchange_id
                        .insert(exch_id.clone(), client_order_id.to_string());
                }
                self.pending_orders.push_back(client_order_id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn get_order(&self, client_order_id: &str) -> Option<&Order> {
        self.orders_by_id.get(client_order_id)
    }

    pub fn get_by_exchange_id(&self, exchange_order_id: &str) -> Option<&Order> {
        self.order_id_by_exchange_id
            .get(exchange_order_id)
            .and_then(|id| self.orders_by_id.get(id))
    }

    pub fn all_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders_by_id.values()
    }

    pub fn all_fills(&self) -> impl Iterator<Item = &Fill> {
        self.fills_by_exec_id.values()
    }

    pub fn all_candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Returns `None` for a duplicate `exec_id`.
    pub fn add_fill(&mut self, fill: Fill) -> Option<()> {
        if self.fills_by_exec_id.contains_key(&fill.exec_id) {
            return None;
        }
        let key = fill.exec_id.clone();
        self.fills_by_exec_id.insert(key.clone(), fill);
        self.pending_fills.push_back(key);
        Some(())
    }

    pub fn get_fill_by_exec(&self, exec_id: &str) -> Option<&Fill> {
        self.fills_by_exec_id.get(exec_id)
    }

    pub fn add_candle(&mut self, candle: Candle) {
        self.candles.push(candle);
        self.pending_ohlc.push_back(self.candles.len() - 1);
    }

    pub fn pending_orders(&mut self, limit: usize) -> Vec<Order> {
        drain_unique(&mut self.pending_orders, limit)
            .into_iter()
            .filter_map(|id| self.orders_by_id.get(&id).cloned())
            .collect()
    }

    pub fn pending_fills(&mut self, limit: usize) -> Vec<Fill> {
        drain_unique(&mut self.pending_fills, limit)
            .into_iter()
            .filter_map(|id| self.fills_by_exec_id.get(&id).cloned())
            .collect()
    }

    pub fn pending_ohlc(&mut self, limit: usize) -> Vec<Candle> {
        let mut out = Vec::new();
        for _ in 0..limit {
            match self.pending_ohlc.pop_front() {
                Some(idx) => {
                    if let Some(candle) = self.candles.get(idx) {
                        out.push(candle.clone());
                    }
                }
                None => break,
            }
        }
        out
    }

    /// Evicts terminal orders older than `max_age`.
    pub fn cleanup(&mut self, max_age: chrono::Duration) -> usize {
        let now = Utc::now();
        let stale: Vec<String> = self
            .orders_by_id
            .iter()
            .filter(|(_, o)| {
                o.status.is_terminal()
                    && o.terminal_at
                        .map(|t| now - t > max_age)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(order) = self.orders_by_id.remove(id) {
                if let Some(exch_id) = order.exchange_order_id {
                    self.order_id_by_exchange_id.remove(&exch_id);
                }
            }
        }
        stale.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn drain_unique(queue: &mut VecDeque<String>, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    for _ in 0..limit {
        match queue.pop_front() {
            Some(id) => out.push(id),
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order() -> Order {
        Order::new("MM-1", "BTC-PYUSD", OrderSide::Buy, 1.0, Some(100.0))
    }

    #[test]
    fn test_order_status_advances_along_monotone_dag() {
        let mut order = sample_order();
        assert!(order.transition(OrderStatus::Sent));
        assert!(order.transition(OrderStatus::Open));
        assert!(order.transition(OrderStatus::Filled));
        assert!(!order.transition(OrderStatus::Open));
    }

    #[test]
    fn test_terminal_status_is_write_once() {
        let mut order = sample_order();
        order.transition(OrderStatus::Sent);
        order.transition(OrderStatus::Open);
        order.transition(OrderStatus::Cancelled);
        assert!(order.terminal_at.is_some());
        assert!(!order.transition(OrderStatus::Filled));
    }

    #[test]
    fn test_reserve_exec_id_is_one_shot() {
        let mut store = MemoryStore::new();
        assert!(store.reserve_exec_id("exec-1"));
        assert!(!store.reserve_exec_id("exec-1"));
        assert!(store.reserve_exec_id("exec-2"));
    }

    #[test]
    fn test_add_fill_rejects_duplicate_exec_id() {
        let mut store = MemoryStore::new();
        let fill = Fill {
            fill_id: "MM-1-exec1".into(),
            exec_id: "exec1".into(),
            order_id: "MM-1".into(),
            exchange_order_id: None,
            symbol: "BTC-PYUSD".into(),
            side: OrderSide::Buy,
            quantity: 1.0,
            price: 100.0,
            fee: None,
            timestamp: Utc::now(),
        };
        assert!(store.add_fill(fill.clone()).is_some());
        assert!(store.add_fill(fill).is_none());
    }

    #[test]
    fn test_pending_orders_drains_fifo_up_to_limit() {
        let mut store = MemoryStore::new();
        store.add_order(Order::new("MM-1", "BTC-PYUSD", OrderSide::Buy, 1.0, Some(100.0)));
        store.add_order(Order::new("MM-2", "BTC-PYUSD", OrderSide::Sell, 1.0, Some(101.0)));
        let drained = store.pending_orders(1);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].client_order_id, "MM-1");
    }

    #[test]
    fn test_cleanup_evicts_only_old_terminal_orders() {
        let mut store = MemoryStore::new();
        let mut order = sample_order();
        order.transition(OrderStatus::Sent);
        order.transition(OrderStatus::Open);
        order.transition(OrderStatus::Cancelled);
        order.terminal_at = Some(Utc::now() - chrono::Duration::hours(2));
        store.add_order(order);
        let removed = store.cleanup(chrono::Duration::hours(1));
        assert_eq!(removed, 1);
        assert!(store.get_order("MM-1").is_none());
    }
}
