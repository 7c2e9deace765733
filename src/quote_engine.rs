use std::collections::{HashMap, VecDeque};

use chrono::Utc;

use crate::book::snap_to_tick;
use crate::config::QuoteEngineConfig;
use crate::fix::tags;
use crate::price_aggregator::AggregatedPrice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn fix_value(&self) -> &'static str {
        match self {
            Side::Bid => tags::side::BUY,
            Side::Ask => tags::side::SELL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LevelKey {
    side: Side,
    level: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct DesiredQuote {
    pub side: Side,
    pub level: u8,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone)]
pub struct ActiveOrder {
    pub cl_ord_id: String,
    pub side: Side,
    pub level: u8,
    pub price: f64,
    pub size: f64,
    pub placed_at_ms: i64,
}

#[derive(Debug, Clone)]
pub enum QuoteAction {
    Place(DesiredQuote),
    Cancel { cl_ord_id: String },
    CancelThenPlace { cl_ord_id: String, desired: DesiredQuote },
}

/// Computes the desired N-level ladder from a mid price and reconciles it
/// against the live active-order set, producing a minimal action list
/// (tick-snapped prices, per-layer spread/size, desired-vs-active diffing,
/// a rate limiter, and a per-order dup guard).
pub struct QuoteEngine {
    config: QuoteEngineConfig,
    tick_size: f64,
    active: HashMap<LevelKey, ActiveOrder>,
    last_action_at: HashMap<String, i64>,
    rate_window: VecDeque<i64>,
    pending_actions: VecDeque<QuoteAction>,
    cl_ord_counter: u64,
    session_prefix: String,
}

impl QuoteEngine {
    pub fn new(config: QuoteEngineConfig, tick_size: f64, session_prefix: impl Into<String>) -> Self {
        Self {
            config,
            tick_size,
            active: HashMap::new(),
            last_action_at: HashMap::new(),
            rate_window: VecDeque::new(),
            pending_actions: VecDeque::new(),
            cl_ord_counter: 0,
            session_prefix: session_prefix.into(),
        }
    }

    fn next_cl_ord_id(&mut self) -> String {
        self.cl_ord_counter += 1;
        let candidate = format!("{}-{}", self.session_prefix, self.cl_ord_counter);
        candidate.chars().take(18).collect()
    }

    /// Mints a fresh ClOrdID outside of `confirm_placed` — e.g. the distinct
    /// ClOrdID an `OrderCancelRequest` carries alongside its `OrigClOrdID`.
    pub fn new_cl_ord_id(&mut self) -> String {
        self.next_cl_ord_id()
    }

    pub fn ladder(&self, price: &AggregatedPrice, bid_skew_ticks: f64, ask_skew_ticks: f64) -> Vec<DesiredQuote> {
        if price.confidence < self.config.confidence_threshold {
            return Vec::new();
        }
        let mid = price.weighted_mid;
        let half_spread = (self.config.base_spread_bps / 10_000.0) * mid / 2.0;
        let mut quotes = Vec::new();
        for level in 1..=self.config.levels {
            let l = level as f64;
            let size = self.config.base_size * self.config.size_decay.powi((level - 1) as i32);

            let bid_raw = mid
                - half_spread
                - l * self.config.level_spacing_ticks * self.tick_size
                - bid_skew_ticks * self.tick_size;
            let bid_price = snap_to_tick(bid_raw, self.tick_size);
            if self.passes_filters(bid_price, size, mid) {
                quotes.push(DesiredQuote {
                    side: Side::Bid,
                    level,
                    price: bid_price,
                    size,
                });
            }

            let ask_raw = mid
                + half_spread
                + l * self.config.level_spacing_ticks * self.tick_size
                + ask_skew_ticks * self.tick_size;
            let ask_price = snap_to_tick(ask_raw, self.tick_size);
            if self.passes_filters(ask_price, size, mid) {
                quotes.push(DesiredQuote {
                    side: Side::Ask,
                    level,
                    price: ask_price,
                    size,
                });
            }
        }
        quotes
    }

    fn passes_filters(&self, price: f64, size: f64, mid: f64) -> bool {
        if price * size < self.config.min_notional {
            return false;
        }
        let band = mid * self.config.price_band_pct;
        (mid - band..=mid + band).contains(&price)
    }

    /// Diffs `desired` against `self.active`, producing cancels for
    /// stale-without-match orders, keeps for within-threshold matches, and
    /// cancel-then-place / place for everything else. Mutates `self.active`
    /// to reflect the post-reconcile desired state (places and
    /// cancel-then-places register pending new `ActiveOrder`s once the
    /// caller confirms dispatch via `confirm_placed`). Returned actions are
    /// ordered cancels, then cancel-then-place replacements, then plain
    /// places, so removals always reach the wire ahead of new exposure.
    pub fn reconcile(&mut self, desired: Vec<DesiredQuote>) -> Vec<QuoteAction> {
        let mut places = Vec::new();
        let mut replaces = Vec::new();
        let mut matched_keys = Vec::new();

        for d in &desired {
            let key = LevelKey { side: d.side, level: d.level };
            match self.active.get(&key) {
                Some(active) => {
                    matched_keys.push(key);
                    let distance_ticks = (d.price - active.price).abs() / self.tick_size;
                    if distance_ticks >= self.config.reprice_threshold_ticks {
                        replaces.push(QuoteAction::CancelThenPlace {
                            cl_ord_id: active.cl_ord_id.clone(),
                            desired: *d,
                        });
                    }
                }
                None => {
                    places.push(QuoteAction::Place(*d));
                }
            }
        }

        let stale: Vec<LevelKey> = self
            .active
            .keys()
            .filter(|k| !matched_keys.contains(k) && !desired.iter().any(|d| d.side == k.side && d.level == k.level))
            .cloned()
            .collect();
        let mut cancels = Vec::new();
        for key in stale {
            if let Some(active) = self.active.get(&key) {
                cancels.push(QuoteAction::Cancel {
                    cl_ord_id: active.cl_ord_id.clone(),
                });
            }
        }

        let mut actions = cancels;
        actions.extend(replaces);
        actions.extend(places);
        self.apply_dup_guard(actions)
    }

    fn apply_dup_guard(&mut self, actions: Vec<QuoteAction>) -> Vec<QuoteAction> {
        let now = Utc::now().timestamp_millis();
        let mut allowed = Vec::new();
        for action in actions {
            let guard_key = match &action {
                QuoteAction::Cancel { cl_ord_id } => cl_ord_id.clone(),
                QuoteAction::CancelThenPlace { cl_ord_id, .. } => cl_ord_id.clone(),
                QuoteAction::Place(d) => format!("new-{:?}-{}", d.side, d.level),
            };
            let last = self.last_action_at.get(&guard_key).copied().unwrap_or(0);
            if now - last < self.config.dup_guard_ms {
                continue;
            }
            self.last_action_at.insert(guard_key, now);
            allowed.push(action);
        }
        self.rate_limit(allowed)
    }

    /// Queues `actions` behind anything left over from a prior call, then
    /// drains as much as the rolling 1s window has budget for. Overflow
    /// stays queued rather than being dropped, and is drained first on the
    /// next call once the window has rolled forward.
    fn rate_limit(&mut self, actions: Vec<QuoteAction>) -> Vec<QuoteAction> {
        let now = Utc::now().timestamp_millis();
        while let Some(&front) = self.rate_window.front() {
            if now - front > 1_000 {
                self.rate_window.pop_front();
            } else {
                break;
            }
        }
        self.pending_actions.extend(actions);
        let budget = self.config.max_orders_per_second as usize;
        let mut out = Vec::new();
        while self.rate_window.len() < budget {
            match self.pending_actions.pop_front() {
                Some(action) => {
                    self.rate_window.push_back(now);
                    out.push(action);
                }
                None => break,
            }
        }
        out
    }

    /// Assigns a fresh ClOrdID and registers it as active ahead of dispatch.
    /// The caller builds the outbound `NewOrderSingle` around the returned
    /// ID, then rolls the registration back via `confirm_cancelled` if the
    /// send itself fails.
    pub fn confirm_placed(&mut self, desired: DesiredQuote) -> String {
        let cl_ord_id = self.next_cl_ord_id();
        self.active.insert(
            LevelKey { side: desired.side, level: desired.level },
            ActiveOrder {
                cl_ord_id: cl_ord_id.clone(),
                side: desired.side,
                level: desired.level,
                price: desired.price,
                size: desired.size,
                placed_at_ms: Utc::now().timestamp_millis(),
            },
        );
        cl_ord_id
    }

    /// Removes the confirmed-cancelled order from the active set and hands
    /// it back, since callers need its `side`/`level` to finish unwinding
    /// the dispatch (e.g. a `CancelThenPlace` replacement).
    pub fn confirm_cancelled(&mut self, cl_ord_id: &str) -> Option<ActiveOrder> {
        let key = self
            .active
            .iter()
            .find(|(_, v)| v.cl_ord_id == cl_ord_id)
            .map(|(k, _)| *k)?;
        self.active.remove(&key)
    }

    pub fn cancel_all(&mut self) -> Vec<QuoteAction> {
        let actions: Vec<QuoteAction> = self
            .active
            .values()
            .map(|a| QuoteAction::Cancel {
                cl_ord_id: a.cl_ord_id.clone(),
            })
            .collect();
        self.active.clear();
        actions
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> QuoteEngine {
        QuoteEngine::new(QuoteEngineConfig::default(), 0.5, "MM")
    }

    fn price(mid: f64, confidence: f64) -> AggregatedPrice {
        AggregatedPrice {
            weighted_mid: mid,
            confidence,
            top_bid: mid - 1.0,
            top_ask: mid + 1.0,
            ts_ms: 0,
        }
    }

    #[test]
    fn test_low_confidence_produces_empty_ladder() {
        let engine = engine();
        let quotes = engine.ladder(&price(100.0, 0.1), 0.0, 0.0);
        assert!(quotes.is_empty());
    }

    #[test]
    fn test_ladder_has_levels_on_both_sides() {
        let engine = engine();
        let quotes = engine.ladder(&price(100.0, 0.9), 0.0, 0.0);
        let bids = quotes.iter().filter(|q| q.side == Side::Bid).count();
        let asks = quotes.iter().filter(|q| q.side == Side::Ask).count();
        assert_eq!(bids, 3);
        assert_eq!(asks, 3);
    }

    #[test]
    fn test_reconcile_places_all_quotes_when_no_active_orders() {
        let mut engine = engine();
        let quotes = engine.ladder(&price(100.0, 0.9), 0.0, 0.0);
        let actions = engine.reconcile(quotes.clone());
        let placed = actions
            .iter()
            .filter(|a| matches!(a, QuoteAction::Place(_)))
            .count();
        assert_eq!(placed, quotes.len().min(engine.config.max_orders_per_second as usize));
    }

    #[test]
    fn test_reconcile_keeps_quote_within_reprice_threshold() {
        let mut engine = engine();
        let quotes = engine.ladder(&price(100.0, 0.9), 0.0, 0.0);
        for q in &quotes {
            engine.confirm_placed(*q);
        }
        let actions = engine.reconcile(quotes);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_reconcile_cancels_order_with_no_matching_desired_level() {
        let mut engine = engine();
        let quotes = engine.ladder(&price(100.0, 0.9), 0.0, 0.0);
        for q in &quotes {
            engine.confirm_placed(*q);
        }
        let actions = engine.reconcile(Vec::new());
        let cancels = actions
            .iter()
            .filter(|a| matches!(a, QuoteAction::Cancel { .. }))
            .count();
        assert_eq!(cancels, quotes.len().min(engine.config.max_orders_per_second as usize));
    }

    #[test]
    fn test_dup_guard_suppresses_rapid_repeat_action() {
        let mut engine = engine();
        let quotes = engine.ladder(&price(100.0, 0.9), 0.0, 0.0);
        let first = engine.reconcile(quotes.clone());
        assert!(!first.is_empty());
        let second = engine.reconcile(quotes);
        assert!(second.is_empty());
    }

    #[test]
    fn test_reconcile_orders_cancels_before_replaces_before_places() {
        let mut engine = engine();
        engine.confirm_placed(DesiredQuote { side: Side::Bid, level: 1, price: 99.0, size: 10.0 });
        engine.confirm_placed(DesiredQuote { side: Side::Bid, level: 2, price: 98.0, size: 10.0 });

        let desired = vec![
            DesiredQuote { side: Side::Bid, level: 2, price: 50.0, size: 10.0 },
            DesiredQuote { side: Side::Ask, level: 1, price: 101.0, size: 10.0 },
        ];
        let actions = engine.reconcile(desired);
        let kinds: Vec<&str> = actions
            .iter()
            .map(|a| match a {
                QuoteAction::Cancel { .. } => "cancel",
                QuoteAction::CancelThenPlace { .. } => "replace",
                QuoteAction::Place(_) => "place",
            })
            .collect();
        assert_eq!(kinds, vec!["cancel", "replace", "place"]);
    }

    #[test]
    fn test_rate_limit_queues_overflow_until_window_rolls() {
        let config = QuoteEngineConfig { max_orders_per_second: 2, ..QuoteEngineConfig::default() };
        let mut engine = QuoteEngine::new(config, 0.5, "MM");
        let quotes = engine.ladder(&price(100.0, 0.9), 0.0, 0.0);
        let total = quotes.len();
        assert!(total > 2);

        let first = engine.reconcile(quotes);
        assert_eq!(first.len(), 2);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        let second = engine.reconcile(Vec::new());
        assert_eq!(second.len(), 2);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        let third = engine.reconcile(Vec::new());
        assert_eq!(third.len(), total - 4);
    }

    #[test]
    fn test_cancel_all_clears_active_set() {
        let mut engine = engine();
        let quotes = engine.ladder(&price(100.0, 0.9), 0.0, 0.0);
        for q in &quotes {
            engine.confirm_placed(*q);
        }
        let actions = engine.cancel_all();
        assert_eq!(actions.len(), quotes.len());
        assert_eq!(engine.active_count(), 0);
    }
}
