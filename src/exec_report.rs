use chrono::Utc;

use crate::fix::{tags, FixMessage};
use crate::store::{Fill, MemoryStore, OrderSide, OrderStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecType {
    New,
    PartialFill,
    Fill,
    Cancel,
    Reject,
    Unknown,
}

fn map_ord_status(code: &str) -> Option<OrderStatus> {
    match code {
        tags::ord_status::NEW => Some(OrderStatus::Open),
        tags::ord_status::PARTIALLY_FILLED => Some(OrderStatus::PartiallyFilled),
        tags::ord_status::FILLED => Some(OrderStatus::Filled),
        tags::ord_status::CANCELED => Some(OrderStatus::Cancelled),
        tags::ord_status::REJECTED => Some(OrderStatus::Rejected),
        _ => None,
    }
}

fn map_exec_type(code: &str) -> ExecType {
    match code {
        tags::exec_type::NEW => ExecType::New,
        tags::exec_type::FILL => ExecType::Fill,
        tags::exec_type::CANCELED => ExecType::Cancel,
        tags::exec_type::REJECTED => ExecType::Reject,
        _ => ExecType::Unknown,
    }
}

#[derive(Debug)]
pub struct ParsedExecReport {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub exec_id: String,
    pub exec_type: ExecType,
    pub ord_status: Option<OrderStatus>,
    pub last_qty: f64,
    pub last_px: f64,
    pub side: OrderSide,
    pub symbol: String,
    pub msg_seq_num: Option<u64>,
}

pub fn parse_execution_report(msg: &FixMessage) -> Option<ParsedExecReport> {
    let client_order_id = msg.get(tags::CL_ORD_ID)?.to_string();
    let exec_id = msg.get(tags::EXEC_ID)?.to_string();
    let exec_type = map_exec_type(msg.get(tags::EXEC_TYPE).unwrap_or(""));
    let ord_status = msg.get(tags::ORD_STATUS).and_then(map_ord_status);
    let last_qty = msg.get(tags::LAST_QTY).and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let last_px = msg.get(tags::LAST_PX).and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let side = match msg.get(tags::SIDE) {
        Some(tags::side::SELL) => OrderSide::Sell,
        _ => OrderSide::Buy,
    };
    let symbol = msg.get(tags::SYMBOL).unwrap_or("").to_string();
    let exchange_order_id = msg.get(tags::ORDER_ID).map(|s| s.to_string());
    let msg_seq_num = msg.msg_seq_num();

    Some(ParsedExecReport {
        client_order_id,
        exchange_order_id,
        exec_id,
        exec_type,
        ord_status,
        last_qty,
        last_px,
        side,
        symbol,
        msg_seq_num,
    })
}

/// Applies one parsed execution report to the store: dedups by `exec_id`
/// (already-known `exec_id` is a no-op signaling a duplicate), updates
/// order status, and materializes a `Fill` when `last_qty > 0`.
pub fn apply_execution_report(store: &mut MemoryStore, report: &ParsedExecReport) -> bool {
    if !store.reserve_exec_id(&report.exec_id) {
        return false;
    }

    store.update_order(&report.client_order_id, |order| {
        if let Some(exch_id) = &report.exchange_order_id {
            order.exchange_order_id = Some(exch_id.clone());
        }
        if let Some(status) = report.ord_status {
            order.transition(status);
        }
        if report.last_qty > 0.0 {
            order.filled_size += report.last_qty;
            let prior_notional = order.avg_fill_price.unwrap_or(0.0) * (order.filled_size - report.last_qty);
            order.avg_fill_price = Some((prior_notional + report.last_px * report.last_qty) / order.filled_size);
        }
        order.msg_seq_num = report.msg_seq_num;
    });

    if report.last_qty > 0.0 {
        let fill_id = format!("{}-{}", report.client_order_id, report.exec_id);
        let fill = Fill {
            fill_id,
            exec_id: report.exec_id.clone(),
            order_id: report.client_order_id.clone(),
            exchange_order_id: report.exchange_order_id.clone(),
            symbol: report.symbol.clone(),
            side: report.side,
            quantity: report.last_qty,
            price: report.last_px,
            fee: None,
            timestamp: Utc::now(),
        };
        store.add_fill(fill);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Order;
    use chrono::Utc;

    fn fix_fill_report() -> FixMessage {
        let now = Utc::now();
        let mut msg = FixMessage::new(tags::msg_type::EXECUTION_REPORT, 1, "VENUE", "MAKER", &now);
        msg.set(tags::CL_ORD_ID, "MM-1");
        msg.set(tags::ORDER_ID, "EXCH-1");
        msg.set(tags::EXEC_ID, "exec-1");
        msg.set(tags::EXEC_TYPE, tags::exec_type::FILL);
        msg.set(tags::ORD_STATUS, tags::ord_status::FILLED);
        msg.set(tags::LAST_QTY, "1.0");
        msg.set(tags::LAST_PX, "100.0");
        msg.set(tags::SIDE, tags::side::BUY);
        msg.set(tags::SYMBOL, "BTC-PYUSD");
        msg
    }

    #[test]
    fn test_parse_execution_report_extracts_fields() {
        let msg = fix_fill_report();
        let parsed = parse_execution_report(&msg).unwrap();
        assert_eq!(parsed.client_order_id, "MM-1");
        assert_eq!(parsed.exec_type, ExecType::Fill);
        assert_eq!(parsed.last_qty, 1.0);
    }

    #[test]
    fn test_apply_execution_report_creates_fill_and_updates_order() {
        let mut store = MemoryStore::new();
        store.add_order(Order::new("MM-1", "BTC-PYUSD", OrderSide::Buy, 1.0, Some(100.0)));
        store.update_order("MM-1", |o| {
            o.transition(OrderStatus::Sent);
            o.transition(OrderStatus::Open);
        });

        let parsed = parse_execution_report(&fix_fill_report()).unwrap();
        let applied = apply_execution_report(&mut store, &parsed);
        assert!(applied);
        assert!(store.get_fill_by_exec("exec-1").is_some());
        assert_eq!(store.get_order("MM-1").unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_apply_execution_report_is_idempotent_on_duplicate_exec_id() {
        let mut store = MemoryStore::new();
        store.add_order(Order::new("MM-1", "BTC-PYUSD", OrderSide::Buy, 1.0, Some(100.0)));
        store.update_order("MM-1", |o| {
            o.transition(OrderStatus::Sent);
            o.transition(OrderStatus::Open);
        });
        let parsed = parse_execution_report(&fix_fill_report()).unwrap();
        assert!(apply_execution_report(&mut store, &parsed));
        assert!(!apply_execution_report(&mut store, &parsed));
    }

    #[test]
    fn test_apply_execution_report_dedups_non_fill_reports_too() {
        let mut store = MemoryStore::new();
        store.add_order(Order::new("MM-1", "BTC-PYUSD", OrderSide::Buy, 1.0, Some(100.0)));
        store.update_order("MM-1", |o| {
            o.transition(OrderStatus::Sent);
        });

        let now = Utc::now();
        let mut msg = FixMessage::new(tags::msg_type::EXECUTION_REPORT, 1, "VENUE", "MAKER", &now);
        msg.set(tags::CL_ORD_ID, "MM-1");
        msg.set(tags::ORDER_ID, "EXCH-1");
        msg.set(tags::EXEC_ID, "exec-ack-1");
        msg.set(tags::EXEC_TYPE, tags::exec_type::NEW);
        msg.set(tags::ORD_STATUS, tags::ord_status::NEW);
        msg.set(tags::SIDE, tags::side::BUY);
        msg.set(tags::SYMBOL, "BTC-PYUSD");

        let parsed = parse_execution_report(&msg).unwrap();
        assert!(apply_execution_report(&mut store, &parsed));
        assert_eq!(store.get_order("MM-1").unwrap().status, OrderStatus::Open);
        assert!(store.get_fill_by_exec("exec-ack-1").is_none());

        store.update_order("MM-1", |o| {
            o.status = OrderStatus::Sent;
        });
        assert!(!apply_execution_report(&mut store, &parsed));
    }
}
