use chrono::Utc;
use serde_json::json;

use truex_mm_engine::audit::{AuditEventType, AuditLog};
use truex_mm_engine::exec_report::{apply_execution_report, parse_execution_report};
use truex_mm_engine::fix::{tags, FixMessage};
use truex_mm_engine::store::{MemoryStore, Order, OrderSide, OrderStatus};

fn fill_report(cl_ord_id: &str, exec_id: &str, qty: &str, px: &str) -> FixMessage {
    let now = Utc::now();
    let mut msg = FixMessage::new(tags::msg_type::EXECUTION_REPORT, 1, "VENUE", "MAKER", &now);
    msg.set(tags::CL_ORD_ID, cl_ord_id);
    msg.set(tags::ORDER_ID, "EXCH-1");
    msg.set(tags::EXEC_ID, exec_id);
    msg.set(tags::EXEC_TYPE, tags::exec_type::FILL);
    msg.set(tags::ORD_STATUS, tags::ord_status::PARTIALLY_FILLED);
    msg.set(tags::LAST_QTY, qty);
    msg.set(tags::LAST_PX, px);
    msg.set(tags::SIDE, tags::side::BUY);
    msg.set(tags::SYMBOL, "BTC-PYUSD");
    msg
}

/// Boundary scenario: a duplicate execution report (same exec_id, possibly
/// via PossDup retransmission) must not double-apply — exactly one Fill is
/// stored and the order's filled_size increases only once.
#[test]
fn test_duplicate_execution_report_is_applied_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut audit = AuditLog::open(dir.path(), "sess-dup").unwrap();
    let mut store = MemoryStore::new();
    store.add_order(Order::new("MM-1", "BTC-PYUSD", OrderSide::Buy, 2.0, Some(100.0)));
    store.update_order("MM-1", |o| {
        o.transition(OrderStatus::Sent);
        o.transition(OrderStatus::Open);
    });

    let report_msg = fill_report("MM-1", "exec-dup-1", "1.0", "100.0");
    let raw = String::from_utf8(report_msg.to_bytes()).unwrap();

    for _ in 0..2 {
        audit
            .append(AuditEventType::FixMessage, json!({"raw_fix": raw}))
            .unwrap();
        let parsed = parse_execution_report(&report_msg).unwrap();
        apply_execution_report(&mut store, &parsed);
    }

    let order = store.get_order("MM-1").unwrap();
    assert_eq!(order.filled_size, 1.0);
    assert_eq!(order.status, OrderStatus::PartiallyFilled);

    let entries = audit.recover_session("sess-dup", None).unwrap();
    assert_eq!(entries.len(), 2, "both retransmissions are still recorded in the audit trail");
}

/// Boundary scenario: two separate fills with distinct exec_ids against
/// the same order both apply, and their quantities sum without exceeding
/// the order size invariant (sigma fill.quantity <= order.size).
#[test]
fn test_sequential_partial_fills_sum_without_exceeding_order_size() {
    let mut store = MemoryStore::new();
    store.add_order(Order::new("MM-2", "BTC-PYUSD", OrderSide::Buy, 2.0, Some(100.0)));
    store.update_order("MM-2", |o| {
        o.transition(OrderStatus::Sent);
        o.transition(OrderStatus::Open);
    });

    let first = fill_report("MM-2", "exec-a", "1.0", "100.0");
    let second = fill_report("MM-2", "exec-b", "1.0", "101.0");

    apply_execution_report(&mut store, &parse_execution_report(&first).unwrap());
    apply_execution_report(&mut store, &parse_execution_report(&second).unwrap());

    let order = store.get_order("MM-2").unwrap();
    assert_eq!(order.filled_size, 2.0);
    assert!(order.filled_size <= order.size);
    assert!((order.avg_fill_price.unwrap() - 100.5).abs() < 1e-9);
}

/// Boundary scenario: FIX logon round-trips through the wire framing
/// (checksum/body-length) the way a real counterparty parser would see it.
#[test]
fn test_logon_message_is_byte_parseable_after_serialization() {
    let now = Utc::now();
    let logon = FixMessage::create_logon(1, "MAKER", "VENUE", 30, true, Some("user"), Some("pass"), None, &now);
    let bytes = logon.to_bytes();
    let parsed = FixMessage::parse(&bytes).unwrap();
    assert_eq!(parsed.msg_type(), Some(tags::msg_type::LOGON));
    assert_eq!(parsed.get(tags::USERNAME), Some("user"));
    assert_eq!(parsed.get(tags::RESET_SEQ_NUM_FLAG), Some("Y"));
}
