use log::info;

use crate::audit::{AuditEventType, AuditLog};
use crate::error::EngineResult;
use crate::exec_report::{apply_execution_report, parse_execution_report};
use crate::fix::FixMessage;
use crate::store::MemoryStore;

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub events_scanned: usize,
    pub events_replayed: usize,
}

/// Reconciles `MemoryStore` against the `AuditLog` for a session on
/// startup: scans recorded execution-report events and replays any that
/// are missing from the in-memory store. Never fabricates state absent
/// from the audit trail.
pub fn recover(audit: &AuditLog, store: &mut MemoryStore, session_id: &str) -> EngineResult<RecoveryReport> {
    let entries = audit.recover_session(session_id, None)?;
    let mut report = RecoveryReport::default();

    for entry in entries {
        if entry.event_type != AuditEventType::OrderEvent {
            continue;
        }
        report.events_scanned += 1;

        let raw_fix = match entry.payload.get("raw_fix").and_then(|v| v.as_str()) {
            Some(raw) => raw,
            None => continue,
        };
        let msg = match FixMessage::parse(raw_fix.as_bytes()) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let parsed = match parse_execution_report(&msg) {
            Some(p) => p,
            None => continue,
        };
        if store.get_fill_by_exec(&parsed.exec_id).is_none() && !store_has_order(store, &parsed.client_order_id) {
            continue;
        }
        if apply_execution_report(store, &parsed) {
            report.events_replayed += 1;
        }
    }

    info!(
        "exec recovery for session {}: scanned {} events, replayed {}",
        session_id, report.events_scanned, report.events_replayed
    );
    Ok(report)
}

fn store_has_order(store: &MemoryStore, client_order_id: &str) -> bool {
    store.get_order(client_order_id).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEventType;
    use crate::fix::tags;
    use crate::store::{Order, OrderSide, OrderStatus};
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_recover_replays_missing_order_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut audit = AuditLog::open(dir.path(), "sess-1").unwrap();

        let now = Utc::now();
        let mut msg = FixMessage::new(tags::msg_type::EXECUTION_REPORT, 1, "VENUE", "MAKER", &now);
        msg.set(tags::CL_ORD_ID, "MM-1");
        msg.set(tags::EXEC_ID, "exec-1");
        msg.set(tags::EXEC_TYPE, tags::exec_type::FILL);
        msg.set(tags::ORD_STATUS, tags::ord_status::FILLED);
        msg.set(tags::LAST_QTY, "1.0");
        msg.set(tags::LAST_PX, "100.0");
        msg.set(tags::SIDE, tags::side::BUY);
        msg.set(tags::SYMBOL, "BTC-PYUSD");
        let raw = String::from_utf8(msg.to_bytes()).unwrap();

        audit
            .append(AuditEventType::OrderEvent, json!({"raw_fix": raw}))
            .unwrap();

        let mut store = MemoryStore::new();
        store.add_order(Order::new("MM-1", "BTC-PYUSD", OrderSide::Buy, 1.0, Some(100.0)));
        store.update_order("MM-1", |o| {
            o.transition(OrderStatus::Sent);
            o.transition(OrderStatus::Open);
        });

        let report = recover(&audit, &mut store, "sess-1").unwrap();
        assert_eq!(report.events_replayed, 1);
        assert!(store.get_fill_by_exec("exec-1").is_some());
    }

    #[test]
    fn test_recover_ignores_events_for_unknown_orders() {
        let dir = tempfile::tempdir().unwrap();
        let mut audit = AuditLog::open(dir.path(), "sess-1").unwrap();
        let now = Utc::now();
        let mut msg = FixMessage::new(tags::msg_type::EXECUTION_REPORT, 1, "VENUE", "MAKER", &now);
        msg.set(tags::CL_ORD_ID, "MM-UNKNOWN");
        msg.set(tags::EXEC_ID, "exec-9");
        msg.set(tags::EXEC_TYPE, tags::exec_type::FILL);
        msg.set(tags::ORD_STATUS, tags::ord_status::FILLED);
        msg.set(tags::LAST_QTY, "1.0");
        msg.set(tags::LAST_PX, "100.0");
        msg.set(tags::SIDE, tags::side::BUY);
        msg.set(tags::SYMBOL, "BTC-PYUSD");
        let raw = String::from_utf8(msg.to_bytes()).unwrap();
        audit
            .append(AuditEventType::OrderEvent, json!({"raw_fix": raw}))
            .unwrap();

        let mut store = MemoryStore::new();
        let report = recover(&audit, &mut store, "sess-1").unwrap();
        assert_eq!(report.events_replayed, 0);
    }
}
