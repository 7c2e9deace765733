use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use super::tags;
use crate::error::EngineError;

pub const SOH: u8 = 0x01;
const BEGIN_STRING_VALUE: &str = "FIX.4.4";

/// An ordered tag-value FIX message. Field order matters for wire output
/// (header tags first, body in insertion order, trailer last), so an
/// `IndexMap` is used rather than a `HashMap`.
#[derive(Debug, Clone, Default)]
pub struct FixMessage {
    pub fields: IndexMap<u32, String>,
}

impl FixMessage {
    pub fn new(msg_type: &str, seq_num: u64, sender: &str, target: &str, now: &DateTime<Utc>) -> Self {
        let mut m = Self::default();
        m.fields.insert(tags::MSG_TYPE, msg_type.to_string());
        m.fields.insert(tags::SENDER_COMP_ID, sender.to_string());
        m.fields.insert(tags::TARGET_COMP_ID, target.to_string());
        m.fields.insert(tags::MSG_SEQ_NUM, seq_num.to_string());
        m.fields
            .insert(tags::SENDING_TIME, format_sending_time(now));
        m
    }

    pub fn set(&mut self, tag: u32, value: impl Into<String>) -> &mut Self {
        self.fields.insert(tag, value.into());
        self
    }

    pub fn get(&self, tag: u32) -> Option<&str> {
        self.fields.get(&tag).map(|s| s.as_str())
    }

    pub fn get_checked(&self, tag: u32) -> Result<&str, EngineError> {
        self.get(tag)
            .ok_or_else(|| EngineError::Protocol(format!("missing tag {}", tag)))
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.get(tags::MSG_TYPE)
    }

    pub fn msg_seq_num(&self) -> Option<u64> {
        self.get(tags::MSG_SEQ_NUM).and_then(|v| v.parse().ok())
    }

    /// Serializes to wire bytes, computing BodyLength and Checksum.
    /// Body is every field after `35=` up to (not including) the checksum
    /// trailer; header (`8=`, `9=`) is prefixed once lengths are known.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for (tag, value) in &self.fields {
            if *tag == tags::BEGIN_STRING || *tag == tags::BODY_LENGTH || *tag == tags::CHECKSUM {
                continue;
            }
            body.extend_from_slice(format!("{}={}", tag, value).as_bytes());
            body.push(SOH);
        }

        let mut out = Vec::new();
        out.extend_from_slice(format!("{}={}", tags::BEGIN_STRING, BEGIN_STRING_VALUE).as_bytes());
        out.push(SOH);
        out.extend_from_slice(format!("{}={}", tags::BODY_LENGTH, body.len()).as_bytes());
        out.push(SOH);
        out.extend_from_slice(&body);

        let checksum: u32 = out.iter().map(|b| *b as u32).sum::<u32>() % 256;
        out.extend_from_slice(format!("{}={:03}", tags::CHECKSUM, checksum).as_bytes());
        out.push(SOH);
        out
    }

    /// Parses a single complete FIX message (including the trailing
    /// checksum field) from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, EngineError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| EngineError::Protocol(format!("non-utf8 fix message: {}", e)))?;
        let mut fields = IndexMap::new();
        for field in text.split(SOH as char) {
            if field.is_empty() {
                continue;
            }
            let mut parts = field.splitn(2, '=');
            let tag_str = parts
                .next()
                .ok_or_else(|| EngineError::Protocol("empty field".into()))?;
            let value = parts
                .next()
                .ok_or_else(|| EngineError::Protocol(format!("field missing '=': {}", field)))?;
            let tag: u32 = tag_str
                .parse()
                .map_err(|_| EngineError::Protocol(format!("non-numeric tag: {}", tag_str)))?;
            fields.insert(tag, value.to_string());
        }
        if !fields.contains_key(&tags::MSG_TYPE) {
            return Err(EngineError::Protocol("missing 35=MsgType".into()));
        }
        Ok(Self { fields })
    }

    pub fn create_logon(
        seq_num: u64,
        sender: &str,
        target: &str,
        heartbeat_secs: u32,
        reset_seq_num: bool,
        username: Option<&str>,
        password: Option<&str>,
        raw_data: Option<&str>,
        now: &DateTime<Utc>,
    ) -> Self {
        let mut m = Self::new(tags::msg_type::LOGON, seq_num, sender, target, now);
        m.set(tags::ENCRYPT_METHOD, "0");
        m.set(tags::HEART_BT_INT, heartbeat_secs.to_string());
        if reset_seq_num {
            m.set(tags::RESET_SEQ_NUM_FLAG, "Y");
        }
        if let Some(u) = username {
            m.set(tags::USERNAME, u);
        }
        if let Some(p) = password {
            m.set(tags::PASSWORD, p);
        }
        if let Some(raw) = raw_data {
            m.set(tags::RAW_DATA, raw);
        }
        m
    }

    pub fn create_heartbeat(
        seq_num: u64,
        sender: &str,
        target: &str,
        test_req_id: Option<&str>,
        now: &DateTime<Utc>,
    ) -> Self {
        let mut m = Self::new(tags::msg_type::HEARTBEAT, seq_num, sender, target, now);
        if let Some(id) = test_req_id {
            m.set(tags::TEST_REQ_ID, id);
        }
        m
    }

    pub fn create_test_request(
        seq_num: u64,
        sender: &str,
        target: &str,
        test_req_id: &str,
        now: &DateTime<Utc>,
    ) -> Self {
        let mut m = Self::new(tags::msg_type::TEST_REQUEST, seq_num, sender, target, now);
        m.set(tags::TEST_REQ_ID, test_req_id);
        m
    }

    pub fn create_logout(seq_num: u64, sender: &str, target: &str, now: &DateTime<Utc>) -> Self {
        Self::new(tags::msg_type::LOGOUT, seq_num, sender, target, now)
    }

    pub fn create_resend_request(
        seq_num: u64,
        sender: &str,
        target: &str,
        begin_seq: u64,
        end_seq: u64,
        now: &DateTime<Utc>,
    ) -> Self {
        let mut m = Self::new(tags::msg_type::RESEND_REQUEST, seq_num, sender, target, now);
        m.set(tags::BEGIN_SEQ_NO, begin_seq.to_string());
        m.set(tags::END_SEQ_NO, end_seq.to_string());
        m
    }

    pub fn create_reject(
        seq_num: u64,
        sender: &str,
        target: &str,
        ref_seq_num: u64,
        reason: &str,
        now: &DateTime<Utc>,
    ) -> Self {
        let mut m = Self::new(tags::msg_type::REJECT, seq_num, sender, target, now);
        m.set(tags::REF_SEQ_NUM, ref_seq_num.to_string());
        m.set(tags::TEXT, reason);
        m
    }

    pub fn create_new_order_single(
        seq_num: u64,
        sender: &str,
        target: &str,
        cl_ord_id: &str,
        symbol: &str,
        side: &str,
        qty: f64,
        ord_type: &str,
        price: Option<f64>,
        time_in_force: &str,
        now: &DateTime<Utc>,
    ) -> Self {
        let mut m = Self::new(tags::msg_type::NEW_ORDER_SINGLE, seq_num, sender, target, now);
        m.set(tags::CL_ORD_ID, cl_ord_id);
        m.set(tags::SYMBOL, symbol);
        m.set(tags::SIDE, side);
        m.set(tags::ORDER_QTY, qty.to_string());
        m.set(tags::ORD_TYPE, ord_type);
        if let Some(p) = price {
            m.set(tags::PRICE, p.to_string());
        }
        m.set(tags::TIME_IN_FORCE, time_in_force);
        m.set(tags::TRANSACT_TIME, format_sending_time(now));
        m
    }

    pub fn create_order_cancel_request(
        seq_num: u64,
        sender: &str,
        target: &str,
        cl_ord_id: &str,
        orig_cl_ord_id: &str,
        symbol: &str,
        side: &str,
        now: &DateTime<Utc>,
    ) -> Self {
        let mut m = Self::new(tags::msg_type::ORDER_CANCEL_REQUEST, seq_num, sender, target, now);
        m.set(tags::CL_ORD_ID, cl_ord_id);
        m.set(tags::ORIG_CL_ORD_ID, orig_cl_ord_id);
        m.set(tags::SYMBOL, symbol);
        m.set(tags::SIDE, side);
        m.set(tags::TRANSACT_TIME, format_sending_time(now));
        m
    }
}

pub fn format_sending_time(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%d-%H:%M:%S%.3f").to_string()
}
