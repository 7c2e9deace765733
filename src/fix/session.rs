use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::{error, info, warn};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::message::{format_sending_time, FixMessage, SOH};
use super::tags;
use crate::config::FixSessionConfig;
use crate::error::{EngineError, EngineResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingLogon,
    LoggedOn,
    LoggingOut,
}

/// Tracks outbound/inbound sequence counters and connection state for one
/// FIX session: framing, logon, heartbeats, and resend requests on sequence
/// gaps.
pub struct FixSession {
    config: FixSessionConfig,
    state: SessionState,
    out_seq: u64,
    in_seq: u64,
    stream: Option<BufReader<TcpStream>>,
    last_inbound: Option<chrono::DateTime<Utc>>,
    pending_test_req: Option<String>,
}

impl FixSession {
    pub fn new(config: FixSessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            out_seq: 1,
            in_seq: 1,
            stream: None,
            last_inbound: None,
            pending_test_req: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn logon_signature(&self, sending_time: &str, seq_num: u64) -> Option<String> {
        let secret = self.config.hmac_secret.as_ref()?;
        let password = self.config.password.as_deref().unwrap_or("");
        let payload = format!(
            "{}{}{}{}{}{}",
            tags::msg_type::LOGON,
            sending_time,
            seq_num,
            self.config.sender_comp_id,
            self.config.target_comp_id,
            password
        );
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(payload.as_bytes());
        Some(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Connects the transport and completes logon; returns only after the
    /// counterparty's Logon (35=A) is received and accepted.
    pub async fn connect(&mut self) -> EngineResult<()> {
        self.state = SessionState::Connecting;
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(&addr))
            .await
            .map_err(|_| EngineError::Timeout(format!("connect to {}", addr)))?
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        self.stream = Some(BufReader::new(stream));

        let now = Utc::now();
        let sending_time = format_sending_time(&now);
        let signature = self.logon_signature(&sending_time, self.out_seq);

        let mut logon = FixMessage::create_logon(
            self.out_seq,
            &self.config.sender_comp_id,
            &self.config.target_comp_id,
            self.config.heartbeat_secs,
            self.config.reset_seq_num_on_logon,
            self.config.username.as_deref(),
            None,
            signature.as_deref(),
            &now,
        );
        if let Some(sig) = signature {
            logon.set(tags::RAW_DATA, sig);
        }

        self.state = SessionState::AwaitingLogon;
        self.write_message(&logon).await?;
        self.out_seq += 1;

        let reply = tokio::time::timeout(Duration::from_secs(10), self.read_message())
            .await
            .map_err(|_| EngineError::Timeout("logon reply".into()))??;

        if reply.msg_type() != Some(tags::msg_type::LOGON) {
            return Err(EngineError::Auth(format!(
                "expected logon reply, got {:?}",
                reply.msg_type()
            )));
        }
        self.in_seq = reply.msg_seq_num().unwrap_or(1) + 1;
        self.state = SessionState::LoggedOn;
        self.last_inbound = Some(Utc::now());
        info!("fix session logged on as {}", self.config.sender_comp_id);
        Ok(())
    }

    pub async fn disconnect(&mut self) -> EngineResult<()> {
        if self.state == SessionState::Disconnected {
            return Ok(());
        }
        self.state = SessionState::LoggingOut;
        let now = Utc::now();
        let logout = FixMessage::create_logout(
            self.out_seq,
            &self.config.sender_comp_id,
            &self.config.target_comp_id,
            &now,
        );
        let _ = self.write_message(&logout).await;
        self.stream = None;
        self.state = SessionState::Disconnected;
        Ok(())
    }

    /// Applies header tags, advances the outbound sequence counter only on
    /// a successful write, and flushes the frame.
    pub async fn send(&mut self, mut msg: FixMessage) -> EngineResult<()> {
        msg.set(tags::MSG_SEQ_NUM, self.out_seq.to_string());
        msg.set(tags::SENDER_COMP_ID, self.config.sender_comp_id.clone());
        msg.set(tags::TARGET_COMP_ID, self.config.target_comp_id.clone());
        self.write_message(&msg).await?;
        self.out_seq += 1;
        Ok(())
    }

    async fn write_message(&mut self, msg: &FixMessage) -> EngineResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::Transport("not connected".into()))?;
        let bytes = msg.to_bytes();
        stream
            .get_mut()
            .write_all(&bytes)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Reads one complete SOH-delimited FIX message (up to and including
    /// the checksum field) from the stream.
    async fn read_message(&mut self) -> EngineResult<FixMessage> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::Transport("not connected".into()))?;
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        let checksum_prefix = format!("{}=", tags::CHECKSUM);
        loop {
            stream
                .read_exact(&mut byte)
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            buf.push(byte[0]);
            if byte[0] == SOH {
                // The checksum field (10=XXX) is always the trailer; once
                // the most recently closed field matches it, the message
                // is complete.
                let without_trailing_soh = &buf[..buf.len() - 1];
                if let Some(last_soh) = without_trailing_soh.iter().rposition(|b| *b == SOH) {
                    let last_field = &without_trailing_soh[last_soh + 1..];
                    if last_field.starts_with(checksum_prefix.as_bytes()) {
                        break;
                    }
                } else if without_trailing_soh.starts_with(checksum_prefix.as_bytes()) {
                    break;
                }
            }
        }
        FixMessage::parse(&buf)
    }

    /// Processes one inbound message: sequence discipline, heartbeat and
    /// test-request handling. Returns `Some(message)` for anything the
    /// caller (exec-report handler, etc.) still needs to act on.
    pub async fn on_inbound(&mut self, msg: FixMessage) -> EngineResult<Option<FixMessage>> {
        self.last_inbound = Some(Utc::now());
        let seq = msg
            .msg_seq_num()
            .ok_or_else(|| EngineError::Protocol("inbound missing 34=MsgSeqNum".into()))?;

        if seq > self.in_seq {
            warn!("seq gap: expected {}, got {}", self.in_seq, seq);
            let now = Utc::now();
            let resend = FixMessage::create_resend_request(
                self.out_seq,
                &self.config.sender_comp_id,
                &self.config.target_comp_id,
                self.in_seq,
                seq - 1,
                &now,
            );
            self.send(resend).await?;
            return Err(EngineError::SeqGap {
                expected: self.in_seq,
                got: seq,
            });
        }
        if seq < self.in_seq && msg.get(tags::POSS_DUP_FLAG) != Some("Y") {
            error!("seq lower than expected without PossDup, disconnecting");
            self.disconnect().await?;
            return Err(EngineError::Protocol("seq below expected, no PossDup".into()));
        }
        self.in_seq = seq + 1;

        match msg.msg_type() {
            Some(tags::msg_type::HEARTBEAT) => {
                if let Some(id) = msg.get(tags::TEST_REQ_ID) {
                    if self.pending_test_req.as_deref() == Some(id) {
                        self.pending_test_req = None;
                    }
                }
                Ok(None)
            }
            Some(tags::msg_type::TEST_REQUEST) => {
                let id = msg.get(tags::TEST_REQ_ID).unwrap_or("").to_string();
                let now = Utc::now();
                let hb = FixMessage::create_heartbeat(
                    self.out_seq,
                    &self.config.sender_comp_id,
                    &self.config.target_comp_id,
                    Some(&id),
                    &now,
                );
                self.send(hb).await?;
                Ok(None)
            }
            Some(tags::msg_type::LOGOUT) => {
                self.state = SessionState::Disconnected;
                Ok(Some(msg))
            }
            _ => Ok(Some(msg)),
        }
    }

    /// Runs the main read loop, forwarding application-level messages
    /// (execution reports, rejects, business message rejects) to `tx`, and
    /// dispatching anything handed to `outbound_rx` (new orders, cancels)
    /// over the wire. On heartbeat starvation or transport error, returns
    /// so the caller can reconnect with backoff.
    pub async fn run(&mut self, tx: mpsc::Sender<FixMessage>, outbound_rx: &mut mpsc::Receiver<FixMessage>) -> EngineResult<()> {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_secs as u64);
        loop {
            let read_fut = self.read_message();
            let timeout = tokio::time::sleep(heartbeat_interval + Duration::from_secs(5));
            tokio::select! {
                result = read_fut => {
                    let msg = result?;
                    if let Some(app_msg) = self.on_inbound(msg).await? {
                        if tx.send(app_msg).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                _ = timeout => {
                    if self.pending_test_req.is_some() {
                        return Err(EngineError::Transport("heartbeat starvation".into()));
                    }
                    let id = uuid::Uuid::new_v4().to_string();
                    let now = Utc::now();
                    let req = FixMessage::create_test_request(
                        self.out_seq,
                        &self.config.sender_comp_id,
                        &self.config.target_comp_id,
                        &id,
                        &now,
                    );
                    self.pending_test_req = Some(id);
                    self.send(req).await?;
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(msg) => self.send(msg).await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    pub fn next_cl_ord_id(&self, counter: u64) -> String {
        let candidate = format!("{}-{}", &self.config.sender_comp_id, counter);
        candidate.chars().take(18).collect()
    }
}

/// Reconnect loop with exponential backoff (1s doubling, capped at
/// `max_backoff_secs`). `outbound_rx` survives reconnects so callers can
/// keep enqueuing new orders and cancels across a dropped session.
pub async fn run_with_reconnect(
    config: FixSessionConfig,
    tx: mpsc::Sender<FixMessage>,
    mut outbound_rx: mpsc::Receiver<FixMessage>,
    max_backoff_secs: u64,
) {
    let mut backoff = 1u64;
    loop {
        let mut session = FixSession::new(config.clone());
        match session.connect().await {
            Ok(()) => {
                backoff = 1;
                if let Err(e) = session.run(tx.clone(), &mut outbound_rx).await {
                    error!("fix session error: {}", e);
                }
            }
            Err(e) => {
                error!("fix connect failed: {}", e);
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(max_backoff_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> FixSessionConfig {
        FixSessionConfig {
            sender_comp_id: "MAKER".into(),
            target_comp_id: "VENUE".into(),
            host: "127.0.0.1".into(),
            port: 1,
            heartbeat_secs: 30,
            reset_seq_num_on_logon: false,
            username: None,
            password: Some("pw".into()),
            hmac_secret: Some("secret".into()),
        }
    }

    #[test]
    fn test_logon_signature_is_deterministic() {
        let session = FixSession::new(test_config());
        let a = session.logon_signature("20240101-00:00:00.000", 1);
        let b = session.logon_signature("20240101-00:00:00.000", 1);
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn test_logon_signature_changes_with_seq_num() {
        let session = FixSession::new(test_config());
        let a = session.logon_signature("20240101-00:00:00.000", 1);
        let b = session.logon_signature("20240101-00:00:00.000", 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_next_cl_ord_id_respects_length_limit() {
        let session = FixSession::new(test_config());
        let id = session.next_cl_ord_id(123456789012345678);
        assert!(id.len() <= 18);
    }

    #[tokio::test]
    async fn test_pending_test_req_cleared_on_matching_heartbeat() {
        let mut session = FixSession::new(test_config());
        session.pending_test_req = Some("abc".into());
        let hb = FixMessage::create_heartbeat(1, "VENUE", "MAKER", Some("abc"), &Utc::now());
        session.on_inbound(hb).await.unwrap();
        assert!(session.pending_test_req.is_none());
    }

    #[tokio::test]
    async fn test_unmatched_heartbeat_does_not_clear_pending_test_req() {
        let mut session = FixSession::new(test_config());
        session.pending_test_req = Some("abc".into());
        let hb = FixMessage::create_heartbeat(1, "VENUE", "MAKER", Some("other"), &Utc::now());
        session.on_inbound(hb).await.unwrap();
        assert_eq!(session.pending_test_req.as_deref(), Some("abc"));
    }
}
