use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    Snapshot(SnapshotPayload),
    Delta(DeltaPayload),
    Trade(TradePayload),
}

#[derive(Debug, Deserialize)]
pub struct LevelPayload {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotPayload {
    pub symbol: String,
    pub bids: Vec<LevelPayload>,
    pub asks: Vec<LevelPayload>,
}

#[derive(Debug, Deserialize)]
pub struct DeltaPayload {
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Deserialize)]
pub struct TradePayload {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub side: String,
    pub ts: u64,
}

/// Tracks whether the feed has gone silent via a shared `AtomicBool`
/// flipped by a background watcher task.
pub struct StallWatch {
    last_message_ms: AtomicU64,
    stalled: AtomicBool,
}

impl StallWatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_message_ms: AtomicU64::new(0),
            stalled: AtomicBool::new(false),
        })
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_message_ms.store(now_ms, Ordering::Relaxed);
        self.stalled.store(false, Ordering::Relaxed);
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Relaxed)
    }

    pub fn mark_stalled_if_quiet(&self, now_ms: u64, threshold_ms: u64) {
        let last = self.last_message_ms.load(Ordering::Relaxed);
        if last != 0 && now_ms.saturating_sub(last) > threshold_ms {
            self.stalled.store(true, Ordering::Relaxed);
        }
    }
}

/// Connects to the reference venue's normalized WebSocket feed and forwards
/// parsed events to `tx`. Reconnects with exponential backoff (1s doubling,
/// capped at `max_backoff_secs`).
pub async fn run_with_reconnect(
    url: String,
    symbols: Vec<String>,
    tx: mpsc::Sender<FeedEvent>,
    stall: Arc<StallWatch>,
    max_backoff_secs: u64,
) {
    let mut backoff = 1u64;
    loop {
        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                info!("feed connected to {}", url);
                backoff = 1;
                for symbol in &symbols {
                    let sub = serde_json::json!({"op": "subscribe", "symbol": symbol});
                    if ws.send(Message::Text(sub.to_string())).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(150)).await;
                }
                while let Some(msg) = ws.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            let now_ms = now_millis();
                            stall.touch(now_ms);
                            match serde_json::from_str::<FeedEvent>(&text) {
                                Ok(event) => {
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => warn!("unparseable feed message: {}", e),
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(_)) => {
                            warn!("feed closed by remote");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("feed read error: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!("feed connect failed: {}", e);
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(max_backoff_secs);
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_watch_starts_unstalled() {
        let watch = StallWatch::new();
        assert!(!watch.is_stalled());
    }

    #[test]
    fn test_stall_watch_flags_quiet_feed() {
        let watch = StallWatch::new();
        watch.touch(1_000);
        watch.mark_stalled_if_quiet(40_000, 30_000);
        assert!(watch.is_stalled());
    }

    #[test]
    fn test_touch_clears_stalled_flag() {
        let watch = StallWatch::new();
        watch.touch(1_000);
        watch.mark_stalled_if_quiet(40_000, 30_000);
        assert!(watch.is_stalled());
        watch.touch(41_000);
        assert!(!watch.is_stalled());
    }

    #[test]
    fn test_snapshot_payload_deserializes() {
        let json = r#"{"type":"snapshot","symbol":"BTC-PYUSD","bids":[{"price":100.0,"size":1.0}],"asks":[]}"#;
        let event: FeedEvent = serde_json::from_str(json).unwrap();
        match event {
            FeedEvent::Snapshot(s) => assert_eq!(s.symbol, "BTC-PYUSD"),
            _ => panic!("expected snapshot"),
        }
    }
}
