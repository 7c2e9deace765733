use std::collections::HashMap;
use std::env;

use crate::error::{EngineError, EngineResult};

fn env_var(key: &str) -> EngineResult<String> {
    env::var(key).map_err(|_| EngineError::Config(format!("missing env var {}", key)))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct FixSessionConfig {
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub host: String,
    pub port: u16,
    pub heartbeat_secs: u32,
    pub reset_seq_num_on_logon: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub hmac_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QuoteEngineConfig {
    pub levels: u8,
    pub base_spread_bps: f64,
    pub level_spacing_ticks: f64,
    pub reprice_threshold_ticks: f64,
    pub base_size: f64,
    pub size_decay: f64,
    pub min_notional: f64,
    pub price_band_pct: f64,
    pub confidence_threshold: f64,
    pub max_orders_per_second: u32,
    pub dup_guard_ms: i64,
}

impl Default for QuoteEngineConfig {
    fn default() -> Self {
        Self {
            levels: 3,
            base_spread_bps: 8.0,
            level_spacing_ticks: 2.0,
            reprice_threshold_ticks: 1.5,
            base_size: 100.0,
            size_decay: 0.7,
            min_notional: 10.0,
            price_band_pct: 0.05,
            confidence_threshold: 0.4,
            max_orders_per_second: 10,
            dup_guard_ms: 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SymbolConfig {
    pub tick_size: f64,
    pub min_order_size: f64,
    pub max_order_size: f64,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub session_id: String,
    pub fix: FixSessionConfig,
    pub quote: QuoteEngineConfig,
    pub symbols: HashMap<String, SymbolConfig>,
    pub reference_ws_url: String,
    pub redis_url: String,
    pub database_url: String,
    pub audit_dir: String,
    pub flush_interval_secs: u64,
    pub migrate_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl EngineConfig {
    /// Loads an optional `.env` via `dotenvy`, then reads required and
    /// optional fields from `std::env::var`.
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let session_id = env_or("MM_SESSION_ID", &uuid::Uuid::new_v4().to_string());

        let fix = FixSessionConfig {
            sender_comp_id: env_var("FIX_SENDER_COMP_ID")?,
            target_comp_id: env_var("FIX_TARGET_COMP_ID")?,
            host: env_var("FIX_HOST")?,
            port: env_parse_or("FIX_PORT", 9878u16),
            heartbeat_secs: env_parse_or("FIX_HEARTBEAT_SECS", 30u32),
            reset_seq_num_on_logon: env_parse_or("FIX_RESET_SEQ_NUM", false),
            username: env::var("FIX_USERNAME").ok(),
            password: env::var("FIX_PASSWORD").ok(),
            hmac_secret: env::var("FIX_HMAC_SECRET").ok(),
        };

        let quote = QuoteEngineConfig {
            levels: env_parse_or("MM_LEVELS", 3u8),
            base_spread_bps: env_parse_or("MM_BASE_SPREAD_BPS", 8.0),
            level_spacing_ticks: env_parse_or("MM_LEVEL_SPACING_TICKS", 2.0),
            reprice_threshold_ticks: env_parse_or("MM_REPRICE_THRESHOLD_TICKS", 1.5),
            base_size: env_parse_or("MM_BASE_SIZE", 100.0),
            size_decay: env_parse_or("MM_SIZE_DECAY", 0.7),
            min_notional: env_parse_or("MM_MIN_NOTIONAL", 10.0),
            price_band_pct: env_parse_or("MM_PRICE_BAND_PCT", 0.05),
            confidence_threshold: env_parse_or("MM_CONFIDENCE_THRESHOLD", 0.4),
            max_orders_per_second: env_parse_or("MM_MAX_ORDERS_PER_SEC", 10u32),
            dup_guard_ms: env_parse_or("MM_DUP_GUARD_MS", 250i64),
        };

        let mut symbols = HashMap::new();
        let symbol = env_or("MM_SYMBOL", "BTC-PYUSD");
        symbols.insert(
            symbol,
            SymbolConfig {
                tick_size: env_parse_or("MM_TICK_SIZE", 0.5),
                min_order_size: env_parse_or("MM_MIN_ORDER_SIZE", 0.001),
                max_order_size: env_parse_or("MM_MAX_ORDER_SIZE", 10.0),
            },
        );

        Ok(Self {
            session_id,
            fix,
            quote,
            symbols,
            reference_ws_url: env_var("REFERENCE_WS_URL")?,
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            database_url: env_or("DATABASE_URL", "postgres://localhost/truex_mm"),
            audit_dir: env_or("MM_AUDIT_DIR", "data/audit"),
            flush_interval_secs: env_parse_or("MM_FLUSH_INTERVAL_SECS", 1u64),
            migrate_interval_secs: env_parse_or("MM_MIGRATE_INTERVAL_SECS", 300u64),
            cleanup_interval_secs: env_parse_or("MM_CLEANUP_INTERVAL_SECS", 1800u64),
        })
    }

    pub fn tick_size(&self, symbol: &str) -> f64 {
        self.symbols
            .get(symbol)
            .map(|s| s.tick_size)
            .unwrap_or(0.01)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_size_falls_back_when_symbol_unknown() {
        let cfg = EngineConfig {
            session_id: "s".into(),
            fix: FixSessionConfig {
                sender_comp_id: "A".into(),
                target_comp_id: "B".into(),
                host: "h".into(),
                port: 1,
                heartbeat_secs: 30,
                reset_seq_num_on_logon: false,
                username: None,
                password: None,
                hmac_secret: None,
            },
            quote: QuoteEngineConfig::default(),
            symbols: HashMap::new(),
            reference_ws_url: "ws://x".into(),
            redis_url: "redis://x".into(),
            database_url: "postgres://x".into(),
            audit_dir: "data/audit".into(),
            flush_interval_secs: 1,
            migrate_interval_secs: 300,
            cleanup_interval_secs: 1800,
        };
        assert_eq!(cfg.tick_size("UNKNOWN"), 0.01);
    }
}
