use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use serde_json::json;
use tokio::sync::Mutex;

use crate::audit::{AuditEventType, AuditLog};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::ohlc::OhlcBuilder;
use crate::redis_tier::RedisTier;
use crate::sql_tier::SqlTier;
use crate::store::MemoryStore;

/// Wires the data-pipeline tiers together and runs three periodic
/// background tasks: a fast flush (memory -> redis), a slow migration
/// (redis -> sql), and a periodic terminal-order cleanup.
pub struct Orchestrator {
    pub store: Arc<Mutex<MemoryStore>>,
    pub audit: Arc<Mutex<AuditLog>>,
    pub ohlc: Arc<Mutex<OhlcBuilder>>,
    redis: Arc<RedisTier>,
    sql: Arc<SqlTier>,
    config: EngineConfig,
}

impl Orchestrator {
    pub async fn new(config: EngineConfig) -> EngineResult<Self> {
        let audit = AuditLog::open(&config.audit_dir, &config.session_id)?;
        let redis = RedisTier::new(&config.redis_url, "truex", "mm", &config.session_id)?;
        let sql = SqlTier::connect(&config.database_url).await?;
        sql.ensure_schema().await?;

        Ok(Self {
            store: Arc::new(Mutex::new(MemoryStore::new())),
            audit: Arc::new(Mutex::new(audit)),
            ohlc: Arc::new(Mutex::new(OhlcBuilder::new())),
            redis: Arc::new(redis),
            sql: Arc::new(sql),
            config,
        })
    }

    /// Runs `ExecRecovery.recover()` against the audit trail before any
    /// quoting begins.
    pub async fn recover(&self) -> EngineResult<()> {
        let mut audit = self.audit.lock().await;
        let mut store = self.store.lock().await;
        let report = crate::exec_recovery::recover(&audit, &mut store, &self.config.session_id)?;
        drop(audit);
        drop(store);
        info!(
            "startup recovery complete: {} events scanned, {} replayed",
            report.events_scanned, report.events_replayed
        );
        Ok(())
    }

    pub fn spawn_background_tasks(&self) {
        self.spawn_fast_flush();
        self.spawn_slow_migration();
        self.spawn_cleanup();
    }

    fn spawn_fast_flush(&self) {
        let store = self.store.clone();
        let redis = self.redis.clone();
        let interval = Duration::from_secs(self.config.flush_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let (orders, fills, ohlc) = {
                    let mut s = store.lock().await;
                    (s.pending_orders(500), s.pending_fills(500), s.pending_ohlc(500))
                };
                if !orders.is_empty() {
                    let report = redis.flush_orders(&orders).await;
                    if report.failed > 0 {
                        error!("order flush had {} failures", report.failed);
                    }
                }
                if !fills.is_empty() {
                    let report = redis.flush_fills(&fills).await;
                    if report.failed > 0 {
                        error!("fill flush had {} failures", report.failed);
                    }
                }
                if !ohlc.is_empty() {
                    let report = redis.flush_ohlc(&ohlc).await;
                    if report.failed > 0 {
                        error!("ohlc flush had {} failures", report.failed);
                    }
                }
            }
        });
    }

    fn spawn_slow_migration(&self) {
        let store = self.store.clone();
        let sql = self.sql.clone();
        let session_id = self.config.session_id.clone();
        let interval = Duration::from_secs(self.config.migrate_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let (orders, fills, candles) = {
                    let s = store.lock().await;
                    (
                        s.all_orders().cloned().collect::<Vec<_>>(),
                        s.all_fills().cloned().collect::<Vec<_>>(),
                        s.all_candles().to_vec(),
                    )
                };
                if let Err(e) = sql.migrate_from_redis(&session_id, &orders, &fills, &candles).await {
                    error!("sql migration failed: {}", e);
                }
            }
        });
    }

    fn spawn_cleanup(&self) {
        let store = self.store.clone();
        let interval = Duration::from_secs(self.config.cleanup_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let mut s = store.lock().await;
                let removed = s.cleanup(chrono::Duration::hours(24));
                if removed > 0 {
                    info!("cleanup evicted {} terminal orders", removed);
                }
            }
        });
    }

    /// Records a state transition to the audit log synchronously before
    /// exposing it to any other observer. A write failure is CRITICAL: the
    /// caller must halt trading (cancel-all + disconnect FIX) rather than
    /// continue.
    pub async fn audit_order_event(&self, raw_fix: &str) -> EngineResult<()> {
        let mut audit = self.audit.lock().await;
        audit.append(AuditEventType::OrderEvent, json!({"raw_fix": raw_fix}))
    }
}
