// truex-mm-engine: FIX market-making engine
//
// Maintains two-sided liquidity on a destination FIX venue using a
// confidence-weighted reference price streamed from a second venue's
// WebSocket feed, with a tiered memory -> redis -> sql persistence
// pipeline and an append-only audit trail for disaster recovery.

use std::sync::Arc;

use log::{error, info};
use tokio::sync::{mpsc, Mutex};

use truex_mm_engine::config::EngineConfig;
use truex_mm_engine::error::EngineResult;
use truex_mm_engine::fix::session::run_with_reconnect as run_fix_with_reconnect;
use truex_mm_engine::fix::{tags, FixMessage};
use truex_mm_engine::book::{L2Book, L2Delta, PriceLevel};
use truex_mm_engine::feed::{run_with_reconnect as run_feed_with_reconnect, FeedEvent, StallWatch};
use truex_mm_engine::exec_report::{apply_execution_report, parse_execution_report};
use truex_mm_engine::orchestrator::Orchestrator;
use truex_mm_engine::price_aggregator::PriceAggregator;
use truex_mm_engine::quote_engine::{DesiredQuote, QuoteAction, QuoteEngine, Side};
use truex_mm_engine::store::{MemoryStore, Order, OrderSide, OrderStatus};

#[tokio::main]
async fn main() -> EngineResult<()> {
    env_logger::init();
    let config = EngineConfig::from_env()?;
    info!("starting truex-mm-engine session {}", config.session_id);

    let orchestrator = Orchestrator::new(config.clone()).await?;
    orchestrator.recover().await?;
    orchestrator.spawn_background_tasks();

    let symbol = config
        .symbols
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "BTC-PYUSD".to_string());
    let tick_size = config.tick_size(&symbol);

    let book = Arc::new(Mutex::new(L2Book::new(symbol.clone(), tick_size)));
    let aggregator = Arc::new(Mutex::new(PriceAggregator::new(60_000, 5_000)));
    let quote_engine = Arc::new(Mutex::new(QuoteEngine::new(
        config.quote.clone(),
        tick_size,
        config.fix.sender_comp_id.clone(),
    )));

    let (fix_inbound_tx, mut fix_inbound_rx) = mpsc::channel::<FixMessage>(256);
    let (fix_outbound_tx, fix_outbound_rx) = mpsc::channel::<FixMessage>(256);
    let (feed_tx, mut feed_rx) = mpsc::channel::<FeedEvent>(1024);

    let fix_config = config.fix.clone();
    tokio::spawn(async move {
        run_fix_with_reconnect(fix_config, fix_inbound_tx, fix_outbound_rx, 32).await;
    });

    let feed_symbols = vec![symbol.clone()];
    let stall = StallWatch::new();
    let feed_stall = stall.clone();
    let feed_url = config.reference_ws_url.clone();
    tokio::spawn(async move {
        run_feed_with_reconnect(feed_url, feed_symbols, feed_tx, feed_stall, 32).await;
    });

    // Market-data task: applies feed events to the book and aggregator,
    // then runs one quote-engine cycle.
    {
        let book = book.clone();
        let aggregator = aggregator.clone();
        let quote_engine = quote_engine.clone();
        let ohlc = orchestrator.ohlc.clone();
        let audit = orchestrator.audit.clone();
        let store = orchestrator.store.clone();
        let fix_outbound_tx = fix_outbound_tx.clone();
        let sender_comp_id = config.fix.sender_comp_id.clone();
        let target_comp_id = config.fix.target_comp_id.clone();
        let md_symbol = symbol.clone();
        tokio::spawn(async move {
            while let Some(event) = feed_rx.recv().await {
                let now_ms = chrono::Utc::now().timestamp_millis() as u64;
                match event {
                    FeedEvent::Snapshot(s) => {
                        let bids: Vec<PriceLevel> = s
                            .bids
                            .iter()
                            .map(|l| PriceLevel { price: l.price, size: l.size })
                            .collect();
                        let asks: Vec<PriceLevel> = s
                            .asks
                            .iter()
                            .map(|l| PriceLevel { price: l.price, size: l.size })
                            .collect();
                        book.lock().await.apply_snapshot(&bids, &asks, now_ms);
                    }
                    FeedEvent::Delta(d) => {
                        let delta = L2Delta {
                            is_bid: d.side == "buy",
                            price: d.price,
                            size: d.size,
                        };
                        book.lock().await.apply_deltas(&[delta], now_ms);
                    }
                    FeedEvent::Trade(t) => {
                        aggregator.lock().await.record_trade(t.ts, t.price);
                        ohlc.lock()
                            .await
                            .on_trade(&t.symbol, "reference", 60_000, t.ts, t.price, t.size);
                    }
                }

                let price = {
                    let book = book.lock().await;
                    aggregator.lock().await.aggregate(&book, now_ms)
                };
                let Some(price) = price else { continue };

                let actions = {
                    let mut engine = quote_engine.lock().await;
                    let desired = engine.ladder(&price, 0.0, 0.0);
                    engine.reconcile(desired)
                };
                for action in actions {
                    if let Err(e) = audit_action(&audit, &action).await {
                        error!("audit write failure on quote action, halting: {}", e);
                        return;
                    }
                    match action {
                        QuoteAction::Place(desired) => {
                            dispatch_place(
                                &store,
                                &quote_engine,
                                &fix_outbound_tx,
                                &sender_comp_id,
                                &target_comp_id,
                                &md_symbol,
                                desired,
                            )
                            .await;
                        }
                        QuoteAction::Cancel { cl_ord_id } => {
                            dispatch_cancel(
                                &quote_engine,
                                &fix_outbound_tx,
                                &sender_comp_id,
                                &target_comp_id,
                                &md_symbol,
                                &cl_ord_id,
                            )
                            .await;
                        }
                        QuoteAction::CancelThenPlace { cl_ord_id, desired } => {
                            dispatch_cancel(
                                &quote_engine,
                                &fix_outbound_tx,
                                &sender_comp_id,
                                &target_comp_id,
                                &md_symbol,
                                &cl_ord_id,
                            )
                            .await;
                            dispatch_place(
                                &store,
                                &quote_engine,
                                &fix_outbound_tx,
                                &sender_comp_id,
                                &target_comp_id,
                                &md_symbol,
                                desired,
                            )
                            .await;
                        }
                    }
                }
            }
        });
    }

    // Execution-report task: everything from the FIX session that isn't a
    // session-level message reaches here for dedup + store application.
    {
        let store = orchestrator.store.clone();
        let audit = orchestrator.audit.clone();
        tokio::spawn(async move {
            while let Some(msg) = fix_inbound_rx.recv().await {
                let raw = String::from_utf8_lossy(&msg.to_bytes()).to_string();
                if let Err(e) = {
                    let mut audit = audit.lock().await;
                    audit.append(truex_mm_engine::audit::AuditEventType::FixMessage, serde_json::json!({"raw_fix": raw}))
                } {
                    error!("audit write failure on inbound fix message, halting: {}", e);
                    return;
                }

                if let Some(parsed) = parse_execution_report(&msg) {
                    let mut store = store.lock().await;
                    apply_execution_report(&mut store, &parsed);
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested, draining");
    Ok(())
}

/// Reserves a ClOrdID against the quote engine's active set, sends the
/// corresponding `NewOrderSingle`, and records the order in the store. Rolls
/// the active-set registration back if the outbound channel is gone.
async fn dispatch_place(
    store: &Arc<Mutex<MemoryStore>>,
    quote_engine: &Arc<Mutex<QuoteEngine>>,
    outbound_tx: &mpsc::Sender<FixMessage>,
    sender_comp_id: &str,
    target_comp_id: &str,
    symbol: &str,
    desired: DesiredQuote,
) {
    let cl_ord_id = quote_engine.lock().await.confirm_placed(desired);
    let (fix_side, order_side) = match desired.side {
        Side::Bid => (tags::side::BUY, OrderSide::Buy),
        Side::Ask => (tags::side::SELL, OrderSide::Sell),
    };
    let now = chrono::Utc::now();
    let msg = FixMessage::create_new_order_single(
        0,
        sender_comp_id,
        target_comp_id,
        &cl_ord_id,
        symbol,
        fix_side,
        desired.size,
        tags::ord_type::LIMIT,
        Some(desired.price),
        tags::time_in_force::GOOD_TILL_CANCEL,
        &now,
    );
    if outbound_tx.send(msg).await.is_err() {
        error!("fix outbound channel closed, rolling back place for {}", cl_ord_id);
        quote_engine.lock().await.confirm_cancelled(&cl_ord_id);
        return;
    }
    let mut order = Order::new(cl_ord_id, symbol.to_string(), order_side, desired.size, Some(desired.price));
    order.transition(OrderStatus::Sent);
    store.lock().await.add_order(order);
}

/// Removes `cl_ord_id` from the quote engine's active set and sends an
/// `OrderCancelRequest` under a freshly minted ClOrdID.
async fn dispatch_cancel(
    quote_engine: &Arc<Mutex<QuoteEngine>>,
    outbound_tx: &mpsc::Sender<FixMessage>,
    sender_comp_id: &str,
    target_comp_id: &str,
    symbol: &str,
    cl_ord_id: &str,
) {
    let Some(active) = quote_engine.lock().await.confirm_cancelled(cl_ord_id) else {
        return;
    };
    let new_cl_ord_id = quote_engine.lock().await.new_cl_ord_id();
    let now = chrono::Utc::now();
    let msg = FixMessage::create_order_cancel_request(
        0,
        sender_comp_id,
        target_comp_id,
        &new_cl_ord_id,
        cl_ord_id,
        symbol,
        active.side.fix_value(),
        &now,
    );
    if outbound_tx.send(msg).await.is_err() {
        error!("fix outbound channel closed, dropping cancel for {}", cl_ord_id);
    }
}

async fn audit_action(
    audit: &Arc<Mutex<truex_mm_engine::audit::AuditLog>>,
    action: &QuoteAction,
) -> EngineResult<()> {
    let payload = match action {
        QuoteAction::Place(d) => serde_json::json!({"action": "place", "side": format!("{:?}", d.side), "price": d.price, "size": d.size}),
        QuoteAction::Cancel { cl_ord_id } => serde_json::json!({"action": "cancel", "client_order_id": cl_ord_id}),
        QuoteAction::CancelThenPlace { cl_ord_id, desired } => {
            serde_json::json!({"action": "cancel_then_place", "client_order_id": cl_ord_id, "price": desired.price})
        }
    };
    let mut audit = audit.lock().await;
    audit.append(truex_mm_engine::audit::AuditEventType::OrderEvent, payload)
}
