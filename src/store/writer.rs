// =============================================================================
// Store Writer — the single async writer draining every hot-path write
// =============================================================================
//
// The sniper, journal, and knowledge store enqueue here and return
// immediately; this task is the only thing that touches SQLite on their
// behalf, so write order is exactly send order (entry before exit per
// position included). The writer also owns the post-exit capture timers:
// closing a trade schedules +60 s / +300 s / +900 s price captures on a
// priority queue, serviced between queue reads.
// =============================================================================

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::analytics::ProfitSnapshot;
use crate::feed::price_book::PriceBook;
use crate::journal::{MarketContext, TradeResult};
use crate::knowledge::{CoinScore, RegimeRule, TradingPattern};
use crate::learning::adaptation::{Adaptation, Effectiveness};
use crate::learning::reflection::ReflectionRecord;
use crate::sniper::{Position, TradeCondition};

use super::{CaptureSlot, RuntimeState, Store};

/// One queued write.
pub enum WriteOp {
    TradeOpened(Position, MarketContext),
    TradeClosed(TradeResult),
    CoinScore(CoinScore),
    Pattern(TradingPattern),
    Rule(RegimeRule),
    Cooldown { coin: String, until_ms: i64 },
    Conditions(Vec<TradeCondition>),
    Activity { ts: i64, category: String, message: String },
    Adaptation(Adaptation),
    AdaptationMeasured {
        adaptation_id: String,
        post_metrics: serde_json::Value,
        effectiveness: Effectiveness,
        measured_at: i64,
    },
    Reflection(ReflectionRecord),
    Snapshot(ProfitSnapshot),
    EquityPoint { ts: i64, balance: f64, total_pnl: f64 },
    RuntimeState(RuntimeState),
    /// Acknowledged once every previously queued op has been applied.
    Flush(oneshot::Sender<()>),
}

/// Cloneable sender side of the writer queue. Sending never blocks and never
/// fails loudly — once the writer is gone (shutdown), ops are dropped with a
/// debug log.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriteOp>,
    depth: Arc<AtomicU64>,
}

impl WriterHandle {
    pub fn send(&self, op: WriteOp) {
        self.depth.fetch_add(1, AtomicOrdering::Relaxed);
        if self.tx.send(op).is_err() {
            self.depth.fetch_sub(1, AtomicOrdering::Relaxed);
            debug!("store writer gone — write op dropped");
        }
    }

    /// Wait until the writer has applied everything queued before this call.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(WriteOp::Flush(tx));
        let _ = rx.await;
    }

    /// Queued-but-unapplied op count, for the health report.
    pub fn queue_depth(&self) -> u64 {
        self.depth.load(AtomicOrdering::Relaxed)
    }

    /// A handle with no writer behind it. Sends are dropped silently;
    /// `flush` returns immediately. For tests and tools.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            tx,
            depth: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Spawn the writer task. Returns the handle and the join handle; the task
/// exits once every `WriterHandle` clone is dropped and the queue drains.
pub fn spawn(store: Arc<Store>, book: Arc<PriceBook>) -> (WriterHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicU64::new(0));
    let handle = WriterHandle {
        tx,
        depth: depth.clone(),
    };
    let join = tokio::spawn(run(rx, store, book, depth));
    (handle, join)
}

/// A scheduled post-exit price capture.
struct CaptureTimer {
    due: Instant,
    trade_id: String,
    coin: String,
    slot: CaptureSlot,
}

// BinaryHeap is a max-heap; invert the ordering to pop the earliest timer.
impl PartialEq for CaptureTimer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for CaptureTimer {}
impl PartialOrd for CaptureTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for CaptureTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due)
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    store: Arc<Store>,
    book: Arc<PriceBook>,
    depth: Arc<AtomicU64>,
) {
    let mut captures: BinaryHeap<CaptureTimer> = BinaryHeap::new();
    info!("store writer started");

    loop {
        let next_due = captures.peek().map(|c| c.due);

        tokio::select! {
            op = rx.recv() => {
                match op {
                    Some(op) => {
                        apply(&store, &mut captures, op);
                        depth.fetch_sub(1, AtomicOrdering::Relaxed);
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)),
                if next_due.is_some() =>
            {
                let now = Instant::now();
                while let Some(timer) = captures.peek() {
                    if timer.due > now {
                        break;
                    }
                    let timer = captures.pop().expect("peeked timer exists");
                    run_capture(&store, &book, &timer);
                }
            }
        }
    }

    info!("store writer stopped");
}

fn run_capture(store: &Store, book: &PriceBook, timer: &CaptureTimer) {
    let Some(price) = book.price(&timer.coin) else {
        warn!(coin = %timer.coin, trade_id = %timer.trade_id, "no price for post-exit capture");
        return;
    };
    if let Err(e) = store.set_post_exit_price(&timer.trade_id, timer.slot, price) {
        warn!(error = %e, trade_id = %timer.trade_id, "post-exit capture write failed");
    } else {
        debug!(
            trade_id = %timer.trade_id,
            coin = %timer.coin,
            price,
            delay_s = timer.slot.delay_s(),
            "post-exit price captured"
        );
    }
}

fn apply(store: &Store, captures: &mut BinaryHeap<CaptureTimer>, op: WriteOp) {
    let result = match op {
        WriteOp::TradeOpened(position, context) => store.insert_open_trade(&position, &context),
        WriteOp::TradeClosed(trade) => {
            let now = Instant::now();
            for slot in [CaptureSlot::Plus1m, CaptureSlot::Plus5m, CaptureSlot::Plus15m] {
                captures.push(CaptureTimer {
                    due: now + std::time::Duration::from_secs(slot.delay_s()),
                    trade_id: trade.id.clone(),
                    coin: trade.coin.clone(),
                    slot,
                });
            }
            store.insert_closed_trade(&trade)
        }
        WriteOp::CoinScore(score) => store.upsert_coin_score(&score),
        WriteOp::Pattern(pattern) => store.upsert_pattern(&pattern),
        WriteOp::Rule(rule) => store.upsert_rule(&rule),
        WriteOp::Cooldown { coin, until_ms } => store.upsert_cooldown(&coin, until_ms),
        WriteOp::Conditions(conditions) => store.replace_conditions(&conditions),
        WriteOp::Activity { ts, category, message } => {
            store.insert_activity(ts, &category, &message)
        }
        WriteOp::Adaptation(adaptation) => store.insert_adaptation(&adaptation),
        WriteOp::AdaptationMeasured {
            adaptation_id,
            post_metrics,
            effectiveness,
            measured_at,
        } => store.set_adaptation_measured(&adaptation_id, &post_metrics, effectiveness, measured_at),
        WriteOp::Reflection(record) => store.insert_reflection(&record),
        WriteOp::Snapshot(snapshot) => store.insert_snapshot(&snapshot),
        WriteOp::EquityPoint { ts, balance, total_pnl } => {
            store.insert_equity_point(ts, balance, total_pnl)
        }
        WriteOp::RuntimeState(state) => store.save_runtime_state(&state),
        WriteOp::Flush(ack) => {
            let _ = ack.send(());
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!(error = %e, "store write failed");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::build_trade_result;
    use crate::types::{Direction, ExitReason};

    fn position(id: &str) -> Position {
        Position {
            id: id.to_string(),
            coin: "BTC".to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            size_usd: 50.0,
            entry_ts: 1_000,
            stop_loss_price: 98.0,
            take_profit_price: 101.5,
            strategy_id: "llm_v1".to_string(),
            pattern_id: None,
            condition_id: "c1".to_string(),
        }
    }

    #[tokio::test]
    async fn writer_applies_ops_in_order_and_flushes() {
        let store = Arc::new(Store::in_memory().unwrap());
        let book = Arc::new(PriceBook::new());
        let (handle, _join) = spawn(store.clone(), book);

        let pos = position("t1");
        handle.send(WriteOp::TradeOpened(pos.clone(), MarketContext::default()));
        let trade = build_trade_result(
            &pos,
            101.5,
            61_000,
            ExitReason::TakeProfit,
            MarketContext::default(),
        );
        handle.send(WriteOp::TradeClosed(trade));
        handle.send(WriteOp::Activity {
            ts: 61_001,
            category: "test".to_string(),
            message: "done".to_string(),
        });

        handle.flush().await;

        let trades = store.recent_closed_trades(10).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].id, "t1");
        assert_eq!(handle.queue_depth(), 0);
    }

    #[tokio::test]
    async fn detached_handle_flushes_immediately() {
        let handle = WriterHandle::detached();
        handle.send(WriteOp::Activity {
            ts: 0,
            category: "x".to_string(),
            message: "y".to_string(),
        });
        handle.flush().await;
    }

    #[test]
    fn capture_heap_pops_earliest_first() {
        let mut heap: BinaryHeap<CaptureTimer> = BinaryHeap::new();
        let now = Instant::now();
        for (id, delay) in [("a", 900u64), ("b", 60), ("c", 300)] {
            heap.push(CaptureTimer {
                due: now + std::time::Duration::from_secs(delay),
                trade_id: id.to_string(),
                coin: "BTC".to_string(),
                slot: CaptureSlot::Plus1m,
            });
        }
        assert_eq!(heap.pop().unwrap().trade_id, "b");
        assert_eq!(heap.pop().unwrap().trade_id, "c");
        assert_eq!(heap.pop().unwrap().trade_id, "a");
    }
}
