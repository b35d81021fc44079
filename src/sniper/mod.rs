// =============================================================================
// Sniper — tick-driven condition matcher and position manager
// =============================================================================
//
// The hot path. `on_tick` is called synchronously from the feed reader for
// every price tick and must finish in well under a millisecond: exits first,
// then one-shot entries through the risk gate, then a cheap once-a-second
// sweep of expired conditions and cooldowns. There is no I/O here — the
// journal and the quick update hand their work to async writers.
//
// Fill model: entries fill at the tick price that crossed the trigger;
// exits fill at the stop/take-profit gate price. When one tick crosses both
// gates the take-profit wins.
//
// The sniper exclusively owns balance, in-position capital, open positions,
// and the active condition set. Everything outside reaches it through
// copying methods (`set_conditions`, `status`).
// =============================================================================

pub mod risk;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::feed::price_book::PriceBook;
use crate::feed::{FeedHealth, PriceTick};
use crate::journal::{Journal, MarketContext};
use crate::knowledge::KnowledgeStore;
use crate::learning::quick_update::QuickUpdate;
use crate::store::writer::{WriteOp, WriterHandle};
use crate::types::{Direction, EngineMode, ExitReason, TriggerKind};

// =============================================================================
// Models
// =============================================================================

/// A validated, time-bounded trade recipe produced by the strategist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeCondition {
    pub id: String,
    pub coin: String,
    pub direction: Direction,
    pub trigger_price: f64,
    pub trigger_condition: TriggerKind,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub position_size_usd: f64,
    pub reasoning: String,
    pub strategy_id: String,
    #[serde(default)]
    pub pattern_id: Option<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub valid_until: i64,
    #[serde(default)]
    pub triggered: bool,
}

impl TradeCondition {
    pub fn triggered_by(&self, price: f64) -> bool {
        match self.trigger_condition {
            TriggerKind::Above => price >= self.trigger_price,
            TriggerKind::Below => price <= self.trigger_price,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.valid_until
    }
}

/// An open simulated trade. All P&L is paper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub coin: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub size_usd: f64,
    pub entry_ts: i64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub strategy_id: String,
    #[serde(default)]
    pub pattern_id: Option<String>,
    pub condition_id: String,
}

/// Copied account snapshot for the strategist and the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SniperStatus {
    pub mode: EngineMode,
    pub starting_balance: f64,
    /// Available (undeployed) balance.
    pub balance: f64,
    /// Capital currently deployed in open positions.
    pub in_positions: f64,
    pub equity: f64,
    pub total_pnl: f64,
    pub open_positions: Vec<Position>,
    pub active_conditions: usize,
    pub tick_count: u64,
    pub trades_closed: u64,
}

// =============================================================================
// Sniper
// =============================================================================

struct Inner {
    starting_balance: f64,
    balance: f64,
    in_positions: f64,
    open: Vec<Position>,
    conditions: Vec<TradeCondition>,
    /// coin -> cooldown expiry, epoch ms.
    cooldowns: HashMap<String, i64>,
    tick_count: u64,
    trades_closed: u64,
    last_sweep_ms: i64,
}

pub struct Sniper {
    inner: RwLock<Inner>,
    mode: RwLock<EngineMode>,
    knowledge: Arc<KnowledgeStore>,
    journal: Arc<Journal>,
    quick_update: Arc<QuickUpdate>,
    feed_health: Arc<FeedHealth>,
    book: Arc<PriceBook>,
    writer: WriterHandle,
    cooldown_ms: i64,
    started_at: Instant,
}

impl Sniper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        starting_balance: f64,
        cooldown_s: i64,
        knowledge: Arc<KnowledgeStore>,
        journal: Arc<Journal>,
        quick_update: Arc<QuickUpdate>,
        feed_health: Arc<FeedHealth>,
        book: Arc<PriceBook>,
        writer: WriterHandle,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                starting_balance,
                balance: starting_balance,
                in_positions: 0.0,
                open: Vec::new(),
                conditions: Vec::new(),
                cooldowns: HashMap::new(),
                tick_count: 0,
                trades_closed: 0,
                last_sweep_ms: 0,
            }),
            mode: RwLock::new(EngineMode::Running),
            knowledge,
            journal,
            quick_update,
            feed_health,
            book,
            writer,
            cooldown_ms: cooldown_s * 1000,
            started_at: Instant::now(),
        }
    }

    // ── Hot path ────────────────────────────────────────────────────────

    /// Process one tick. Never suspends, never raises. O(conditions +
    /// open positions) per call.
    pub fn on_tick(&self, tick: &PriceTick) {
        let now_ms = tick.ts;
        let mode = *self.mode.read();
        let mut inner = self.inner.write();
        inner.tick_count += 1;

        self.process_exits(&mut inner, tick, now_ms);

        // A paused engine (or an unhealthy feed) still manages exits above;
        // only new entries are gated off.
        self.process_entries(&mut inner, tick, now_ms, mode);

        if now_ms - inner.last_sweep_ms >= 1_000 {
            inner.last_sweep_ms = now_ms;
            Self::sweep(&mut inner, now_ms);
        }
    }

    fn process_exits(&self, inner: &mut Inner, tick: &PriceTick, now_ms: i64) {
        let mut closed: Vec<(Position, f64, ExitReason)> = Vec::new();

        let mut i = 0;
        while i < inner.open.len() {
            if inner.open[i].coin != tick.coin {
                i += 1;
                continue;
            }
            // Take-profit wins when both gates are crossed by the same tick.
            let (fill, reason) = if tick.price >= inner.open[i].take_profit_price {
                (inner.open[i].take_profit_price, ExitReason::TakeProfit)
            } else if tick.price <= inner.open[i].stop_loss_price {
                (inner.open[i].stop_loss_price, ExitReason::StopLoss)
            } else {
                i += 1;
                continue;
            };
            let position = inner.open.remove(i);
            closed.push((position, fill, reason));
        }

        for (position, fill, reason) in closed {
            inner.in_positions -= position.size_usd;
            let result = self.journal.record_exit(&position, fill, now_ms, reason);
            inner.balance += position.size_usd + result.pnl_usd;
            inner.trades_closed += 1;

            info!(
                position_id = %position.id,
                coin = %position.coin,
                reason = %reason,
                entry = position.entry_price,
                exit = fill,
                pnl = result.pnl_usd,
                balance = inner.balance,
                "position closed"
            );

            let update = self.quick_update.apply(&result);
            if let Some(pattern_id) = &update.pattern_deactivated {
                debug!(pattern_id = %pattern_id, "exit deactivated its pattern");
            }
        }
    }

    fn process_entries(
        &self,
        inner: &mut Inner,
        tick: &PriceTick,
        now_ms: i64,
        mode: EngineMode,
    ) {
        let mut idx = 0;
        while idx < inner.conditions.len() {
            let fires = {
                let c = &inner.conditions[idx];
                c.coin == tick.coin && c.triggered_by(tick.price)
            };
            if !fires {
                idx += 1;
                continue;
            }

            let decision = {
                let condition = &inner.conditions[idx];
                let ctx = risk::GateContext {
                    mode,
                    feed_healthy: self.feed_health.entries_allowed(),
                    now_ms,
                    available_balance: inner.balance,
                    in_positions: inner.in_positions,
                    open_positions: &inner.open,
                    coin_status: self.knowledge.coin_status(&condition.coin),
                    cooldown_until: inner.cooldowns.get(&condition.coin).copied(),
                };
                risk::evaluate(condition, &ctx)
            };

            match decision {
                Ok(effective) => {
                    // One-shot: remove before executing so a duplicate tick
                    // can never double-open.
                    let mut condition = inner.conditions.remove(idx);
                    condition.triggered = true;
                    self.execute_entry(inner, condition, effective, tick, now_ms);
                    // idx stays: removal shifted the next candidate into it.
                }
                Err(reject) => {
                    debug!(
                        condition_id = %inner.conditions[idx].id,
                        coin = %tick.coin,
                        reject = %reject,
                        "entry rejected by risk gate"
                    );
                    idx += 1;
                }
            }
        }
    }

    fn execute_entry(
        &self,
        inner: &mut Inner,
        condition: TradeCondition,
        effective_size: f64,
        tick: &PriceTick,
        now_ms: i64,
    ) {
        let entry_price = tick.price;
        let position = Position {
            id: Uuid::new_v4().to_string(),
            coin: condition.coin.clone(),
            direction: condition.direction,
            entry_price,
            size_usd: effective_size,
            entry_ts: now_ms,
            stop_loss_price: entry_price * (1.0 - condition.stop_loss_pct / 100.0),
            take_profit_price: entry_price * (1.0 + condition.take_profit_pct / 100.0),
            strategy_id: condition.strategy_id.clone(),
            pattern_id: condition.pattern_id.clone(),
            condition_id: condition.id.clone(),
        };

        inner.balance -= effective_size;
        inner.in_positions += effective_size;

        let until = now_ms + self.cooldown_ms;
        inner.cooldowns.insert(condition.coin.clone(), until);
        self.writer.send(WriteOp::Cooldown {
            coin: condition.coin.clone(),
            until_ms: until,
        });

        info!(
            position_id = %position.id,
            coin = %position.coin,
            entry = entry_price,
            size = effective_size,
            stop_loss = position.stop_loss_price,
            take_profit = position.take_profit_price,
            condition_id = %condition.id,
            "position opened"
        );

        self.journal.record_entry(&position, self.market_context(tick));
        inner.open.push(position);
    }

    fn sweep(inner: &mut Inner, now_ms: i64) {
        let before = inner.conditions.len();
        inner.conditions.retain(|c| !c.is_expired(now_ms));
        let dropped = before - inner.conditions.len();
        if dropped > 0 {
            debug!(dropped, "expired conditions swept");
        }
        inner.cooldowns.retain(|_, until| now_ms < *until);
    }

    fn market_context(&self, tick: &PriceTick) -> MarketContext {
        let btc_trend = self.book.last("BTC").map(|t| {
            if t.change_24h > 1.0 {
                "up".to_string()
            } else if t.change_24h < -1.0 {
                "down".to_string()
            } else {
                "flat".to_string()
            }
        });
        MarketContext {
            regime: None,
            volatility: Some(tick.change_24h.abs()),
            btc_trend,
            funding: None,
        }
    }

    // ── External surface (copies, never shared state) ───────────────────

    /// Atomically replace the active condition set. Already-expired entries
    /// are dropped on the way in.
    pub fn set_conditions(&self, conditions: Vec<TradeCondition>) {
        let now_ms = Utc::now().timestamp_millis();
        let fresh: Vec<TradeCondition> = conditions
            .into_iter()
            .filter(|c| !c.is_expired(now_ms))
            .collect();

        self.writer.send(WriteOp::Conditions(fresh.clone()));

        let mut inner = self.inner.write();
        let replaced = std::mem::replace(&mut inner.conditions, fresh);
        info!(
            active = inner.conditions.len(),
            replaced = replaced.len(),
            "condition set swapped"
        );
    }

    pub fn active_conditions(&self) -> Vec<TradeCondition> {
        self.inner.read().conditions.clone()
    }

    pub fn status(&self) -> SniperStatus {
        let inner = self.inner.read();
        let equity = inner.balance + inner.in_positions;
        SniperStatus {
            mode: *self.mode.read(),
            starting_balance: inner.starting_balance,
            balance: inner.balance,
            in_positions: inner.in_positions,
            equity,
            total_pnl: equity - inner.starting_balance,
            open_positions: inner.open.clone(),
            active_conditions: inner.conditions.len(),
            tick_count: inner.tick_count,
            trades_closed: inner.trades_closed,
        }
    }

    pub fn cooldown_active(&self, coin: &str, now_ms: i64) -> bool {
        self.inner
            .read()
            .cooldowns
            .get(coin)
            .map(|until| now_ms < *until)
            .unwrap_or(false)
    }

    pub fn set_mode(&self, mode: EngineMode) {
        *self.mode.write() = mode;
        info!(mode = %mode, "engine mode changed");
    }

    pub fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Snapshot for the runtime-state table.
    pub fn runtime_state(&self) -> crate::store::RuntimeState {
        let inner = self.inner.read();
        crate::store::RuntimeState {
            starting_balance: inner.starting_balance,
            balance: inner.balance,
            open_positions: inner.open.clone(),
            active_conditions: inner.conditions.clone(),
            cooldowns: inner.cooldowns.clone(),
            tick_count: inner.tick_count,
            uptime_s: self.uptime_s(),
            shutdown_ts: Utc::now().timestamp_millis(),
        }
    }

    /// Restore balance, positions, conditions, and cooldowns from a previous
    /// run. Called once before the feed starts.
    pub fn hydrate(&self, state: crate::store::RuntimeState) {
        let now_ms = Utc::now().timestamp_millis();
        let mut inner = self.inner.write();
        inner.starting_balance = state.starting_balance;
        inner.balance = state.balance;
        inner.in_positions = state.open_positions.iter().map(|p| p.size_usd).sum();
        inner.open = state.open_positions;
        inner.conditions = state
            .active_conditions
            .into_iter()
            .filter(|c| !c.is_expired(now_ms))
            .collect();
        inner.cooldowns = state
            .cooldowns
            .into_iter()
            .filter(|(_, until)| now_ms < *until)
            .collect();
        info!(
            balance = inner.balance,
            open = inner.open.len(),
            conditions = inner.conditions.len(),
            cooldowns = inner.cooldowns.len(),
            "sniper state restored"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CoinStatus;

    const START_BALANCE: f64 = 10_000.0;

    struct Rig {
        sniper: Sniper,
        knowledge: Arc<KnowledgeStore>,
    }

    fn rig() -> Rig {
        let knowledge = Arc::new(KnowledgeStore::new(WriterHandle::detached()));
        let journal = Arc::new(Journal::new(WriterHandle::detached()));
        let quick_update = Arc::new(QuickUpdate::new(knowledge.clone(), WriterHandle::detached()));
        let feed_health = Arc::new(FeedHealth::new());
        feed_health.mark_tick();
        let book = Arc::new(PriceBook::new());

        let sniper = Sniper::new(
            START_BALANCE,
            1800,
            knowledge.clone(),
            journal,
            quick_update,
            feed_health,
            book,
            WriterHandle::detached(),
        );
        Rig { sniper, knowledge }
    }

    fn condition(coin: &str, trigger: f64, kind: TriggerKind, size: f64) -> TradeCondition {
        let now = Utc::now().timestamp_millis();
        TradeCondition {
            id: Uuid::new_v4().to_string(),
            coin: coin.to_string(),
            direction: Direction::Long,
            trigger_price: trigger,
            trigger_condition: kind,
            stop_loss_pct: 2.0,
            take_profit_pct: 1.5,
            position_size_usd: size,
            reasoning: "momentum continuation".to_string(),
            strategy_id: "llm_v1".to_string(),
            pattern_id: None,
            created_at: now,
            valid_until: now + 300_000,
            triggered: false,
        }
    }

    fn tick(coin: &str, price: f64) -> PriceTick {
        PriceTick {
            coin: coin.to_string(),
            price,
            ts: Utc::now().timestamp_millis(),
            vol_24h: 1.0e9,
            change_24h: 1.2,
        }
    }

    #[test]
    fn happy_path_take_profit() {
        let r = rig();
        r.sniper
            .set_conditions(vec![condition("BTC", 42_000.0, TriggerKind::Above, 100.0)]);

        // Below the trigger: nothing happens.
        r.sniper.on_tick(&tick("BTC", 41_999.0));
        assert!(r.sniper.status().open_positions.is_empty());

        // Crossing the trigger opens at the tick price.
        r.sniper.on_tick(&tick("BTC", 42_001.0));
        let status = r.sniper.status();
        assert_eq!(status.open_positions.len(), 1);
        let pos = &status.open_positions[0];
        assert!((pos.entry_price - 42_001.0).abs() < 1e-9);
        assert!((status.balance - (START_BALANCE - 100.0)).abs() < 1e-9);
        assert!((status.in_positions - 100.0).abs() < 1e-9);

        // Price through the take-profit gate: fill at the gate price.
        r.sniper.on_tick(&tick("BTC", 42_700.0));
        let status = r.sniper.status();
        assert!(status.open_positions.is_empty());
        assert_eq!(status.trades_closed, 1);
        // pnl = 100 * 1.5% = ~1.50
        assert!((status.total_pnl - 1.50).abs() < 0.01);
        assert!((status.balance - 10_001.50).abs() < 0.01);
    }

    #[test]
    fn happy_path_stop_loss() {
        let r = rig();
        r.sniper
            .set_conditions(vec![condition("BTC", 42_000.0, TriggerKind::Above, 100.0)]);
        r.sniper.on_tick(&tick("BTC", 42_001.0));

        // Below the stop: fill exactly at stop_loss_price = 42001 * 0.98.
        r.sniper.on_tick(&tick("BTC", 41_100.0));
        let status = r.sniper.status();
        assert!(status.open_positions.is_empty());
        assert!((status.total_pnl - (-2.0)).abs() < 0.01);
        assert!((status.balance - 9_998.0).abs() < 0.01);
    }

    #[test]
    fn exit_fills_at_gate_price_not_tick_price() {
        let r = rig();
        let mut c = condition("BTC", 100.0, TriggerKind::Above, 100.0);
        c.stop_loss_pct = 5.0;
        c.take_profit_pct = 0.5;
        r.sniper.set_conditions(vec![c]);
        r.sniper.on_tick(&tick("BTC", 100.0));
        assert_eq!(r.sniper.status().open_positions.len(), 1);

        // A gap tick far beyond the gate fills at the gate price (100.5),
        // not the tick price, so pnl is exactly +0.5%.
        r.sniper.on_tick(&tick("BTC", 140.0));
        let status = r.sniper.status();
        assert!(status.open_positions.is_empty());
        assert!((status.total_pnl - 0.5).abs() < 1e-9);
    }

    #[test]
    fn duplicate_tick_cannot_double_open() {
        let r = rig();
        r.sniper
            .set_conditions(vec![condition("ETH", 2_000.0, TriggerKind::Below, 50.0)]);

        let t = tick("ETH", 1_999.0);
        r.sniper.on_tick(&t);
        r.sniper.on_tick(&t);
        let status = r.sniper.status();
        assert_eq!(status.open_positions.len(), 1);
        assert!((status.in_positions - 50.0).abs() < 1e-9);
    }

    #[test]
    fn blacklisted_coin_never_enters() {
        let r = rig();
        // Blacklist DOGE via five losing trades' worth of knowledge.
        for _ in 0..5 {
            r.knowledge.update_coin_score("DOGE", false, -2.0, 0);
        }
        assert_eq!(r.knowledge.coin_status("DOGE"), CoinStatus::Blacklisted);

        r.sniper
            .set_conditions(vec![condition("DOGE", 0.10, TriggerKind::Above, 50.0)]);
        r.sniper.on_tick(&tick("DOGE", 0.11));
        assert!(r.sniper.status().open_positions.is_empty());
    }

    #[test]
    fn balance_conservation_through_a_cycle() {
        let r = rig();
        r.sniper
            .set_conditions(vec![condition("BTC", 42_000.0, TriggerKind::Above, 100.0)]);
        r.sniper.on_tick(&tick("BTC", 42_001.0));

        // While open: balance + in_positions == starting_balance.
        let open = r.sniper.status();
        assert!(
            (open.balance + open.in_positions - START_BALANCE).abs() < 1e-9
        );

        r.sniper.on_tick(&tick("BTC", 42_700.0));
        let closed = r.sniper.status();
        // After close: equity == starting + realised pnl.
        assert!((closed.equity - (START_BALANCE + closed.total_pnl)).abs() < 1e-9);
        assert!((closed.in_positions).abs() < 1e-9);
    }

    #[test]
    fn set_conditions_replaces_atomically_and_drops_expired() {
        let r = rig();
        r.sniper
            .set_conditions(vec![condition("BTC", 1.0, TriggerKind::Above, 20.0)]);
        assert_eq!(r.sniper.status().active_conditions, 1);

        let mut expired = condition("ETH", 1.0, TriggerKind::Above, 20.0);
        expired.valid_until = Utc::now().timestamp_millis() - 1;
        let fresh = condition("SOL", 1.0, TriggerKind::Above, 20.0);
        r.sniper.set_conditions(vec![expired, fresh]);

        let active = r.sniper.active_conditions();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].coin, "SOL");
    }

    #[test]
    fn cooldown_starts_on_entry_and_blocks_reentry() {
        let r = rig();
        r.sniper
            .set_conditions(vec![condition("BTC", 42_000.0, TriggerKind::Above, 100.0)]);
        r.sniper.on_tick(&tick("BTC", 42_001.0));
        let now = Utc::now().timestamp_millis();
        assert!(r.sniper.cooldown_active("BTC", now));

        // Close the position, then offer a fresh condition — cooldown blocks.
        r.sniper.on_tick(&tick("BTC", 42_700.0));
        r.sniper
            .set_conditions(vec![condition("BTC", 42_000.0, TriggerKind::Above, 100.0)]);
        r.sniper.on_tick(&tick("BTC", 42_800.0));
        assert!(r.sniper.status().open_positions.is_empty());
    }

    #[test]
    fn paused_engine_blocks_entries_but_still_exits() {
        let r = rig();
        r.sniper
            .set_conditions(vec![condition("BTC", 42_000.0, TriggerKind::Above, 100.0)]);
        r.sniper.on_tick(&tick("BTC", 42_001.0));
        assert_eq!(r.sniper.status().open_positions.len(), 1);

        r.sniper.set_mode(EngineMode::Paused);

        // Exit still fires while paused.
        r.sniper.on_tick(&tick("BTC", 42_700.0));
        assert!(r.sniper.status().open_positions.is_empty());

        // But a new trigger does not.
        r.sniper
            .set_conditions(vec![condition("ETH", 2_000.0, TriggerKind::Above, 50.0)]);
        r.sniper.on_tick(&tick("ETH", 2_001.0));
        assert!(r.sniper.status().open_positions.is_empty());
    }

    #[test]
    fn runtime_state_roundtrip() {
        let r = rig();
        r.sniper
            .set_conditions(vec![condition("BTC", 42_000.0, TriggerKind::Above, 100.0)]);
        r.sniper.on_tick(&tick("BTC", 42_001.0));

        let state = r.sniper.runtime_state();
        assert_eq!(state.open_positions.len(), 1);
        assert!((state.balance - (START_BALANCE - 100.0)).abs() < 1e-9);

        // A fresh sniper restored from the snapshot matches.
        let r2 = rig();
        r2.sniper.hydrate(state);
        let status = r2.sniper.status();
        assert_eq!(status.open_positions.len(), 1);
        assert!((status.balance - (START_BALANCE - 100.0)).abs() < 1e-9);
        assert!((status.in_positions - 100.0).abs() < 1e-9);
    }
}
