// =============================================================================
// Trade Journal — records every entry and exit with full context
// =============================================================================
//
// The sniper calls `record_entry` / `record_exit` synchronously from the tick
// path; both only build the row and enqueue it on the store writer, so the
// hot path never touches SQLite. The writer task also owns the post-exit
// capture timers (+1 / +5 / +15 min) that fill `price_plus_*` and
// `missed_profit` after the fact.
// =============================================================================

use std::collections::HashMap;

use chrono::{Datelike, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::sniper::Position;
use crate::store::writer::{WriteOp, WriterHandle};
use crate::types::{Direction, ExitReason};

/// Market conditions captured at entry time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volatility: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub btc_trend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding: Option<f64>,
}

/// One closed trade, the unit the whole learning pipeline consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub id: String,
    pub coin: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size_usd: f64,
    pub entry_ts: i64,
    pub exit_ts: i64,
    pub exit_reason: ExitReason,
    pub pnl_usd: f64,
    pub pnl_pct: f64,
    pub duration_s: i64,
    pub strategy_id: String,
    #[serde(default)]
    pub pattern_id: Option<String>,
    pub condition_id: String,
    #[serde(default)]
    pub market_context: MarketContext,
    pub hour_of_day: u8,
    pub day_of_week: u8,
    #[serde(default)]
    pub price_plus_1m: Option<f64>,
    #[serde(default)]
    pub price_plus_5m: Option<f64>,
    #[serde(default)]
    pub price_plus_15m: Option<f64>,
    #[serde(default)]
    pub missed_profit: Option<f64>,
}

impl TradeResult {
    pub fn won(&self) -> bool {
        self.pnl_usd > 0.0
    }
}

pub struct Journal {
    writer: WriterHandle,
    /// Entry context parked until the matching exit arrives.
    pending_context: Mutex<HashMap<String, MarketContext>>,
}

impl Journal {
    pub fn new(writer: WriterHandle) -> Self {
        Self {
            writer,
            pending_context: Mutex::new(HashMap::new()),
        }
    }

    /// Record a freshly opened position. Returns the journal entry id (the
    /// position id).
    pub fn record_entry(&self, position: &Position, context: MarketContext) -> String {
        self.pending_context
            .lock()
            .insert(position.id.clone(), context.clone());
        self.writer
            .send(WriteOp::TradeOpened(position.clone(), context));
        debug!(position_id = %position.id, coin = %position.coin, "journal entry recorded");
        position.id.clone()
    }

    /// Record an exit, returning the full trade result. The row is enqueued
    /// for persistence together with its three capture timers.
    pub fn record_exit(
        &self,
        position: &Position,
        exit_price: f64,
        exit_ts: i64,
        exit_reason: ExitReason,
    ) -> TradeResult {
        let context = self
            .pending_context
            .lock()
            .remove(&position.id)
            .unwrap_or_else(|| {
                warn!(position_id = %position.id, "exit without journalled entry context");
                MarketContext::default()
            });

        let result = build_trade_result(position, exit_price, exit_ts, exit_reason, context);
        self.writer.send(WriteOp::TradeClosed(result.clone()));
        result
    }

    /// Drain every queued write. Called once during graceful shutdown.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}

/// Pure construction of a [`TradeResult`] from a position and its exit.
pub fn build_trade_result(
    position: &Position,
    exit_price: f64,
    exit_ts: i64,
    exit_reason: ExitReason,
    market_context: MarketContext,
) -> TradeResult {
    let direction_factor = match position.direction {
        Direction::Long => 1.0,
        Direction::Short => -1.0,
    };
    let pnl_pct = if position.entry_price > 0.0 {
        direction_factor * (exit_price - position.entry_price) / position.entry_price * 100.0
    } else {
        0.0
    };
    let pnl_usd = position.size_usd * pnl_pct / 100.0;

    let entry_time = Utc
        .timestamp_millis_opt(position.entry_ts)
        .single()
        .unwrap_or_else(Utc::now);

    TradeResult {
        id: position.id.clone(),
        coin: position.coin.clone(),
        direction: position.direction,
        entry_price: position.entry_price,
        exit_price,
        size_usd: position.size_usd,
        entry_ts: position.entry_ts,
        exit_ts,
        exit_reason,
        pnl_usd,
        pnl_pct,
        duration_s: (exit_ts - position.entry_ts).max(0) / 1000,
        strategy_id: position.strategy_id.clone(),
        pattern_id: position.pattern_id.clone(),
        condition_id: position.condition_id.clone(),
        market_context,
        hour_of_day: entry_time.hour() as u8,
        day_of_week: entry_time.weekday().num_days_from_monday() as u8,
        price_plus_1m: None,
        price_plus_5m: None,
        price_plus_15m: None,
        missed_profit: None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniper::Position;

    fn position(entry_price: f64, size_usd: f64) -> Position {
        Position {
            id: "pos-1".to_string(),
            coin: "BTC".to_string(),
            direction: Direction::Long,
            entry_price,
            size_usd,
            entry_ts: 1_700_000_000_000,
            stop_loss_price: entry_price * 0.98,
            take_profit_price: entry_price * 1.015,
            strategy_id: "llm_v1".to_string(),
            pattern_id: None,
            condition_id: "cond-1".to_string(),
        }
    }

    #[test]
    fn long_pnl_sign_follows_price_move() {
        let pos = position(42_001.0, 100.0);

        let win = build_trade_result(
            &pos,
            42_631.0,
            pos.entry_ts + 60_000,
            ExitReason::TakeProfit,
            MarketContext::default(),
        );
        assert!(win.pnl_usd > 0.0);
        // 100 * (42631 - 42001) / 42001 = ~1.50
        assert!((win.pnl_usd - 1.50).abs() < 0.01);
        assert!(win.won());

        let loss = build_trade_result(
            &pos,
            41_160.98,
            pos.entry_ts + 60_000,
            ExitReason::StopLoss,
            MarketContext::default(),
        );
        assert!(loss.pnl_usd < 0.0);
        assert!((loss.pnl_usd - (-2.0)).abs() < 0.01);
        assert!(!loss.won());
    }

    #[test]
    fn pnl_magnitude_matches_formula() {
        let pos = position(100.0, 50.0);
        let result = build_trade_result(
            &pos,
            103.0,
            pos.entry_ts + 5_000,
            ExitReason::Manual,
            MarketContext::default(),
        );
        // 50 * (103 - 100) / 100 = 1.5
        assert!((result.pnl_usd - 1.5).abs() < 1e-9);
        assert!((result.pnl_pct - 3.0).abs() < 1e-9);
        assert_eq!(result.duration_s, 5);
    }

    #[test]
    fn entry_context_is_carried_to_exit() {
        let journal = Journal::new(WriterHandle::detached());
        let pos = position(100.0, 50.0);
        let context = MarketContext {
            regime: Some("ranging".to_string()),
            volatility: Some(1.2),
            btc_trend: Some("up".to_string()),
            funding: None,
        };

        journal.record_entry(&pos, context);
        let result = journal.record_exit(&pos, 101.0, pos.entry_ts + 1000, ExitReason::TakeProfit);
        assert_eq!(result.market_context.regime.as_deref(), Some("ranging"));
        // The parked context is consumed exactly once.
        assert!(journal.pending_context.lock().is_empty());
    }

    #[test]
    fn hour_and_weekday_derive_from_entry_time() {
        // 2023-11-14 22:13:20 UTC, a Tuesday.
        let pos = position(100.0, 50.0);
        let result = build_trade_result(
            &pos,
            100.0,
            pos.entry_ts,
            ExitReason::Expiry,
            MarketContext::default(),
        );
        assert_eq!(result.hour_of_day, 22);
        assert_eq!(result.day_of_week, 1);
    }
}
