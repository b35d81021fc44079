// =============================================================================
// Quick Update — instant per-trade knowledge refresh
// =============================================================================
//
// Called synchronously by the sniper right after an exit. Budget is well
// under 10 ms: two in-memory mutations plus queue sends, no LLM, no SQLite.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::journal::TradeResult;
use crate::knowledge::{CoinTransition, KnowledgeStore};
use crate::store::writer::{WriteOp, WriterHandle};
use crate::types::CoinStatus;

#[derive(Debug, Clone, Serialize)]
pub struct QuickUpdateResult {
    pub coin: String,
    pub new_status: CoinStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<CoinTransition>,
    /// Pattern id if this trade's outcome deactivated its pattern.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_deactivated: Option<String>,
    pub elapsed_us: u64,
}

pub struct QuickUpdate {
    knowledge: Arc<KnowledgeStore>,
    writer: WriterHandle,
}

impl QuickUpdate {
    pub fn new(knowledge: Arc<KnowledgeStore>, writer: WriterHandle) -> Self {
        Self { knowledge, writer }
    }

    pub fn apply(&self, trade: &TradeResult) -> QuickUpdateResult {
        let started = Instant::now();
        let won = trade.won();

        // 1. Coin score (returns any status transition).
        let (score, transition) =
            self.knowledge
                .update_coin_score(&trade.coin, won, trade.pnl_usd, trade.exit_ts);

        // 2. Pattern outcome, if the trade carried one.
        let pattern_deactivated = trade.pattern_id.as_deref().and_then(|id| {
            match self.knowledge.record_pattern_outcome(id, won, trade.pnl_usd) {
                Some((_, true)) => Some(id.to_string()),
                _ => None,
            }
        });

        // 3. Activity log row.
        let outcome = if won { "win" } else { "loss" };
        self.writer.send(WriteOp::Activity {
            ts: Utc::now().timestamp_millis(),
            category: "quick_update".to_string(),
            message: format!(
                "{} {} {:+.2} USD ({:.2}%), coin now {} ({} trades, {:.0}% wr)",
                trade.coin,
                outcome,
                trade.pnl_usd,
                trade.pnl_pct,
                score.status,
                score.total_trades,
                score.win_rate * 100.0
            ),
        });

        let elapsed_us = started.elapsed().as_micros() as u64;
        if let Some(t) = &transition {
            info!(
                coin = %t.coin,
                from = %t.old_status,
                to = %t.new_status,
                reason = %t.reason,
                "coin status transition"
            );
        }
        debug!(coin = %trade.coin, elapsed_us, "quick update applied");

        QuickUpdateResult {
            coin: trade.coin.clone(),
            new_status: score.status,
            transition,
            pattern_deactivated,
            elapsed_us,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MarketContext;
    use crate::knowledge::TradingPattern;
    use crate::types::{Direction, ExitReason};

    fn trade(coin: &str, pnl: f64, pattern: Option<&str>) -> TradeResult {
        TradeResult {
            id: "t1".to_string(),
            coin: coin.to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            size_usd: 100.0,
            entry_ts: 0,
            exit_ts: 60_000,
            exit_reason: if pnl > 0.0 { ExitReason::TakeProfit } else { ExitReason::StopLoss },
            pnl_usd: pnl,
            pnl_pct: pnl,
            duration_s: 60,
            strategy_id: "llm_v1".to_string(),
            pattern_id: pattern.map(str::to_string),
            condition_id: "c1".to_string(),
            market_context: MarketContext::default(),
            hour_of_day: 12,
            day_of_week: 2,
            price_plus_1m: None,
            price_plus_5m: None,
            price_plus_15m: None,
            missed_profit: None,
        }
    }

    #[test]
    fn applies_score_and_pattern_in_one_pass() {
        let knowledge = Arc::new(KnowledgeStore::new(WriterHandle::detached()));
        knowledge.add_pattern(TradingPattern::new("brk", "breakout"));
        let qu = QuickUpdate::new(knowledge.clone(), WriterHandle::detached());

        let result = qu.apply(&trade("BTC", 1.5, Some("brk")));
        assert_eq!(result.coin, "BTC");
        assert!(result.transition.is_none());
        assert!(result.pattern_deactivated.is_none());

        let score = knowledge.coin_score("BTC").unwrap();
        assert_eq!(score.total_trades, 1);
        assert_eq!(score.wins, 1);
        let pattern = knowledge.pattern("brk").unwrap();
        assert_eq!(pattern.times_used, 1);
    }

    #[test]
    fn reports_blacklist_transition() {
        let knowledge = Arc::new(KnowledgeStore::new(WriterHandle::detached()));
        let qu = QuickUpdate::new(knowledge, WriterHandle::detached());

        let mut last = None;
        for _ in 0..5 {
            last = Some(qu.apply(&trade("DOGE", -2.0, None)));
        }
        let result = last.unwrap();
        assert_eq!(result.new_status, CoinStatus::Blacklisted);
        assert!(result.transition.is_some());
    }

    #[test]
    fn reports_pattern_deactivation() {
        let knowledge = Arc::new(KnowledgeStore::new(WriterHandle::detached()));
        knowledge.add_pattern(TradingPattern::new("fade", ""));
        let qu = QuickUpdate::new(knowledge.clone(), WriterHandle::detached());

        qu.apply(&trade("ETH", 1.0, Some("fade")));
        let mut deactivated_on = None;
        for i in 0..19 {
            let r = qu.apply(&trade("ETH", -1.0, Some("fade")));
            if r.pattern_deactivated.is_some() {
                deactivated_on = Some(i);
                break;
            }
        }
        assert!(deactivated_on.is_some());
        assert!(!knowledge.pattern("fade").unwrap().is_active);
    }
}
