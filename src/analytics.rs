// =============================================================================
// Analytics — profit snapshots and aggregate trade statistics
// =============================================================================
//
// Pure functions over closed-trade slices. The matcher's balance is the one
// source of truth; snapshots derive from it plus the journal, never the
// other way around.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::journal::TradeResult;

/// Snapshot window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    Hour,
    Day,
    Week,
    Month,
    AllTime,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::AllTime => "all_time",
        }
    }

    /// Window length in milliseconds; `None` means unbounded.
    pub fn window_ms(&self) -> Option<i64> {
        match self {
            Self::Hour => Some(3_600_000),
            Self::Day => Some(86_400_000),
            Self::Week => Some(7 * 86_400_000),
            Self::Month => Some(30 * 86_400_000),
            Self::AllTime => None,
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "all_time" | "all" => Some(Self::AllTime),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time performance summary, persisted for dashboards and used as
/// pre/post metrics by the adaptation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitSnapshot {
    pub ts: i64,
    pub timeframe: Timeframe,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    /// Largest peak-to-trough equity drop within the window, as a fraction.
    pub max_drawdown: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharpe: Option<f64>,
    pub balance: f64,
}

/// Aggregate stats over an arbitrary trade slice.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PerformanceStats {
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
}

pub fn performance(trades: &[TradeResult]) -> PerformanceStats {
    if trades.is_empty() {
        return PerformanceStats::default();
    }
    let wins = trades.iter().filter(|t| t.won()).count();
    PerformanceStats {
        trades: trades.len(),
        wins,
        win_rate: wins as f64 / trades.len() as f64,
        total_pnl: trades.iter().map(|t| t.pnl_usd).sum(),
    }
}

/// Build a snapshot over `trades` (already sorted by exit time ascending).
/// `balance` is the matcher's current equity.
pub fn compute_snapshot(
    timeframe: Timeframe,
    trades: &[TradeResult],
    balance: f64,
    now_ms: i64,
) -> ProfitSnapshot {
    let cutoff = timeframe.window_ms().map(|w| now_ms - w);
    let window: Vec<&TradeResult> = trades
        .iter()
        .filter(|t| cutoff.map(|c| t.exit_ts >= c).unwrap_or(true))
        .collect();

    if window.is_empty() {
        return ProfitSnapshot {
            ts: now_ms,
            timeframe,
            total_pnl: 0.0,
            win_rate: 0.0,
            profit_factor: 0.0,
            max_drawdown: 0.0,
            sharpe: None,
            balance,
        };
    }

    let wins = window.iter().filter(|t| t.won()).count();
    let win_rate = wins as f64 / window.len() as f64;
    let total_pnl: f64 = window.iter().map(|t| t.pnl_usd).sum();

    let gross_profit: f64 = window
        .iter()
        .map(|t| t.pnl_usd)
        .filter(|p| *p > 0.0)
        .sum();
    let gross_loss: f64 = window
        .iter()
        .map(|t| t.pnl_usd)
        .filter(|p| *p < 0.0)
        .map(f64::abs)
        .sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    // Equity curve reconstructed backwards from the current balance.
    let start_equity = balance - total_pnl;
    let mut equity = start_equity;
    let mut peak = start_equity;
    let mut max_drawdown: f64 = 0.0;
    for trade in &window {
        equity += trade.pnl_usd;
        if equity > peak {
            peak = equity;
        } else if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - equity) / peak);
        }
    }

    // Per-trade Sharpe over percentage returns.
    let sharpe = if window.len() >= 2 {
        let returns: Vec<f64> = window.iter().map(|t| t.pnl_pct).collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / (returns.len() - 1) as f64;
        let std = variance.sqrt();
        if std > 0.0 {
            Some(mean / std * (returns.len() as f64).sqrt())
        } else {
            None
        }
    } else {
        None
    };

    ProfitSnapshot {
        ts: now_ms,
        timeframe,
        total_pnl,
        win_rate,
        profit_factor,
        max_drawdown,
        sharpe,
        balance,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MarketContext;
    use crate::types::{Direction, ExitReason};

    fn trade(pnl: f64, exit_ts: i64) -> TradeResult {
        TradeResult {
            id: format!("t-{exit_ts}"),
            coin: "BTC".to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            size_usd: 100.0,
            entry_ts: exit_ts - 60_000,
            exit_ts,
            exit_reason: if pnl > 0.0 { ExitReason::TakeProfit } else { ExitReason::StopLoss },
            pnl_usd: pnl,
            pnl_pct: pnl,
            duration_s: 60,
            strategy_id: "llm_v1".to_string(),
            pattern_id: None,
            condition_id: "c".to_string(),
            market_context: MarketContext::default(),
            hour_of_day: 0,
            day_of_week: 0,
            price_plus_1m: None,
            price_plus_5m: None,
            price_plus_15m: None,
            missed_profit: None,
        }
    }

    #[test]
    fn empty_window_is_zeroed() {
        let snap = compute_snapshot(Timeframe::Hour, &[], 10_000.0, 1_000_000);
        assert_eq!(snap.win_rate, 0.0);
        assert_eq!(snap.total_pnl, 0.0);
        assert!(snap.sharpe.is_none());
        assert!((snap.balance - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn window_filtering_respects_timeframe() {
        let now = 10 * 3_600_000;
        let trades = vec![
            trade(5.0, now - 2 * 3_600_000), // outside the hour window
            trade(-1.0, now - 60_000),       // inside
            trade(2.0, now - 30_000),        // inside
        ];
        let hour = compute_snapshot(Timeframe::Hour, &trades, 10_006.0, now);
        assert_eq!(hour.win_rate, 0.5);
        assert!((hour.total_pnl - 1.0).abs() < 1e-9);

        let all = compute_snapshot(Timeframe::AllTime, &trades, 10_006.0, now);
        assert!((all.total_pnl - 6.0).abs() < 1e-9);
        assert!((all.win_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_matches_gross_ratio() {
        let trades = vec![trade(6.0, 1), trade(-2.0, 2), trade(-1.0, 3)];
        let snap = compute_snapshot(Timeframe::AllTime, &trades, 10_003.0, 10);
        assert!((snap.profit_factor - 2.0).abs() < 1e-9);
    }

    #[test]
    fn all_winners_has_infinite_profit_factor() {
        let trades = vec![trade(1.0, 1), trade(2.0, 2)];
        let snap = compute_snapshot(Timeframe::AllTime, &trades, 10_003.0, 10);
        assert!(snap.profit_factor.is_infinite());
    }

    #[test]
    fn drawdown_tracks_peak_to_trough() {
        // Equity path: 10000 -> 10100 -> 9900 -> 10000: drawdown 200/10100.
        let trades = vec![trade(100.0, 1), trade(-200.0, 2), trade(100.0, 3)];
        let snap = compute_snapshot(Timeframe::AllTime, &trades, 10_000.0, 10);
        assert!((snap.max_drawdown - 200.0 / 10_100.0).abs() < 1e-9);
    }

    #[test]
    fn sharpe_needs_variance_and_two_trades() {
        let one = vec![trade(1.0, 1)];
        assert!(compute_snapshot(Timeframe::AllTime, &one, 10_001.0, 10).sharpe.is_none());

        let flat = vec![trade(1.0, 1), trade(1.0, 2)];
        assert!(compute_snapshot(Timeframe::AllTime, &flat, 10_002.0, 10).sharpe.is_none());

        let mixed = vec![trade(2.0, 1), trade(-1.0, 2), trade(1.5, 3)];
        let snap = compute_snapshot(Timeframe::AllTime, &mixed, 10_002.5, 10);
        assert!(snap.sharpe.is_some());
    }

    #[test]
    fn performance_aggregates() {
        let trades = vec![trade(2.0, 1), trade(-1.0, 2)];
        let stats = performance(&trades);
        assert_eq!(stats.trades, 2);
        assert_eq!(stats.wins, 1);
        assert!((stats.win_rate - 0.5).abs() < 1e-9);
        assert!((stats.total_pnl - 1.0).abs() < 1e-9);
    }
}
