// =============================================================================
// Coin Scores — per-coin performance record and status state machine
// =============================================================================
//
// Status transitions (evaluated on every recorded trade, 5-trade minimum):
//   -> BLACKLISTED   win_rate < 30% and total_pnl < 0
//   -> FAVORED       win_rate >= 60% and total_pnl > 0
//   REDUCED -> NORMAL at win_rate >= 50%
//   FAVORED -> NORMAL when win_rate < 60% or total_pnl <= 0
//   -> REDUCED       win_rate < 45% (unless already BLACKLISTED/REDUCED)
//
// Thresholds use strict `<` and `>=` exactly as written. A manual blacklist
// (adaptation or dashboard override) sticks until explicitly lifted; a
// threshold blacklist can re-trip after an unblacklist if the stats still
// warrant it.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::CoinStatus;

/// Minimum recorded trades before any status transition applies.
pub const MIN_TRADES_FOR_STATUS: u32 = 5;

/// Number of recent outcomes kept for trend detection.
const TREND_WINDOW: usize = 10;

/// Direction the coin's recent results are moving relative to its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreTrend {
    Improving,
    Stable,
    Declining,
}

impl Default for ScoreTrend {
    fn default() -> Self {
        Self::Stable
    }
}

impl std::fmt::Display for ScoreTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Improving => write!(f, "improving"),
            Self::Stable => write!(f, "stable"),
            Self::Declining => write!(f, "declining"),
        }
    }
}

/// A status change produced by recording a trade.
#[derive(Debug, Clone, Serialize)]
pub struct CoinTransition {
    pub coin: String,
    pub old_status: CoinStatus,
    pub new_status: CoinStatus,
    pub reason: String,
}

/// Learned performance record for one coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinScore {
    pub coin: String,
    #[serde(default)]
    pub total_trades: u32,
    #[serde(default)]
    pub wins: u32,
    #[serde(default)]
    pub losses: u32,
    #[serde(default)]
    pub total_pnl: f64,
    #[serde(default)]
    pub avg_pnl: f64,
    #[serde(default)]
    pub win_rate: f64,
    #[serde(default)]
    pub avg_winner: f64,
    #[serde(default)]
    pub avg_loser: f64,
    /// Running sums backing avg_winner / avg_loser.
    #[serde(default)]
    pub winner_pnl_sum: f64,
    #[serde(default)]
    pub loser_pnl_sum: f64,
    #[serde(default)]
    pub status: CoinStatus,
    #[serde(default)]
    pub is_blacklisted: bool,
    #[serde(default)]
    pub blacklist_reason: Option<String>,
    #[serde(default)]
    pub trend: ScoreTrend,
    /// Win/loss outcomes of the most recent trades, newest last.
    #[serde(default)]
    pub recent_results: Vec<bool>,
    /// Epoch milliseconds of the last update.
    #[serde(default)]
    pub last_updated: i64,
}

impl CoinScore {
    pub fn new(coin: impl Into<String>) -> Self {
        Self {
            coin: coin.into(),
            total_trades: 0,
            wins: 0,
            losses: 0,
            total_pnl: 0.0,
            avg_pnl: 0.0,
            win_rate: 0.0,
            avg_winner: 0.0,
            avg_loser: 0.0,
            winner_pnl_sum: 0.0,
            loser_pnl_sum: 0.0,
            status: CoinStatus::Unknown,
            is_blacklisted: false,
            blacklist_reason: None,
            trend: ScoreTrend::Stable,
            recent_results: Vec::new(),
            last_updated: 0,
        }
    }

    /// Fold one trade outcome into the score and re-run the status machine.
    ///
    /// Returns the transition if the status changed.
    pub fn record_trade(&mut self, won: bool, pnl: f64, now_ms: i64) -> Option<CoinTransition> {
        self.total_trades += 1;
        if won {
            self.wins += 1;
            self.winner_pnl_sum += pnl;
        } else {
            self.losses += 1;
            self.loser_pnl_sum += pnl;
        }
        self.total_pnl += pnl;

        self.win_rate = self.wins as f64 / self.total_trades as f64;
        self.avg_pnl = self.total_pnl / self.total_trades as f64;
        self.avg_winner = if self.wins > 0 {
            self.winner_pnl_sum / self.wins as f64
        } else {
            0.0
        };
        self.avg_loser = if self.losses > 0 {
            self.loser_pnl_sum / self.losses as f64
        } else {
            0.0
        };

        self.recent_results.push(won);
        if self.recent_results.len() > TREND_WINDOW {
            self.recent_results.remove(0);
        }
        self.trend = self.compute_trend();
        self.last_updated = now_ms;

        let old = self.status;
        let (new, reason) = self.next_status(old);
        if new == CoinStatus::Blacklisted && old != CoinStatus::Blacklisted {
            self.is_blacklisted = true;
            self.blacklist_reason = Some(reason.clone());
        }
        self.status = new;

        if new != old {
            Some(CoinTransition {
                coin: self.coin.clone(),
                old_status: old,
                new_status: new,
                reason,
            })
        } else {
            None
        }
    }

    /// Force-blacklist (adaptation or dashboard override).
    pub fn blacklist(&mut self, reason: impl Into<String>) {
        self.is_blacklisted = true;
        self.blacklist_reason = Some(reason.into());
        self.status = CoinStatus::Blacklisted;
    }

    /// Lift a blacklist and re-derive the status from the stats alone.
    /// A coin whose numbers still trip the threshold will re-blacklist on
    /// its next recorded trade, not here.
    pub fn unblacklist(&mut self) {
        self.is_blacklisted = false;
        self.blacklist_reason = None;
        let (new, _) = self.threshold_status(CoinStatus::Normal);
        self.status = if new == CoinStatus::Blacklisted {
            // The flag was just cleared; leave the judgement to the next trade.
            CoinStatus::Normal
        } else {
            new
        };
    }

    fn compute_trend(&self) -> ScoreTrend {
        if self.recent_results.len() < 5 || self.total_trades < MIN_TRADES_FOR_STATUS {
            return ScoreTrend::Stable;
        }
        let recent_wins = self.recent_results.iter().filter(|w| **w).count();
        let recent_wr = recent_wins as f64 / self.recent_results.len() as f64;
        if recent_wr > self.win_rate + 0.1 {
            ScoreTrend::Improving
        } else if recent_wr < self.win_rate - 0.1 {
            ScoreTrend::Declining
        } else {
            ScoreTrend::Stable
        }
    }

    fn next_status(&self, prior: CoinStatus) -> (CoinStatus, String) {
        if self.is_blacklisted {
            return (
                CoinStatus::Blacklisted,
                self.blacklist_reason.clone().unwrap_or_default(),
            );
        }
        if self.total_trades < MIN_TRADES_FOR_STATUS {
            return (prior, String::new());
        }
        self.threshold_status(prior)
    }

    /// Pure threshold evaluation, assuming the trade minimum is met.
    fn threshold_status(&self, prior: CoinStatus) -> (CoinStatus, String) {
        if self.total_trades < MIN_TRADES_FOR_STATUS {
            return (prior, String::new());
        }
        let wr = self.win_rate;

        if wr < 0.30 && self.total_pnl < 0.0 {
            return (
                CoinStatus::Blacklisted,
                format!(
                    "win rate {:.0}% over {} trades with {:.2} total pnl",
                    wr * 100.0,
                    self.total_trades,
                    self.total_pnl
                ),
            );
        }
        if wr >= 0.60 && self.total_pnl > 0.0 {
            return (
                CoinStatus::Favored,
                format!("win rate {:.0}% with positive pnl", wr * 100.0),
            );
        }
        if prior == CoinStatus::Reduced {
            return if wr >= 0.50 {
                (
                    CoinStatus::Normal,
                    format!("win rate recovered to {:.0}%", wr * 100.0),
                )
            } else {
                (CoinStatus::Reduced, String::new())
            };
        }
        if wr < 0.45 {
            return (
                CoinStatus::Reduced,
                format!("win rate {:.0}% below 45%", wr * 100.0),
            );
        }
        // Covers the FAVORED demotion (win rate < 60% or pnl <= 0) and the
        // UNKNOWN -> NORMAL settling once enough trades exist.
        (CoinStatus::Normal, "within normal band".to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn drive(score: &mut CoinScore, outcomes: &[(bool, f64)]) {
        for (i, (won, pnl)) in outcomes.iter().enumerate() {
            score.record_trade(*won, *pnl, i as i64);
        }
    }

    #[test]
    fn derived_fields_stay_consistent() {
        let mut s = CoinScore::new("BTC");
        drive(
            &mut s,
            &[(true, 2.0), (false, -1.0), (true, 4.0), (false, -3.0), (true, 1.0)],
        );
        assert_eq!(s.wins + s.losses, s.total_trades);
        assert!((s.total_pnl - 3.0).abs() < 1e-9);
        assert!((s.win_rate - 0.6).abs() < 1e-9);
        assert!((s.avg_winner - 7.0 / 3.0).abs() < 1e-9);
        assert!((s.avg_loser - (-2.0)).abs() < 1e-9);
    }

    #[test]
    fn no_transition_below_five_trades() {
        let mut s = CoinScore::new("DOGE");
        drive(&mut s, &[(false, -2.0), (false, -2.0), (false, -2.0), (false, -2.0)]);
        assert_eq!(s.status, CoinStatus::Unknown);
    }

    #[test]
    fn blacklists_at_exactly_five_bad_trades() {
        let mut s = CoinScore::new("DOGE");
        // 1 win, 4 losses => 20% win rate, negative pnl.
        drive(
            &mut s,
            &[(true, 1.0), (false, -3.0), (false, -3.0), (false, -3.0), (false, -2.0)],
        );
        assert_eq!(s.total_trades, 5);
        assert_eq!(s.status, CoinStatus::Blacklisted);
        assert!(s.is_blacklisted);
        assert!(s.blacklist_reason.is_some());
    }

    #[test]
    fn thirty_percent_boundary_is_strict() {
        let mut s = CoinScore::new("XRP");
        // Exactly 30% (3/10) with negative pnl must NOT blacklist.
        let mut outcomes = vec![(true, 1.0); 3];
        outcomes.extend(vec![(false, -2.0); 7]);
        drive(&mut s, &outcomes);
        assert!((s.win_rate - 0.30).abs() < 1e-9);
        assert_ne!(s.status, CoinStatus::Blacklisted);
        // 30% is below 45%, so the coin lands in REDUCED instead.
        assert_eq!(s.status, CoinStatus::Reduced);
    }

    #[test]
    fn favored_at_sixty_percent_with_profit() {
        let mut s = CoinScore::new("ETH");
        let mut outcomes = vec![(true, 2.0); 3];
        outcomes.extend(vec![(false, -1.0); 2]);
        drive(&mut s, &outcomes);
        assert!((s.win_rate - 0.60).abs() < 1e-9);
        assert_eq!(s.status, CoinStatus::Favored);
    }

    #[test]
    fn favored_demotes_symmetrically() {
        let mut s = CoinScore::new("ETH");
        // 3W / 2L => FAVORED.
        drive(&mut s, &[(true, 2.0), (true, 2.0), (true, 2.0), (false, -1.0), (false, -1.0)]);
        assert_eq!(s.status, CoinStatus::Favored);
        // One more loss drops win rate to 50% => back to NORMAL, no ratchet.
        s.record_trade(false, -1.0, 5);
        assert_eq!(s.status, CoinStatus::Normal);
    }

    #[test]
    fn reduced_recovers_at_fifty_percent() {
        let mut s = CoinScore::new("SOL");
        // 4W then 6L => 40% win rate, positive pnl => REDUCED.
        let mut outcomes = vec![(true, 2.0); 4];
        outcomes.extend(vec![(false, -1.0); 6]);
        drive(&mut s, &outcomes);
        assert!((s.win_rate - 0.40).abs() < 1e-9);
        assert_eq!(s.status, CoinStatus::Reduced);
        // 5/11 = 45.5% stays REDUCED (needs >= 50%)...
        s.record_trade(true, 2.0, 10);
        assert!(s.win_rate < 0.50);
        assert_eq!(s.status, CoinStatus::Reduced);
        // ...and exactly 50% recovers.
        s.record_trade(true, 2.0, 11);
        assert!((s.win_rate - 0.50).abs() < 1e-9);
        assert_eq!(s.status, CoinStatus::Normal);
    }

    #[test]
    fn manual_blacklist_sticks_and_unblacklist_rederives() {
        let mut s = CoinScore::new("SOL");
        drive(&mut s, &[(true, 1.0), (true, 1.0), (true, 1.0), (false, -1.0), (false, -1.0)]);
        assert_eq!(s.status, CoinStatus::Favored);

        s.blacklist("insight: weekend bleeder");
        assert_eq!(s.status, CoinStatus::Blacklisted);
        // Winning trades do not lift a manual blacklist.
        s.record_trade(true, 2.0, 6);
        assert_eq!(s.status, CoinStatus::Blacklisted);

        s.unblacklist();
        assert!(!s.is_blacklisted);
        assert_ne!(s.status, CoinStatus::Blacklisted);
    }
}
