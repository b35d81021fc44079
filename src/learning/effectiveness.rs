// =============================================================================
// Effectiveness Monitor — did an adaptation actually help?
// =============================================================================
//
// Hourly sweep over pending adaptations. Each one is judged only after 24
// hours and at least 10 subsequent trades, by comparing win rate (in
// percentage points) and pnl after the adaptation against the pre-metrics
// captured when it was applied. A harmful rating with a meaningful pnl hit
// flags the adaptation for rollback; execution stays a separate, commanded
// step.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::analytics::performance;
use crate::store::writer::{WriteOp, WriterHandle};
use crate::store::Store;

use super::adaptation::{Adaptation, AdaptationAction, Effectiveness};

/// Hours an adaptation must age before measurement.
pub const MIN_HOURS: i64 = 24;
/// Trades required after the adaptation before measurement.
pub const MIN_TRADES: usize = 10;
/// A harmful adaptation is flagged for rollback only past this pnl loss.
pub const ROLLBACK_PNL_FLOOR: f64 = -20.0;

/// Outcome of measuring one adaptation.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub adaptation_id: String,
    pub action: AdaptationAction,
    pub target: String,
    pub rating: Effectiveness,
    pub delta_win_rate_pp: f64,
    pub delta_pnl: f64,
    pub trades_measured: usize,
    pub rollback_flagged: bool,
}

/// Rate a win-rate delta given in percentage points.
pub fn rate(delta_pp: f64) -> Effectiveness {
    if delta_pp >= 10.0 {
        Effectiveness::HighlyEffective
    } else if delta_pp >= 3.0 {
        Effectiveness::Effective
    } else if delta_pp >= -3.0 {
        Effectiveness::Neutral
    } else if delta_pp > -10.0 {
        Effectiveness::Ineffective
    } else {
        Effectiveness::Harmful
    }
}

/// Rollback is flagged for harmful ratings with a real pnl cost on a
/// sufficient sample.
pub fn should_flag_rollback(rating: Effectiveness, delta_pnl: f64, trades: usize) -> bool {
    rating == Effectiveness::Harmful && delta_pnl < ROLLBACK_PNL_FLOOR && trades >= MIN_TRADES
}

pub struct EffectivenessMonitor {
    store: Arc<Store>,
    writer: WriterHandle,
}

impl EffectivenessMonitor {
    pub fn new(store: Arc<Store>, writer: WriterHandle) -> Self {
        Self { store, writer }
    }

    /// Measure every pending adaptation that is old enough and has enough
    /// subsequent trades. Returns the measurements taken this round.
    pub fn sweep(&self, now_ms: i64) -> Vec<Measurement> {
        let pending = match self.store.pending_adaptations() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "effectiveness sweep could not list pending adaptations");
                return Vec::new();
            }
        };

        let mut measured = Vec::new();
        for adaptation in pending {
            let age_hours = (now_ms - adaptation.timestamp) / 3_600_000;
            if age_hours < MIN_HOURS {
                continue;
            }
            match self.measure(&adaptation, now_ms) {
                Some(m) => measured.push(m),
                None => {}
            }
        }
        measured
    }

    fn measure(&self, adaptation: &Adaptation, now_ms: i64) -> Option<Measurement> {
        let trades_after = match self.store.closed_trades_since(adaptation.timestamp) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, adaptation_id = %adaptation.adaptation_id, "could not read trades for measurement");
                return None;
            }
        };
        if trades_after.len() < MIN_TRADES {
            return None;
        }

        let post = performance(&trades_after);
        let pre_win_rate = adaptation.pre_metrics["win_rate"].as_f64().unwrap_or(0.0);
        let pre_pnl = adaptation.pre_metrics["total_pnl"].as_f64().unwrap_or(0.0);

        let delta_pp = (post.win_rate - pre_win_rate) * 100.0;
        let delta_pnl = post.total_pnl - pre_pnl;
        let rating = rate(delta_pp);
        let rollback_flagged = should_flag_rollback(rating, delta_pnl, trades_after.len());

        let post_metrics = serde_json::json!({
            "win_rate": post.win_rate,
            "total_pnl": post.total_pnl,
            "trades_measured": trades_after.len(),
            "delta_win_rate_pp": delta_pp,
            "delta_pnl": delta_pnl,
        });

        info!(
            adaptation_id = %adaptation.adaptation_id,
            action = %adaptation.action,
            target = %adaptation.target,
            rating = %rating,
            delta_pp,
            delta_pnl,
            rollback_flagged,
            "adaptation effectiveness measured"
        );

        self.writer.send(WriteOp::AdaptationMeasured {
            adaptation_id: adaptation.adaptation_id.clone(),
            post_metrics,
            effectiveness: rating,
            measured_at: now_ms,
        });

        Some(Measurement {
            adaptation_id: adaptation.adaptation_id.clone(),
            action: adaptation.action,
            target: adaptation.target.clone(),
            rating,
            delta_win_rate_pp: delta_pp,
            delta_pnl,
            trades_measured: trades_after.len(),
            rollback_flagged,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_thresholds_in_percentage_points() {
        assert_eq!(rate(12.0), Effectiveness::HighlyEffective);
        assert_eq!(rate(10.0), Effectiveness::HighlyEffective);
        assert_eq!(rate(9.9), Effectiveness::Effective);
        assert_eq!(rate(3.0), Effectiveness::Effective);
        assert_eq!(rate(2.9), Effectiveness::Neutral);
        assert_eq!(rate(0.0), Effectiveness::Neutral);
        assert_eq!(rate(-3.0), Effectiveness::Neutral);
        assert_eq!(rate(-3.1), Effectiveness::Ineffective);
        assert_eq!(rate(-9.9), Effectiveness::Ineffective);
        assert_eq!(rate(-10.0), Effectiveness::Harmful);
        assert_eq!(rate(-12.0), Effectiveness::Harmful);
    }

    #[test]
    fn rollback_flag_needs_all_three_conditions() {
        // Scenario: -12 pp, -$25, 12 trades => flagged.
        assert!(should_flag_rollback(rate(-12.0), -25.0, 12));
        // Harmful but pnl loss too small.
        assert!(!should_flag_rollback(Effectiveness::Harmful, -19.0, 12));
        // Harmful pnl but not a harmful rating.
        assert!(!should_flag_rollback(Effectiveness::Ineffective, -50.0, 12));
        // Not enough trades.
        assert!(!should_flag_rollback(Effectiveness::Harmful, -25.0, 9));
    }
}
