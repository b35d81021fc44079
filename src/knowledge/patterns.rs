// =============================================================================
// Trading Patterns — reusable entry/exit recipes with earned confidence
// =============================================================================
//
// Confidence is fully derived from outcomes:
//   fewer than 3 uses          -> 0.5 (unproven)
//   otherwise                  -> base  = 0.5 + (win_rate - 0.5) * 0.5
//                                 usage = min(1.0, times_used / 20)
//                                 clamp(base * (0.7 + 0.3 * usage), 0.1, 0.9)
//
// A pattern falling below 0.3 is deactivated and stays deactivated until an
// explicit reactivation (adaptation rollback or dashboard override).
// =============================================================================

use serde::{Deserialize, Serialize};

/// Confidence floor/ceiling.
pub const CONFIDENCE_MIN: f64 = 0.1;
pub const CONFIDENCE_MAX: f64 = 0.9;
/// Patterns below this confidence are switched off.
pub const DEACTIVATION_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPattern {
    pub pattern_id: String,
    pub description: String,
    /// Opaque predicate map authored by the strategist/reflection LLM.
    #[serde(default)]
    pub entry_conditions: serde_json::Value,
    #[serde(default)]
    pub exit_conditions: serde_json::Value,
    #[serde(default)]
    pub times_used: u32,
    #[serde(default)]
    pub wins: u32,
    #[serde(default)]
    pub losses: u32,
    #[serde(default)]
    pub total_pnl: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_confidence() -> f64 {
    0.5
}

fn default_active() -> bool {
    true
}

impl TradingPattern {
    pub fn new(pattern_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            description: description.into(),
            entry_conditions: serde_json::Value::Null,
            exit_conditions: serde_json::Value::Null,
            times_used: 0,
            wins: 0,
            losses: 0,
            total_pnl: 0.0,
            confidence: 0.5,
            is_active: true,
        }
    }

    /// Fold one outcome in, recompute confidence, and deactivate if it fell
    /// below the threshold. Returns `true` if this call deactivated the
    /// pattern.
    pub fn record_outcome(&mut self, won: bool, pnl: f64) -> bool {
        self.times_used += 1;
        if won {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.total_pnl += pnl;
        self.confidence = self.compute_confidence();

        if self.is_active && self.confidence < DEACTIVATION_THRESHOLD {
            self.is_active = false;
            return true;
        }
        false
    }

    fn compute_confidence(&self) -> f64 {
        if self.times_used < 3 {
            return 0.5;
        }
        let resolved = self.wins + self.losses;
        let win_rate = if resolved > 0 {
            self.wins as f64 / resolved as f64
        } else {
            0.5
        };
        let base = 0.5 + (win_rate - 0.5) * 0.5;
        let usage = (self.times_used as f64 / 20.0).min(1.0);
        (base * (0.7 + 0.3 * usage)).clamp(CONFIDENCE_MIN, CONFIDENCE_MAX)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unproven_patterns_sit_at_half() {
        let mut p = TradingPattern::new("breakout_v1", "volume breakout");
        p.record_outcome(false, -2.0);
        p.record_outcome(false, -2.0);
        assert!((p.confidence - 0.5).abs() < 1e-9);
        assert!(p.is_active);
    }

    #[test]
    fn confidence_stays_in_bounds_for_any_sequence() {
        let mut p = TradingPattern::new("x", "");
        for i in 0..50 {
            p.record_outcome(i % 5 == 0, if i % 5 == 0 { 3.0 } else { -1.0 });
            assert!(p.confidence >= CONFIDENCE_MIN && p.confidence <= CONFIDENCE_MAX);
        }
        let mut q = TradingPattern::new("y", "");
        for _ in 0..50 {
            q.record_outcome(true, 5.0);
            assert!(q.confidence <= CONFIDENCE_MAX);
        }
        // All-winners caps at 0.75 * 1.0 = 0.75 under the formula.
        assert!((q.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn losing_pattern_deactivates_below_threshold() {
        let mut p = TradingPattern::new("fail_v1", "fades every time");
        // 1 win, then losses: at 20 uses win_rate = 5% => confidence ~0.26.
        p.record_outcome(true, 1.0);
        let mut deactivated = false;
        for _ in 0..19 {
            deactivated |= p.record_outcome(false, -1.0);
        }
        assert!(p.confidence < DEACTIVATION_THRESHOLD);
        assert!(deactivated);
        assert!(!p.is_active);
    }

    #[test]
    fn outcomes_never_reactivate_a_dead_pattern() {
        let mut p = TradingPattern::new("fail_v1", "");
        p.record_outcome(true, 1.0);
        for _ in 0..19 {
            p.record_outcome(false, -1.0);
        }
        assert!(!p.is_active);
        // A streak of wins raises confidence but must not flip is_active.
        for _ in 0..30 {
            p.record_outcome(true, 2.0);
        }
        assert!(p.confidence > DEACTIVATION_THRESHOLD);
        assert!(!p.is_active);
    }

    #[test]
    fn exact_formula_at_twenty_uses() {
        let mut p = TradingPattern::new("mid", "");
        // 10 wins / 10 losses => win_rate 0.5 => base 0.5, usage 1.0.
        for i in 0..20 {
            p.record_outcome(i % 2 == 0, 0.0);
        }
        assert!((p.confidence - 0.5).abs() < 1e-9);
    }
}
