// =============================================================================
// Regime Rules — learned market-state guards checked before each strategist
// cycle
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

/// What a matching rule tells the strategist to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    NoTrade,
    ReduceSize,
    IncreaseSize,
    Caution,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTrade => write!(f, "NO_TRADE"),
            Self::ReduceSize => write!(f, "REDUCE_SIZE"),
            Self::IncreaseSize => write!(f, "INCREASE_SIZE"),
            Self::Caution => write!(f, "CAUTION"),
        }
    }
}

/// Aggregate market state the rule predicates are evaluated against.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MarketState {
    pub btc_change_24h: f64,
    /// Mean 24 h change across all tracked coins.
    pub avg_change_24h: f64,
    pub hour_utc: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeRule {
    pub rule_id: String,
    pub description: String,
    /// Predicate of the form `{"field": "...", "op": "lt|gt", "value": n}`.
    /// Fields: btc_change_24h, avg_change_24h, hour_utc. Anything else never
    /// matches — an LLM-authored rule can only ever be too quiet, not too
    /// loud.
    pub condition: serde_json::Value,
    pub action: RuleAction,
    #[serde(default)]
    pub times_triggered: u32,
    #[serde(default)]
    pub estimated_saves: f64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl RegimeRule {
    /// Evaluate the predicate against the current market state.
    pub fn matches(&self, state: &MarketState) -> bool {
        if !self.is_active {
            return false;
        }
        let field = match self.condition["field"].as_str() {
            Some(f) => f,
            None => return false,
        };
        let op = match self.condition["op"].as_str() {
            Some(o) => o,
            None => return false,
        };
        let value = match self.condition["value"].as_f64() {
            Some(v) => v,
            None => return false,
        };

        let actual = match field {
            "btc_change_24h" => state.btc_change_24h,
            "avg_change_24h" => state.avg_change_24h,
            "hour_utc" => state.hour_utc as f64,
            other => {
                debug!(field = other, rule = %self.rule_id, "unknown rule field — no match");
                return false;
            }
        };

        match op {
            "lt" => actual < value,
            "gt" => actual > value,
            "lte" => actual <= value,
            "gte" => actual >= value,
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn rule(field: &str, op: &str, value: f64, action: RuleAction) -> RegimeRule {
        RegimeRule {
            rule_id: "r1".to_string(),
            description: "test rule".to_string(),
            condition: serde_json::json!({ "field": field, "op": op, "value": value }),
            action,
            times_triggered: 0,
            estimated_saves: 0.0,
            is_active: true,
        }
    }

    #[test]
    fn btc_crash_rule_matches() {
        let r = rule("btc_change_24h", "lt", -5.0, RuleAction::NoTrade);
        let bearish = MarketState { btc_change_24h: -7.2, ..Default::default() };
        let calm = MarketState { btc_change_24h: -1.0, ..Default::default() };
        assert!(r.matches(&bearish));
        assert!(!r.matches(&calm));
    }

    #[test]
    fn inactive_rules_never_match() {
        let mut r = rule("btc_change_24h", "lt", 100.0, RuleAction::NoTrade);
        r.is_active = false;
        assert!(!r.matches(&MarketState::default()));
    }

    #[test]
    fn malformed_or_unknown_predicates_never_match() {
        let mut r = rule("funding_rate", "lt", 0.0, RuleAction::Caution);
        assert!(!r.matches(&MarketState::default()));
        r.condition = serde_json::json!({ "field": "btc_change_24h" });
        assert!(!r.matches(&MarketState::default()));
        r.condition = serde_json::Value::Null;
        assert!(!r.matches(&MarketState::default()));
    }

    #[test]
    fn hour_window_rule() {
        let r = rule("hour_utc", "gte", 22.0, RuleAction::ReduceSize);
        assert!(r.matches(&MarketState { hour_utc: 23, ..Default::default() }));
        assert!(!r.matches(&MarketState { hour_utc: 10, ..Default::default() }));
    }
}
