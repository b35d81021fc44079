// =============================================================================
// Adaptation — turning insights into concrete knowledge mutations
// =============================================================================
//
// Only insights with confidence >= 0.7 are acted on. Every application
// captures pre-metrics first and records an adaptation row with
// effectiveness = pending, so the monitor can judge it later. Each action
// has an exact inverse:
//
//   BLACKLIST           <-> unblacklist
//   FAVOR               <-> clear trend
//   CREATE_RULE         <-> deactivate rule
//   DEACTIVATE_PATTERN  <-> reactivate pattern
//   ADJUST_PARAM        <-> inverse delta
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::analytics::ProfitSnapshot;
use crate::knowledge::{KnowledgeStore, RegimeRule, RuleAction, ScoreTrend};
use crate::store::writer::{WriteOp, WriterHandle};

use super::reflection::Insight;

/// Insights below this confidence are recorded but never applied.
pub const MIN_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdaptationAction {
    Blacklist,
    Favor,
    CreateRule,
    DeactivatePattern,
    AdjustParam,
    Rollback,
}

impl AdaptationAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BLACKLIST" => Some(Self::Blacklist),
            "FAVOR" => Some(Self::Favor),
            "CREATE_RULE" => Some(Self::CreateRule),
            "DEACTIVATE_PATTERN" => Some(Self::DeactivatePattern),
            "ADJUST_PARAM" => Some(Self::AdjustParam),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blacklist => "BLACKLIST",
            Self::Favor => "FAVOR",
            Self::CreateRule => "CREATE_RULE",
            Self::DeactivatePattern => "DEACTIVATE_PATTERN",
            Self::AdjustParam => "ADJUST_PARAM",
            Self::Rollback => "ROLLBACK",
        }
    }
}

impl std::fmt::Display for AdaptationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effectiveness {
    Pending,
    HighlyEffective,
    Effective,
    Neutral,
    Ineffective,
    Harmful,
}

impl Effectiveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::HighlyEffective => "highly_effective",
            Self::Effective => "effective",
            Self::Neutral => "neutral",
            Self::Ineffective => "ineffective",
            Self::Harmful => "harmful",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "highly_effective" => Some(Self::HighlyEffective),
            "effective" => Some(Self::Effective),
            "neutral" => Some(Self::Neutral),
            "ineffective" => Some(Self::Ineffective),
            "harmful" => Some(Self::Harmful),
            _ => None,
        }
    }
}

impl std::fmt::Display for Effectiveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One applied knowledge mutation, tracked for effectiveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adaptation {
    pub adaptation_id: String,
    pub timestamp: i64,
    pub insight_type: String,
    pub action: AdaptationAction,
    pub target: String,
    pub description: String,
    pub pre_metrics: serde_json::Value,
    pub insight_confidence: f64,
    #[serde(default)]
    pub insight_evidence: String,
    #[serde(default)]
    pub post_metrics: Option<serde_json::Value>,
    pub effectiveness: Effectiveness,
    #[serde(default)]
    pub effectiveness_measured_at: Option<i64>,
}

pub struct AdaptationEngine {
    knowledge: Arc<KnowledgeStore>,
    writer: WriterHandle,
}

impl AdaptationEngine {
    pub fn new(knowledge: Arc<KnowledgeStore>, writer: WriterHandle) -> Self {
        Self { knowledge, writer }
    }

    /// Apply every actionable insight. `baseline` is the current account
    /// snapshot, captured by the caller before anything mutates.
    pub fn process(
        &self,
        insights: &[Insight],
        baseline: &ProfitSnapshot,
        now_ms: i64,
    ) -> Vec<Adaptation> {
        let mut applied = Vec::new();
        for insight in insights {
            if insight.confidence < MIN_CONFIDENCE {
                continue;
            }
            match self.apply_insight(insight, baseline, now_ms) {
                Some(adaptation) => applied.push(adaptation),
                None => {}
            }
        }
        applied
    }

    fn apply_insight(
        &self,
        insight: &Insight,
        baseline: &ProfitSnapshot,
        now_ms: i64,
    ) -> Option<Adaptation> {
        let action = AdaptationAction::parse(&insight.suggested_action.action)?;
        let target = insight.suggested_action.target.trim().to_string();
        if target.is_empty() {
            warn!(action = %action, "insight without target — skipped");
            return None;
        }

        let mut pre_metrics = serde_json::json!({
            "win_rate": baseline.win_rate,
            "total_pnl": baseline.total_pnl,
            "profit_factor": baseline.profit_factor,
            "balance": baseline.balance,
        });

        let target = match action {
            AdaptationAction::Blacklist => {
                if let Some(score) = self.knowledge.coin_score(&target) {
                    pre_metrics["coin_score"] = serde_json::to_value(&score).ok()?;
                }
                self.knowledge
                    .blacklist(&target, &format!("insight: {}", insight.title));
                target
            }
            AdaptationAction::Favor => {
                if let Some(score) = self.knowledge.coin_score(&target) {
                    pre_metrics["coin_score"] = serde_json::to_value(&score).ok()?;
                }
                self.knowledge.set_trend(&target, ScoreTrend::Improving);
                target
            }
            AdaptationAction::CreateRule => {
                let params = insight.suggested_action.params.clone().unwrap_or_default();
                let rule = RegimeRule {
                    rule_id: Uuid::new_v4().to_string(),
                    description: insight.title.clone(),
                    condition: params["condition"].clone(),
                    action: parse_rule_action(params["rule_action"].as_str()),
                    times_triggered: 0,
                    estimated_saves: 0.0,
                    is_active: true,
                };
                let rule_id = rule.rule_id.clone();
                self.knowledge.add_rule(rule);
                rule_id
            }
            AdaptationAction::DeactivatePattern => {
                if !self.knowledge.deactivate_pattern(&target, &insight.title) {
                    warn!(pattern_id = %target, "deactivate-pattern insight for unknown pattern");
                    return None;
                }
                target
            }
            AdaptationAction::AdjustParam => {
                let delta = insight
                    .suggested_action
                    .params
                    .as_ref()
                    .and_then(|p| p["delta"].as_f64())?;
                pre_metrics["param_delta"] = serde_json::json!(delta);
                let new_value = self.knowledge.adjust_param(&target, delta);
                pre_metrics["param_value_after"] = serde_json::json!(new_value);
                target
            }
            AdaptationAction::Rollback => return None,
        };

        let adaptation = Adaptation {
            adaptation_id: Uuid::new_v4().to_string(),
            timestamp: now_ms,
            insight_type: format!("{:?}", insight.insight_type).to_lowercase(),
            action,
            target: target.clone(),
            description: insight.description.clone(),
            pre_metrics,
            insight_confidence: insight.confidence,
            insight_evidence: insight.evidence.clone(),
            post_metrics: None,
            effectiveness: Effectiveness::Pending,
            effectiveness_measured_at: None,
        };

        info!(
            adaptation_id = %adaptation.adaptation_id,
            action = %action,
            target = %target,
            confidence = insight.confidence,
            "adaptation applied"
        );
        self.writer.send(WriteOp::Adaptation(adaptation.clone()));
        Some(adaptation)
    }

    /// Execute the inverse of `adaptation` and record a ROLLBACK row.
    /// Returns `None` for actions without an inverse.
    pub fn rollback(&self, adaptation: &Adaptation, now_ms: i64) -> Option<Adaptation> {
        match adaptation.action {
            AdaptationAction::Blacklist => {
                self.knowledge.unblacklist(&adaptation.target);
            }
            AdaptationAction::Favor => {
                self.knowledge.set_trend(&adaptation.target, ScoreTrend::Stable);
            }
            AdaptationAction::CreateRule => {
                if !self.knowledge.set_rule_active(&adaptation.target, false) {
                    warn!(rule_id = %adaptation.target, "rollback of unknown rule");
                    return None;
                }
            }
            AdaptationAction::DeactivatePattern => {
                if !self.knowledge.reactivate_pattern(&adaptation.target) {
                    warn!(pattern_id = %adaptation.target, "rollback of unknown pattern");
                    return None;
                }
            }
            AdaptationAction::AdjustParam => {
                let delta = adaptation.pre_metrics["param_delta"].as_f64()?;
                self.knowledge.adjust_param(&adaptation.target, -delta);
            }
            AdaptationAction::Rollback => return None,
        }

        let record = Adaptation {
            adaptation_id: Uuid::new_v4().to_string(),
            timestamp: now_ms,
            insight_type: adaptation.insight_type.clone(),
            action: AdaptationAction::Rollback,
            target: adaptation.adaptation_id.clone(),
            description: format!(
                "rollback of {} {} ({})",
                adaptation.action, adaptation.target, adaptation.adaptation_id
            ),
            pre_metrics: adaptation.post_metrics.clone().unwrap_or_default(),
            insight_confidence: 1.0,
            insight_evidence: String::new(),
            post_metrics: None,
            effectiveness: Effectiveness::Neutral,
            effectiveness_measured_at: None,
        };
        info!(
            rolled_back = %adaptation.adaptation_id,
            action = %adaptation.action,
            target = %adaptation.target,
            "adaptation rolled back"
        );
        self.writer.send(WriteOp::Adaptation(record.clone()));
        Some(record)
    }
}

fn parse_rule_action(s: Option<&str>) -> RuleAction {
    match s {
        Some("REDUCE_SIZE") => RuleAction::ReduceSize,
        Some("INCREASE_SIZE") => RuleAction::IncreaseSize,
        Some("CAUTION") => RuleAction::Caution,
        _ => RuleAction::NoTrade,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::Timeframe;
    use crate::knowledge::TradingPattern;
    use crate::learning::reflection::{InsightCategory, InsightType, SuggestedAction};
    use crate::types::CoinStatus;

    fn baseline() -> ProfitSnapshot {
        ProfitSnapshot {
            ts: 0,
            timeframe: Timeframe::AllTime,
            total_pnl: 12.0,
            win_rate: 0.5,
            profit_factor: 1.4,
            max_drawdown: 0.01,
            sharpe: None,
            balance: 10_012.0,
        }
    }

    fn insight(action: &str, target: &str, confidence: f64) -> Insight {
        Insight {
            insight_type: InsightType::Coin,
            category: InsightCategory::Problem,
            title: format!("{action} {target}"),
            description: "test".to_string(),
            evidence: "table".to_string(),
            suggested_action: SuggestedAction {
                action: action.to_string(),
                target: target.to_string(),
                params: None,
            },
            confidence,
        }
    }

    fn engine() -> (AdaptationEngine, Arc<KnowledgeStore>) {
        let knowledge = Arc::new(KnowledgeStore::new(WriterHandle::detached()));
        (
            AdaptationEngine::new(knowledge.clone(), WriterHandle::detached()),
            knowledge,
        )
    }

    #[test]
    fn low_confidence_insights_are_ignored() {
        let (engine, knowledge) = engine();
        let applied = engine.process(&[insight("BLACKLIST", "DOGE", 0.69)], &baseline(), 0);
        assert!(applied.is_empty());
        assert_ne!(knowledge.coin_status("DOGE"), CoinStatus::Blacklisted);
    }

    #[test]
    fn blacklist_applies_and_rolls_back() {
        let (engine, knowledge) = engine();
        let applied = engine.process(&[insight("BLACKLIST", "DOGE", 0.85)], &baseline(), 1);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].effectiveness, Effectiveness::Pending);
        assert_eq!(knowledge.coin_status("DOGE"), CoinStatus::Blacklisted);

        let rollback = engine.rollback(&applied[0], 2).unwrap();
        assert_eq!(rollback.action, AdaptationAction::Rollback);
        assert_eq!(rollback.target, applied[0].adaptation_id);
        assert_ne!(knowledge.coin_status("DOGE"), CoinStatus::Blacklisted);
    }

    #[test]
    fn favor_sets_trend_and_rollback_clears_it() {
        let (engine, knowledge) = engine();
        knowledge.update_coin_score("SOL", true, 2.0, 0);

        let applied = engine.process(&[insight("FAVOR", "SOL", 0.9)], &baseline(), 1);
        assert_eq!(applied.len(), 1);
        assert_eq!(knowledge.coin_score("SOL").unwrap().trend, ScoreTrend::Improving);

        engine.rollback(&applied[0], 2).unwrap();
        assert_eq!(knowledge.coin_score("SOL").unwrap().trend, ScoreTrend::Stable);
    }

    #[test]
    fn create_rule_and_rollback_deactivates_it() {
        let (engine, knowledge) = engine();
        let mut i = insight("CREATE_RULE", "btc crash guard", 0.8);
        i.suggested_action.params = Some(serde_json::json!({
            "condition": {"field": "btc_change_24h", "op": "lt", "value": -5.0},
            "rule_action": "NO_TRADE",
        }));
        let applied = engine.process(&[i], &baseline(), 1);
        assert_eq!(applied.len(), 1);
        assert_eq!(knowledge.active_rules().len(), 1);

        engine.rollback(&applied[0], 2).unwrap();
        assert!(knowledge.active_rules().is_empty());
    }

    #[test]
    fn deactivate_pattern_roundtrip() {
        let (engine, knowledge) = engine();
        knowledge.add_pattern(TradingPattern::new("brk", "breakout"));

        let applied = engine.process(&[insight("DEACTIVATE_PATTERN", "brk", 0.75)], &baseline(), 1);
        assert_eq!(applied.len(), 1);
        assert!(!knowledge.pattern("brk").unwrap().is_active);

        engine.rollback(&applied[0], 2).unwrap();
        assert!(knowledge.pattern("brk").unwrap().is_active);
    }

    #[test]
    fn adjust_param_rollback_inverts_delta() {
        let (engine, knowledge) = engine();
        let mut i = insight("ADJUST_PARAM", "trigger_tolerance_pct", 0.8);
        i.suggested_action.params = Some(serde_json::json!({"delta": 0.05}));

        let applied = engine.process(&[i], &baseline(), 1);
        assert_eq!(applied.len(), 1);
        assert!((knowledge.param_deltas()["trigger_tolerance_pct"] - 0.05).abs() < 1e-12);

        engine.rollback(&applied[0], 2).unwrap();
        assert!(knowledge.param_deltas()["trigger_tolerance_pct"].abs() < 1e-12);
    }

    #[test]
    fn unknown_actions_and_targets_are_skipped() {
        let (engine, _) = engine();
        assert!(engine
            .process(&[insight("NONE", "x", 0.9)], &baseline(), 0)
            .is_empty());
        assert!(engine
            .process(&[insight("BLACKLIST", "  ", 0.9)], &baseline(), 0)
            .is_empty());
        assert!(engine
            .process(&[insight("DEACTIVATE_PATTERN", "ghost", 0.9)], &baseline(), 0)
            .is_empty());
    }
}
