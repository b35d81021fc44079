// =============================================================================
// Strategist — the slow LLM-driven condition planner
// =============================================================================
//
// Every cycle (default 180 s): sweep expired conditions, consult the regime
// rules, assemble market + knowledge + account context, ask the model for at
// most three LONG conditions, validate every proposal against hard ranges,
// and hand the surviving set to the sniper as an atomic replacement.
//
// The model's output is untrusted: each condition is range-checked, priced
// against the live book, and discarded on any mismatch. A failed cycle is
// logged and skipped, never fatal.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics::{performance, PerformanceStats};
use crate::config::EngineConfig;
use crate::feed::price_book::PriceBook;
use crate::feed::PriceTick;
use crate::knowledge::{KnowledgeStore, MarketState, RuleAction, StrategistContext};
use crate::llm::{extract_json, LlmClient};
use crate::sniper::{Sniper, SniperStatus, TradeCondition};
use crate::store::writer::{WriteOp, WriterHandle};
use crate::store::Store;
use crate::types::{CoinStatus, Direction, TriggerKind};

/// Most conditions accepted per cycle.
pub const MAX_CONDITIONS: usize = 3;
/// Condition lifetime from stamping.
pub const CONDITION_TTL_MS: i64 = 5 * 60 * 1000;
/// Proposed trigger must sit within this fraction of the current price.
pub const TRIGGER_TOLERANCE: f64 = 0.005;
/// Allowed stop-loss / take-profit percentage range.
pub const SL_TP_RANGE: (f64, f64) = (0.5, 5.0);
/// Allowed position size range in USD.
pub const SIZE_RANGE: (f64, f64) = (20.0, 100.0);
/// Strategy tag stamped on every condition this planner emits.
pub const STRATEGY_ID: &str = "llm_v1";
/// Sleep after a failed cycle before the next attempt.
const ERROR_BACKOFF: Duration = Duration::from_secs(30);

pub struct Strategist {
    config: Arc<EngineConfig>,
    book: Arc<PriceBook>,
    knowledge: Arc<KnowledgeStore>,
    sniper: Arc<Sniper>,
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    writer: WriterHandle,
}

impl Strategist {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<EngineConfig>,
        book: Arc<PriceBook>,
        knowledge: Arc<KnowledgeStore>,
        sniper: Arc<Sniper>,
        store: Arc<Store>,
        llm: Arc<LlmClient>,
        writer: WriterHandle,
    ) -> Self {
        Self {
            config,
            book,
            knowledge,
            sniper,
            store,
            llm,
            writer,
        }
    }

    /// Cooperative planning loop; runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.strategist_interval_s));
        info!(
            interval_s = self.config.strategist_interval_s,
            "strategist loop starting"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            if let Err(e) = self.cycle().await {
                warn!(error = %e, "strategist cycle failed — backing off");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        info!("strategist loop stopped");
    }

    pub async fn cycle(&self) -> anyhow::Result<()> {
        let now_ms = Utc::now().timestamp_millis();

        // 1. Drop anything expired before planning against the set. The
        // sniper sweeps on ticks; this covers a stalled feed too.
        let held = self.sniper.active_conditions();
        let still_active: Vec<_> = held
            .iter()
            .filter(|c| !c.is_expired(now_ms))
            .cloned()
            .collect();
        if still_active.len() != held.len() {
            self.sniper.set_conditions(still_active);
        }

        // 2. Regime rules may veto the whole cycle.
        let market_state = self.market_state(now_ms);
        if let Some(rule) = self
            .knowledge
            .active_rules()
            .into_iter()
            .find(|r| r.action == RuleAction::NoTrade && r.matches(&market_state))
        {
            info!(rule_id = %rule.rule_id, description = %rule.description, "NO_TRADE rule active — emitting zero conditions");
            self.knowledge.update_rule_stats(&rule.rule_id, 0.0);
            self.writer.send(WriteOp::Activity {
                ts: now_ms,
                category: "strategist".to_string(),
                message: format!("no_trade_reason: {}", rule.description),
            });
            self.sniper.set_conditions(Vec::new());
            return Ok(());
        }

        // 3. Context. Without prices there is nothing to plan against.
        let prices = self.book.all();
        if prices.is_empty() {
            debug!("strategist skipped — no prices yet");
            return Ok(());
        }
        let knowledge_ctx = self.knowledge.strategist_context();
        let account = self.sniper.status();
        let day_ago = now_ms - 86_400_000;
        let recent = self.store.closed_trades_since(day_ago)?;
        let perf = performance(&recent);

        // 4. Prompt and model call. An unreachable model skips the cycle.
        let prompt = build_prompt(&prices, &knowledge_ctx, &account, &perf);
        let Some(response) = self.llm.query(STRATEGIST_SYSTEM_PROMPT, &prompt).await else {
            info!("strategist cycle skipped — llm unavailable");
            return Ok(());
        };

        // 5. Parse and validate every proposal.
        let proposal = parse_condition_response(&response);
        let vctx = self.validation_context(now_ms, &prices);

        let mut accepted = Vec::new();
        for raw in proposal.conditions.into_iter().take(MAX_CONDITIONS) {
            match validate_condition(&raw, &vctx) {
                Ok(condition) => accepted.push(condition),
                Err(reason) => {
                    warn!(coin = %raw.coin, reason = %reason, "condition rejected by validator");
                }
            }
        }

        if let Some(assessment) = &proposal.market_assessment {
            debug!(assessment = %assessment, "market assessment");
        }
        if accepted.is_empty() {
            if let Some(reason) = &proposal.no_trade_reason {
                info!(reason = %reason, "strategist proposes no trades");
                self.writer.send(WriteOp::Activity {
                    ts: now_ms,
                    category: "strategist".to_string(),
                    message: format!("no_trade_reason: {reason}"),
                });
            }
        }

        info!(accepted = accepted.len(), "strategist cycle complete");

        // 6. Atomic hand-off; the sniper persists the set.
        self.sniper.set_conditions(accepted);
        Ok(())
    }

    fn market_state(&self, _now_ms: i64) -> MarketState {
        let ticks = self.book.all();
        let btc_change_24h = self
            .book
            .last("BTC")
            .map(|t| t.change_24h)
            .unwrap_or(0.0);
        let avg_change_24h = if ticks.is_empty() {
            0.0
        } else {
            ticks.iter().map(|t| t.change_24h).sum::<f64>() / ticks.len() as f64
        };
        MarketState {
            btc_change_24h,
            avg_change_24h,
            hour_utc: Utc::now().hour() as u8,
        }
    }

    fn validation_context(&self, now_ms: i64, prices: &[PriceTick]) -> ValidationContext {
        let tradeable: HashSet<String> = self.config.coins.iter().cloned().collect();
        let blacklisted: HashSet<String> = tradeable
            .iter()
            .filter(|c| self.knowledge.coin_status(c) == CoinStatus::Blacklisted)
            .cloned()
            .collect();
        let on_cooldown: HashSet<String> = tradeable
            .iter()
            .filter(|c| self.sniper.cooldown_active(c, now_ms))
            .cloned()
            .collect();
        ValidationContext {
            now_ms,
            prices: prices.iter().map(|t| (t.coin.clone(), t.price)).collect(),
            tradeable,
            blacklisted,
            on_cooldown,
        }
    }
}

// =============================================================================
// Prompting
// =============================================================================

pub const STRATEGIST_SYSTEM_PROMPT: &str = "You are the strategist of an \
autonomous spot paper-trading engine. You propose entry conditions that a \
separate matcher executes mechanically. Respond with JSON only. Obey every \
constraint in the user message exactly; out-of-range values are discarded.";

pub fn build_prompt(
    prices: &[PriceTick],
    knowledge: &StrategistContext,
    account: &SniperStatus,
    perf: &PerformanceStats,
) -> String {
    let mut out = String::new();

    out.push_str("Current market (coin, price, 24h change):\n");
    for t in prices {
        out.push_str(&format!(
            "  {}: {} ({:+.2}%)\n",
            t.coin, t.price, t.change_24h
        ));
    }

    out.push_str(&format!(
        "\nAccount: balance {:.2} USD available, {:.2} USD in {} open positions, \
         total pnl {:+.2} USD\n",
        account.balance,
        account.in_positions,
        account.open_positions.len(),
        account.total_pnl
    ));
    out.push_str(&format!(
        "Last 24h: {} trades, {:.0}% win rate, {:+.2} USD\n",
        perf.trades,
        perf.win_rate * 100.0,
        perf.total_pnl
    ));

    if !knowledge.good_coins.is_empty() {
        out.push_str(&format!("Favored coins: {}\n", knowledge.good_coins.join(", ")));
    }
    if !knowledge.avoid_coins.is_empty() {
        out.push_str(&format!("Avoid coins: {}\n", knowledge.avoid_coins.join(", ")));
    }
    for summary in &knowledge.top_coin_summaries {
        out.push_str(&format!("  history {summary}\n"));
    }
    for pattern in &knowledge.winning_patterns {
        out.push_str(&format!(
            "Winning pattern {} (confidence {:.2}): {}\n",
            pattern.pattern_id, pattern.confidence, pattern.description
        ));
    }
    for rule in &knowledge.active_rules {
        out.push_str(&format!("Active rule [{}]: {}\n", rule.action, rule.description));
    }

    out.push_str(
        "\nRules you must obey:\n\
         - at most 3 conditions, LONG only\n\
         - position_size_usd between 20 and 100 inclusive\n\
         - stop_loss_pct and take_profit_pct between 0.5 and 5.0\n\
         - trigger_price within 0.1-0.3% of the current price\n\
         - never propose a blacklisted or avoided coin\n\
         - reasoning must be non-empty\n\n\
         Respond with a JSON object:\n\
         {\"conditions\": [{\"coin\": \"BTC\", \"direction\": \"LONG\", \
         \"trigger_price\": 0, \"trigger_condition\": \"ABOVE|BELOW\", \
         \"stop_loss_pct\": 0, \"take_profit_pct\": 0, \"position_size_usd\": 0, \
         \"reasoning\": \"...\", \"pattern_id\": null}], \
         \"market_assessment\": \"...\", \"no_trade_reason\": null}\n",
    );
    out
}

// =============================================================================
// Parsing & validation
// =============================================================================

/// Raw condition as proposed by the model, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCondition {
    #[serde(default)]
    pub coin: String,
    #[serde(default = "default_direction")]
    pub direction: String,
    #[serde(default)]
    pub trigger_price: f64,
    #[serde(default)]
    pub trigger_condition: String,
    #[serde(default)]
    pub stop_loss_pct: f64,
    #[serde(default)]
    pub take_profit_pct: f64,
    #[serde(default)]
    pub position_size_usd: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub pattern_id: Option<String>,
}

fn default_direction() -> String {
    "LONG".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct ConditionProposal {
    #[serde(default)]
    pub conditions: Vec<RawCondition>,
    #[serde(default)]
    pub market_assessment: Option<String>,
    #[serde(default)]
    pub no_trade_reason: Option<String>,
}

/// Everything the validator needs, as plain data.
pub struct ValidationContext {
    pub now_ms: i64,
    pub prices: HashMap<String, f64>,
    pub tradeable: HashSet<String>,
    pub blacklisted: HashSet<String>,
    pub on_cooldown: HashSet<String>,
}

pub fn parse_condition_response(response: &str) -> ConditionProposal {
    let Some(json) = extract_json(response) else {
        warn!("strategist response contained no JSON object");
        return ConditionProposal::default();
    };
    match serde_json::from_str(&json) {
        Ok(proposal) => proposal,
        Err(e) => {
            warn!(error = %e, "strategist response failed to parse");
            ConditionProposal::default()
        }
    }
}

/// Validate one proposal and stamp it into a live [`TradeCondition`].
pub fn validate_condition(
    raw: &RawCondition,
    ctx: &ValidationContext,
) -> Result<TradeCondition, String> {
    let coin = raw.coin.trim().to_uppercase();
    if coin.is_empty() || !ctx.tradeable.contains(&coin) {
        return Err(format!("unknown coin '{}'", raw.coin));
    }

    // Schema admits SHORT; generation rejects it just like the matcher does.
    let direction = match raw.direction.to_uppercase().as_str() {
        "LONG" => Direction::Long,
        "SHORT" => return Err("short direction not supported".to_string()),
        other => return Err(format!("unknown direction '{other}'")),
    };

    let trigger_condition = match raw.trigger_condition.to_uppercase().as_str() {
        "ABOVE" => TriggerKind::Above,
        "BELOW" => TriggerKind::Below,
        other => return Err(format!("unknown trigger condition '{other}'")),
    };

    if !(SL_TP_RANGE.0..=SL_TP_RANGE.1).contains(&raw.stop_loss_pct) {
        return Err(format!("stop_loss_pct {} out of range", raw.stop_loss_pct));
    }
    if !(SL_TP_RANGE.0..=SL_TP_RANGE.1).contains(&raw.take_profit_pct) {
        return Err(format!("take_profit_pct {} out of range", raw.take_profit_pct));
    }
    if !(SIZE_RANGE.0..=SIZE_RANGE.1).contains(&raw.position_size_usd) {
        return Err(format!(
            "position_size_usd {} out of range",
            raw.position_size_usd
        ));
    }

    let current = *ctx
        .prices
        .get(&coin)
        .ok_or_else(|| format!("no live price for {coin}"))?;
    if raw.trigger_price <= 0.0 {
        return Err("non-positive trigger price".to_string());
    }
    let distance = (raw.trigger_price - current).abs() / current;
    if distance > TRIGGER_TOLERANCE {
        return Err(format!(
            "trigger {:.4} is {:.2}% from current {:.4}",
            raw.trigger_price,
            distance * 100.0,
            current
        ));
    }

    if ctx.blacklisted.contains(&coin) {
        return Err(format!("{coin} is blacklisted"));
    }
    if ctx.on_cooldown.contains(&coin) {
        return Err(format!("{coin} is on cooldown"));
    }
    if raw.reasoning.trim().is_empty() {
        return Err("empty reasoning".to_string());
    }

    Ok(TradeCondition {
        id: Uuid::new_v4().to_string(),
        coin,
        direction,
        trigger_price: raw.trigger_price,
        trigger_condition,
        stop_loss_pct: raw.stop_loss_pct,
        take_profit_pct: raw.take_profit_pct,
        position_size_usd: raw.position_size_usd,
        reasoning: raw.reasoning.trim().to_string(),
        strategy_id: STRATEGY_ID.to_string(),
        pattern_id: raw.pattern_id.clone(),
        created_at: ctx.now_ms,
        valid_until: ctx.now_ms + CONDITION_TTL_MS,
        triggered: false,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ValidationContext {
        ValidationContext {
            now_ms: 1_000_000,
            prices: HashMap::from([
                ("BTC".to_string(), 42_000.0),
                ("DOGE".to_string(), 0.10),
                ("SOL".to_string(), 100.0),
            ]),
            tradeable: HashSet::from([
                "BTC".to_string(),
                "DOGE".to_string(),
                "SOL".to_string(),
            ]),
            blacklisted: HashSet::from(["DOGE".to_string()]),
            on_cooldown: HashSet::from(["SOL".to_string()]),
        }
    }

    fn raw(coin: &str) -> RawCondition {
        RawCondition {
            coin: coin.to_string(),
            direction: "LONG".to_string(),
            trigger_price: 42_050.0,
            trigger_condition: "ABOVE".to_string(),
            stop_loss_pct: 2.0,
            take_profit_pct: 1.5,
            position_size_usd: 100.0,
            reasoning: "volume breakout".to_string(),
            pattern_id: None,
        }
    }

    #[test]
    fn valid_condition_is_stamped() {
        let c = validate_condition(&raw("BTC"), &ctx()).unwrap();
        assert_eq!(c.coin, "BTC");
        assert_eq!(c.direction, Direction::Long);
        assert_eq!(c.strategy_id, STRATEGY_ID);
        assert_eq!(c.created_at, 1_000_000);
        assert_eq!(c.valid_until, 1_000_000 + CONDITION_TTL_MS);
        assert!(!c.triggered);
    }

    #[test]
    fn size_bounds_are_inclusive() {
        let mut r = raw("BTC");
        r.position_size_usd = 20.0;
        assert!(validate_condition(&r, &ctx()).is_ok());
        r.position_size_usd = 100.0;
        assert!(validate_condition(&r, &ctx()).is_ok());
        r.position_size_usd = 19.99;
        assert!(validate_condition(&r, &ctx()).is_err());
        r.position_size_usd = 100.01;
        assert!(validate_condition(&r, &ctx()).is_err());
    }

    #[test]
    fn sl_tp_ranges_enforced() {
        let mut r = raw("BTC");
        r.stop_loss_pct = 0.4;
        assert!(validate_condition(&r, &ctx()).is_err());
        r.stop_loss_pct = 5.1;
        assert!(validate_condition(&r, &ctx()).is_err());
        r.stop_loss_pct = 0.5;
        r.take_profit_pct = 5.0;
        assert!(validate_condition(&r, &ctx()).is_ok());
        r.take_profit_pct = 0.49;
        assert!(validate_condition(&r, &ctx()).is_err());
    }

    #[test]
    fn trigger_must_be_near_current_price() {
        let mut r = raw("BTC");
        // 0.5% of 42000 = 210.
        r.trigger_price = 42_210.0;
        assert!(validate_condition(&r, &ctx()).is_ok());
        r.trigger_price = 42_250.0;
        assert!(validate_condition(&r, &ctx()).is_err());
        r.trigger_price = 0.0;
        assert!(validate_condition(&r, &ctx()).is_err());
    }

    #[test]
    fn short_and_unknown_directions_rejected() {
        let mut r = raw("BTC");
        r.direction = "SHORT".to_string();
        assert!(validate_condition(&r, &ctx())
            .unwrap_err()
            .contains("short"));
        r.direction = "SIDEWAYS".to_string();
        assert!(validate_condition(&r, &ctx()).is_err());
    }

    #[test]
    fn blacklist_cooldown_and_unknown_coin_rejected() {
        let mut r = raw("DOGE");
        r.trigger_price = 0.1;
        assert!(validate_condition(&r, &ctx()).unwrap_err().contains("blacklisted"));

        let mut r = raw("SOL");
        r.trigger_price = 100.0;
        assert!(validate_condition(&r, &ctx()).unwrap_err().contains("cooldown"));

        let r = raw("PEPE");
        assert!(validate_condition(&r, &ctx()).unwrap_err().contains("unknown coin"));
    }

    #[test]
    fn empty_reasoning_rejected() {
        let mut r = raw("BTC");
        r.reasoning = "   ".to_string();
        assert!(validate_condition(&r, &ctx()).is_err());
    }

    #[test]
    fn parses_fenced_response() {
        let response = r#"Here is my plan:
```json
{
  "conditions": [{
    "coin": "BTC", "direction": "LONG", "trigger_price": 42050.0,
    "trigger_condition": "ABOVE", "stop_loss_pct": 2.0,
    "take_profit_pct": 1.5, "position_size_usd": 75.0,
    "reasoning": "strength continuation"
  }],
  "market_assessment": "risk-on",
  "no_trade_reason": null
}
```"#;
        let proposal = parse_condition_response(response);
        assert_eq!(proposal.conditions.len(), 1);
        assert_eq!(proposal.market_assessment.as_deref(), Some("risk-on"));
    }

    #[test]
    fn garbage_response_parses_to_empty_proposal() {
        let proposal = parse_condition_response("I would rather not trade today.");
        assert!(proposal.conditions.is_empty());
        assert!(proposal.no_trade_reason.is_none());
    }

    #[test]
    fn prompt_contains_hard_rules_and_context() {
        let prices = vec![PriceTick {
            coin: "BTC".to_string(),
            price: 42_000.0,
            ts: 0,
            vol_24h: 1.0e9,
            change_24h: 2.0,
        }];
        let knowledge = StrategistContext {
            good_coins: vec!["ETH".to_string()],
            avoid_coins: vec!["DOGE".to_string()],
            active_rules: vec![],
            winning_patterns: vec![],
            top_coin_summaries: vec![],
        };
        let account = SniperStatus {
            mode: crate::types::EngineMode::Running,
            starting_balance: 10_000.0,
            balance: 9_900.0,
            in_positions: 100.0,
            equity: 10_000.0,
            total_pnl: 0.0,
            open_positions: vec![],
            active_conditions: 0,
            tick_count: 0,
            trades_closed: 0,
        };
        let prompt = build_prompt(&prices, &knowledge, &account, &PerformanceStats::default());
        assert!(prompt.contains("BTC: 42000"));
        assert!(prompt.contains("at most 3 conditions, LONG only"));
        assert!(prompt.contains("between 20 and 100"));
        assert!(prompt.contains("Avoid coins: DOGE"));
        assert!(prompt.contains("Favored coins: ETH"));
    }
}
