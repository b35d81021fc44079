// =============================================================================
// Reflection — periodic LLM review of the trade journal
// =============================================================================
//
// Fires when an hour has passed or ten trades have closed since the last
// round, whichever comes first. The model sees aggregated statistics, never
// raw ticks, and answers with structured insights. Everything it returns is
// treated as untrusted input: parsed defensively, clamped, and dropped on
// any mismatch.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::journal::TradeResult;
use crate::llm::{extract_json, LlmClient};
use crate::store::writer::{WriteOp, WriterHandle};
use crate::store::Store;

/// Minimum journal rows before a reflection is worth running.
const MIN_TRADES_FOR_REFLECTION: usize = 3;
/// Journal rows read per round.
const REFLECTION_LOOKBACK: usize = 30;
/// Trades faster than this count as quick exits in the stats.
const QUICK_EXIT_S: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightType {
    Coin,
    Pattern,
    Time,
    Regime,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightCategory {
    Opportunity,
    Problem,
    Observation,
}

/// Structured action the model recommends. `action` matches the adaptation
/// vocabulary (BLACKLIST, FAVOR, CREATE_RULE, DEACTIVATE_PATTERN,
/// ADJUST_PARAM); anything else is recorded but never applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub action: String,
    pub target: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub insight_type: InsightType,
    pub category: InsightCategory,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub evidence: String,
    pub suggested_action: SuggestedAction,
    pub confidence: f64,
}

/// One persisted reflection round.
#[derive(Debug, Clone, Serialize)]
pub struct ReflectionRecord {
    pub reflection_id: String,
    pub ts: i64,
    pub trigger: String,
    pub trades_analysed: usize,
    pub summary: String,
    pub insights: Vec<Insight>,
}

pub struct ReflectionEngine {
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    writer: WriterHandle,
    interval_s: u64,
    trade_trigger: u64,
    last_run_ms: Mutex<i64>,
    trades_at_last_run: Mutex<u64>,
}

impl ReflectionEngine {
    pub fn new(
        store: Arc<Store>,
        llm: Arc<LlmClient>,
        writer: WriterHandle,
        interval_s: u64,
        trade_trigger: u64,
    ) -> Self {
        Self {
            store,
            llm,
            writer,
            interval_s,
            trade_trigger,
            last_run_ms: Mutex::new(Utc::now().timestamp_millis()),
            trades_at_last_run: Mutex::new(0),
        }
    }

    /// Trigger check: an hour elapsed OR ten trades closed since last round.
    pub fn due(&self, trades_closed_total: u64, now_ms: i64) -> Option<&'static str> {
        let elapsed_s = (now_ms - *self.last_run_ms.lock()) / 1000;
        if elapsed_s >= self.interval_s as i64 {
            return Some("time");
        }
        if trades_closed_total.saturating_sub(*self.trades_at_last_run.lock())
            >= self.trade_trigger
        {
            return Some("trade_count");
        }
        None
    }

    /// Run one reflection round. Returns the insights for the adaptation
    /// engine, or an empty list when the round was skipped.
    pub async fn run_once(&self, trades_closed_total: u64, trigger: &str) -> Vec<Insight> {
        let now_ms = Utc::now().timestamp_millis();
        *self.last_run_ms.lock() = now_ms;
        *self.trades_at_last_run.lock() = trades_closed_total;

        let trades = match self.store.recent_closed_trades(REFLECTION_LOOKBACK) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "reflection could not read the journal");
                return Vec::new();
            }
        };
        if trades.len() < MIN_TRADES_FOR_REFLECTION {
            info!(trades = trades.len(), "reflection skipped — not enough closed trades");
            return Vec::new();
        }

        let prompt = build_reflection_prompt(&trades);
        let Some(response) = self.llm.query(REFLECTION_SYSTEM_PROMPT, &prompt).await else {
            warn!("reflection skipped — llm unavailable");
            return Vec::new();
        };

        let (summary, insights) = parse_reflection_response(&response);
        if insights.is_empty() {
            info!("reflection produced no usable insights");
        }

        let record = ReflectionRecord {
            reflection_id: Uuid::new_v4().to_string(),
            ts: now_ms,
            trigger: trigger.to_string(),
            trades_analysed: trades.len(),
            summary,
            insights: insights.clone(),
        };
        info!(
            reflection_id = %record.reflection_id,
            insights = insights.len(),
            trigger,
            "reflection round complete"
        );
        self.writer.send(WriteOp::Reflection(record));

        insights
    }
}

pub const REFLECTION_SYSTEM_PROMPT: &str = "You are the post-trade analyst of an \
autonomous paper-trading engine. You receive aggregated statistics over recent \
closed trades and respond with JSON only, no prose. Your insights adjust what \
the engine trades next, so only report what the evidence supports.";

/// Render the aggregated stats block the model reasons over.
pub fn build_reflection_prompt(trades: &[TradeResult]) -> String {
    use std::collections::BTreeMap;

    let mut by_coin: BTreeMap<&str, (usize, usize, f64)> = BTreeMap::new();
    let mut by_hour: BTreeMap<u8, (usize, usize)> = BTreeMap::new();
    let mut by_pattern: BTreeMap<&str, (usize, usize, f64)> = BTreeMap::new();
    let mut quick_exits = 0usize;

    for t in trades {
        let coin = by_coin.entry(t.coin.as_str()).or_insert((0, 0, 0.0));
        coin.0 += 1;
        if t.won() {
            coin.1 += 1;
        }
        coin.2 += t.pnl_usd;

        let hour = by_hour.entry(t.hour_of_day).or_insert((0, 0));
        hour.0 += 1;
        if t.won() {
            hour.1 += 1;
        }

        if let Some(p) = &t.pattern_id {
            let pat = by_pattern.entry(p.as_str()).or_insert((0, 0, 0.0));
            pat.0 += 1;
            if t.won() {
                pat.1 += 1;
            }
            pat.2 += t.pnl_usd;
        }

        if t.duration_s < QUICK_EXIT_S {
            quick_exits += 1;
        }
    }

    let best = trades
        .iter()
        .max_by(|a, b| a.pnl_usd.partial_cmp(&b.pnl_usd).unwrap_or(std::cmp::Ordering::Equal));
    let worst = trades
        .iter()
        .min_by(|a, b| a.pnl_usd.partial_cmp(&b.pnl_usd).unwrap_or(std::cmp::Ordering::Equal));

    let mut out = String::new();
    out.push_str(&format!(
        "Closed trades analysed: {}\nQuick exits (<{}s): {}\n\nPer coin (trades, wins, pnl):\n",
        trades.len(),
        QUICK_EXIT_S,
        quick_exits
    ));
    for (coin, (n, w, pnl)) in &by_coin {
        out.push_str(&format!("  {coin}: {n} trades, {w} wins, {pnl:+.2} USD\n"));
    }
    out.push_str("\nPer hour of day (trades, wins):\n");
    for (hour, (n, w)) in &by_hour {
        out.push_str(&format!("  {hour:02}:00 UTC: {n} trades, {w} wins\n"));
    }
    if !by_pattern.is_empty() {
        out.push_str("\nPer pattern (uses, wins, pnl):\n");
        for (p, (n, w, pnl)) in &by_pattern {
            out.push_str(&format!("  {p}: {n} uses, {w} wins, {pnl:+.2} USD\n"));
        }
    }
    if let (Some(b), Some(w)) = (best, worst) {
        out.push_str(&format!(
            "\nBest trade: {} {:+.2} USD ({})\nWorst trade: {} {:+.2} USD ({})\n",
            b.coin, b.pnl_usd, b.exit_reason, w.coin, w.pnl_usd, w.exit_reason
        ));
    }

    out.push_str(
        "\nRespond with a JSON object:\n\
        {\n  \"summary\": \"one sentence\",\n  \"insights\": [\n    {\n      \
        \"insight_type\": \"coin|pattern|time|regime|exit\",\n      \
        \"category\": \"opportunity|problem|observation\",\n      \
        \"title\": \"...\", \"description\": \"...\", \"evidence\": \"...\",\n      \
        \"suggested_action\": {\"action\": \"BLACKLIST|FAVOR|CREATE_RULE|DEACTIVATE_PATTERN|ADJUST_PARAM|NONE\", \"target\": \"...\"},\n      \
        \"confidence\": 0.0\n    }\n  ]\n}\n\
        At most 5 insights. Use confidence below 0.7 unless the evidence is strong.",
    );
    out
}

/// Parse the model's reflection answer. Malformed insights are dropped one
/// by one; a fully malformed response yields an empty list.
pub fn parse_reflection_response(response: &str) -> (String, Vec<Insight>) {
    let Some(json) = extract_json(response) else {
        warn!("reflection response contained no JSON object");
        return (String::new(), Vec::new());
    };
    let value: serde_json::Value = match serde_json::from_str(&json) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "reflection response was not valid JSON");
            return (String::new(), Vec::new());
        }
    };

    let summary = value["summary"].as_str().unwrap_or_default().to_string();
    let mut insights = Vec::new();
    if let Some(raw) = value["insights"].as_array() {
        for item in raw {
            match serde_json::from_value::<Insight>(item.clone()) {
                Ok(mut insight) => {
                    insight.confidence = insight.confidence.clamp(0.0, 1.0);
                    if insight.title.trim().is_empty() {
                        continue;
                    }
                    insights.push(insight);
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed insight");
                }
            }
        }
    }
    (summary, insights)
}
