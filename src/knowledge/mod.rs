// =============================================================================
// Knowledge Store — the authoritative in-memory record of learned signals
// =============================================================================
//
// Owns coin scores, trading patterns, regime rules, and parameter overrides.
// The quick-update path mutates it synchronously after every closed trade;
// the strategist reads a cloned context; the adaptation engine applies and
// rolls back targeted mutations.
//
// Thread safety: one mutex per coin score and per pattern (writers serialise
// per entity, readers clone the small struct out). The entity maps themselves
// are behind an RwLock that is only write-locked to insert a new entry.
// Every mutation is written through to SQLite via the store writer queue, so
// nothing on the tick path ever waits on the database.
// =============================================================================

pub mod patterns;
pub mod rules;
pub mod scores;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use crate::store::writer::{WriteOp, WriterHandle};
use crate::types::CoinStatus;

pub use patterns::TradingPattern;
pub use rules::{MarketState, RegimeRule, RuleAction};
pub use scores::{CoinScore, CoinTransition, ScoreTrend};

/// Context handed to the strategist each cycle.
#[derive(Debug, Clone, Serialize)]
pub struct StrategistContext {
    pub good_coins: Vec<String>,
    pub avoid_coins: Vec<String>,
    pub active_rules: Vec<RegimeRule>,
    pub winning_patterns: Vec<TradingPattern>,
    pub top_coin_summaries: Vec<String>,
}

pub struct KnowledgeStore {
    coins: RwLock<HashMap<String, Arc<Mutex<CoinScore>>>>,
    patterns: RwLock<HashMap<String, Arc<Mutex<TradingPattern>>>>,
    rules: RwLock<Vec<RegimeRule>>,
    /// Cumulative deltas applied by ADJUST_PARAM adaptations, keyed by
    /// parameter name. Held in memory only; the adaptation rows carry enough
    /// to replay or invert them.
    param_deltas: Mutex<HashMap<String, f64>>,
    writer: WriterHandle,
}

impl KnowledgeStore {
    pub fn new(writer: WriterHandle) -> Self {
        Self {
            coins: RwLock::new(HashMap::new()),
            patterns: RwLock::new(HashMap::new()),
            rules: RwLock::new(Vec::new()),
            param_deltas: Mutex::new(HashMap::new()),
            writer,
        }
    }

    /// Restore the in-memory image from persisted rows at boot.
    pub fn hydrate(
        &self,
        scores: Vec<CoinScore>,
        patterns: Vec<TradingPattern>,
        rules: Vec<RegimeRule>,
    ) {
        let mut coin_map = self.coins.write();
        for s in scores {
            coin_map.insert(s.coin.clone(), Arc::new(Mutex::new(s)));
        }
        let mut pattern_map = self.patterns.write();
        for p in patterns {
            pattern_map.insert(p.pattern_id.clone(), Arc::new(Mutex::new(p)));
        }
        let rule_count = rules.len();
        *self.rules.write() = rules;
        info!(
            coins = coin_map.len(),
            patterns = pattern_map.len(),
            rules = rule_count,
            "knowledge store hydrated"
        );
    }

    // ── Coin scores ─────────────────────────────────────────────────────

    fn coin_entry(&self, coin: &str) -> Arc<Mutex<CoinScore>> {
        if let Some(entry) = self.coins.read().get(coin) {
            return entry.clone();
        }
        self.coins
            .write()
            .entry(coin.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CoinScore::new(coin))))
            .clone()
    }

    pub fn coin_score(&self, coin: &str) -> Option<CoinScore> {
        self.coins.read().get(coin).map(|e| e.lock().clone())
    }

    pub fn coin_status(&self, coin: &str) -> CoinStatus {
        self.coins
            .read()
            .get(coin)
            .map(|e| e.lock().status)
            .unwrap_or(CoinStatus::Unknown)
    }

    /// Fold a closed trade into the coin's score. Returns the updated score
    /// and the status transition, if one occurred.
    pub fn update_coin_score(
        &self,
        coin: &str,
        won: bool,
        pnl: f64,
        now_ms: i64,
    ) -> (CoinScore, Option<CoinTransition>) {
        let entry = self.coin_entry(coin);
        let (snapshot, transition) = {
            let mut score = entry.lock();
            let transition = score.record_trade(won, pnl, now_ms);
            (score.clone(), transition)
        };
        self.writer.send(WriteOp::CoinScore(snapshot.clone()));
        (snapshot, transition)
    }

    pub fn blacklist(&self, coin: &str, reason: &str) {
        let entry = self.coin_entry(coin);
        let snapshot = {
            let mut score = entry.lock();
            score.blacklist(reason);
            score.clone()
        };
        warn!(coin = %coin, reason = %reason, "coin blacklisted");
        self.writer.send(WriteOp::CoinScore(snapshot));
    }

    pub fn unblacklist(&self, coin: &str) {
        let entry = self.coin_entry(coin);
        let snapshot = {
            let mut score = entry.lock();
            score.unblacklist();
            score.clone()
        };
        info!(coin = %coin, status = %snapshot.status, "coin unblacklisted");
        self.writer.send(WriteOp::CoinScore(snapshot));
    }

    /// FAVOR adaptation: mark the coin as improving.
    pub fn set_trend(&self, coin: &str, trend: ScoreTrend) {
        let entry = self.coin_entry(coin);
        let snapshot = {
            let mut score = entry.lock();
            score.trend = trend;
            score.clone()
        };
        self.writer.send(WriteOp::CoinScore(snapshot));
    }

    pub fn all_scores(&self) -> Vec<CoinScore> {
        let mut scores: Vec<CoinScore> = self
            .coins
            .read()
            .values()
            .map(|e| e.lock().clone())
            .collect();
        scores.sort_by(|a, b| a.coin.cmp(&b.coin));
        scores
    }

    // ── Patterns ────────────────────────────────────────────────────────

    pub fn pattern(&self, id: &str) -> Option<TradingPattern> {
        self.patterns.read().get(id).map(|e| e.lock().clone())
    }

    pub fn add_pattern(&self, pattern: TradingPattern) {
        let snapshot = pattern.clone();
        self.patterns
            .write()
            .insert(pattern.pattern_id.clone(), Arc::new(Mutex::new(pattern)));
        self.writer.send(WriteOp::Pattern(snapshot));
    }

    /// Record one outcome against a pattern. Returns `(confidence,
    /// deactivated_now)`, or `None` for an unknown pattern id.
    pub fn record_pattern_outcome(
        &self,
        id: &str,
        won: bool,
        pnl: f64,
    ) -> Option<(f64, bool)> {
        let entry = self.patterns.read().get(id)?.clone();
        let (snapshot, deactivated) = {
            let mut pattern = entry.lock();
            let deactivated = pattern.record_outcome(won, pnl);
            (pattern.clone(), deactivated)
        };
        if deactivated {
            warn!(
                pattern_id = %id,
                confidence = snapshot.confidence,
                "pattern deactivated on low confidence"
            );
        }
        self.writer.send(WriteOp::Pattern(snapshot.clone()));
        Some((snapshot.confidence, deactivated))
    }

    pub fn deactivate_pattern(&self, id: &str, reason: &str) -> bool {
        self.set_pattern_active(id, false, reason)
    }

    pub fn reactivate_pattern(&self, id: &str) -> bool {
        self.set_pattern_active(id, true, "explicit reactivation")
    }

    fn set_pattern_active(&self, id: &str, active: bool, reason: &str) -> bool {
        let entry = match self.patterns.read().get(id) {
            Some(e) => e.clone(),
            None => return false,
        };
        let snapshot = {
            let mut pattern = entry.lock();
            pattern.is_active = active;
            pattern.clone()
        };
        info!(pattern_id = %id, active, reason = %reason, "pattern activity changed");
        self.writer.send(WriteOp::Pattern(snapshot));
        true
    }

    pub fn all_patterns(&self) -> Vec<TradingPattern> {
        let mut patterns: Vec<TradingPattern> = self
            .patterns
            .read()
            .values()
            .map(|e| e.lock().clone())
            .collect();
        patterns.sort_by(|a, b| a.pattern_id.cmp(&b.pattern_id));
        patterns
    }

    // ── Regime rules ────────────────────────────────────────────────────

    pub fn active_rules(&self) -> Vec<RegimeRule> {
        self.rules
            .read()
            .iter()
            .filter(|r| r.is_active)
            .cloned()
            .collect()
    }

    pub fn all_rules(&self) -> Vec<RegimeRule> {
        self.rules.read().clone()
    }

    pub fn add_rule(&self, rule: RegimeRule) {
        self.writer.send(WriteOp::Rule(rule.clone()));
        self.rules.write().push(rule);
    }

    /// Bump a rule's trigger counter and estimated savings.
    pub fn update_rule_stats(&self, id: &str, saved_pnl: f64) {
        let mut rules = self.rules.write();
        if let Some(rule) = rules.iter_mut().find(|r| r.rule_id == id) {
            rule.times_triggered += 1;
            rule.estimated_saves += saved_pnl;
            self.writer.send(WriteOp::Rule(rule.clone()));
        }
    }

    pub fn set_rule_active(&self, id: &str, active: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.rule_id == id) {
            Some(rule) => {
                rule.is_active = active;
                self.writer.send(WriteOp::Rule(rule.clone()));
                true
            }
            None => false,
        }
    }

    // ── Parameter overrides (ADJUST_PARAM) ──────────────────────────────

    pub fn adjust_param(&self, name: &str, delta: f64) -> f64 {
        let mut deltas = self.param_deltas.lock();
        let entry = deltas.entry(name.to_string()).or_insert(0.0);
        *entry += delta;
        *entry
    }

    pub fn param_deltas(&self) -> HashMap<String, f64> {
        self.param_deltas.lock().clone()
    }

    // ── Strategist context ──────────────────────────────────────────────

    pub fn strategist_context(&self) -> StrategistContext {
        let scores = self.all_scores();

        let good_coins: Vec<String> = scores
            .iter()
            .filter(|s| s.status == CoinStatus::Favored)
            .map(|s| s.coin.clone())
            .collect();

        let avoid_coins: Vec<String> = scores
            .iter()
            .filter(|s| matches!(s.status, CoinStatus::Blacklisted | CoinStatus::Reduced))
            .map(|s| s.coin.clone())
            .collect();

        let mut winning_patterns: Vec<TradingPattern> = self
            .all_patterns()
            .into_iter()
            .filter(|p| p.is_active && p.confidence >= 0.6)
            .collect();
        winning_patterns.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        winning_patterns.truncate(5);

        let mut ranked: Vec<&CoinScore> = scores
            .iter()
            .filter(|s| s.total_trades > 0)
            .collect();
        ranked.sort_by(|a, b| b.total_trades.cmp(&a.total_trades));
        let top_coin_summaries: Vec<String> = ranked
            .iter()
            .take(5)
            .map(|s| {
                format!(
                    "{}: {} trades, {:.0}% win rate, {:+.2} USD total, {} ({})",
                    s.coin,
                    s.total_trades,
                    s.win_rate * 100.0,
                    s.total_pnl,
                    s.status,
                    s.trend
                )
            })
            .collect();

        StrategistContext {
            good_coins,
            avoid_coins,
            active_rules: self.active_rules(),
            winning_patterns,
            top_coin_summaries,
        }
    }
}
