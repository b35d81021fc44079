// =============================================================================
// Store — embedded SQLite persistence for every engine entity
// =============================================================================
//
// One connection behind a mutex, WAL journaling so a crash never tears a
// record. Multi-row mutations run inside explicit transactions. Opaque maps
// (market context, predicates, metrics) live in JSON columns; everything the
// dashboard filters on gets a real column and an index.
//
// Writes from the hot path arrive through the single-writer queue in
// `writer`; slow loops and API handlers may read directly.
// =============================================================================

pub mod writer;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analytics::{ProfitSnapshot, Timeframe};
use crate::journal::{MarketContext, TradeResult};
use crate::knowledge::{CoinScore, RegimeRule, TradingPattern};
use crate::learning::adaptation::{Adaptation, AdaptationAction, Effectiveness};
use crate::learning::reflection::{Insight, ReflectionRecord};
use crate::sniper::{Position, TradeCondition};
use crate::types::{Direction, ExitReason};

/// Engine state re-hydrated on boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub starting_balance: f64,
    pub balance: f64,
    pub open_positions: Vec<Position>,
    pub active_conditions: Vec<TradeCondition>,
    pub cooldowns: HashMap<String, i64>,
    #[serde(default)]
    pub tick_count: u64,
    #[serde(default)]
    pub uptime_s: u64,
    #[serde(default)]
    pub shutdown_ts: i64,
}

/// Post-exit capture slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSlot {
    Plus1m,
    Plus5m,
    Plus15m,
}

impl CaptureSlot {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Plus1m => "price_plus_1m",
            Self::Plus5m => "price_plus_5m",
            Self::Plus15m => "price_plus_15m",
        }
    }

    pub fn delay_s(&self) -> u64 {
        match self {
            Self::Plus1m => 60,
            Self::Plus5m => 300,
            Self::Plus15m => 900,
        }
    }
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    // ── Construction ────────────────────────────────────────────────────

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        let store = Self { conn: Mutex::new(conn) };
        store.initialize()?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let store = Self { conn: Mutex::new(conn) };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS open_trades (
                id TEXT PRIMARY KEY,
                coin TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_price REAL NOT NULL,
                size_usd REAL NOT NULL,
                entry_ts INTEGER NOT NULL,
                stop_loss_price REAL NOT NULL,
                take_profit_price REAL NOT NULL,
                strategy_id TEXT NOT NULL,
                pattern_id TEXT,
                condition_id TEXT NOT NULL,
                market_context TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_open_trades_coin ON open_trades(coin);

            CREATE TABLE IF NOT EXISTS closed_trades (
                id TEXT PRIMARY KEY,
                coin TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                size_usd REAL NOT NULL,
                entry_ts INTEGER NOT NULL,
                exit_ts INTEGER NOT NULL,
                exit_reason TEXT NOT NULL,
                pnl_usd REAL NOT NULL,
                pnl_pct REAL NOT NULL,
                duration_s INTEGER NOT NULL,
                strategy_id TEXT NOT NULL,
                pattern_id TEXT,
                condition_id TEXT NOT NULL,
                market_context TEXT NOT NULL DEFAULT '{}',
                hour_of_day INTEGER NOT NULL,
                day_of_week INTEGER NOT NULL,
                price_plus_1m REAL,
                price_plus_5m REAL,
                price_plus_15m REAL,
                missed_profit REAL
            );
            CREATE INDEX IF NOT EXISTS idx_closed_trades_exit_ts ON closed_trades(exit_ts);
            CREATE INDEX IF NOT EXISTS idx_closed_trades_coin ON closed_trades(coin);

            CREATE TABLE IF NOT EXISTS active_conditions (
                id TEXT PRIMARY KEY,
                coin TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                valid_until INTEGER NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS regime_rules (
                rule_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS coin_scores (
                coin TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                win_rate REAL NOT NULL DEFAULT 0,
                total_trades INTEGER NOT NULL DEFAULT 0,
                is_blacklisted INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_coin_scores_coin ON coin_scores(coin);

            CREATE TABLE IF NOT EXISTS trading_patterns (
                pattern_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.5,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS reflections (
                reflection_id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                trigger_kind TEXT NOT NULL,
                trades_analysed INTEGER NOT NULL,
                summary TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_reflections_ts ON reflections(ts);

            CREATE TABLE IF NOT EXISTS insights (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                reflection_id TEXT NOT NULL REFERENCES reflections(reflection_id),
                ts INTEGER NOT NULL,
                insight_type TEXT NOT NULL,
                category TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                evidence TEXT NOT NULL DEFAULT '',
                suggested_action TEXT NOT NULL DEFAULT '{}',
                confidence REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_insights_reflection ON insights(reflection_id);
            CREATE INDEX IF NOT EXISTS idx_insights_ts ON insights(ts);

            CREATE TABLE IF NOT EXISTS adaptations (
                adaptation_id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                insight_type TEXT NOT NULL,
                action TEXT NOT NULL,
                target TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                pre_metrics TEXT NOT NULL DEFAULT '{}',
                insight_confidence REAL NOT NULL,
                insight_evidence TEXT NOT NULL DEFAULT '',
                post_metrics TEXT,
                effectiveness TEXT NOT NULL DEFAULT 'pending',
                effectiveness_measured_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_adaptations_ts ON adaptations(timestamp);

            CREATE TABLE IF NOT EXISTS profit_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                timeframe TEXT NOT NULL,
                total_pnl REAL NOT NULL,
                win_rate REAL NOT NULL,
                profit_factor REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                sharpe REAL,
                balance REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_profit_snapshots_ts ON profit_snapshots(ts);

            CREATE TABLE IF NOT EXISTS equity_points (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                balance REAL NOT NULL,
                total_pnl REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_equity_points_ts ON equity_points(ts);

            CREATE TABLE IF NOT EXISTS runtime_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS coin_cooldowns (
                coin TEXT PRIMARY KEY,
                until_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activity_log_ts ON activity_log(ts);",
        )?;
        Ok(())
    }

    // ── Trades ──────────────────────────────────────────────────────────

    pub fn insert_open_trade(&self, position: &Position, context: &MarketContext) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO open_trades
             (id, coin, direction, entry_price, size_usd, entry_ts, stop_loss_price,
              take_profit_price, strategy_id, pattern_id, condition_id, market_context)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                position.id,
                position.coin,
                position.direction.to_string(),
                position.entry_price,
                position.size_usd,
                position.entry_ts,
                position.stop_loss_price,
                position.take_profit_price,
                position.strategy_id,
                position.pattern_id,
                position.condition_id,
                serde_json::to_string(context)?,
            ],
        )?;
        Ok(())
    }

    /// Close out a trade: remove the open row and insert the closed row in
    /// one transaction.
    pub fn insert_closed_trade(&self, trade: &TradeResult) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM open_trades WHERE id = ?1", params![trade.id])?;
        tx.execute(
            "INSERT OR REPLACE INTO closed_trades
             (id, coin, direction, entry_price, exit_price, size_usd, entry_ts, exit_ts,
              exit_reason, pnl_usd, pnl_pct, duration_s, strategy_id, pattern_id,
              condition_id, market_context, hour_of_day, day_of_week,
              price_plus_1m, price_plus_5m, price_plus_15m, missed_profit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                trade.id,
                trade.coin,
                trade.direction.to_string(),
                trade.entry_price,
                trade.exit_price,
                trade.size_usd,
                trade.entry_ts,
                trade.exit_ts,
                trade.exit_reason.as_str(),
                trade.pnl_usd,
                trade.pnl_pct,
                trade.duration_s,
                trade.strategy_id,
                trade.pattern_id,
                trade.condition_id,
                serde_json::to_string(&trade.market_context)?,
                trade.hour_of_day,
                trade.day_of_week,
                trade.price_plus_1m,
                trade.price_plus_5m,
                trade.price_plus_15m,
                trade.missed_profit,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record a post-exit capture and refresh `missed_profit` from the
    /// captures known so far (LONG: best price after exit minus exit price).
    pub fn set_post_exit_price(&self, trade_id: &str, slot: CaptureSlot, price: f64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            &format!("UPDATE closed_trades SET {} = ?1 WHERE id = ?2", slot.column()),
            params![price, trade_id],
        )?;
        tx.execute(
            "UPDATE closed_trades
             SET missed_profit = MAX(
                     COALESCE(price_plus_1m, exit_price),
                     COALESCE(price_plus_5m, exit_price),
                     COALESCE(price_plus_15m, exit_price)
                 ) - exit_price
             WHERE id = ?1",
            params![trade_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The most recent `limit` closed trades, oldest first.
    pub fn recent_closed_trades(&self, limit: usize) -> Result<Vec<TradeResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM closed_trades ORDER BY exit_ts DESC LIMIT ?1",
        )?;
        let mut trades: Vec<TradeResult> = stmt
            .query_map(params![limit as i64], row_to_trade)?
            .collect::<std::result::Result<_, _>>()?;
        trades.reverse();
        Ok(trades)
    }

    /// Closed trades with `exit_ts` strictly after `ts_ms`, oldest first.
    pub fn closed_trades_since(&self, ts_ms: i64) -> Result<Vec<TradeResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM closed_trades WHERE exit_ts > ?1 ORDER BY exit_ts ASC",
        )?;
        let trades = stmt
            .query_map(params![ts_ms], row_to_trade)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(trades)
    }

    // ── Conditions & cooldowns ──────────────────────────────────────────

    pub fn replace_conditions(&self, conditions: &[TradeCondition]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM active_conditions", [])?;
        for c in conditions {
            tx.execute(
                "INSERT INTO active_conditions (id, coin, created_at, valid_until, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![c.id, c.coin, c.created_at, c.valid_until, serde_json::to_string(c)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_conditions(&self) -> Result<Vec<TradeCondition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT payload FROM active_conditions")?;
        let conditions = stmt
            .query_map([], |row| {
                let payload: String = row.get(0)?;
                Ok(payload)
            })?
            .filter_map(|r| r.ok())
            .filter_map(|p| serde_json::from_str(&p).ok())
            .collect();
        Ok(conditions)
    }

    pub fn upsert_cooldown(&self, coin: &str, until_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO coin_cooldowns (coin, until_ms) VALUES (?1, ?2)",
            params![coin, until_ms],
        )?;
        Ok(())
    }

    pub fn load_cooldowns(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT coin, until_ms FROM coin_cooldowns")?;
        let cooldowns = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(cooldowns)
    }

    // ── Knowledge ───────────────────────────────────────────────────────

    pub fn upsert_coin_score(&self, score: &CoinScore) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO coin_scores
             (coin, payload, win_rate, total_trades, is_blacklisted)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                score.coin,
                serde_json::to_string(score)?,
                score.win_rate,
                score.total_trades,
                score.is_blacklisted as i64,
            ],
        )?;
        Ok(())
    }

    pub fn load_coin_scores(&self) -> Result<Vec<CoinScore>> {
        self.load_payloads("SELECT payload FROM coin_scores")
    }

    pub fn upsert_pattern(&self, pattern: &TradingPattern) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO trading_patterns (pattern_id, payload, confidence, is_active)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                pattern.pattern_id,
                serde_json::to_string(pattern)?,
                pattern.confidence,
                pattern.is_active as i64,
            ],
        )?;
        Ok(())
    }

    pub fn load_patterns(&self) -> Result<Vec<TradingPattern>> {
        self.load_payloads("SELECT payload FROM trading_patterns")
    }

    pub fn upsert_rule(&self, rule: &RegimeRule) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO regime_rules (rule_id, payload, is_active)
             VALUES (?1, ?2, ?3)",
            params![rule.rule_id, serde_json::to_string(rule)?, rule.is_active as i64],
        )?;
        Ok(())
    }

    pub fn load_rules(&self) -> Result<Vec<RegimeRule>> {
        self.load_payloads("SELECT payload FROM regime_rules")
    }

    fn load_payloads<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let items = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|p| serde_json::from_str(&p).ok())
            .collect();
        Ok(items)
    }

    // ── Reflections & insights ──────────────────────────────────────────

    pub fn insert_reflection(&self, record: &ReflectionRecord) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO reflections
             (reflection_id, ts, trigger_kind, trades_analysed, summary)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.reflection_id,
                record.ts,
                record.trigger,
                record.trades_analysed as i64,
                record.summary,
            ],
        )?;
        for insight in &record.insights {
            tx.execute(
                "INSERT INTO insights
                 (reflection_id, ts, insight_type, category, title, description,
                  evidence, suggested_action, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.reflection_id,
                    record.ts,
                    serde_json::to_value(insight.insight_type)?.as_str().unwrap_or("coin"),
                    serde_json::to_value(insight.category)?.as_str().unwrap_or("observation"),
                    insight.title,
                    insight.description,
                    insight.evidence,
                    serde_json::to_string(&insight.suggested_action)?,
                    insight.confidence,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Insights newest first, joined-ready for the dashboard.
    pub fn recent_insights(&self, limit: usize) -> Result<Vec<(String, i64, Insight)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT reflection_id, ts, insight_type, category, title, description,
                    evidence, suggested_action, confidence
             FROM insights ORDER BY ts DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let reflection_id: String = row.get(0)?;
                let ts: i64 = row.get(1)?;
                let insight_type: String = row.get(2)?;
                let category: String = row.get(3)?;
                let title: String = row.get(4)?;
                let description: String = row.get(5)?;
                let evidence: String = row.get(6)?;
                let suggested_action: String = row.get(7)?;
                let confidence: f64 = row.get(8)?;
                Ok((
                    reflection_id,
                    ts,
                    insight_type,
                    category,
                    title,
                    description,
                    evidence,
                    suggested_action,
                    confidence,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(
                |(rid, ts, ity, cat, title, desc, evidence, action, confidence)| {
                    let insight = serde_json::from_value(serde_json::json!({
                        "insight_type": ity,
                        "category": cat,
                        "title": title,
                        "description": desc,
                        "evidence": evidence,
                        "suggested_action": serde_json::from_str::<serde_json::Value>(&action)
                            .unwrap_or_default(),
                        "confidence": confidence,
                    }))
                    .ok()?;
                    Some((rid, ts, insight))
                },
            )
            .collect();
        Ok(rows)
    }

    // ── Adaptations ─────────────────────────────────────────────────────

    pub fn insert_adaptation(&self, adaptation: &Adaptation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO adaptations
             (adaptation_id, timestamp, insight_type, action, target, description,
              pre_metrics, insight_confidence, insight_evidence, post_metrics,
              effectiveness, effectiveness_measured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                adaptation.adaptation_id,
                adaptation.timestamp,
                adaptation.insight_type,
                adaptation.action.as_str(),
                adaptation.target,
                adaptation.description,
                adaptation.pre_metrics.to_string(),
                adaptation.insight_confidence,
                adaptation.insight_evidence,
                adaptation.post_metrics.as_ref().map(|m| m.to_string()),
                adaptation.effectiveness.as_str(),
                adaptation.effectiveness_measured_at,
            ],
        )?;
        Ok(())
    }

    pub fn set_adaptation_measured(
        &self,
        adaptation_id: &str,
        post_metrics: &serde_json::Value,
        effectiveness: Effectiveness,
        measured_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE adaptations
             SET post_metrics = ?1, effectiveness = ?2, effectiveness_measured_at = ?3
             WHERE adaptation_id = ?4",
            params![
                post_metrics.to_string(),
                effectiveness.as_str(),
                measured_at,
                adaptation_id,
            ],
        )?;
        Ok(())
    }

    pub fn pending_adaptations(&self) -> Result<Vec<Adaptation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM adaptations WHERE effectiveness = 'pending' ORDER BY timestamp ASC",
        )?;
        let adaptations = stmt
            .query_map([], row_to_adaptation)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(adaptations)
    }

    pub fn list_adaptations(&self, limit: usize) -> Result<Vec<Adaptation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM adaptations ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let adaptations = stmt
            .query_map(params![limit as i64], row_to_adaptation)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(adaptations)
    }

    pub fn get_adaptation(&self, id: &str) -> Result<Option<Adaptation>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM adaptations WHERE adaptation_id = ?1",
            params![id],
            row_to_adaptation,
        )
        .optional()
        .context("failed to read adaptation")
    }

    // ── Snapshots, equity, activity ─────────────────────────────────────

    pub fn insert_snapshot(&self, snapshot: &ProfitSnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO profit_snapshots
             (ts, timeframe, total_pnl, win_rate, profit_factor, max_drawdown, sharpe, balance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.ts,
                snapshot.timeframe.as_str(),
                snapshot.total_pnl,
                snapshot.win_rate,
                if snapshot.profit_factor.is_finite() { snapshot.profit_factor } else { -1.0 },
                snapshot.max_drawdown,
                snapshot.sharpe,
                snapshot.balance,
            ],
        )?;
        Ok(())
    }

    pub fn latest_snapshot(&self, timeframe: Timeframe) -> Result<Option<ProfitSnapshot>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT ts, timeframe, total_pnl, win_rate, profit_factor, max_drawdown, sharpe, balance
             FROM profit_snapshots WHERE timeframe = ?1 ORDER BY ts DESC LIMIT 1",
            params![timeframe.as_str()],
            row_to_snapshot,
        )
        .optional()
        .context("failed to read latest snapshot")
    }

    pub fn insert_equity_point(&self, ts: i64, balance: f64, total_pnl: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO equity_points (ts, balance, total_pnl) VALUES (?1, ?2, ?3)",
            params![ts, balance, total_pnl],
        )?;
        Ok(())
    }

    pub fn recent_equity_points(&self, limit: usize) -> Result<Vec<(i64, f64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ts, balance, total_pnl FROM equity_points ORDER BY ts DESC LIMIT ?1",
        )?;
        let mut points: Vec<(i64, f64, f64)> = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        points.reverse();
        Ok(points)
    }

    pub fn insert_activity(&self, ts: i64, category: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO activity_log (ts, category, message) VALUES (?1, ?2, ?3)",
            params![ts, category, message],
        )?;
        Ok(())
    }

    // ── Runtime state ───────────────────────────────────────────────────

    pub fn save_runtime_state(&self, state: &RuntimeState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO runtime_state (id, payload, updated_at)
             VALUES (1, ?1, ?2)",
            params![serde_json::to_string(state)?, state.shutdown_ts],
        )?;
        Ok(())
    }

    pub fn load_runtime_state(&self) -> Result<Option<RuntimeState>> {
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row("SELECT payload FROM runtime_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p).context("corrupt runtime state")?)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Row mappers
// =============================================================================

fn parse_direction(s: &str) -> Direction {
    match s {
        "SHORT" => Direction::Short,
        _ => Direction::Long,
    }
}

fn parse_exit_reason(s: &str) -> ExitReason {
    match s {
        "stop_loss" => ExitReason::StopLoss,
        "take_profit" => ExitReason::TakeProfit,
        "manual" => ExitReason::Manual,
        _ => ExitReason::Expiry,
    }
}

fn row_to_trade(row: &Row<'_>) -> rusqlite::Result<TradeResult> {
    let direction: String = row.get("direction")?;
    let exit_reason: String = row.get("exit_reason")?;
    let context: String = row.get("market_context")?;
    Ok(TradeResult {
        id: row.get("id")?,
        coin: row.get("coin")?,
        direction: parse_direction(&direction),
        entry_price: row.get("entry_price")?,
        exit_price: row.get("exit_price")?,
        size_usd: row.get("size_usd")?,
        entry_ts: row.get("entry_ts")?,
        exit_ts: row.get("exit_ts")?,
        exit_reason: parse_exit_reason(&exit_reason),
        pnl_usd: row.get("pnl_usd")?,
        pnl_pct: row.get("pnl_pct")?,
        duration_s: row.get("duration_s")?,
        strategy_id: row.get("strategy_id")?,
        pattern_id: row.get("pattern_id")?,
        condition_id: row.get("condition_id")?,
        market_context: serde_json::from_str(&context).unwrap_or_default(),
        hour_of_day: row.get::<_, i64>("hour_of_day")? as u8,
        day_of_week: row.get::<_, i64>("day_of_week")? as u8,
        price_plus_1m: row.get("price_plus_1m")?,
        price_plus_5m: row.get("price_plus_5m")?,
        price_plus_15m: row.get("price_plus_15m")?,
        missed_profit: row.get("missed_profit")?,
    })
}

fn row_to_adaptation(row: &Row<'_>) -> rusqlite::Result<Adaptation> {
    let action: String = row.get("action")?;
    let effectiveness: String = row.get("effectiveness")?;
    let pre_metrics: String = row.get("pre_metrics")?;
    let post_metrics: Option<String> = row.get("post_metrics")?;
    Ok(Adaptation {
        adaptation_id: row.get("adaptation_id")?,
        timestamp: row.get("timestamp")?,
        insight_type: row.get("insight_type")?,
        action: match action.as_str() {
            "BLACKLIST" => AdaptationAction::Blacklist,
            "FAVOR" => AdaptationAction::Favor,
            "CREATE_RULE" => AdaptationAction::CreateRule,
            "DEACTIVATE_PATTERN" => AdaptationAction::DeactivatePattern,
            "ADJUST_PARAM" => AdaptationAction::AdjustParam,
            _ => AdaptationAction::Rollback,
        },
        target: row.get("target")?,
        description: row.get("description")?,
        pre_metrics: serde_json::from_str(&pre_metrics).unwrap_or_default(),
        insight_confidence: row.get("insight_confidence")?,
        insight_evidence: row.get("insight_evidence")?,
        post_metrics: post_metrics.and_then(|m| serde_json::from_str(&m).ok()),
        effectiveness: Effectiveness::parse(&effectiveness).unwrap_or(Effectiveness::Pending),
        effectiveness_measured_at: row.get("effectiveness_measured_at")?,
    })
}

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<ProfitSnapshot> {
    let timeframe: String = row.get(1)?;
    let profit_factor: f64 = row.get(4)?;
    Ok(ProfitSnapshot {
        ts: row.get(0)?,
        timeframe: Timeframe::from_str_loose(&timeframe).unwrap_or(Timeframe::AllTime),
        total_pnl: row.get(2)?,
        win_rate: row.get(3)?,
        profit_factor: if profit_factor < 0.0 { f64::INFINITY } else { profit_factor },
        max_drawdown: row.get(5)?,
        sharpe: row.get(6)?,
        balance: row.get(7)?,
    })
}
