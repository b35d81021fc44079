// =============================================================================
// Central Application State — Vela Paper Engine
// =============================================================================
//
// Ties every subsystem together behind one `Arc<AppState>` for the dashboard
// API, the SSE feed, and the supervision loops. The sniper stays the single
// authority for balance and P&L; everything served here reads from it and
// derives.
//
// Thread safety:
//   - AtomicU64 state version for change tracking.
//   - parking_lot::RwLock for the error ring buffer.
//   - Subsystems manage their own interior mutability behind Arcs.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::analytics::{compute_snapshot, ProfitSnapshot, Timeframe};
use crate::config::EngineConfig;
use crate::feed::price_book::PriceBook;
use crate::feed::FeedHealth;
use crate::journal::Journal;
use crate::knowledge::KnowledgeStore;
use crate::learning::adaptation::AdaptationEngine;
use crate::learning::effectiveness::EffectivenessMonitor;
use crate::learning::reflection::ReflectionEngine;
use crate::llm::LlmClient;
use crate::sniper::Sniper;
use crate::store::writer::WriterHandle;
use crate::store::Store;
use crate::types::{EngineMode, FeedStatus, HealthLevel};

/// Maximum retained error records.
const MAX_RECENT_ERRORS: usize = 50;
/// Writer backlog beyond which the store is reported degraded.
const QUEUE_DEPTH_DEGRADED: u64 = 1_000;

/// A recorded error event for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: String,
}

pub struct AppState {
    pub state_version: AtomicU64,
    pub config: Arc<EngineConfig>,

    pub book: Arc<PriceBook>,
    pub feed_health: Arc<FeedHealth>,
    pub store: Arc<Store>,
    pub writer: WriterHandle,
    pub llm: Arc<LlmClient>,
    pub knowledge: Arc<KnowledgeStore>,
    pub journal: Arc<Journal>,
    pub sniper: Arc<Sniper>,
    pub adaptation: Arc<AdaptationEngine>,
    pub effectiveness: Arc<EffectivenessMonitor>,
    pub reflection: Arc<ReflectionEngine>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    // ── Version tracking ────────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error log ───────────────────────────────────────────────────────

    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    // ── Health ──────────────────────────────────────────────────────────

    pub fn health(&self) -> HealthReport {
        let feed = match self.feed_health.status() {
            FeedStatus::Healthy => HealthLevel::Ok,
            FeedStatus::Stale | FeedStatus::Connecting => HealthLevel::Degraded,
            FeedStatus::Down => HealthLevel::Down,
        };
        let llm = if self.llm.is_reachable() {
            HealthLevel::Ok
        } else {
            HealthLevel::Degraded
        };
        let queue_depth = self.writer.queue_depth();
        let store = if queue_depth > QUEUE_DEPTH_DEGRADED {
            HealthLevel::Degraded
        } else {
            HealthLevel::Ok
        };
        let summary = [feed, llm, store].into_iter().max().unwrap_or(HealthLevel::Ok);

        HealthReport {
            feed,
            feed_status: self.feed_health.status(),
            llm,
            store,
            journal_queue_depth: queue_depth,
            summary,
        }
    }

    // ── Dashboard snapshots ─────────────────────────────────────────────

    /// Payload for `GET /api/status`. Balance and P&L come straight from
    /// the sniper, the one source of truth.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let account = self.sniper.status();
        StatusSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            mode: account.mode,
            feed_status: self.feed_health.status(),
            coins: self.config.coins.clone(),
            starting_balance: account.starting_balance,
            balance: account.balance,
            in_positions: account.in_positions,
            equity: account.equity,
            total_pnl: account.total_pnl,
            open_positions: account.open_positions.len(),
            active_conditions: account.active_conditions,
            tick_count: account.tick_count,
            trades_closed: account.trades_closed,
            uptime_s: self.start_time.elapsed().as_secs(),
            health: self.health(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }

    /// Live profitability snapshot over the requested window, derived from
    /// the journal plus the sniper's equity.
    pub fn profit_snapshot(&self, timeframe: Timeframe) -> ProfitSnapshot {
        let now_ms = Utc::now().timestamp_millis();
        let trades = match self.store.closed_trades_since(0) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "could not read journal for snapshot");
                Vec::new()
            }
        };
        let equity = self.sniper.status().equity;
        compute_snapshot(timeframe, &trades, equity, now_ms)
    }
}

/// One reflection round followed by adaptation of its insights. Shared by
/// the periodic trigger and the dashboard override.
pub async fn run_reflection_round(state: &Arc<AppState>, trigger: &str) -> usize {
    let trades_closed = state.sniper.status().trades_closed;
    let insights = state.reflection.run_once(trades_closed, trigger).await;
    if insights.is_empty() {
        return 0;
    }

    let baseline = state.profit_snapshot(Timeframe::AllTime);
    let now_ms = Utc::now().timestamp_millis();
    let applied = state.adaptation.process(&insights, &baseline, now_ms);
    info!(
        insights = insights.len(),
        adaptations = applied.len(),
        trigger,
        "reflection round applied"
    );
    state.increment_version();
    applied.len()
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthReport {
    pub feed: HealthLevel,
    pub feed_status: FeedStatus,
    pub llm: HealthLevel,
    pub store: HealthLevel,
    pub journal_queue_depth: u64,
    pub summary: HealthLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub mode: EngineMode,
    pub feed_status: FeedStatus,
    pub coins: Vec<String>,
    pub starting_balance: f64,
    pub balance: f64,
    pub in_positions: f64,
    pub equity: f64,
    pub total_pnl: f64,
    pub open_positions: usize,
    pub active_conditions: usize,
    pub tick_count: u64,
    pub trades_closed: u64,
    pub uptime_s: u64,
    pub health: HealthReport,
    pub recent_errors: Vec<ErrorRecord>,
}
