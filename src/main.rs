// =============================================================================
// Vela Paper Engine — Main Entry Point
// =============================================================================
//
// Two loops around one knowledge base: a slow LLM strategist proposes trade
// conditions, a fast tick-driven sniper executes them against a simulated
// balance, and every closed trade feeds the learning pipeline that shapes
// the next strategist prompt. No real funds ever move.
//
// Exit codes: 0 clean shutdown, 1 fatal init error, 2 dashboard port taken.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analytics;
mod api;
mod app_state;
mod config;
mod feed;
mod journal;
mod knowledge;
mod learning;
mod llm;
mod process_lock;
mod sniper;
mod store;
mod strategist;
mod types;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::analytics::Timeframe;
use crate::app_state::{run_reflection_round, AppState};
use crate::config::EngineConfig;
use crate::feed::price_book::PriceBook;
use crate::feed::FeedHealth;
use crate::journal::Journal;
use crate::knowledge::KnowledgeStore;
use crate::learning::adaptation::AdaptationEngine;
use crate::learning::effectiveness::EffectivenessMonitor;
use crate::learning::quick_update::QuickUpdate;
use crate::learning::reflection::ReflectionEngine;
use crate::llm::LlmClient;
use crate::process_lock::PidFile;
use crate::sniper::Sniper;
use crate::store::writer::WriteOp;
use crate::store::Store;
use crate::strategist::Strategist;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Vela Paper Engine — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Arc::new(EngineConfig::from_env());

    let code = match boot(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal init error");
            1
        }
    };
    std::process::exit(code);
}

async fn boot(config: Arc<EngineConfig>) -> anyhow::Result<i32> {
    // ── 1. Single live process: PID file, then the dashboard port ───────
    let _pid_file = PidFile::acquire(&config.pid_file)?;

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.bind_addr, error = %e, "dashboard port unavailable");
            return Ok(2);
        }
    };

    // ── 2. Store, price book, single writer ─────────────────────────────
    let store = Arc::new(Store::open(&config.db_path)?);
    let book = Arc::new(PriceBook::new());
    let feed_health = Arc::new(FeedHealth::new());
    let (writer, _writer_join) = store::writer::spawn(store.clone(), book.clone());

    // ── 3. LLM gateway ──────────────────────────────────────────────────
    let llm = Arc::new(LlmClient::new(
        &config.llm_host,
        &config.llm_model,
        config.llm_timeout_s,
    ));

    // ── 4. Knowledge store, hydrated from disk ──────────────────────────
    let knowledge = Arc::new(KnowledgeStore::new(writer.clone()));
    knowledge.hydrate(
        store.load_coin_scores()?,
        store.load_patterns()?,
        store.load_rules()?,
    );

    // ── 5. Journal, quick update, sniper ────────────────────────────────
    let journal = Arc::new(Journal::new(writer.clone()));
    let quick_update = Arc::new(QuickUpdate::new(knowledge.clone(), writer.clone()));
    let sniper = Arc::new(Sniper::new(
        config.initial_balance,
        config.cooldown_s,
        knowledge.clone(),
        journal.clone(),
        quick_update,
        feed_health.clone(),
        book.clone(),
        writer.clone(),
    ));

    match store.load_runtime_state()? {
        Some(mut state) => {
            // The condition and cooldown tables are written continuously and
            // are fresher than the shutdown snapshot.
            state.active_conditions = store.load_conditions()?;
            state.cooldowns.extend(store.load_cooldowns()?);
            sniper.hydrate(state);
        }
        None => {
            info!(balance = config.initial_balance, "fresh paper account");
        }
    }

    // ── 6. Learning engines ─────────────────────────────────────────────
    let reflection = Arc::new(ReflectionEngine::new(
        store.clone(),
        llm.clone(),
        writer.clone(),
        config.reflection_interval_s,
        config.reflection_trades,
    ));
    let adaptation = Arc::new(AdaptationEngine::new(knowledge.clone(), writer.clone()));
    let effectiveness = Arc::new(EffectivenessMonitor::new(store.clone(), writer.clone()));

    // ── 7. Shared state & dashboard ─────────────────────────────────────
    let state = Arc::new(AppState {
        state_version: AtomicU64::new(1),
        config: config.clone(),
        book: book.clone(),
        feed_health: feed_health.clone(),
        store: store.clone(),
        writer: writer.clone(),
        llm: llm.clone(),
        knowledge: knowledge.clone(),
        journal: journal.clone(),
        sniper: sniper.clone(),
        adaptation,
        effectiveness: effectiveness.clone(),
        reflection,
        recent_errors: RwLock::new(Vec::new()),
        start_time: std::time::Instant::now(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let app = api::rest::router(state.clone());
        let mut rx = shutdown_rx.clone();
        info!(addr = %config.bind_addr, "dashboard listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await
            {
                error!(error = %e, "dashboard server failed");
            }
        });
    }

    // ── 8. Price feed ───────────────────────────────────────────────────
    tokio::spawn(feed::stream::supervise(
        config.clone(),
        book.clone(),
        feed_health.clone(),
        sniper.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(feed::stream::watchdog(
        feed_health.clone(),
        shutdown_rx.clone(),
    ));

    // ── 9. Strategist loop ──────────────────────────────────────────────
    let strategist = Arc::new(Strategist::new(
        config.clone(),
        book.clone(),
        knowledge.clone(),
        sniper.clone(),
        store.clone(),
        llm.clone(),
        writer.clone(),
    ));
    tokio::spawn(strategist.run(shutdown_rx.clone()));

    // ── 10. Supervision loops ───────────────────────────────────────────
    spawn_health_ticker(state.clone(), shutdown_rx.clone());
    spawn_snapshot_scheduler(state.clone(), shutdown_rx.clone());
    spawn_effectiveness_sweep(state.clone(), shutdown_rx.clone());
    spawn_reflection_trigger(state.clone(), shutdown_rx.clone());

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 11. Graceful shutdown ───────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    // Stop the producers first, then persist state and drain the journal
    // queue so no write is lost.
    let _ = shutdown_tx.send(true);
    writer.send(WriteOp::RuntimeState(sniper.runtime_state()));
    state.journal.flush().await;

    info!(
        uptime_s = sniper.uptime_s(),
        ticks = sniper.status().tick_count,
        "Vela Paper Engine shut down complete"
    );
    Ok(0)
}

// =============================================================================
// Supervision loops
// =============================================================================

/// 1 Hz: status heartbeat. The feed watchdog and the LLM client maintain
/// their own health signals; this loop just surfaces them.
fn spawn_health_ticker(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let health = state.health();
                    let account = state.sniper.status();
                    debug!(
                        summary = %health.summary,
                        feed = %health.feed_status,
                        queue = health.journal_queue_depth,
                        ticks = account.tick_count,
                        equity = account.equity,
                        "heartbeat"
                    );
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

/// Every 5 minutes: equity point, plus any profit snapshots that are due
/// (hourly, daily, weekly, monthly — each when its window has elapsed).
fn spawn_snapshot_scheduler(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = interval.tick() => take_due_snapshots(&state),
                _ = shutdown.changed() => break,
            }
        }
    });
}

fn take_due_snapshots(state: &Arc<AppState>) {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let account = state.sniper.status();
    state.writer.send(WriteOp::EquityPoint {
        ts: now_ms,
        balance: account.equity,
        total_pnl: account.total_pnl,
    });
    // Periodic checkpoint so a crash loses at most five minutes of runtime
    // state.
    state
        .writer
        .send(WriteOp::RuntimeState(state.sniper.runtime_state()));

    for timeframe in [
        Timeframe::Hour,
        Timeframe::Day,
        Timeframe::Week,
        Timeframe::Month,
        Timeframe::AllTime,
    ] {
        // all_time refreshes on the hourly cadence.
        let cadence_ms = timeframe.window_ms().unwrap_or(3_600_000);
        let due = match state.store.latest_snapshot(timeframe) {
            Ok(Some(last)) => now_ms - last.ts >= cadence_ms,
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "snapshot due-check failed");
                false
            }
        };
        if due {
            let snapshot = state.profit_snapshot(timeframe);
            debug!(timeframe = %timeframe, pnl = snapshot.total_pnl, "profit snapshot taken");
            state.writer.send(WriteOp::Snapshot(snapshot));
        }
    }
}

/// Hourly: measure pending adaptations; harmful ones are flagged for the
/// operator (rollback itself stays a commanded action).
fn spawn_effectiveness_sweep(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let measured = state.effectiveness.sweep(now_ms);
                    for m in &measured {
                        if m.rollback_flagged {
                            warn!(
                                adaptation_id = %m.adaptation_id,
                                target = %m.target,
                                delta_pp = m.delta_win_rate_pp,
                                delta_pnl = m.delta_pnl,
                                "harmful adaptation flagged for rollback"
                            );
                            state.push_error(format!(
                                "adaptation {} ({} {}) measured harmful — rollback recommended",
                                m.adaptation_id, m.action, m.target
                            ));
                        }
                    }
                    if !measured.is_empty() {
                        state.increment_version();
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

/// Every minute: fire a reflection round when the time or trade-count
/// trigger is met.
fn spawn_reflection_trigger(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let trades = state.sniper.status().trades_closed;
                    if let Some(trigger) = state.reflection.due(trades, now_ms) {
                        run_reflection_round(&state, trigger).await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}
