// =============================================================================
// Price Feed — real-time tick source for the sniper and the strategist
// =============================================================================
//
// One websocket task per engine subscribes to a combined multi-coin ticker
// stream and dispatches every tick synchronously into the sniper, then into
// the price book. Reconnection with exponential backoff and the staleness
// watchdog live in `stream`; the last-tick snapshot store lives in
// `price_book`.
// =============================================================================

pub mod price_book;
pub mod stream;

use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::FeedStatus;

/// One price observation for one coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub coin: String,
    pub price: f64,
    /// Exchange event time, epoch milliseconds.
    pub ts: i64,
    pub vol_24h: f64,
    pub change_24h: f64,
}

/// Seconds of silence after which the feed is declared stale and the sniper
/// stops opening new positions.
pub const STALE_AFTER_S: u64 = 5;

/// Shared feed-health cell, written by the stream task and the watchdog,
/// read by the risk gate and the dashboard.
pub struct FeedHealth {
    status: RwLock<FeedStatus>,
    last_tick: RwLock<Instant>,
}

impl FeedHealth {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(FeedStatus::Connecting),
            last_tick: RwLock::new(Instant::now()),
        }
    }

    /// Record a received tick and flip the status back to healthy.
    pub fn mark_tick(&self) {
        *self.last_tick.write() = Instant::now();
        let mut status = self.status.write();
        if *status != FeedStatus::Healthy {
            *status = FeedStatus::Healthy;
        }
    }

    pub fn set_status(&self, status: FeedStatus) {
        *self.status.write() = status;
    }

    pub fn status(&self) -> FeedStatus {
        *self.status.read()
    }

    pub fn seconds_since_tick(&self) -> u64 {
        self.last_tick.read().elapsed().as_secs()
    }

    /// New entries are only allowed while the feed is demonstrably live.
    pub fn entries_allowed(&self) -> bool {
        *self.status.read() == FeedStatus::Healthy
    }
}

impl Default for FeedHealth {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Symbol mapping — the single coin ↔ provider-symbol table
// =============================================================================

/// Both providers derive their wire symbols from the plain coin name here so
/// the mapping is never duplicated elsewhere.
pub mod symbols {
    /// Binance stream name for a coin, e.g. "BTC" -> "btcusdt".
    pub fn binance_stream(coin: &str) -> String {
        format!("{}usdt", coin.to_lowercase())
    }

    /// Reverse of [`binance_stream`], e.g. "BTCUSDT" -> "BTC".
    pub fn coin_from_binance(symbol: &str) -> Option<String> {
        symbol
            .to_uppercase()
            .strip_suffix("USDT")
            .filter(|c| !c.is_empty())
            .map(str::to_string)
    }

    /// Coinbase Exchange product id for a coin, e.g. "BTC" -> "BTC-USD".
    pub fn coinbase_product(coin: &str) -> String {
        format!("{}-USD", coin.to_uppercase())
    }

    /// Reverse of [`coinbase_product`], e.g. "BTC-USD" -> "BTC".
    pub fn coin_from_coinbase(product: &str) -> Option<String> {
        product
            .to_uppercase()
            .strip_suffix("-USD")
            .filter(|c| !c.is_empty())
            .map(str::to_string)
    }

}
