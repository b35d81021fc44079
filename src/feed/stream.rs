// =============================================================================
// Feed Stream — websocket tick readers with reconnect supervision
// =============================================================================
//
// Primary provider: Binance combined `@ticker` stream (one socket for all
// coins). Fallback provider: Coinbase Exchange `ticker` channel, selected
// with `VELA_EXCHANGE=coinbase`. Both are translated to `PriceTick` here;
// nothing downstream knows which exchange is connected.
//
// The supervision loop reconnects with exponential backoff (1 s doubling to
// a 30 s cap, reset after a connection that held for a while). A separate
// watchdog task flips the feed to `stale` after 5 s of silence.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::sniper::Sniper;
use crate::types::FeedStatus;

use super::price_book::PriceBook;
use super::{symbols, FeedHealth, PriceTick, STALE_AFTER_S};

/// Initial reconnect delay.
const BACKOFF_START: Duration = Duration::from_secs(1);
/// Reconnect delay cap.
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// A connection that survived this long resets the backoff to the start.
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(60);

// =============================================================================
// Supervision
// =============================================================================

/// Run the feed until shutdown, reconnecting on every disconnect.
pub async fn supervise(
    config: Arc<EngineConfig>,
    book: Arc<PriceBook>,
    health: Arc<FeedHealth>,
    sniper: Arc<Sniper>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_START;

    loop {
        if *shutdown.borrow() {
            break;
        }

        health.set_status(FeedStatus::Connecting);
        let connected_at = Instant::now();

        let result = tokio::select! {
            r = run_stream(&config, &book, &health, &sniper) => r,
            _ = shutdown.changed() => break,
        };

        health.set_status(FeedStatus::Down);
        match result {
            Ok(()) => warn!(exchange = %config.exchange, "price stream ended — reconnecting"),
            Err(e) => error!(exchange = %config.exchange, error = %e, "price stream error — reconnecting"),
        }

        if connected_at.elapsed() >= BACKOFF_RESET_AFTER {
            backoff = BACKOFF_START;
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {},
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }

    health.set_status(FeedStatus::Down);
    info!("feed supervision stopped");
}

/// Staleness watchdog. Checked once per second; flips the feed to `stale`
/// after [`STALE_AFTER_S`] seconds without a tick.
pub async fn watchdog(health: Arc<FeedHealth>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if health.status() == FeedStatus::Healthy
                    && health.seconds_since_tick() >= STALE_AFTER_S
                {
                    warn!(
                        silent_s = health.seconds_since_tick(),
                        "feed stale — pausing new entries"
                    );
                    health.set_status(FeedStatus::Stale);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_stream(
    config: &EngineConfig,
    book: &Arc<PriceBook>,
    health: &Arc<FeedHealth>,
    sniper: &Arc<Sniper>,
) -> Result<()> {
    match config.exchange.as_str() {
        "coinbase" => run_coinbase(&config.coins, book, health, sniper).await,
        _ => run_binance(&config.coins, book, health, sniper).await,
    }
}

/// Dispatch one tick: health first (the watchdog must see it), then the
/// price book (the sniper's journal handoff reads it), then the matcher.
fn dispatch(tick: PriceTick, book: &PriceBook, health: &FeedHealth, sniper: &Sniper) {
    health.mark_tick();
    book.update(&tick);
    sniper.on_tick(&tick);
}

// =============================================================================
// Binance (primary)
// =============================================================================

async fn run_binance(
    coins: &[String],
    book: &Arc<PriceBook>,
    health: &Arc<FeedHealth>,
    sniper: &Arc<Sniper>,
) -> Result<()> {
    let streams: Vec<String> = coins
        .iter()
        .map(|c| format!("{}@ticker", symbols::binance_stream(c)))
        .collect();
    let url = format!(
        "wss://stream.binance.com:9443/stream?streams={}",
        streams.join("/")
    );
    info!(url = %url, "connecting to Binance ticker stream");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to Binance ticker stream")?;

    info!(coins = coins.len(), "Binance ticker stream connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_binance_ticker(&text) {
                Ok(Some(tick)) => dispatch(tick, book, health, sniper),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to parse Binance ticker message"),
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "Binance websocket read error");
                return Err(e.into());
            }
            None => {
                warn!("Binance websocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance combined-stream ticker frame.
///
/// Expected shape:
/// ```json
/// { "stream": "btcusdt@ticker",
///   "data": { "e": "24hrTicker", "E": 1700000000000, "s": "BTCUSDT",
///             "c": "42000.10", "P": "2.31", "q": "1234567.0" } }
/// ```
fn parse_binance_ticker(text: &str) -> Result<Option<PriceTick>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse Binance JSON")?;

    // Combined streams wrap the payload in {stream, data}; tolerate raw too.
    let data = root.get("data").unwrap_or(&root);

    if data["e"].as_str() != Some("24hrTicker") {
        return Ok(None);
    }

    let symbol = data["s"].as_str().context("missing field s")?;
    let coin = symbols::coin_from_binance(symbol)
        .with_context(|| format!("unmapped Binance symbol {symbol}"))?;

    let price: f64 = data["c"]
        .as_str()
        .context("missing field c")?
        .parse()
        .context("failed to parse last price")?;
    let change_24h: f64 = data["P"]
        .as_str()
        .context("missing field P")?
        .parse()
        .context("failed to parse 24h change")?;
    let vol_24h: f64 = data["q"]
        .as_str()
        .unwrap_or("0")
        .parse()
        .unwrap_or(0.0);
    let ts = data["E"].as_i64().context("missing field E")?;

    if price <= 0.0 {
        anyhow::bail!("non-positive price {price} for {coin}");
    }

    Ok(Some(PriceTick {
        coin,
        price,
        ts,
        vol_24h: vol_24h.max(0.0),
        change_24h,
    }))
}

// =============================================================================
// Coinbase (fallback)
// =============================================================================

async fn run_coinbase(
    coins: &[String],
    book: &Arc<PriceBook>,
    health: &Arc<FeedHealth>,
    sniper: &Arc<Sniper>,
) -> Result<()> {
    let url = "wss://ws-feed.exchange.coinbase.com";
    info!(url, "connecting to Coinbase ticker feed");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to Coinbase feed")?;

    let (mut write, mut read) = ws_stream.split();

    let products: Vec<String> = coins.iter().map(|c| symbols::coinbase_product(c)).collect();
    let subscribe = serde_json::json!({
        "type": "subscribe",
        "product_ids": products,
        "channels": ["ticker"],
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send Coinbase subscribe message")?;

    info!(coins = coins.len(), "Coinbase ticker feed connected");

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_coinbase_ticker(&text) {
                Ok(Some(tick)) => dispatch(tick, book, health, sniper),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to parse Coinbase ticker message"),
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "Coinbase websocket read error");
                return Err(e.into());
            }
            None => {
                warn!("Coinbase websocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Coinbase Exchange `ticker` frame.
///
/// Expected shape:
/// ```json
/// { "type": "ticker", "product_id": "BTC-USD", "price": "42000.10",
///   "open_24h": "41000.00", "volume_24h": "1234.5",
///   "time": "2024-01-01T00:00:00.000000Z" }
/// ```
fn parse_coinbase_ticker(text: &str) -> Result<Option<PriceTick>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse Coinbase JSON")?;

    if root["type"].as_str() != Some("ticker") {
        return Ok(None);
    }

    let product = root["product_id"].as_str().context("missing product_id")?;
    let coin = symbols::coin_from_coinbase(product)
        .with_context(|| format!("unmapped Coinbase product {product}"))?;

    let price: f64 = root["price"]
        .as_str()
        .context("missing price")?
        .parse()
        .context("failed to parse price")?;
    let open_24h: f64 = root["open_24h"]
        .as_str()
        .unwrap_or("0")
        .parse()
        .unwrap_or(0.0);
    let vol_24h: f64 = root["volume_24h"]
        .as_str()
        .unwrap_or("0")
        .parse()
        .unwrap_or(0.0);

    let change_24h = if open_24h > 0.0 {
        (price - open_24h) / open_24h * 100.0
    } else {
        0.0
    };

    let ts = root["time"]
        .as_str()
        .and_then(|t| t.parse::<chrono::DateTime<chrono::Utc>>().ok())
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    if price <= 0.0 {
        anyhow::bail!("non-positive price {price} for {coin}");
    }

    debug!(coin = %coin, price, "coinbase tick");

    Ok(Some(PriceTick {
        coin,
        price,
        ts,
        vol_24h: vol_24h.max(0.0),
        change_24h,
    }))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binance_combined_ticker() {
        let text = r#"{
            "stream": "btcusdt@ticker",
            "data": {
                "e": "24hrTicker", "E": 1700000000123, "s": "BTCUSDT",
                "c": "42000.10", "P": "2.31", "q": "1234567.89"
            }
        }"#;
        let tick = parse_binance_ticker(text).unwrap().unwrap();
        assert_eq!(tick.coin, "BTC");
        assert!((tick.price - 42_000.10).abs() < 1e-9);
        assert!((tick.change_24h - 2.31).abs() < 1e-9);
        assert_eq!(tick.ts, 1_700_000_000_123);
    }

    #[test]
    fn ignores_non_ticker_binance_frames() {
        let text = r#"{ "result": null, "id": 1 }"#;
        assert!(parse_binance_ticker(text).unwrap().is_none());
    }

    #[test]
    fn rejects_non_positive_binance_price() {
        let text = r#"{
            "data": { "e": "24hrTicker", "E": 1, "s": "ETHUSDT",
                      "c": "0", "P": "0", "q": "0" }
        }"#;
        assert!(parse_binance_ticker(text).is_err());
    }

    #[test]
    fn parses_coinbase_ticker_and_derives_change() {
        let text = r#"{
            "type": "ticker", "product_id": "ETH-USD",
            "price": "2050.00", "open_24h": "2000.00", "volume_24h": "500.5",
            "time": "2024-01-01T00:00:00.000000Z"
        }"#;
        let tick = parse_coinbase_ticker(text).unwrap().unwrap();
        assert_eq!(tick.coin, "ETH");
        assert!((tick.change_24h - 2.5).abs() < 1e-9);
        assert!(tick.ts > 0);
    }

    #[test]
    fn ignores_coinbase_subscription_ack() {
        let text = r#"{ "type": "subscriptions", "channels": [] }"#;
        assert!(parse_coinbase_ticker(text).unwrap().is_none());
    }
}
