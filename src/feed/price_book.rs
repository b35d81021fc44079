// =============================================================================
// Price Book — last-tick snapshot per coin
// =============================================================================
//
// The strategist, the journal's post-exit capture timers, and the dashboard
// all read prices here instead of touching the websocket task. Writes happen
// once per tick from the feed reader; readers clone small structs.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use super::PriceTick;

pub struct PriceBook {
    inner: RwLock<HashMap<String, PriceTick>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, tick: &PriceTick) {
        self.inner.write().insert(tick.coin.clone(), tick.clone());
    }

    /// Last full tick for a coin, if one has been seen.
    pub fn last(&self, coin: &str) -> Option<PriceTick> {
        self.inner.read().get(coin).cloned()
    }

    /// Last price for a coin.
    pub fn price(&self, coin: &str) -> Option<f64> {
        self.inner.read().get(coin).map(|t| t.price)
    }

    /// Snapshot of every tracked coin, sorted by coin name for stable output.
    pub fn all(&self) -> Vec<PriceTick> {
        let mut ticks: Vec<PriceTick> = self.inner.read().values().cloned().collect();
        ticks.sort_by(|a, b| a.coin.cmp(&b.coin));
        ticks
    }
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(coin: &str, price: f64) -> PriceTick {
        PriceTick {
            coin: coin.to_string(),
            price,
            ts: 1_700_000_000_000,
            vol_24h: 1.0e9,
            change_24h: 2.5,
        }
    }

    #[test]
    fn update_then_read_back() {
        let book = PriceBook::new();
        assert!(book.last("BTC").is_none());

        book.update(&tick("BTC", 42_000.0));
        assert_eq!(book.price("BTC"), Some(42_000.0));

        book.update(&tick("BTC", 42_100.0));
        assert_eq!(book.price("BTC"), Some(42_100.0));
    }

    #[test]
    fn all_is_sorted_by_coin() {
        let book = PriceBook::new();
        book.update(&tick("SOL", 100.0));
        book.update(&tick("BTC", 42_000.0));
        book.update(&tick("ETH", 2_500.0));

        let coins: Vec<String> = book.all().into_iter().map(|t| t.coin).collect();
        assert_eq!(coins, vec!["BTC", "ETH", "SOL"]);
    }
}
