// =============================================================================
// Engine Configuration — environment-driven settings
// =============================================================================
//
// Every tunable is read once at boot from `VELA_*` environment variables
// (a `.env` file is honoured via dotenv). Defaults are chosen so the engine
// runs against a local Ollama instance and the public Binance stream with no
// configuration at all.
//
// Variables:
//   VELA_COINS                 comma list of coins (default BTC,ETH,SOL,XRP,DOGE)
//   VELA_EXCHANGE              binance | coinbase
//   VELA_LLM_HOST              chat endpoint base URL
//   VELA_LLM_MODEL             model name sent in the request body
//   VELA_LLM_TIMEOUT_S         per-attempt wall-clock timeout
//   VELA_BIND_ADDR             dashboard bind address
//   VELA_DB_PATH               SQLite database path
//   VELA_PID_FILE              PID file path (absolute)
//   VELA_INITIAL_BALANCE       paper balance for a fresh database
//   VELA_STRATEGIST_INTERVAL_S strategist cycle period
//   VELA_REFLECTION_INTERVAL_S reflection time trigger
//   VELA_REFLECTION_TRADES     reflection trade-count trigger
//   VELA_COOLDOWN_S            per-coin re-entry cooldown
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_coins() -> Vec<String> {
    vec![
        "BTC".to_string(),
        "ETH".to_string(),
        "SOL".to_string(),
        "XRP".to_string(),
        "DOGE".to_string(),
    ]
}

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_llm_host() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_llm_timeout_s() -> u64 {
    120
}

fn default_bind_addr() -> String {
    "0.0.0.0:8787".to_string()
}

fn default_db_path() -> String {
    "vela.db".to_string()
}

fn default_pid_file() -> String {
    "/tmp/vela-bot.pid".to_string()
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_strategist_interval_s() -> u64 {
    180
}

fn default_reflection_interval_s() -> u64 {
    3600
}

fn default_reflection_trades() -> u64 {
    10
}

fn default_cooldown_s() -> i64 {
    1800
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Immutable engine configuration, assembled once at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_coins")]
    pub coins: Vec<String>,

    /// Price feed provider: "binance" (primary) or "coinbase" (fallback).
    #[serde(default = "default_exchange")]
    pub exchange: String,

    #[serde(default = "default_llm_host")]
    pub llm_host: String,

    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    #[serde(default = "default_llm_timeout_s")]
    pub llm_timeout_s: u64,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Paper balance used when the database has no runtime state to restore.
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    #[serde(default = "default_strategist_interval_s")]
    pub strategist_interval_s: u64,

    #[serde(default = "default_reflection_interval_s")]
    pub reflection_interval_s: u64,

    /// Trades since the last reflection that force a new round early.
    #[serde(default = "default_reflection_trades")]
    pub reflection_trades: u64,

    /// Seconds a coin stays on cooldown after an entry.
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coins: default_coins(),
            exchange: default_exchange(),
            llm_host: default_llm_host(),
            llm_model: default_llm_model(),
            llm_timeout_s: default_llm_timeout_s(),
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            pid_file: default_pid_file(),
            initial_balance: default_initial_balance(),
            strategist_interval_s: default_strategist_interval_s(),
            reflection_interval_s: default_reflection_interval_s(),
            reflection_trades: default_reflection_trades(),
            cooldown_s: default_cooldown_s(),
        }
    }
}

impl EngineConfig {
    /// Assemble the configuration from `VELA_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(coins) = std::env::var("VELA_COINS") {
            let parsed: Vec<String> = coins
                .split(',')
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .collect();
            if !parsed.is_empty() {
                cfg.coins = parsed;
            }
        }

        if let Ok(v) = std::env::var("VELA_EXCHANGE") {
            cfg.exchange = v.trim().to_lowercase();
        }
        if let Ok(v) = std::env::var("VELA_LLM_HOST") {
            cfg.llm_host = v;
        }
        if let Ok(v) = std::env::var("VELA_LLM_MODEL") {
            cfg.llm_model = v;
        }
        if let Ok(v) = std::env::var("VELA_LLM_TIMEOUT_S") {
            if let Ok(n) = v.parse() {
                cfg.llm_timeout_s = n;
            }
        }
        if let Ok(v) = std::env::var("VELA_BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Ok(v) = std::env::var("VELA_DB_PATH") {
            cfg.db_path = v;
        }
        if let Ok(v) = std::env::var("VELA_PID_FILE") {
            cfg.pid_file = v;
        }
        if let Ok(v) = std::env::var("VELA_INITIAL_BALANCE") {
            if let Ok(n) = v.parse::<f64>() {
                if n > 0.0 {
                    cfg.initial_balance = n;
                }
            }
        }
        if let Ok(v) = std::env::var("VELA_STRATEGIST_INTERVAL_S") {
            if let Ok(n) = v.parse() {
                cfg.strategist_interval_s = n;
            }
        }
        if let Ok(v) = std::env::var("VELA_REFLECTION_INTERVAL_S") {
            if let Ok(n) = v.parse() {
                cfg.reflection_interval_s = n;
            }
        }
        if let Ok(v) = std::env::var("VELA_REFLECTION_TRADES") {
            if let Ok(n) = v.parse() {
                cfg.reflection_trades = n;
            }
        }
        if let Ok(v) = std::env::var("VELA_COOLDOWN_S") {
            if let Ok(n) = v.parse() {
                cfg.cooldown_s = n;
            }
        }

        info!(
            coins = ?cfg.coins,
            exchange = %cfg.exchange,
            llm_host = %cfg.llm_host,
            llm_model = %cfg.llm_model,
            bind_addr = %cfg.bind_addr,
            db_path = %cfg.db_path,
            "engine config assembled"
        );

        cfg
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.coins.len(), 5);
        assert_eq!(cfg.coins[0], "BTC");
        assert_eq!(cfg.exchange, "binance");
        assert_eq!(cfg.strategist_interval_s, 180);
        assert_eq!(cfg.reflection_interval_s, 3600);
        assert_eq!(cfg.reflection_trades, 10);
        assert_eq!(cfg.cooldown_s, 1800);
        assert!((cfg.initial_balance - 10_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.exchange, "binance");
        assert_eq!(cfg.llm_timeout_s, 120);
        assert_eq!(cfg.pid_file, "/tmp/vela-bot.pid");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "exchange": "coinbase", "coins": ["ETH"] }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.exchange, "coinbase");
        assert_eq!(cfg.coins, vec!["ETH"]);
        assert_eq!(cfg.strategist_interval_s, 180);
    }
}
