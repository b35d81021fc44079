// =============================================================================
// Shared types used across the Vela paper-trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trade direction. SHORT is accepted by the wire schema but rejected by both
/// the strategist validator and the sniper risk gate — the paper engine only
/// simulates spot longs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// How a condition's trigger price is compared against the tick price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerKind {
    Above,
    Below,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Above => write!(f, "ABOVE"),
            Self::Below => write!(f, "BELOW"),
        }
    }
}

/// Why a position was closed. Recorded verbatim in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
    Expiry,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::Manual => "manual",
            Self::Expiry => "expiry",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Learned standing of a coin, derived from its score after every trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoinStatus {
    Blacklisted,
    Reduced,
    Normal,
    Favored,
    Unknown,
}

impl CoinStatus {
    /// Position-size multiplier applied by the risk gate.
    pub fn size_modifier(&self) -> f64 {
        match self {
            Self::Blacklisted => 0.0,
            Self::Reduced => 0.5,
            Self::Normal => 1.0,
            Self::Favored => 1.5,
            Self::Unknown => 1.0,
        }
    }
}

impl Default for CoinStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for CoinStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blacklisted => write!(f, "BLACKLISTED"),
            Self::Reduced => write!(f, "REDUCED"),
            Self::Normal => write!(f, "NORMAL"),
            Self::Favored => write!(f, "FAVORED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Health of the exchange price feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Connecting,
    Healthy,
    /// No tick for longer than the staleness window — the sniper pauses new
    /// entries until the feed recovers.
    Stale,
    Down,
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self::Connecting
    }
}

impl std::fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Stale => write!(f, "stale"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Whether the engine is accepting new entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    Running,
    Paused,
}

impl Default for EngineMode {
    fn default() -> Self {
        Self::Running
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
        }
    }
}

/// Component health for the dashboard. The system summary is the worst of
/// all component levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Ok,
    Degraded,
    Down,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_modifiers_match_status_table() {
        assert_eq!(CoinStatus::Blacklisted.size_modifier(), 0.0);
        assert_eq!(CoinStatus::Reduced.size_modifier(), 0.5);
        assert_eq!(CoinStatus::Normal.size_modifier(), 1.0);
        assert_eq!(CoinStatus::Favored.size_modifier(), 1.5);
        assert_eq!(CoinStatus::Unknown.size_modifier(), 1.0);
    }

    #[test]
    fn exit_reason_serialises_snake_case() {
        let json = serde_json::to_string(&ExitReason::StopLoss).unwrap();
        assert_eq!(json, "\"stop_loss\"");
        let back: ExitReason = serde_json::from_str("\"take_profit\"").unwrap();
        assert_eq!(back, ExitReason::TakeProfit);
    }

    #[test]
    fn direction_wire_format_is_uppercase() {
        assert_eq!(serde_json::to_string(&Direction::Long).unwrap(), "\"LONG\"");
        let short: Direction = serde_json::from_str("\"SHORT\"").unwrap();
        assert_eq!(short, Direction::Short);
    }

    #[test]
    fn health_summary_is_worst_of_components() {
        let worst = [HealthLevel::Ok, HealthLevel::Degraded, HealthLevel::Ok]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(worst, HealthLevel::Degraded);
    }
}
