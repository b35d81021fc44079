// =============================================================================
// Risk Gate — every entry must clear all of these checks
// =============================================================================
//
// Rejections are normal operation, not errors; callers log them at debug and
// move on. The gate is pure — it reads a borrowed context and never mutates
// anything — so every rule is unit-testable in isolation.
// =============================================================================

use serde::Serialize;

use crate::types::{CoinStatus, Direction, EngineMode};

use super::{Position, TradeCondition};

/// Hard cap on simultaneously open positions.
pub const MAX_POSITIONS: usize = 5;
/// Hard cap on open positions per coin.
pub const MAX_PER_COIN: usize = 1;
/// Deployed capital may not exceed this fraction of equity at entry time.
pub const MAX_EXPOSURE_PCT: f64 = 0.10;

/// Why the gate turned an entry away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReject {
    Paused,
    FeedStale,
    ShortNotSupported,
    Expired,
    MaxPositions,
    CoinPositionExists,
    Blacklisted,
    Cooldown,
    ZeroEffectiveSize,
    InsufficientBalance,
    ExposureCap,
}

impl std::fmt::Display for RiskReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Paused => "engine paused",
            Self::FeedStale => "price feed not healthy",
            Self::ShortNotSupported => "short direction not supported",
            Self::Expired => "condition expired",
            Self::MaxPositions => "max open positions reached",
            Self::CoinPositionExists => "position already open for coin",
            Self::Blacklisted => "coin is blacklisted",
            Self::Cooldown => "coin on cooldown",
            Self::ZeroEffectiveSize => "effective size is zero",
            Self::InsufficientBalance => "insufficient available balance",
            Self::ExposureCap => "exposure cap exceeded",
        };
        write!(f, "{s}")
    }
}

/// Borrowed view of everything the gate needs to decide.
pub struct GateContext<'a> {
    pub mode: EngineMode,
    pub feed_healthy: bool,
    pub now_ms: i64,
    pub available_balance: f64,
    pub in_positions: f64,
    pub open_positions: &'a [Position],
    pub coin_status: CoinStatus,
    /// Cooldown expiry for this coin, epoch ms, if one is running.
    pub cooldown_until: Option<i64>,
}

/// Evaluate the gate. `Ok` carries the effective position size in USD after
/// the coin-status modifier.
pub fn evaluate(condition: &TradeCondition, ctx: &GateContext<'_>) -> Result<f64, RiskReject> {
    if ctx.mode == EngineMode::Paused {
        return Err(RiskReject::Paused);
    }
    if !ctx.feed_healthy {
        return Err(RiskReject::FeedStale);
    }
    if condition.direction == Direction::Short {
        return Err(RiskReject::ShortNotSupported);
    }
    if ctx.now_ms > condition.valid_until {
        return Err(RiskReject::Expired);
    }
    if ctx.open_positions.len() >= MAX_POSITIONS {
        return Err(RiskReject::MaxPositions);
    }
    let per_coin = ctx
        .open_positions
        .iter()
        .filter(|p| p.coin == condition.coin)
        .count();
    if per_coin >= MAX_PER_COIN {
        return Err(RiskReject::CoinPositionExists);
    }
    if ctx.coin_status == CoinStatus::Blacklisted {
        return Err(RiskReject::Blacklisted);
    }
    if let Some(until) = ctx.cooldown_until {
        if ctx.now_ms < until {
            return Err(RiskReject::Cooldown);
        }
    }

    let effective = condition.position_size_usd * ctx.coin_status.size_modifier();
    if effective <= 0.0 {
        return Err(RiskReject::ZeroEffectiveSize);
    }
    if ctx.available_balance < effective {
        return Err(RiskReject::InsufficientBalance);
    }

    let equity = ctx.available_balance + ctx.in_positions;
    if equity <= 0.0 || (ctx.in_positions + effective) / equity > MAX_EXPOSURE_PCT {
        return Err(RiskReject::ExposureCap);
    }

    Ok(effective)
}
