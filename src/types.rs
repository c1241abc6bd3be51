// =============================================================================
// Shared types used across the Helios trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a trade. `Sell` on an open position denotes a short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// The order side that closes a position opened on this side.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("invalid side: {other}")),
        }
    }
}

/// An inbound trade signal. Transient — the engine never persists signals,
/// only the decisions and positions they produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    /// Confidence score in [0, 100] attached by the signal source.
    pub confidence: f64,
    /// Informational tags carried through to logs.
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub timeframe: String,
}

/// Time source injected into the risk engine and position manager so tests
/// can simulate day rollovers and cooldown expiry deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Adjustable clock for tests.
#[cfg(test)]
pub struct ManualClock(parking_lot::RwLock<DateTime<Utc>>);

#[cfg(test)]
impl ManualClock {
    pub fn at(start: DateTime<Utc>) -> Self {
        Self(parking_lot::RwLock::new(start))
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.0.write();
        *now += delta;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.write() = now;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.read()
    }
}
