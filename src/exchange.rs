// =============================================================================
// Exchange collaborator contract
// =============================================================================
//
// The engine's only view of the outside market. Failures stay inside the
// `Result` vocabulary: a missing price is `Ok(None)` (transient — the caller
// skips and retries on its next natural cycle), a transport fault is `Err`.
// Neither may take down the request path or the watcher loop.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Result of a filled (or partially filled) market order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub filled_quantity: f64,
    /// Volume-weighted average fill price; `0.0` when the exchange did not
    /// report it, in which case callers fall back to their observed price.
    pub avg_fill_price: f64,
    /// Raw exchange order status, e.g. "FILLED".
    pub status: String,
}

impl OrderFill {
    pub fn is_filled(&self) -> bool {
        self.status == "FILLED" || self.filled_quantity > 0.0
    }
}

/// Everything the trading-safety core needs from an exchange.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Latest trade price for `symbol`. `Ok(None)` means the price is
    /// temporarily unavailable and the caller should simply skip this cycle.
    async fn current_price(&self, symbol: &str) -> Result<Option<f64>>;

    /// Free balance of `asset` (e.g. "USDT").
    async fn account_balance(&self, asset: &str) -> Result<f64>;

    /// Submit a MARKET order and report the fill.
    async fn place_market_order(&self, symbol: &str, side: Side, quantity: f64)
        -> Result<OrderFill>;
}
