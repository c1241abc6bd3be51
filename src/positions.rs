// =============================================================================
// Position Manager — source of truth for every tracked position
// =============================================================================
//
// Life-cycle:
//   Open -> Closed (stop-loss / take-profit / manual)
//
// Stop-loss and take-profit prices are computed once at open time and never
// change afterwards: 1% adverse, 2.5% favourable, mirrored for shorts.
//
// Thread-safety: the record table lives behind a single parking_lot::RwLock;
// every operation is a critical section, so a read-modify-write sequence can
// never interleave with another mutation. Durable snapshots are written on
// open/close transitions only — price ticks stay in memory.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::store::PositionStore;
use crate::types::{Clock, Side};

/// Stop-loss 1% below entry for longs.
const BUY_STOP_LOSS_MULT: f64 = 0.99;
/// Take-profit 2.5% above entry for longs.
const BUY_TAKE_PROFIT_MULT: f64 = 1.025;
/// Stop-loss 1% above entry for shorts.
const SELL_STOP_LOSS_MULT: f64 = 1.01;
/// Take-profit 2.5% below entry for shorts.
const SELL_TAKE_PROFIT_MULT: f64 = 0.975;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Current status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => f.write_str("OPEN"),
            Self::Closed => f.write_str("CLOSED"),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "STOP_LOSS")]
    StopLoss,
    #[serde(rename = "TAKE_PROFIT")]
    TakeProfit,
    #[serde(rename = "MANUAL")]
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => f.write_str("STOP_LOSS"),
            Self::TakeProfit => f.write_str("TAKE_PROFIT"),
            Self::Manual => f.write_str("MANUAL"),
        }
    }
}

/// A single tracked position. Closed records are never deleted — they are the
/// engine's trade history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    /// Asset units, always positive.
    pub quantity: f64,
    pub entry_price: f64,
    /// Last price observed by the exit watcher while the position was open.
    pub current_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub status: PositionStatus,
    pub entry_time: DateTime<Utc>,
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    #[serde(default)]
    pub realized_pnl_pct: Option<f64>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// Exit thresholds for a new position: (stop_loss, take_profit).
pub fn exit_thresholds(side: Side, entry_price: f64) -> (f64, f64) {
    match side {
        Side::Buy => (
            entry_price * BUY_STOP_LOSS_MULT,
            entry_price * BUY_TAKE_PROFIT_MULT,
        ),
        Side::Sell => (
            entry_price * SELL_STOP_LOSS_MULT,
            entry_price * SELL_TAKE_PROFIT_MULT,
        ),
    }
}

// ---------------------------------------------------------------------------
// Position Manager
// ---------------------------------------------------------------------------

/// Thread-safe owner of the position table. All mutation goes through these
/// methods; neither the request path nor the watcher touches the backing
/// store directly.
pub struct PositionManager {
    records: RwLock<Vec<Position>>,
    store: Box<dyn PositionStore>,
    clock: Arc<dyn Clock>,
}

impl PositionManager {
    /// Build a manager on top of `store`, reloading every persisted record so
    /// open positions resume monitoring after a restart.
    pub fn with_store(store: Box<dyn PositionStore>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let records = store.load()?;
        let open = records.iter().filter(|p| p.is_open()).count();
        if open > 0 {
            info!(open, total = records.len(), "resuming persisted positions");
        }
        Ok(Self {
            records: RwLock::new(records),
            store,
            clock,
        })
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Record a new open position with computed exit thresholds.
    ///
    /// Callers are expected not to open a second position for a symbol that
    /// already has one OPEN; this method does not deduplicate.
    pub fn open(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        entry_price: f64,
    ) -> anyhow::Result<Position> {
        let (stop_loss, take_profit) = exit_thresholds(side, entry_price);

        let pos = Position {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price,
            current_price: entry_price,
            stop_loss_price: stop_loss,
            take_profit_price: take_profit,
            status: PositionStatus::Open,
            entry_time: self.clock.now(),
            exit_time: None,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            realized_pnl_pct: None,
        };

        let mut records = self.records.write();
        records.push(pos.clone());
        self.store.persist(&records)?;

        info!(
            symbol,
            side = %side,
            quantity,
            entry_price,
            stop_loss,
            take_profit,
            "position opened"
        );
        Ok(pos)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Snapshot of all OPEN positions, in insertion order.
    pub fn open_positions(&self) -> Vec<Position> {
        self.records
            .read()
            .iter()
            .filter(|p| p.is_open())
            .cloned()
            .collect()
    }

    /// Number of OPEN positions. This count is the single authoritative
    /// source for the risk engine's max-open-trades check.
    pub fn open_count(&self) -> usize {
        self.records.read().iter().filter(|p| p.is_open()).count()
    }

    /// Snapshot of every record, open and closed.
    pub fn all_positions(&self) -> Vec<Position> {
        self.records.read().clone()
    }

    /// The most recent `limit` closed positions, newest first.
    pub fn closed_positions(&self, limit: usize) -> Vec<Position> {
        self.records
            .read()
            .iter()
            .rev()
            .filter(|p| !p.is_open())
            .take(limit)
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Price updates
    // -------------------------------------------------------------------------

    /// Update `current_price` on every OPEN record for `symbol`. A no-op when
    /// none match. Memory-only: the durable snapshot is refreshed on the next
    /// open/close transition.
    pub fn update_price(&self, symbol: &str, price: f64) {
        let mut records = self.records.write();
        for pos in records
            .iter_mut()
            .filter(|p| p.is_open() && p.symbol == symbol)
        {
            pos.current_price = price;
        }
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close the first OPEN position for `symbol`, computing realized PnL.
    ///
    /// Returns the realized PnL, or `None` when no OPEN record matches (the
    /// store is left untouched in that case).
    pub fn close(&self, symbol: &str, exit_price: f64, reason: ExitReason) -> Option<f64> {
        let mut records = self.records.write();

        let pos = match records
            .iter_mut()
            .find(|p| p.is_open() && p.symbol == symbol)
        {
            Some(p) => p,
            None => {
                warn!(symbol, "close requested but no open position found");
                return None;
            }
        };

        let (pnl, pnl_pct) = match pos.side {
            Side::Buy => (
                (exit_price - pos.entry_price) * pos.quantity,
                (exit_price - pos.entry_price) / pos.entry_price * 100.0,
            ),
            Side::Sell => (
                (pos.entry_price - exit_price) * pos.quantity,
                (pos.entry_price - exit_price) / pos.entry_price * 100.0,
            ),
        };

        pos.status = PositionStatus::Closed;
        pos.current_price = exit_price;
        pos.exit_time = Some(self.clock.now());
        pos.exit_price = Some(exit_price);
        pos.exit_reason = Some(reason);
        pos.realized_pnl = Some(pnl);
        pos.realized_pnl_pct = Some(pnl_pct);

        info!(
            symbol,
            side = %pos.side,
            quantity = pos.quantity,
            exit_price,
            reason = %reason,
            pnl,
            pnl_pct,
            "position closed"
        );

        if let Err(e) = self.store.persist(&records) {
            // The in-memory close already happened; the next transition will
            // rewrite the snapshot.
            error!(symbol, error = %e, "failed to persist position close");
        }

        Some(pnl)
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let records = self.records.read();
        let open = records.iter().filter(|p| p.is_open()).count();
        f.debug_struct("PositionManager")
            .field("open", &open)
            .field("total", &records.len())
            .finish()
    }
}
