// =============================================================================
// Risk Engine — constraint gate evaluated before every trade
// =============================================================================
//
// Checks, in fixed order (the first failure is the reported reason):
//   1. Confidence       — signal confidence meets the configured minimum.
//   2. Minimum balance  — account balance covers the trading floor.
//   3. Trade amount     — the capped per-trade amount is positive.
//   4. Open trades      — open-position count is under the cap. The position
//                         store is the authoritative source for this count.
//   5. Daily limit      — accepted trades today are under the cap.
//   6. Cooldown         — no accepted signal for the same (symbol, side)
//                         within the cooldown window.
//
// `evaluate` applies no side effects, so the caller can re-check freely; the
// cooldown and daily counters move only through `record_signal` and
// `record_trade`, invoked after the trade is actually accepted and filled.
// Daily counters reset automatically when the UTC date rolls over.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::RiskLimits;
use crate::positions::PositionManager;
use crate::types::{Clock, Side};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Outcome of a risk evaluation. A denial is an ordinary decision, not an
/// error; `reason` is always human-readable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskDecision {
    pub allowed: bool,
    pub reason: String,
}

impl RiskDecision {
    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }

    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "All risk constraints satisfied".to_string(),
        }
    }
}

/// One active cooldown entry, for the status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CooldownInfo {
    pub symbol: String,
    pub side: Side,
    pub seconds_remaining: u64,
}

/// Read-only snapshot of the risk engine for monitoring. No side effects
/// beyond the idempotent daily rollover reset.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub trades_today: usize,
    pub max_trades_per_day: u32,
    pub open_trades: usize,
    pub max_open_trades: u32,
    pub max_risk_per_trade: f64,
    pub min_balance_usdt: f64,
    pub cooldown_seconds: u64,
    pub min_confidence: f64,
    pub active_cooldowns: Vec<CooldownInfo>,
    pub current_date: NaiveDate,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Counters {
    /// Timestamps of trades accepted during the current UTC day only.
    trades_today: Vec<DateTime<Utc>>,
    /// Last accepted signal per (symbol, side).
    signal_cooldowns: HashMap<(String, Side), DateTime<Utc>>,
    last_reset: NaiveDate,
}

// ---------------------------------------------------------------------------
// Risk Engine
// ---------------------------------------------------------------------------

pub struct RiskEngine {
    limits: RiskLimits,
    clock: Arc<dyn Clock>,
    /// Authoritative source for the open-trade count.
    positions: Arc<PositionManager>,
    state: RwLock<Counters>,
}

impl RiskEngine {
    pub fn new(
        limits: RiskLimits,
        clock: Arc<dyn Clock>,
        positions: Arc<PositionManager>,
    ) -> Self {
        let today = clock.now().date_naive();
        info!(
            min_confidence = limits.min_confidence,
            min_balance = limits.min_balance_usdt,
            max_risk_per_trade = limits.max_risk_per_trade,
            max_open_trades = limits.max_open_trades,
            max_trades_per_day = limits.max_trades_per_day,
            cooldown_secs = limits.signal_cooldown_secs,
            "RiskEngine initialised"
        );

        Self {
            limits,
            clock,
            positions,
            state: RwLock::new(Counters {
                trades_today: Vec::new(),
                signal_cooldowns: HashMap::new(),
                last_reset: today,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Check every constraint for a prospective trade. Free of side effects:
    /// repeated calls with identical inputs return identical decisions.
    pub fn evaluate(
        &self,
        symbol: &str,
        side: Side,
        confidence: f64,
        account_balance: f64,
    ) -> RiskDecision {
        self.maybe_reset_daily();
        let now = self.clock.now();
        let s = self.state.read();

        // 1. Confidence threshold
        if confidence < self.limits.min_confidence {
            return RiskDecision::deny(format!(
                "Confidence {confidence:.1} below minimum {}",
                self.limits.min_confidence
            ));
        }

        // 2. Minimum balance
        if account_balance < self.limits.min_balance_usdt {
            return RiskDecision::deny(format!(
                "Insufficient balance: ${account_balance:.2} < ${} minimum",
                self.limits.min_balance_usdt
            ));
        }

        // 3. Capped trade amount
        let available = account_balance.min(self.limits.max_risk_per_trade);
        if available <= 0.0 {
            return RiskDecision::deny(format!(
                "Trade size ${} exceeds balance ${account_balance:.2}",
                self.limits.max_risk_per_trade
            ));
        }

        // 4. Open-trade cap (counted from the position store)
        let open = self.positions.open_count();
        if open >= self.limits.max_open_trades as usize {
            return RiskDecision::deny(format!(
                "Max open trades {} reached ({open} currently open)",
                self.limits.max_open_trades
            ));
        }

        // 5. Daily trade limit
        if s.trades_today.len() >= self.limits.max_trades_per_day as usize {
            return RiskDecision::deny(format!(
                "Daily trade limit {} reached ({} executed today)",
                self.limits.max_trades_per_day,
                s.trades_today.len()
            ));
        }

        // 6. Duplicate-signal cooldown, measured from the last record_signal.
        if let Some(last) = s.signal_cooldowns.get(&(symbol.to_string(), side)) {
            let expiry = *last + Duration::seconds(self.limits.signal_cooldown_secs as i64);
            if now < expiry {
                let remaining = (expiry - now).num_seconds();
                return RiskDecision::deny(format!(
                    "Duplicate {side} signal for {symbol}: cooldown active for {remaining}s more"
                ));
            }
        }

        RiskDecision::allow()
    }

    // -------------------------------------------------------------------------
    // Effects — applied by the caller only after the trade went through
    // -------------------------------------------------------------------------

    /// Stamp the cooldown for (symbol, side). Call after the gated trade was
    /// accepted, never on evaluation.
    pub fn record_signal(&self, symbol: &str, side: Side) {
        let now = self.clock.now();
        self.state
            .write()
            .signal_cooldowns
            .insert((symbol.to_string(), side), now);
        debug!(symbol, side = %side, "signal recorded for cooldown tracking");
    }

    /// Count a confirmed fill against the daily limit.
    pub fn record_trade(&self, symbol: &str, side: Side) {
        self.maybe_reset_daily();
        let now = self.clock.now();
        let mut s = self.state.write();
        s.trades_today.push(now);
        info!(
            symbol,
            side = %side,
            daily = s.trades_today.len(),
            limit = self.limits.max_trades_per_day,
            "trade recorded"
        );
    }

    // -------------------------------------------------------------------------
    // Status snapshot
    // -------------------------------------------------------------------------

    pub fn status(&self) -> RiskStatus {
        self.maybe_reset_daily();
        let now = self.clock.now();
        let s = self.state.read();

        let cooldown = Duration::seconds(self.limits.signal_cooldown_secs as i64);
        let mut active_cooldowns: Vec<CooldownInfo> = s
            .signal_cooldowns
            .iter()
            .filter_map(|((symbol, side), last)| {
                let expiry = *last + cooldown;
                if now < expiry {
                    Some(CooldownInfo {
                        symbol: symbol.clone(),
                        side: *side,
                        seconds_remaining: (expiry - now).num_seconds().max(0) as u64,
                    })
                } else {
                    None
                }
            })
            .collect();
        active_cooldowns.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        RiskStatus {
            trades_today: s.trades_today.len(),
            max_trades_per_day: self.limits.max_trades_per_day,
            open_trades: self.positions.open_count(),
            max_open_trades: self.limits.max_open_trades,
            max_risk_per_trade: self.limits.max_risk_per_trade,
            min_balance_usdt: self.limits.min_balance_usdt,
            cooldown_seconds: self.limits.signal_cooldown_secs,
            min_confidence: self.limits.min_confidence,
            active_cooldowns,
            current_date: s.last_reset,
        }
    }

    // -------------------------------------------------------------------------
    // Daily reset
    // -------------------------------------------------------------------------

    /// Clear the daily counters once the UTC date advances. The clear happens
    /// under the write lock, so no reader ever observes a partially reset day.
    fn maybe_reset_daily(&self) {
        let today = self.clock.now().date_naive();
        {
            let s = self.state.read();
            if s.last_reset >= today {
                return;
            }
        }
        let mut s = self.state.write();
        // Another thread may have reset between the read and write locks.
        if s.last_reset < today {
            info!(
                old_date = %s.last_reset,
                new_date = %today,
                "date rolled — resetting daily risk counters"
            );
            s.trades_today.clear();
            s.last_reset = today;
        }
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("limits", &self.limits)
            .finish()
    }
}
