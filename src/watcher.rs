// =============================================================================
// Exit Watcher — background loop that closes open positions on SL/TP breach
// =============================================================================
//
// One tick every `interval`: fetch a fresh price per open symbol, refresh the
// in-memory mark, and fire a closing MARKET order when a threshold is crossed.
// A failed price fetch or closing order leaves the position OPEN so the next
// tick retries. Stop-loss wins when a single print crosses both thresholds.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::exchange::ExchangeClient;
use crate::positions::{ExitReason, Position, PositionManager};
use crate::types::Side;

/// Upper bound on how long `stop()` waits for the loop to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Decide whether `price` breaches a protective threshold for `pos`.
///
/// Pure so it can be tested without an exchange. Stop-loss is evaluated
/// before take-profit.
pub fn exit_trigger(pos: &Position, price: f64) -> Option<ExitReason> {
    match pos.side {
        Side::Buy => {
            if price <= pos.stop_loss_price {
                Some(ExitReason::StopLoss)
            } else if price >= pos.take_profit_price {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
        Side::Sell => {
            if price >= pos.stop_loss_price {
                Some(ExitReason::StopLoss)
            } else if price <= pos.take_profit_price {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

pub struct ExitWatcher {
    positions: Arc<PositionManager>,
    exchange: Arc<dyn ExchangeClient>,
    interval: Duration,
    /// Present while running. The sender cancels the loop, the handle is
    /// awaited on stop.
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ExitWatcher {
    pub fn new(
        positions: Arc<PositionManager>,
        exchange: Arc<dyn ExchangeClient>,
        interval: Duration,
    ) -> Self {
        Self {
            positions,
            exchange,
            interval,
            running: Mutex::new(None),
        }
    }

    /// Spawn the monitoring loop. Calling `start` while already running is a
    /// no-op; only one loop ever exists per watcher.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.running.lock();
        if guard.is_some() {
            warn!("exit watcher already running — start ignored");
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let watcher = self.clone();
        let handle = tokio::spawn(async move {
            info!(interval_secs = watcher.interval.as_secs(), "exit watcher started");
            let mut ticker = tokio::time::interval(watcher.interval);
            // First tick fires immediately; skip it so a fresh start does not
            // race position opening.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        watcher.check_open_positions().await;
                    }
                    _ = stop_rx.changed() => {
                        info!("exit watcher stopping");
                        break;
                    }
                }
            }
        });

        *guard = Some((stop_tx, handle));
    }

    /// Signal the loop to stop and wait (bounded) for it to finish. Safe to
    /// call when not running.
    pub async fn stop(&self) {
        let entry = self.running.lock().take();
        let Some((stop_tx, handle)) = entry else {
            return;
        };

        let _ = stop_tx.send(true);
        match tokio::time::timeout(STOP_TIMEOUT, handle).await {
            Ok(Ok(())) => info!("exit watcher stopped"),
            Ok(Err(e)) => error!(error = %e, "exit watcher task panicked"),
            Err(_) => warn!("exit watcher did not stop within timeout — abandoning task"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    // -------------------------------------------------------------------------
    // One monitoring pass
    // -------------------------------------------------------------------------

    /// Check every open position once. Public so manual close paths and tests
    /// can drive a pass directly.
    pub async fn check_open_positions(&self) {
        let open = self.positions.open_positions();
        if open.is_empty() {
            return;
        }
        debug!(count = open.len(), "checking open positions");

        for pos in open {
            let price = match self.exchange.current_price(&pos.symbol).await {
                Ok(Some(p)) => p,
                Ok(None) => {
                    warn!(symbol = %pos.symbol, "price unavailable — skipping this cycle");
                    continue;
                }
                Err(e) => {
                    warn!(symbol = %pos.symbol, error = %e, "price fetch failed — skipping this cycle");
                    continue;
                }
            };

            self.positions.update_price(&pos.symbol, price);

            let Some(reason) = exit_trigger(&pos, price) else {
                continue;
            };

            info!(
                symbol = %pos.symbol,
                side = %pos.side,
                price,
                stop_loss = pos.stop_loss_price,
                take_profit = pos.take_profit_price,
                %reason,
                "exit threshold breached — closing position"
            );
            self.close_position(&pos, price, reason).await;
        }
    }

    /// Fire the closing order and record the exit. On order failure the
    /// position stays OPEN for the next tick.
    async fn close_position(&self, pos: &Position, trigger_price: f64, reason: ExitReason) {
        let close_side = pos.side.opposite();
        let fill = match self
            .exchange
            .place_market_order(&pos.symbol, close_side, pos.quantity)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(
                    symbol = %pos.symbol,
                    error = %e,
                    "closing order failed — position remains open for retry"
                );
                return;
            }
        };

        let exit_price = if fill.avg_fill_price > 0.0 {
            fill.avg_fill_price
        } else {
            trigger_price
        };

        match self.positions.close(&pos.symbol, exit_price, reason) {
            Some(pnl) => info!(
                symbol = %pos.symbol,
                exit_price,
                pnl,
                %reason,
                "position closed"
            ),
            None => warn!(symbol = %pos.symbol, "position vanished before close was recorded"),
        }
    }
}

impl std::fmt::Debug for ExitWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitWatcher")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::OrderFill;
    use crate::positions::PositionStatus;
    use crate::store::MemoryStore;
    use crate::types::{Clock, ManualClock};
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::RwLock;

    fn manager() -> Arc<PositionManager> {
        let clock: Arc<dyn Clock> =
            Arc::new(ManualClock::at("2026-03-01T12:00:00Z".parse().unwrap()));
        Arc::new(PositionManager::with_store(Box::new(MemoryStore::default()), clock).unwrap())
    }

    fn open_buy(mgr: &PositionManager, entry: f64) -> Position {
        mgr.open("BTCUSDT", Side::Buy, 0.01, entry).unwrap()
    }

    // -- trigger logic ------------------------------------------------------

    #[test]
    fn buy_triggers() {
        let mgr = manager();
        let pos = open_buy(&mgr, 100_000.0);
        // Thresholds: SL 99_000, TP 102_500.
        assert_eq!(exit_trigger(&pos, 100_000.0), None);
        assert_eq!(exit_trigger(&pos, 99_000.0), Some(ExitReason::StopLoss));
        assert_eq!(exit_trigger(&pos, 98_000.0), Some(ExitReason::StopLoss));
        assert_eq!(exit_trigger(&pos, 102_500.0), Some(ExitReason::TakeProfit));
        assert_eq!(exit_trigger(&pos, 102_499.0), None);
    }

    #[test]
    fn sell_triggers() {
        let mgr = manager();
        let pos = mgr.open("ETHUSDT", Side::Sell, 1.0, 3000.0).unwrap();
        // Thresholds: SL 3030, TP 2925.
        assert_eq!(exit_trigger(&pos, 3000.0), None);
        assert_eq!(exit_trigger(&pos, 3030.0), Some(ExitReason::StopLoss));
        assert_eq!(exit_trigger(&pos, 3050.0), Some(ExitReason::StopLoss));
        assert_eq!(exit_trigger(&pos, 2925.0), Some(ExitReason::TakeProfit));
        assert_eq!(exit_trigger(&pos, 2926.0), None);
    }

    #[test]
    fn stop_loss_wins_when_both_would_trigger() {
        let mgr = manager();
        let mut pos = open_buy(&mgr, 100_000.0);
        // Degenerate thresholds where one price crosses both.
        pos.stop_loss_price = 100_000.0;
        pos.take_profit_price = 100_000.0;
        assert_eq!(exit_trigger(&pos, 100_000.0), Some(ExitReason::StopLoss));
    }

    // -- loop behaviour -----------------------------------------------------

    struct ScriptedExchange {
        price: RwLock<Option<f64>>,
        fail_orders: bool,
        orders: RwLock<Vec<(String, Side, f64)>>,
    }

    impl ScriptedExchange {
        fn at(price: f64) -> Self {
            Self {
                price: RwLock::new(Some(price)),
                fail_orders: false,
                orders: RwLock::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for ScriptedExchange {
        async fn current_price(&self, _symbol: &str) -> Result<Option<f64>> {
            Ok(*self.price.read())
        }

        async fn account_balance(&self, _asset: &str) -> Result<f64> {
            Ok(1000.0)
        }

        async fn place_market_order(
            &self,
            symbol: &str,
            side: Side,
            quantity: f64,
        ) -> Result<OrderFill> {
            if self.fail_orders {
                anyhow::bail!("exchange rejected order");
            }
            self.orders
                .write()
                .push((symbol.to_string(), side, quantity));
            Ok(OrderFill {
                filled_quantity: quantity,
                avg_fill_price: 0.0,
                status: "FILLED".into(),
            })
        }
    }

    #[tokio::test]
    async fn breach_closes_with_opposite_side_order() {
        let mgr = manager();
        open_buy(&mgr, 100_000.0);
        let exchange = Arc::new(ScriptedExchange::at(98_500.0));
        let watcher = ExitWatcher::new(mgr.clone(), exchange.clone(), Duration::from_secs(30));

        watcher.check_open_positions().await;

        let orders = exchange.orders.read();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].1, Side::Sell);
        assert!((orders[0].2 - 0.01).abs() < 1e-12);

        assert_eq!(mgr.open_count(), 0);
        let closed = mgr.closed_positions(10);
        assert_eq!(closed[0].status, PositionStatus::Closed);
        assert_eq!(closed[0].exit_reason, Some(ExitReason::StopLoss));
        // No reported fill price, so the trigger price is recorded.
        assert_eq!(closed[0].exit_price, Some(98_500.0));
    }

    #[tokio::test]
    async fn unavailable_price_skips_cycle() {
        let mgr = manager();
        open_buy(&mgr, 100_000.0);
        let exchange = Arc::new(ScriptedExchange {
            price: RwLock::new(None),
            fail_orders: false,
            orders: RwLock::new(Vec::new()),
        });
        let watcher = ExitWatcher::new(mgr.clone(), exchange.clone(), Duration::from_secs(30));

        watcher.check_open_positions().await;

        assert!(exchange.orders.read().is_empty());
        assert_eq!(mgr.open_count(), 1);
    }

    #[tokio::test]
    async fn failed_closing_order_leaves_position_open() {
        let mgr = manager();
        open_buy(&mgr, 100_000.0);
        let exchange = Arc::new(ScriptedExchange {
            price: RwLock::new(Some(90_000.0)),
            fail_orders: true,
            orders: RwLock::new(Vec::new()),
        });
        let watcher = ExitWatcher::new(mgr.clone(), exchange.clone(), Duration::from_secs(30));

        watcher.check_open_positions().await;

        assert_eq!(mgr.open_count(), 1);
        // Mark price still refreshed even though the close failed.
        assert_eq!(mgr.open_positions()[0].current_price, 90_000.0);
    }

    #[tokio::test]
    async fn within_band_only_updates_mark() {
        let mgr = manager();
        open_buy(&mgr, 100_000.0);
        let exchange = Arc::new(ScriptedExchange::at(100_500.0));
        let watcher = ExitWatcher::new(mgr.clone(), exchange.clone(), Duration::from_secs(30));

        watcher.check_open_positions().await;

        assert!(exchange.orders.read().is_empty());
        assert_eq!(mgr.open_count(), 1);
        assert_eq!(mgr.open_positions()[0].current_price, 100_500.0);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_is_prompt() {
        let mgr = manager();
        let exchange = Arc::new(ScriptedExchange::at(100_000.0));
        let watcher = Arc::new(ExitWatcher::new(
            mgr,
            exchange,
            Duration::from_secs(60),
        ));

        watcher.start();
        assert!(watcher.is_running());
        watcher.start();
        assert!(watcher.is_running());

        let started = std::time::Instant::now();
        watcher.stop().await;
        assert!(!watcher.is_running());
        assert!(started.elapsed() < Duration::from_secs(1));

        // Stop on an idle watcher is a no-op.
        watcher.stop().await;
    }
}
