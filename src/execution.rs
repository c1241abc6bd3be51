// =============================================================================
// Execution Engine — routes accepted signals through the risk gate, sizing,
// the exchange order, and position bookkeeping
// =============================================================================
//
// Ordering matters: the cooldown and daily counters are recorded only AFTER
// the order actually filled, so a denied or failed execution never consumes a
// risk budget. Collaborator failures are absorbed here and reported in the
// outcome vocabulary — nothing propagates into the webhook handler as a fault.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::RiskLimits;
use crate::exchange::ExchangeClient;
use crate::positions::PositionManager;
use crate::risk::RiskEngine;
use crate::types::{Signal, Side};

/// Quote asset every pair in this engine settles in.
const QUOTE_ASSET: &str = "USDT";
/// Exchange-imposed floor on order notional, in quote currency.
const MIN_NOTIONAL_USDT: f64 = 5.0;

// ---------------------------------------------------------------------------
// Outcome type
// ---------------------------------------------------------------------------

/// Result of handling one signal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionOutcome {
    /// Order filled and the position is now tracked.
    Executed {
        symbol: String,
        side: Side,
        quantity: f64,
        entry_price: f64,
    },
    /// Denied by the risk engine (expected, frequent, not an error).
    Rejected { reason: String },
    /// A collaborator failed; nothing was recorded.
    Failed { reason: String },
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executed {
                symbol,
                side,
                quantity,
                entry_price,
            } => write!(f, "Executed({side} {quantity} {symbol} @ {entry_price})"),
            Self::Rejected { reason } => write!(f, "Rejected({reason})"),
            Self::Failed { reason } => write!(f, "Failed({reason})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Ties together the exchange client, risk engine, and position manager for
/// the synchronous request path.
pub struct ExecutionEngine {
    exchange: Arc<dyn ExchangeClient>,
    risk: Arc<RiskEngine>,
    positions: Arc<PositionManager>,
    limits: RiskLimits,
}

impl ExecutionEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        risk: Arc<RiskEngine>,
        positions: Arc<PositionManager>,
        limits: RiskLimits,
    ) -> Self {
        Self {
            exchange,
            risk,
            positions,
            limits,
        }
    }

    /// Handle one inbound signal end to end.
    pub async fn execute_signal(&self, signal: &Signal) -> ExecutionOutcome {
        info!(
            symbol = %signal.symbol,
            side = %signal.side,
            confidence = signal.confidence,
            strategy = %signal.strategy,
            timeframe = %signal.timeframe,
            "signal received"
        );

        // -----------------------------------------------------------------
        // Account state + risk gate
        // -----------------------------------------------------------------
        let balance = match self.exchange.account_balance(QUOTE_ASSET).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "balance query failed — signal dropped");
                return ExecutionOutcome::Failed {
                    reason: format!("balance query failed: {e}"),
                };
            }
        };

        let decision =
            self.risk
                .evaluate(&signal.symbol, signal.side, signal.confidence, balance);
        if !decision.allowed {
            info!(
                symbol = %signal.symbol,
                side = %signal.side,
                reason = %decision.reason,
                "signal rejected by risk engine"
            );
            return ExecutionOutcome::Rejected {
                reason: decision.reason,
            };
        }

        // -----------------------------------------------------------------
        // Position sizing
        // -----------------------------------------------------------------
        let trade_amount = if self.limits.use_percentage_risk {
            (balance * self.limits.risk_percentage).max(MIN_NOTIONAL_USDT)
        } else {
            self.limits.max_risk_per_trade
        };

        let observed_price = match self.exchange.current_price(&signal.symbol).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!(symbol = %signal.symbol, "no price available — signal dropped");
                return ExecutionOutcome::Failed {
                    reason: format!("no price available for {}", signal.symbol),
                };
            }
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "price query failed — signal dropped");
                return ExecutionOutcome::Failed {
                    reason: format!("price query failed: {e}"),
                };
            }
        };

        let quantity = round_quantity(trade_amount / observed_price);
        if quantity <= 0.0 {
            return ExecutionOutcome::Failed {
                reason: format!(
                    "computed quantity is zero (amount ${trade_amount:.2} @ {observed_price})"
                ),
            };
        }

        // -----------------------------------------------------------------
        // Order placement
        // -----------------------------------------------------------------
        let fill = match self
            .exchange
            .place_market_order(&signal.symbol, signal.side, quantity)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "order placement failed");
                return ExecutionOutcome::Failed {
                    reason: format!("order placement failed: {e}"),
                };
            }
        };

        if !fill.is_filled() {
            warn!(symbol = %signal.symbol, status = %fill.status, "order not filled");
            return ExecutionOutcome::Failed {
                reason: format!("order not filled (status {})", fill.status),
            };
        }

        // -----------------------------------------------------------------
        // Bookkeeping — only after the fill is confirmed
        // -----------------------------------------------------------------
        let filled_quantity = if fill.filled_quantity > 0.0 {
            fill.filled_quantity
        } else {
            quantity
        };
        let entry_price = if fill.avg_fill_price > 0.0 {
            fill.avg_fill_price
        } else {
            observed_price
        };

        self.risk.record_signal(&signal.symbol, signal.side);
        self.risk.record_trade(&signal.symbol, signal.side);

        if let Err(e) = self
            .positions
            .open(&signal.symbol, signal.side, filled_quantity, entry_price)
        {
            // The trade went through; only the durable snapshot failed.
            error!(symbol = %signal.symbol, error = %e, "failed to persist opened position");
        }

        info!(
            symbol = %signal.symbol,
            side = %signal.side,
            quantity = filled_quantity,
            entry_price,
            "trade executed"
        );

        ExecutionOutcome::Executed {
            symbol: signal.symbol.clone(),
            side: signal.side,
            quantity: filled_quantity,
            entry_price,
        }
    }
}

/// Truncate to the exchange's 8-decimal quantity grid.
fn round_quantity(quantity: f64) -> f64 {
    (quantity * 1e8).floor() / 1e8
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("positions", &self.positions)
            .field("risk", &self.risk)
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
    use crate::store::MemoryStore;
    use crate::types::{Clock, ManualClock};
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::RwLock;

    struct MockExchange {
        balance: f64,
        price: Option<f64>,
        fill: Result<OrderFill, String>,
        orders_placed: RwLock<Vec<(String, Side, f64)>>,
    }

    impl MockExchange {
        fn filled(balance: f64, price: f64, avg_fill_price: f64) -> Self {
            Self {
                balance,
                price: Some(price),
                fill: Ok(OrderFill {
                    filled_quantity: 0.0,
                    avg_fill_price,
                    status: "FILLED".into(),
                }),
                orders_placed: RwLock::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for MockExchange {
        async fn current_price(&self, _symbol: &str) -> Result<Option<f64>> {
            Ok(self.price)
        }

        async fn account_balance(&self, _asset: &str) -> Result<f64> {
            Ok(self.balance)
        }

        async fn place_market_order(
            &self,
            symbol: &str,
            side: Side,
            quantity: f64,
        ) -> Result<OrderFill> {
            self.orders_placed
                .write()
                .push((symbol.to_string(), side, quantity));
            match &self.fill {
                Ok(f) => Ok(f.clone()),
                Err(msg) => Err(anyhow::anyhow!(msg.clone())),
            }
        }
    }

    fn limits() -> RiskLimits {
        RiskLimits {
            min_confidence: 50.0,
            min_balance_usdt: 10.0,
            max_risk_per_trade: 10.0,
            use_percentage_risk: false,
            risk_percentage: 0.5,
            max_open_trades: 3,
            max_trades_per_day: 10,
            signal_cooldown_secs: 300,
        }
    }

    fn build(exchange: Arc<MockExchange>, limits_override: RiskLimits) -> (ExecutionEngine, Arc<RiskEngine>, Arc<PositionManager>) {
        let clock: Arc<dyn Clock> =
            Arc::new(ManualClock::at("2026-03-01T12:00:00Z".parse().unwrap()));
        let positions = Arc::new(
            PositionManager::with_store(Box::new(MemoryStore::default()), clock.clone()).unwrap(),
        );
        let risk = Arc::new(RiskEngine::new(
            limits_override.clone(),
            clock,
            positions.clone(),
        ));
        let engine = ExecutionEngine::new(
            exchange,
            risk.clone(),
            positions.clone(),
            limits_override,
        );
        (engine, risk, positions)
    }

    fn signal(confidence: f64) -> Signal {
        Signal {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            confidence,
            strategy: "momentum".into(),
            timeframe: "4h".into(),
        }
    }

    #[tokio::test]
    async fn rejected_signal_places_no_order() {
        let exchange = Arc::new(MockExchange::filled(100.0, 90_000.0, 0.0));
        let (engine, risk, positions) = build(exchange.clone(), limits());

        let outcome = engine.execute_signal(&signal(10.0)).await;
        assert!(matches!(outcome, ExecutionOutcome::Rejected { .. }));
        assert!(exchange.orders_placed.read().is_empty());
        assert_eq!(positions.open_count(), 0);
        assert_eq!(risk.status().trades_today, 0);
        assert!(risk.status().active_cooldowns.is_empty());
    }

    #[tokio::test]
    async fn executed_signal_records_and_opens() {
        let exchange = Arc::new(MockExchange::filled(100.0, 90_000.0, 90_050.0));
        let (engine, risk, positions) = build(exchange.clone(), limits());

        let outcome = engine.execute_signal(&signal(80.0)).await;
        match outcome {
            ExecutionOutcome::Executed {
                entry_price,
                quantity,
                ..
            } => {
                // Fill price preferred over the observed ticker price.
                assert!((entry_price - 90_050.0).abs() < 1e-9);
                // Fixed sizing: $10 / 90000.
                assert!((quantity - round_quantity(10.0 / 90_000.0)).abs() < 1e-12);
            }
            other => panic!("unexpected outcome: {other}"),
        }

        assert_eq!(exchange.orders_placed.read().len(), 1);
        assert_eq!(positions.open_count(), 1);
        assert_eq!(risk.status().trades_today, 1);
        assert_eq!(risk.status().active_cooldowns.len(), 1);
    }

    #[tokio::test]
    async fn fill_price_falls_back_to_observed_price() {
        let exchange = Arc::new(MockExchange::filled(100.0, 90_000.0, 0.0));
        let (engine, _, positions) = build(exchange, limits());

        engine.execute_signal(&signal(80.0)).await;
        let pos = &positions.open_positions()[0];
        assert!((pos.entry_price - 90_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn percentage_sizing_with_notional_floor() {
        let mut l = limits();
        l.use_percentage_risk = true;
        l.risk_percentage = 0.5;
        // Balance 100 → 50 quote committed.
        let exchange = Arc::new(MockExchange::filled(100.0, 100.0, 0.0));
        let (engine, _, _) = build(exchange.clone(), l.clone());
        engine.execute_signal(&signal(80.0)).await;
        let (_, _, qty) = exchange.orders_placed.read()[0].clone();
        assert!((qty - 0.5).abs() < 1e-9);

        // Tiny balance → floored at the $5 minimum notional.
        l.min_balance_usdt = 5.0;
        let exchange = Arc::new(MockExchange::filled(8.0, 100.0, 0.0));
        let (engine, _, _) = build(exchange.clone(), l);
        engine.execute_signal(&signal(80.0)).await;
        let (_, _, qty) = exchange.orders_placed.read()[0].clone();
        assert!((qty - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_order_records_nothing() {
        let exchange = Arc::new(MockExchange {
            balance: 100.0,
            price: Some(90_000.0),
            fill: Err("insufficient liquidity".into()),
            orders_placed: RwLock::new(Vec::new()),
        });
        let (engine, risk, positions) = build(exchange, limits());

        let outcome = engine.execute_signal(&signal(80.0)).await;
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
        assert_eq!(positions.open_count(), 0);
        assert_eq!(risk.status().trades_today, 0);
        assert!(risk.status().active_cooldowns.is_empty());
    }

    #[tokio::test]
    async fn missing_price_fails_without_order() {
        let exchange = Arc::new(MockExchange {
            balance: 100.0,
            price: None,
            fill: Ok(OrderFill {
                filled_quantity: 0.0,
                avg_fill_price: 0.0,
                status: "FILLED".into(),
            }),
            orders_placed: RwLock::new(Vec::new()),
        });
        let (engine, _, _) = build(exchange.clone(), limits());

        let outcome = engine.execute_signal(&signal(80.0)).await;
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
        assert!(exchange.orders_placed.read().is_empty());
    }
}
