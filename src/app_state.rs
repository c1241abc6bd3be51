// =============================================================================
// Central Application State
// =============================================================================
//
// Ties the subsystems together for the HTTP layer. Each subsystem manages its
// own interior mutability; AppState just holds the Arc references and the
// startup instant for uptime reporting.
// =============================================================================

use std::sync::Arc;

use crate::config::Config;
use crate::exchange::ExchangeClient;
use crate::execution::ExecutionEngine;
use crate::positions::PositionManager;
use crate::risk::RiskEngine;

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: Config,
    pub risk_engine: Arc<RiskEngine>,
    pub position_manager: Arc<PositionManager>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub execution: Arc<ExecutionEngine>,
    /// Instant the process came up. Used for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        risk_engine: Arc<RiskEngine>,
        position_manager: Arc<PositionManager>,
        exchange: Arc<dyn ExchangeClient>,
        execution: Arc<ExecutionEngine>,
    ) -> Self {
        Self {
            config,
            risk_engine,
            position_manager,
            exchange,
            execution,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
