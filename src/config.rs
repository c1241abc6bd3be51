// =============================================================================
// Configuration — environment-backed settings validated at startup
// =============================================================================
//
// Every tunable lives here. Values come from the process environment (a
// `.env` file is loaded by main before this module is consulted) with
// defaults that are safe for testnet use. `validate()` runs before any
// subsystem is constructed: an invalid risk limit must prevent the engine
// from ever becoming active.
// =============================================================================

use anyhow::{bail, Result};
use serde::Serialize;

/// Placeholder shipped in `.env.example`; refusing to run with it forces the
/// operator to pick a real webhook secret.
const DEFAULT_WEBHOOK_SECRET: &str = "change-me-before-going-live";

const BINANCE_TESTNET_API: &str = "https://testnet.binance.vision";
const BINANCE_LIVE_API: &str = "https://api.binance.com";

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(default)
}

/// Limits consulted by the risk engine on every signal.
#[derive(Debug, Clone, Serialize)]
pub struct RiskLimits {
    /// Minimum confidence score (0–100) a signal must carry.
    pub min_confidence: f64,
    /// Minimum quote-currency balance required to trade at all.
    pub min_balance_usdt: f64,
    /// Hard cap on quote-currency committed to a single trade.
    pub max_risk_per_trade: f64,
    /// Size trades as a fraction of balance instead of the fixed cap.
    pub use_percentage_risk: bool,
    /// Fraction of balance per trade when percentage sizing is on (0, 1].
    pub risk_percentage: f64,
    /// Maximum simultaneous open positions.
    pub max_open_trades: u32,
    /// Maximum accepted trades per UTC day.
    pub max_trades_per_day: u32,
    /// Minimum seconds between accepted signals for the same (symbol, side).
    pub signal_cooldown_secs: u64,
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Server -------------------------------------------------------------
    pub host: String,
    pub port: u16,
    /// Shared secret expected in every webhook payload.
    pub webhook_secret: String,

    // --- Exchange -----------------------------------------------------------
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub use_testnet: bool,
    /// Optional explicit base URL override (demo/proxy endpoints).
    pub binance_base_url: String,

    // --- Risk ---------------------------------------------------------------
    pub risk: RiskLimits,

    // --- Exit watcher -------------------------------------------------------
    /// Seconds between exit-watcher evaluations of open positions.
    pub exit_check_interval_secs: u64,

    // --- Persistence --------------------------------------------------------
    /// Durable position table; the only state that survives a restart.
    pub positions_file: String,
}

impl Config {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            host: env_string("HOST", "0.0.0.0"),
            port: env_u32("PORT", 8000) as u16,
            webhook_secret: env_string("WEBHOOK_SECRET_KEY", DEFAULT_WEBHOOK_SECRET),
            binance_api_key: env_string("BINANCE_API_KEY", ""),
            binance_api_secret: env_string("BINANCE_API_SECRET", ""),
            use_testnet: env_bool("USE_TESTNET", true),
            binance_base_url: env_string("BINANCE_BASE_URL", ""),
            risk: RiskLimits {
                min_confidence: env_f64("MIN_CONFIDENCE", 50.0),
                min_balance_usdt: env_f64("MIN_BALANCE_USDT", 10.0),
                max_risk_per_trade: env_f64("MAX_RISK_PER_TRADE", 10.0),
                use_percentage_risk: env_bool("USE_PERCENTAGE_RISK", true),
                risk_percentage: env_f64("RISK_PERCENTAGE", 0.50),
                max_open_trades: env_u32("MAX_OPEN_TRADES", 3),
                max_trades_per_day: env_u32("MAX_TRADES_PER_DAY", 10),
                signal_cooldown_secs: env_u64("SIGNAL_COOLDOWN_SECONDS", 300),
            },
            exit_check_interval_secs: env_u64("EXIT_CHECK_INTERVAL_SECONDS", 30),
            positions_file: env_string("POSITIONS_FILE", "logs/positions.csv"),
        }
    }

    /// The exchange base URL after applying testnet/override rules.
    pub fn exchange_base_url(&self) -> String {
        if !self.binance_base_url.is_empty() {
            self.binance_base_url.clone()
        } else if self.use_testnet {
            BINANCE_TESTNET_API.to_string()
        } else {
            BINANCE_LIVE_API.to_string()
        }
    }

    /// Reject configurations that would make the engine unsafe. Called once
    /// at startup; any failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.webhook_secret == DEFAULT_WEBHOOK_SECRET || self.webhook_secret.is_empty() {
            bail!("WEBHOOK_SECRET_KEY still has the placeholder value — set a real secret");
        }
        if self.binance_api_key.is_empty() || self.binance_api_secret.is_empty() {
            bail!("BINANCE_API_KEY and BINANCE_API_SECRET must be set");
        }
        if self.risk.max_risk_per_trade <= 0.0 {
            bail!("MAX_RISK_PER_TRADE must be positive");
        }
        if self.risk.risk_percentage <= 0.0 || self.risk.risk_percentage > 1.0 {
            bail!("RISK_PERCENTAGE must be in (0.0, 1.0]");
        }
        if self.risk.max_open_trades < 1 {
            bail!("MAX_OPEN_TRADES must be at least 1");
        }
        if self.risk.max_trades_per_day < 1 {
            bail!("MAX_TRADES_PER_DAY must be at least 1");
        }
        if !(0.0..=100.0).contains(&self.risk.min_confidence) {
            bail!("MIN_CONFIDENCE must be between 0 and 100");
        }
        if self.risk.min_balance_usdt < 0.0 {
            bail!("MIN_BALANCE_USDT must not be negative");
        }
        if self.exit_check_interval_secs < 1 {
            bail!("EXIT_CHECK_INTERVAL_SECONDS must be at least 1");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            host: "0.0.0.0".into(),
            port: 8000,
            webhook_secret: "unit-test-secret".into(),
            binance_api_key: "key".into(),
            binance_api_secret: "secret".into(),
            use_testnet: true,
            binance_base_url: String::new(),
            risk: RiskLimits {
                min_confidence: 50.0,
                min_balance_usdt: 10.0,
                max_risk_per_trade: 10.0,
                use_percentage_risk: true,
                risk_percentage: 0.5,
                max_open_trades: 3,
                max_trades_per_day: 10,
                signal_cooldown_secs: 300,
            },
            exit_check_interval_secs: 30,
            positions_file: "logs/positions.csv".into(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn placeholder_secret_is_fatal() {
        let mut cfg = valid_config();
        cfg.webhook_secret = DEFAULT_WEBHOOK_SECRET.into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_positive_risk_limits_are_fatal() {
        let mut cfg = valid_config();
        cfg.risk.max_risk_per_trade = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.risk.risk_percentage = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.risk.max_open_trades = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.exit_check_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn base_url_override_and_testnet() {
        let mut cfg = valid_config();
        assert_eq!(cfg.exchange_base_url(), BINANCE_TESTNET_API);

        cfg.use_testnet = false;
        assert_eq!(cfg.exchange_base_url(), BINANCE_LIVE_API);

        cfg.binance_base_url = "https://proxy.example".into();
        assert_eq!(cfg.exchange_base_url(), "https://proxy.example");
    }
}
