// =============================================================================
// Binance REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::exchange::{ExchangeClient, OrderFill};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance REST API client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `api_key`  — Binance API key (sent as a header, never in query params).
    /// * `secret`   — Binance secret key used exclusively for HMAC signing.
    /// * `base_url` — REST base, e.g. testnet or live endpoint.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "BinanceClient initialised");

        Self {
            secret: secret.into(),
            base_url,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    /// GET /api/v3/ticker/price (public — no signature required).
    ///
    /// Non-success responses are treated as a transient `None` so the caller
    /// can skip the symbol for one cycle instead of failing.
    #[instrument(skip(self), name = "binance::current_price")]
    async fn current_price(&self, symbol: &str) -> Result<Option<f64>> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/ticker/price request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse ticker response")?;

        if !status.is_success() {
            warn!(symbol, %status, %body, "ticker request rejected — treating price as unavailable");
            return Ok(None);
        }

        let price = Self::parse_str_f64(&body["price"]);
        if price <= 0.0 {
            warn!(symbol, %body, "ticker returned no usable price");
            return Ok(None);
        }

        debug!(symbol, price, "price fetched");
        Ok(Some(price))
    }

    /// GET /api/v3/account (signed), reduced to the free balance of `asset`.
    #[instrument(skip(self), name = "binance::account_balance")]
    async fn account_balance(&self, asset: &str) -> Result<f64> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/account request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse account response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/account returned {status}: {body}");
        }

        let balances = body["balances"]
            .as_array()
            .context("account response missing 'balances' array")?;

        for b in balances {
            if b["asset"].as_str() == Some(asset) {
                let free = Self::parse_str_f64(&b["free"]);
                debug!(asset, free, "balance retrieved");
                return Ok(free);
            }
        }

        warn!(asset, "asset not found in balances — returning 0.0");
        Ok(0.0)
    }

    /// POST /api/v3/order (signed) — MARKET order with a generated client id.
    #[instrument(skip(self), name = "binance::place_market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderFill> {
        let client_order_id = Uuid::new_v4();
        let params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={quantity}&newClientOrderId={client_order_id}"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, %side, quantity, %client_order_id, "placing market order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /api/v3/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!("Binance POST /api/v3/order returned {status}: {body}");
        }

        let filled_quantity = Self::parse_str_f64(&body["executedQty"]);
        let cumulative_quote = Self::parse_str_f64(&body["cummulativeQuoteQty"]);
        let avg_fill_price = if filled_quantity > 0.0 {
            cumulative_quote / filled_quantity
        } else {
            0.0
        };
        let order_status = body["status"].as_str().unwrap_or("UNKNOWN").to_string();

        debug!(
            symbol,
            %side,
            filled_quantity,
            avg_fill_price,
            status = %order_status,
            "market order placed"
        );

        Ok(OrderFill {
            filled_quantity,
            avg_fill_price,
            status: order_status,
        })
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
