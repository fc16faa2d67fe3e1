use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tokio::time::{sleep, Duration};

use async_trait::async_trait;

use crate::error::EngineError;
use crate::exchange::{ExecutionGateway, OrderFill};
use crate::models::{Bar, GatewayPosition, Side};

const MAINNET_BASE: &str = "https://fapi.binance.com";
const TESTNET_BASE: &str = "https://testnet.binancefuture.com";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;

type HmacSha256 = Hmac<Sha256>;

/// Binance USD-M futures client
///
/// Market-data reads retry with exponential backoff; order placement is a
/// single attempt so a timeout can never double an order. With `simulate`
/// set, order endpoints are never hit and fills report a zero average price,
/// which callers replace with the price they evaluated at.
#[derive(Clone)]
pub struct BinanceFutures {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    simulate: bool,
    simulated_balance: f64,
}

impl BinanceFutures {
    pub fn new(api_key: String, api_secret: String, use_testnet: bool, simulate: bool) -> Self {
        let base = if use_testnet { TESTNET_BASE } else { MAINNET_BASE };
        Self::with_base_url(base.to_string(), api_key, api_secret, simulate)
    }

    pub fn with_base_url(
        base_url: String,
        api_key: String,
        api_secret: String,
        simulate: bool,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url,
            api_key,
            api_secret,
            simulate,
            simulated_balance: 1000.0,
        }
    }

    /// Append timestamp and HMAC-SHA256 signature to a query string
    fn sign(&self, query: &str) -> Result<String, EngineError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let query = if query.is_empty() {
            format!("timestamp={timestamp}")
        } else {
            format!("{query}&timestamp={timestamp}")
        };
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| EngineError::Configuration(format!("bad API secret: {e}")))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{query}&signature={signature}"))
    }

    async fn get_json(&self, path: &str, query: &str) -> Result<serde_json::Value, EngineError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let res = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(EngineError::remote)?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(EngineError::RemoteCallFailure(format!(
                "{path} returned {status}: {body}"
            )));
        }
        res.json().await.map_err(EngineError::remote)
    }

    async fn get_signed(&self, path: &str, query: &str) -> Result<serde_json::Value, EngineError> {
        let signed = self.sign(query)?;
        let url = format!("{}{}?{}", self.base_url, path, signed);
        let res = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(EngineError::remote)?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(EngineError::RemoteCallFailure(format!(
                "{path} returned {status}: {body}"
            )));
        }
        res.json().await.map_err(EngineError::remote)
    }

    async fn post_signed(&self, path: &str, query: &str) -> Result<serde_json::Value, EngineError> {
        let signed = self.sign(query)?;
        let url = format!("{}{}?{}", self.base_url, path, signed);
        let res = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(EngineError::remote)?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(EngineError::RemoteCallFailure(format!(
                "{path} returned {status}: {body}"
            )));
        }
        res.json().await.map_err(EngineError::remote)
    }

    /// GET with retry and exponential backoff, for idempotent reads only
    async fn get_json_with_retry(
        &self,
        path: &str,
        query: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let mut last_error = None;
        for attempt in 1..=MAX_RETRIES {
            match self.get_json(path, query).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                        tracing::warn!(
                            "attempt {attempt}/{MAX_RETRIES} for {path} failed: {e}; retrying in {backoff_ms}ms"
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| EngineError::RemoteCallFailure("all retries failed".into())))
    }

    /// Historical klines, oldest first
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        start_time: Option<i64>,
    ) -> Result<Vec<Bar>, EngineError> {
        let mut query = format!("symbol={symbol}&interval={interval}&limit={limit}");
        if let Some(start) = start_time {
            query.push_str(&format!("&startTime={start}"));
        }
        let raw = self.get_json_with_retry("/fapi/v1/klines", &query).await?;

        let rows = raw
            .as_array()
            .ok_or_else(|| EngineError::RemoteCallFailure("klines: not an array".into()))?;
        let bars = rows
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                if row.len() < 7 {
                    return None;
                }
                Some(Bar {
                    symbol: symbol.to_string(),
                    interval: interval.to_string(),
                    open_time: row[0].as_i64()?,
                    open: row[1].as_str()?.parse().ok()?,
                    high: row[2].as_str()?.parse().ok()?,
                    low: row[3].as_str()?.parse().ok()?,
                    close: row[4].as_str()?.parse().ok()?,
                    volume: row[5].as_str()?.parse().ok()?,
                    close_time: row[6].as_i64()?,
                })
            })
            .collect();
        Ok(bars)
    }

    /// Latest ticker price for a symbol
    pub async fn latest_price(&self, symbol: &str) -> Result<f64, EngineError> {
        let raw = self
            .get_json_with_retry("/fapi/v1/ticker/price", &format!("symbol={symbol}"))
            .await?;
        raw.get("price")
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| EngineError::RemoteCallFailure("ticker: missing price".into()))
    }
}

fn json_f64(value: &serde_json::Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[async_trait]
impl ExecutionGateway for BinanceFutures {
    async fn balance(&self) -> Result<f64, EngineError> {
        if self.simulate {
            return Ok(self.simulated_balance);
        }
        let account = self.get_signed("/fapi/v2/account", "").await?;
        let available = json_f64(&account, "availableBalance").unwrap_or(0.0);
        if available > 0.0 {
            return Ok(available);
        }
        // Wallet balance as fallback when the whole margin is committed
        let wallet = json_f64(&account, "totalWalletBalance").unwrap_or(0.0);
        tracing::warn!("available balance is {available}, falling back to wallet balance {wallet}");
        Ok(wallet)
    }

    async fn open_positions(&self) -> Result<Vec<GatewayPosition>, EngineError> {
        if self.simulate {
            return Ok(Vec::new());
        }
        let raw = self.get_signed("/fapi/v2/positionRisk", "").await?;
        let rows = raw
            .as_array()
            .ok_or_else(|| EngineError::RemoteCallFailure("positionRisk: not an array".into()))?;
        let positions = rows
            .iter()
            .filter_map(|row| {
                let amt = json_f64(row, "positionAmt")?;
                if amt == 0.0 {
                    return None;
                }
                Some(GatewayPosition {
                    symbol: row.get("symbol")?.as_str()?.to_string(),
                    side: if amt > 0.0 { Side::Long } else { Side::Short },
                    quantity: amt.abs(),
                })
            })
            .collect();
        Ok(positions)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderFill, EngineError> {
        if self.simulate {
            tracing::info!("SIMULATED ORDER {} {} {:.6}", symbol, side, quantity);
            return Ok(OrderFill {
                avg_price: 0.0,
                filled_quantity: quantity,
            });
        }
        let order_side = match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let query = format!(
            "symbol={symbol}&side={order_side}&type=MARKET&quantity={quantity}&newOrderRespType=RESULT"
        );
        let res = self.post_signed("/fapi/v1/order", &query).await?;

        let avg_price = json_f64(&res, "avgPrice").unwrap_or(0.0);
        let filled = json_f64(&res, "executedQty").unwrap_or(quantity);
        Ok(OrderFill {
            avg_price,
            filled_quantity: filled,
        })
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<f64, EngineError> {
        if self.simulate {
            tracing::info!("SIMULATED CLOSE {} {} {:.6}", symbol, side, quantity);
            return Ok(0.0);
        }
        // Opposite side, reduce-only, so this can never flip the position
        let order_side = match side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };
        let query = format!(
            "symbol={symbol}&side={order_side}&type=MARKET&quantity={quantity}&reduceOnly=true&newOrderRespType=RESULT"
        );
        let res = self.post_signed("/fapi/v1/order", &query).await?;
        Ok(json_f64(&res, "avgPrice").unwrap_or(0.0))
    }
}
