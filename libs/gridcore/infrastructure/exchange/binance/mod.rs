//! Binance USDⓈ-M futures adapter
//!
//! REST calls are signed with HMAC-SHA256; order updates arrive over the
//! user data stream (listen key), prices over `bookTicker`.

mod rest;
mod stream;
mod types;

use async_trait::async_trait;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::info;

use crate::domain::{
    round_to, Account, FundingRate, Kline, Order, OrderRequest, OrderType, OrderUpdate, Position,
    PriceTick,
};
use crate::infrastructure::config::{InstanceConfig, ResilienceConfig};
use crate::infrastructure::exchange::adapter::{ExchangeAdapter, DEFAULT_BATCH_LIMIT};
use crate::infrastructure::exchange::error::{ExchangeError, Result};
use crate::infrastructure::exchange::resilience::{with_retry, PollThrottle, RetryPolicy};
use crate::infrastructure::shutdown::ShutdownManager;
use crate::infrastructure::stream::{run_stream, StreamConfig};

pub use rest::{batch_item_error, map_api_error, BinanceRest};
pub use stream::{KlineSession, PriceSession, UserDataSession};
pub use types::{step_decimals, OrderResponse, SymbolInfo};

use types::{
    kline_from_row, AccountResponse, BalanceEntry, ExchangeInfo, PositionRisk, PremiumIndex,
    TickerPrice,
};

pub const MAINNET_REST_URL: &str = "https://fapi.binance.com";
pub const MAINNET_WS_URL: &str = "wss://fstream.binance.com/ws";
pub const TESTNET_REST_URL: &str = "https://testnet.binancefuture.com";
pub const TESTNET_WS_URL: &str = "wss://stream.binancefuture.com/ws";
const SPOT_REST_URL: &str = "https://api.binance.com";

/// Everything needed to connect one symbol
#[derive(Debug, Clone)]
pub struct BinanceSettings {
    pub symbol: String,
    pub rest_url: String,
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub request_timeout: Duration,
    pub min_poll_interval: Duration,
    pub retry_policy: RetryPolicy,
    pub stream_config: StreamConfig,
}

impl BinanceSettings {
    pub fn from_instance(instance: &InstanceConfig, resilience: &ResilienceConfig) -> Self {
        let (default_rest, default_ws) = if instance.testnet {
            (TESTNET_REST_URL, TESTNET_WS_URL)
        } else {
            (MAINNET_REST_URL, MAINNET_WS_URL)
        };

        Self {
            symbol: instance.symbol.clone(),
            rest_url: instance
                .rest_url
                .clone()
                .unwrap_or_else(|| default_rest.to_string()),
            ws_url: instance
                .ws_url
                .clone()
                .unwrap_or_else(|| default_ws.to_string()),
            api_key: instance.api_key.clone(),
            api_secret: instance.api_secret.clone(),
            request_timeout: resilience.request_timeout(),
            min_poll_interval: resilience.min_poll_interval(),
            retry_policy: resilience.retry_policy(),
            stream_config: resilience.stream_config(),
        }
    }

    /// Let shutdown cut retry waits short
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.retry_policy = self.retry_policy.with_shutdown(shutdown);
        self
    }
}

pub struct BinanceFutures {
    rest: Arc<BinanceRest>,
    ws_url: String,
    symbol: String,
    base_asset: String,
    quote_asset: String,
    price_decimals: u32,
    quantity_decimals: u32,
    policy: RetryPolicy,
    throttle: PollThrottle,
    stream_config: StreamConfig,
}

impl BinanceFutures {
    /// Build the client and load instrument metadata for `settings.symbol`
    pub async fn connect(settings: BinanceSettings) -> Result<Self> {
        let rest = Arc::new(BinanceRest::new(
            settings.rest_url.clone(),
            settings.api_key.clone(),
            settings.api_secret.clone(),
            settings.request_timeout,
        )?);

        let info: ExchangeInfo = with_retry(&settings.retry_policy, "exchange_info", || async {
            rest.public_get("/fapi/v1/exchangeInfo", &[]).await
        })
        .await?;

        let symbol_info = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == settings.symbol)
            .ok_or_else(|| ExchangeError::Api {
                code: -1121,
                message: format!("Invalid symbol {}", settings.symbol),
            })?;

        let adapter = Self {
            rest,
            ws_url: settings.ws_url,
            symbol: settings.symbol,
            price_decimals: symbol_info.price_decimals(),
            quantity_decimals: symbol_info.quantity_decimals(),
            base_asset: symbol_info.base_asset,
            quote_asset: symbol_info.quote_asset,
            policy: settings.retry_policy,
            throttle: PollThrottle::new(settings.min_poll_interval),
            stream_config: settings.stream_config,
        };

        info!(
            "[Exchange] Binance {} connected ({}/{}, price decimals {}, qty decimals {})",
            adapter.symbol,
            adapter.base_asset,
            adapter.quote_asset,
            adapter.price_decimals,
            adapter.quantity_decimals
        );

        Ok(adapter)
    }

    /// Set the symbol's initial leverage
    pub async fn set_leverage(&self, leverage: u32) -> Result<()> {
        let _: serde_json::Value = with_retry(&self.policy, "set_leverage", || {
            self.rest.signed(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", self.symbol.clone()),
                    ("leverage", leverage.to_string()),
                ],
            )
        })
        .await?;
        info!("[Exchange] Leverage for {} set to {}x", self.symbol, leverage);
        Ok(())
    }

    fn format_price(&self, price: f64) -> String {
        format!("{:.*}", self.price_decimals as usize, round_to(price, self.price_decimals))
    }

    fn format_qty(&self, qty: f64) -> String {
        format!(
            "{:.*}",
            self.quantity_decimals as usize,
            round_to(qty, self.quantity_decimals)
        )
    }

    fn order_params(&self, request: &OrderRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", request.order_type.as_str().to_string()),
            ("quantity", self.format_qty(request.quantity)),
            ("newClientOrderId", request.client_order_id.clone()),
        ];

        if request.order_type == OrderType::Limit {
            let tif = if request.post_only { "GTX" } else { "GTC" };
            params.push(("timeInForce", tif.to_string()));
            params.push(("price", self.format_price(request.price)));
        }
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        params
    }

    fn parse_batch_item(value: serde_json::Value) -> Result<Order> {
        if let Some(error) = batch_item_error(&value) {
            return Err(error);
        }
        serde_json::from_value::<OrderResponse>(value)
            .map_err(|e| ExchangeError::DeserializeFailed(e.to_string()))?
            .into_order()
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceFutures {
    fn name(&self) -> &str {
        "binance"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn price_decimals(&self) -> u32 {
        self.price_decimals
    }

    fn quantity_decimals(&self) -> u32 {
        self.quantity_decimals
    }

    fn base_asset(&self) -> &str {
        &self.base_asset
    }

    fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    fn batch_limit(&self) -> usize {
        DEFAULT_BATCH_LIMIT
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn poll_throttle(&self) -> &PollThrottle {
        &self.throttle
    }

    async fn send_order(&self, request: &OrderRequest) -> Result<Order> {
        let response: OrderResponse = self
            .rest
            .signed(Method::POST, "/fapi/v1/order", self.order_params(request))
            .await?;
        response.into_order()
    }

    async fn send_order_batch(&self, requests: &[OrderRequest]) -> Result<Vec<Result<Order>>> {
        let orders: Vec<serde_json::Value> = requests
            .iter()
            .map(|r| {
                let map: serde_json::Map<String, serde_json::Value> = self
                    .order_params(r)
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
                    .collect();
                serde_json::Value::Object(map)
            })
            .collect();

        let batch = serde_json::Value::Array(orders).to_string();
        let results: Vec<serde_json::Value> = self
            .rest
            .signed(Method::POST, "/fapi/v1/batchOrders", vec![("batchOrders", batch)])
            .await?;

        Ok(results.into_iter().map(Self::parse_batch_item).collect())
    }

    async fn send_cancel(&self, symbol: &str, order_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .rest
            .signed(
                Method::DELETE,
                "/fapi/v1/order",
                vec![("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn send_cancel_batch(&self, symbol: &str, order_ids: &[String]) -> Result<Vec<Result<()>>> {
        let id_list = format!("[{}]", order_ids.join(","));
        let results: Vec<serde_json::Value> = self
            .rest
            .signed(
                Method::DELETE,
                "/fapi/v1/batchOrders",
                vec![("symbol", symbol.to_string()), ("orderIdList", id_list)],
            )
            .await?;

        Ok(results
            .into_iter()
            .map(|v| match batch_item_error(&v) {
                Some(e) => Err(e),
                None => Ok(()),
            })
            .collect())
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        let responses: Vec<OrderResponse> = self
            .rest
            .signed(Method::GET, "/fapi/v1/openOrders", vec![("symbol", symbol.to_string())])
            .await?;
        responses.into_iter().map(OrderResponse::into_order).collect()
    }

    async fn fetch_positions(&self, symbol: &str) -> Result<Vec<Position>> {
        let risks: Vec<PositionRisk> = self
            .rest
            .signed(Method::GET, "/fapi/v2/positionRisk", vec![("symbol", symbol.to_string())])
            .await?;
        Ok(risks.into_iter().map(Position::from).collect())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let _: serde_json::Value = with_retry(&self.policy, "cancel_all_orders", || {
            self.rest.signed(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                vec![("symbol", symbol.to_string())],
            )
        })
        .await?;
        Ok(())
    }

    async fn get_account(&self) -> Result<Account> {
        let account: AccountResponse = with_retry(&self.policy, "get_account", || {
            self.rest.signed(Method::GET, "/fapi/v2/account", Vec::new())
        })
        .await?;
        Ok(Account::from(account))
    }

    async fn get_balance(&self, asset: &str) -> Result<f64> {
        let balances: Vec<BalanceEntry> = with_retry(&self.policy, "get_balance", || {
            self.rest.signed(Method::GET, "/fapi/v2/balance", Vec::new())
        })
        .await?;

        Ok(balances
            .iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .map(|b| types::parse_num(&b.available_balance))
            .unwrap_or(0.0))
    }

    async fn start_order_stream(
        &self,
        tx: UnboundedSender<OrderUpdate>,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<JoinHandle<()>> {
        let session = UserDataSession::new(Arc::clone(&self.rest), self.ws_url.clone(), self.symbol.clone(), tx);
        Ok(tokio::spawn(run_stream(session, self.stream_config.clone(), shutdown)))
    }

    async fn start_price_stream(
        &self,
        symbol: &str,
        tx: UnboundedSender<PriceTick>,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<JoinHandle<()>> {
        let session = PriceSession::new(self.ws_url.clone(), symbol, tx);
        Ok(tokio::spawn(run_stream(session, self.stream_config.clone(), shutdown)))
    }

    async fn start_kline_stream(
        &self,
        symbol: &str,
        interval: &str,
        tx: UnboundedSender<Kline>,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<JoinHandle<()>> {
        let session = KlineSession::new(self.ws_url.clone(), symbol, interval, tx);
        Ok(tokio::spawn(run_stream(session, self.stream_config.clone(), shutdown)))
    }

    async fn get_historical_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let rows: Vec<Vec<serde_json::Value>> = with_retry(&self.policy, "get_historical_klines", || async move {
            let params = [
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("limit", limit.min(1500).to_string()),
            ];
            self.rest.public_get("/fapi/v1/klines", &params).await
        })
        .await?;

        rows.iter()
            .map(|row| kline_from_row(symbol, interval, row))
            .collect()
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate> {
        let index: PremiumIndex = with_retry(&self.policy, "get_funding_rate", || async move {
            let params = [("symbol", symbol.to_string())];
            self.rest.public_get("/fapi/v1/premiumIndex", &params).await
        })
        .await?;
        Ok(FundingRate::from(index))
    }

    async fn get_spot_price(&self, symbol: &str) -> Result<f64> {
        let ticker: TickerPrice = with_retry(&self.policy, "get_spot_price", || async move {
            let params = [("symbol", symbol.to_string())];
            self.rest
                .public_get_from(SPOT_REST_URL, "/api/v3/ticker/price", &params)
                .await
        })
        .await?;
        Ok(types::parse_num(&ticker.price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceConfig {
        serde_yaml::from_str(
            r#"
exchange: binance
symbol: BTCUSDT
testnet: true
grid:
  price_interval: 100
  order_quantity: 0.001
  buy_window_size: 5
  sell_window_size: 5
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_settings_follow_resilience_config() {
        let resilience = ResilienceConfig {
            max_ban_wait_secs: 90,
            ..ResilienceConfig::default()
        };
        let settings = BinanceSettings::from_instance(&instance(), &resilience);

        assert_eq!(settings.rest_url, TESTNET_REST_URL);
        assert_eq!(settings.ws_url, TESTNET_WS_URL);
        assert_eq!(settings.retry_policy.max_ban_wait, Duration::from_secs(90));
        assert!(settings.retry_policy.shutdown.is_none());
    }

    #[test]
    fn test_shutdown_reaches_retry_policy() {
        let shutdown = Arc::new(ShutdownManager::new());
        let settings = BinanceSettings::from_instance(&instance(), &ResilienceConfig::default())
            .with_shutdown(Arc::clone(&shutdown));

        let attached = settings.retry_policy.shutdown.as_ref().unwrap();
        shutdown.trigger();
        assert!(!attached.is_running());
    }
}
