//! Binance WebSocket sessions driven by the generic stream runner

use async_trait::async_trait;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::rest::BinanceRest;
use super::types::{BookTicker, KlineEvent, ListenKeyResponse, UserEvent};
use crate::domain::{Kline, OrderUpdate, PriceTick};
use crate::infrastructure::exchange::error::Result;
use crate::infrastructure::stream::{StreamControl, StreamSession};

const LISTEN_KEY_PATH: &str = "/fapi/v1/listenKey";

/// Listen keys expire after 60 minutes without a keepalive
const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(30 * 60);

fn subscribe_message(stream: &str) -> String {
    serde_json::json!({
        "method": "SUBSCRIBE",
        "params": [stream],
        "id": 1
    })
    .to_string()
}

fn event_type(text: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("e")?
        .as_str()
        .map(str::to_string)
}

// =============================================================================
// User data (orders)
// =============================================================================

pub struct UserDataSession {
    rest: Arc<BinanceRest>,
    ws_base: String,
    symbol: String,
    tx: UnboundedSender<OrderUpdate>,
    listen_key: Option<String>,
}

impl UserDataSession {
    pub fn new(
        rest: Arc<BinanceRest>,
        ws_base: impl Into<String>,
        symbol: impl Into<String>,
        tx: UnboundedSender<OrderUpdate>,
    ) -> Self {
        Self {
            rest,
            ws_base: ws_base.into(),
            symbol: symbol.into(),
            tx,
            listen_key: None,
        }
    }
}

#[async_trait]
impl StreamSession for UserDataSession {
    fn name(&self) -> String {
        format!("binance-orders:{}", self.symbol)
    }

    async fn url(&mut self) -> Result<String> {
        let response: ListenKeyResponse = self.rest.keyed(Method::POST, LISTEN_KEY_PATH).await?;
        debug!("[Stream] Obtained listen key for {}", self.symbol);
        let url = format!("{}/{}", self.ws_base.trim_end_matches('/'), response.listen_key);
        self.listen_key = Some(response.listen_key);
        Ok(url)
    }

    fn on_text(&mut self, text: &str) -> StreamControl {
        match event_type(text).as_deref() {
            Some("ORDER_TRADE_UPDATE") => {}
            Some("listenKeyExpired") => {
                warn!("[Stream] Listen key expired for {}, reconnecting", self.symbol);
                self.listen_key = None;
                return StreamControl::Reconnect;
            }
            _ => return StreamControl::Continue,
        }

        let event = match serde_json::from_str::<UserEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("[Stream] Unparseable order update: {}", e);
                return StreamControl::Continue;
            }
        };

        let Some(order) = event.order else {
            return StreamControl::Continue;
        };
        if order.symbol != self.symbol {
            return StreamControl::Continue;
        }

        match order.into_update() {
            Ok(update) => {
                if self.tx.send(update).is_err() {
                    info!("[Stream] Order update receiver dropped, stopping");
                    return StreamControl::Stop;
                }
            }
            Err(e) => warn!("[Stream] Dropping order update: {}", e),
        }
        StreamControl::Continue
    }

    fn maintenance_interval(&self) -> Option<Duration> {
        Some(LISTEN_KEY_KEEPALIVE)
    }

    async fn on_maintenance(&mut self) -> StreamControl {
        match self
            .rest
            .keyed::<serde_json::Value>(Method::PUT, LISTEN_KEY_PATH)
            .await
        {
            Ok(_) => {
                debug!("[Stream] Listen key kept alive for {}", self.symbol);
                StreamControl::Continue
            }
            Err(e) => {
                warn!("[Stream] Listen key keepalive failed: {}", e);
                StreamControl::Reconnect
            }
        }
    }
}

// =============================================================================
// Market data
// =============================================================================

pub struct PriceSession {
    ws_base: String,
    symbol: String,
    tx: UnboundedSender<PriceTick>,
}

impl PriceSession {
    pub fn new(ws_base: impl Into<String>, symbol: impl Into<String>, tx: UnboundedSender<PriceTick>) -> Self {
        Self {
            ws_base: ws_base.into(),
            symbol: symbol.into(),
            tx,
        }
    }
}

#[async_trait]
impl StreamSession for PriceSession {
    fn name(&self) -> String {
        format!("binance-prices:{}", self.symbol)
    }

    async fn url(&mut self) -> Result<String> {
        Ok(self.ws_base.clone())
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![subscribe_message(&format!(
            "{}@bookTicker",
            self.symbol.to_lowercase()
        ))]
    }

    fn on_text(&mut self, text: &str) -> StreamControl {
        if event_type(text).as_deref() != Some("bookTicker") {
            return StreamControl::Continue;
        }

        match serde_json::from_str::<BookTicker>(text) {
            Ok(ticker) => {
                if self.tx.send(PriceTick::from(ticker)).is_err() {
                    return StreamControl::Stop;
                }
            }
            Err(e) => debug!("[Stream] Unparseable book ticker: {}", e),
        }
        StreamControl::Continue
    }
}

pub struct KlineSession {
    ws_base: String,
    symbol: String,
    interval: String,
    tx: UnboundedSender<Kline>,
}

impl KlineSession {
    pub fn new(
        ws_base: impl Into<String>,
        symbol: impl Into<String>,
        interval: impl Into<String>,
        tx: UnboundedSender<Kline>,
    ) -> Self {
        Self {
            ws_base: ws_base.into(),
            symbol: symbol.into(),
            interval: interval.into(),
            tx,
        }
    }
}

#[async_trait]
impl StreamSession for KlineSession {
    fn name(&self) -> String {
        format!("binance-klines:{}:{}", self.symbol, self.interval)
    }

    async fn url(&mut self) -> Result<String> {
        Ok(self.ws_base.clone())
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![subscribe_message(&format!(
            "{}@kline_{}",
            self.symbol.to_lowercase(),
            self.interval
        ))]
    }

    fn on_text(&mut self, text: &str) -> StreamControl {
        if event_type(text).as_deref() != Some("kline") {
            return StreamControl::Continue;
        }

        match serde_json::from_str::<KlineEvent>(text) {
            Ok(event) => {
                if self.tx.send(Kline::from(event)).is_err() {
                    return StreamControl::Stop;
                }
            }
            Err(e) => debug!("[Stream] Unparseable kline: {}", e),
        }
        StreamControl::Continue
    }
}
