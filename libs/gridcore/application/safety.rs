//! Pre-flight safety gate
//!
//! Runs once before the ledger is initialized. Any failure keeps the
//! instance from trading.

use thiserror::Error;
use tracing::{info, warn};

use crate::infrastructure::config::SafetyConfig;
use crate::infrastructure::exchange::{ExchangeAdapter, ExchangeError};

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Trading is disabled on the account")]
    TradingDisabled,

    #[error("Insufficient balance: {required:.2} {asset} required, {available:.2} available")]
    InsufficientBalance {
        asset: String,
        required: f64,
        available: f64,
    },

    #[error("Leverage {leverage}x exceeds the {max}x limit")]
    LeverageTooHigh { leverage: u32, max: u32 },

    #[error("Grid step earns {profit:.6} per round trip but fees cost {fees:.6}")]
    Unprofitable { profit: f64, fees: f64 },

    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    #[error("Account check failed: {0}")]
    Exchange(#[from] ExchangeError),
}

pub type Result<T> = std::result::Result<T, SafetyError>;

/// Parameters of the grid about to be started
#[derive(Debug, Clone)]
pub struct GridPlan {
    pub anchor_price: f64,
    pub price_interval: f64,
    pub order_quantity: f64,
    pub buy_window_size: usize,
    pub leverage: u32,
}

impl GridPlan {
    /// Margin needed to hold every buy of the window at once
    pub fn required_margin(&self, buffer: f64) -> f64 {
        let leverage = self.leverage.max(1) as f64;
        let notional: f64 = (1..=self.buy_window_size)
            .map(|i| (self.anchor_price - i as f64 * self.price_interval) * self.order_quantity)
            .sum();
        notional / leverage * buffer
    }

    /// Gross profit of one buy/sell round trip
    pub fn profit_per_grid(&self) -> f64 {
        self.price_interval * self.order_quantity
    }

    /// Maker fees paid on one round trip
    pub fn fees_per_grid(&self, fee_rate: f64) -> f64 {
        2.0 * self.anchor_price * self.order_quantity * fee_rate
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyReport {
    pub available_balance: f64,
    pub required_margin: f64,
    pub profit_per_grid: f64,
    pub fees_per_grid: f64,
    /// The gate was disabled in config and nothing was checked
    pub skipped: bool,
}

pub struct SafetyGate {
    config: SafetyConfig,
}

impl SafetyGate {
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    pub async fn check(&self, adapter: &dyn ExchangeAdapter, plan: &GridPlan) -> Result<SafetyReport> {
        if !self.config.enabled {
            warn!("[Safety] Pre-flight checks disabled for {}", adapter.symbol());
            return Ok(SafetyReport {
                available_balance: 0.0,
                required_margin: 0.0,
                profit_per_grid: plan.profit_per_grid(),
                fees_per_grid: 0.0,
                skipped: true,
            });
        }

        let lowest = plan.anchor_price - plan.buy_window_size as f64 * plan.price_interval;
        if !(plan.anchor_price > 0.0) || !(plan.price_interval > 0.0) || lowest <= 0.0 {
            return Err(SafetyError::InvalidGrid(format!(
                "anchor {} with {} levels of {} reaches {}",
                plan.anchor_price, plan.buy_window_size, plan.price_interval, lowest
            )));
        }

        if plan.leverage > self.config.max_leverage {
            return Err(SafetyError::LeverageTooHigh {
                leverage: plan.leverage,
                max: self.config.max_leverage,
            });
        }

        let profit = plan.profit_per_grid();
        let fees = plan.fees_per_grid(self.config.maker_fee_rate);
        if profit <= fees {
            return Err(SafetyError::Unprofitable { profit, fees });
        }

        let account = adapter.get_account().await?;
        if !account.can_trade {
            return Err(SafetyError::TradingDisabled);
        }

        let asset = adapter.quote_asset().to_string();
        let available = adapter.get_balance(&asset).await?;
        let required = plan.required_margin(self.config.margin_buffer);
        if available < required {
            return Err(SafetyError::InsufficientBalance {
                asset,
                required,
                available,
            });
        }

        info!(
            "[Safety] {} passed: balance {:.2} {} >= {:.2} required, {:.6} profit vs {:.6} fees per grid",
            adapter.symbol(),
            available,
            asset,
            required,
            profit,
            fees
        );

        Ok(SafetyReport {
            available_balance: available,
            required_margin: required,
            profit_per_grid: profit,
            fees_per_grid: fees,
            skipped: false,
        })
    }
}
