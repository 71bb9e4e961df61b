//! Grid engine
//!
//! Drives one instance: anchors the grid, runs the safety gate, seeds the
//! ledger, then feeds it order updates and price ticks until shutdown.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::executor::ExchangeExecutor;
use super::ledger::{LedgerConfig, LedgerError, SlotLedger};
use super::reconciler::{spawn_reconcile_task, Reconciler, ReconcilerConfig};
use super::safety::{GridPlan, SafetyError, SafetyGate};
use crate::domain::{OrderUpdate, PriceTick};
use crate::infrastructure::config::{InstanceConfig, ReconcileSettings, SafetyConfig};
use crate::infrastructure::database::ReconcileStore;
use crate::infrastructure::exchange::{ExchangeAdapter, ExchangeError};
use crate::infrastructure::lock::{DistributedLock, InMemoryLock};
use crate::infrastructure::shutdown::ShutdownManager;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Safety gate refused to start: {0}")]
    Safety(#[from] SafetyError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Price stream closed before the first tick")]
    NoPrice,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Counters of one engine run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub ticks: u64,
    pub order_updates: u64,
    pub anchor_price: Option<f64>,
}

pub struct GridEngine {
    instance: InstanceConfig,
    adapter: Arc<dyn ExchangeAdapter>,
    ledger: Arc<SlotLedger>,
    safety: SafetyGate,
    reconcile: ReconcileSettings,
    lock: Arc<dyn DistributedLock>,
    store: Option<Arc<dyn ReconcileStore>>,
    shutdown: Arc<ShutdownManager>,
}

impl GridEngine {
    pub fn new(
        instance: InstanceConfig,
        adapter: Arc<dyn ExchangeAdapter>,
        shutdown: Arc<ShutdownManager>,
    ) -> Result<Self> {
        let ledger_config = LedgerConfig::from_instance(
            &instance,
            adapter.price_decimals(),
            adapter.quantity_decimals(),
        );
        let executor = Arc::new(ExchangeExecutor::new(Arc::clone(&adapter)));
        let ledger = Arc::new(SlotLedger::new(ledger_config, executor)?);

        Ok(Self {
            instance,
            adapter,
            ledger,
            safety: SafetyGate::new(SafetyConfig::default()),
            reconcile: ReconcileSettings::default(),
            lock: Arc::new(InMemoryLock::new()),
            store: None,
            shutdown,
        })
    }

    pub fn with_safety(mut self, config: SafetyConfig) -> Self {
        self.safety = SafetyGate::new(config);
        self
    }

    pub fn with_reconcile(mut self, settings: ReconcileSettings, lock: Arc<dyn DistributedLock>) -> Self {
        self.reconcile = settings;
        self.lock = lock;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ReconcileStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ledger(&self) -> &Arc<SlotLedger> {
        &self.ledger
    }

    pub fn label(&self) -> String {
        self.instance.label()
    }

    /// Run until shutdown. Open orders are canceled on the way out when the
    /// instance asks for it.
    pub async fn run(&self) -> Result<EngineStats> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let result = self.run_inner(&mut handles).await;

        if self.instance.cancel_on_exit && self.ledger.is_initialized() {
            info!("[Engine] {} canceling open orders", self.label());
            if let Err(e) = self.adapter.cancel_all_orders(self.adapter.symbol()).await {
                error!("[Engine] {} cancel on exit failed: {}", self.label(), e);
            }
        }

        for handle in handles {
            handle.abort();
        }

        match &result {
            Ok(stats) => info!(
                "[Engine] {} stopped after {} ticks, {} order updates",
                self.label(),
                stats.ticks,
                stats.order_updates
            ),
            Err(e) => error!("[Engine] {} stopped: {}", self.label(), e),
        }
        result
    }

    async fn run_inner(&self, handles: &mut Vec<JoinHandle<()>>) -> Result<EngineStats> {
        let label = self.label();
        let symbol = self.adapter.symbol().to_string();
        let mut stats = EngineStats::default();

        let (price_tx, mut price_rx) = mpsc::unbounded_channel::<PriceTick>();
        handles.push(
            self.adapter
                .start_price_stream(&symbol, price_tx, Arc::clone(&self.shutdown))
                .await?,
        );

        let (anchor, anchor_str) = match self.resolve_anchor(&mut price_rx).await? {
            Some(anchor) => anchor,
            None => return Ok(stats),
        };
        stats.anchor_price = Some(anchor);
        info!("[Engine] {} anchored at {}", label, anchor_str);

        let plan = GridPlan {
            anchor_price: anchor,
            price_interval: self.instance.grid.price_interval,
            order_quantity: self.instance.grid.order_quantity,
            buy_window_size: self.instance.grid.buy_window_size,
            leverage: self.instance.leverage,
        };
        self.safety.check(self.adapter.as_ref(), &plan).await?;

        let (order_tx, mut order_rx) = mpsc::unbounded_channel::<OrderUpdate>();
        handles.push(
            self.adapter
                .start_order_stream(order_tx, Arc::clone(&self.shutdown))
                .await?,
        );

        let placed = self.ledger.initialize(anchor, &anchor_str).await?;
        info!("[Engine] {} grid live with {} buys", label, placed);

        if self.reconcile.enabled {
            let mut reconciler = Reconciler::new(
                ReconcilerConfig::from_settings(&self.reconcile),
                Arc::clone(&self.adapter),
                self.ledger.clone(),
                Arc::clone(&self.lock),
                self.ledger.risk_pause(),
            );
            if let Some(store) = &self.store {
                reconciler = reconciler.with_store(Arc::clone(store));
            }
            handles.push(spawn_reconcile_task(
                Arc::new(reconciler),
                Arc::clone(&self.shutdown),
            ));
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                update = order_rx.recv() => match update {
                    Some(update) => {
                        stats.order_updates += 1;
                        self.ledger.on_order_update(&update).await;
                    }
                    None => {
                        warn!("[Engine] {} order stream closed", label);
                        break;
                    }
                },

                tick = price_rx.recv() => match tick {
                    Some(tick) => {
                        if let Some(tick) = latest_tick(&symbol, tick, &mut price_rx) {
                            stats.ticks += 1;
                            let summary = self.ledger.adjust_orders(tick.mid()).await;
                            debug!("[Engine] {} tick {:.2}: {:?}", label, tick.mid(), summary);
                        }
                    }
                    None => {
                        warn!("[Engine] {} price stream closed", label);
                        break;
                    }
                },
            }
        }

        Ok(stats)
    }

    /// Configured anchor, or the mid of the first tick. `None` on shutdown.
    async fn resolve_anchor(
        &self,
        price_rx: &mut UnboundedReceiver<PriceTick>,
    ) -> Result<Option<(f64, String)>> {
        if let (Some(price), Some(text)) = (
            self.instance.anchor_price(),
            self.instance.grid.anchor_price.as_deref(),
        ) {
            return Ok(Some((price, text.trim().to_string())));
        }

        let symbol = self.adapter.symbol();
        let decimals = self.adapter.price_decimals() as usize;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                tick = price_rx.recv() => match tick {
                    Some(tick) if tick.symbol.eq_ignore_ascii_case(symbol) => {
                        let text = format!("{:.*}", decimals, tick.mid());
                        let price = text.parse::<f64>().unwrap_or(tick.mid());
                        return Ok(Some((price, text)));
                    }
                    Some(_) => continue,
                    None => return Err(EngineError::NoPrice),
                },
            }
        }
    }
}

/// Drain queued ticks, keeping the newest one for `symbol`
fn latest_tick(symbol: &str, first: PriceTick, rx: &mut UnboundedReceiver<PriceTick>) -> Option<PriceTick> {
    let mut latest = first.symbol.eq_ignore_ascii_case(symbol).then_some(first);
    while let Ok(next) = rx.try_recv() {
        if next.symbol.eq_ignore_ascii_case(symbol) {
            latest = Some(next);
        }
    }
    latest
}
