//! Reconciliation engine
//!
//! Periodically compares the exchange's positions and open orders with the
//! ledger's slots. Drift is logged and audited. The only automatic correction
//! is clearing local inventory when the exchange reports no position at all.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{
    ForceSyncOutcome, PositionStatus, ReconcileRecord, Side, SlotSnapshot, SlotSource, QTY_EPSILON,
};
use crate::infrastructure::config::{ReconcileSettings, MIN_RECONCILE_INTERVAL_FLOOR_SECS};
use crate::infrastructure::database::ReconcileStore;
use crate::infrastructure::exchange::{ExchangeAdapter, ExchangeError};
use crate::infrastructure::lock::{DistributedLock, LockError};
use crate::infrastructure::shutdown::ShutdownManager;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Exchange state unavailable: {0}")]
    Exchange(#[from] ExchangeError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    interval: Duration,
    min_interval: Duration,
    epsilon: f64,
    lock_ttl: Duration,
}

impl ReconcilerConfig {
    /// `min_interval` is raised to the 30s floor
    pub fn new(interval: Duration, min_interval: Duration, epsilon: f64, lock_ttl: Duration) -> Self {
        let floor = Duration::from_secs(MIN_RECONCILE_INTERVAL_FLOOR_SECS);
        Self {
            interval,
            min_interval: min_interval.max(floor),
            epsilon: epsilon.max(0.0),
            lock_ttl,
        }
    }

    pub fn from_settings(settings: &ReconcileSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.interval_secs),
            Duration::from_secs(settings.min_interval_secs),
            settings.epsilon,
            Duration::from_secs(settings.lock_ttl_secs),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from_settings(&ReconcileSettings::default())
    }
}

/// Why a round did not run
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    RiskPaused,
    LockBusy,
    LockUnavailable(String),
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub record: ReconcileRecord,
    pub exchange_open_orders: usize,
    /// Present when the round cleared local inventory
    pub forced_sync: Option<ForceSyncOutcome>,
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    Skipped(SkipReason),
    Completed(ReconcileReport),
}

/// Local view tallied from slot snapshots
#[derive(Debug, Default)]
struct LocalTally {
    position: f64,
    active_buys: u32,
    active_sells: u32,
    pending_sell_qty: f64,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    adapter: Arc<dyn ExchangeAdapter>,
    slots: Arc<dyn SlotSource>,
    lock: Arc<dyn DistributedLock>,
    store: Option<Arc<dyn ReconcileStore>>,
    risk_pause: Arc<AtomicBool>,
    /// Start of the last round; also serializes rounds
    last_run: tokio::sync::Mutex<Option<Instant>>,
    reconcile_count: AtomicU64,
    last_reconcile_time: RwLock<Option<DateTime<Utc>>>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        adapter: Arc<dyn ExchangeAdapter>,
        slots: Arc<dyn SlotSource>,
        lock: Arc<dyn DistributedLock>,
        risk_pause: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            adapter,
            slots,
            lock,
            store: None,
            risk_pause,
            last_run: tokio::sync::Mutex::new(None),
            reconcile_count: AtomicU64::new(0),
            last_reconcile_time: RwLock::new(None),
        }
    }

    /// Persist an audit row after every completed round
    pub fn with_store(mut self, store: Arc<dyn ReconcileStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Completed rounds since start
    pub fn reconcile_count(&self) -> u64 {
        self.reconcile_count.load(Ordering::Acquire)
    }

    pub fn last_reconcile_time(&self) -> Option<DateTime<Utc>> {
        *self.last_reconcile_time.read()
    }

    pub fn lock_key(&self) -> String {
        format!("reconcile:{}:{}", self.adapter.name(), self.adapter.symbol())
    }

    /// Run one reconciliation round.
    ///
    /// A call less than `min_interval` after the previous round waits out the
    /// remainder first. Fetch errors abort the round without retry.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        if self.risk_pause.load(Ordering::Acquire) {
            debug!("[Reconcile] Risk pause set, skipping");
            return Ok(ReconcileOutcome::Skipped(SkipReason::RiskPaused));
        }

        let mut last_run = self.last_run.lock().await;
        if let Some(previous) = *last_run {
            let elapsed = previous.elapsed();
            if elapsed < self.config.min_interval {
                let wait = self.config.min_interval - elapsed;
                debug!("[Reconcile] Last round {:?} ago, waiting {:?}", elapsed, wait);
                tokio::time::sleep(wait).await;
            }
        }
        *last_run = Some(Instant::now());

        let key = self.lock_key();
        let lease = match self.lock.lock(&key, self.config.lock_ttl).await {
            Ok(()) => Lease::new(Arc::clone(&self.lock), key),
            Err(LockError::Busy(_)) => {
                debug!("[Reconcile] {} held elsewhere, skipping", key);
                return Ok(ReconcileOutcome::Skipped(SkipReason::LockBusy));
            }
            Err(LockError::Backend(e)) => {
                warn!("[Reconcile] Could not acquire {}: {}", key, e);
                return Ok(ReconcileOutcome::Skipped(SkipReason::LockUnavailable(e)));
            }
        };

        let result = self.run_locked().await;
        lease.release().await;

        let report = result?;
        self.reconcile_count.fetch_add(1, Ordering::AcqRel);
        *self.last_reconcile_time.write() = Some(report.record.reconcile_time);

        if let Some(store) = &self.store {
            if let Err(e) = store.save_reconciliation(&report.record).await {
                warn!("[Reconcile] Failed to persist audit row: {}", e);
            }
        }

        Ok(ReconcileOutcome::Completed(report))
    }

    async fn run_locked(&self) -> Result<ReconcileReport> {
        let symbol = self.adapter.symbol().to_string();

        let (positions, open_orders) = tokio::try_join!(
            self.adapter.get_positions(&symbol),
            self.adapter.get_open_orders(&symbol)
        )
        .map_err(|e| {
            warn!("[Reconcile] {} fetch failed, round aborted: {}", symbol, e);
            e
        })?;

        let exchange_position: f64 = positions
            .iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.size)
            .sum();
        let exchange_open_orders = open_orders.iter().filter(|o| o.symbol == symbol).count();

        let local = self.tally();
        let diff = (local.position - exchange_position).abs();

        let mut forced_sync = None;
        if exchange_position.abs() < QTY_EPSILON && local.position > self.config.epsilon {
            warn!(
                "[Reconcile] {} exchange position is zero but ledger holds {}, clearing slots",
                symbol, local.position
            );
            forced_sync = Some(self.slots.force_sync_positions(0.0).await);
        } else if diff > self.config.epsilon {
            warn!(
                "[Reconcile] {} position drift: local {} vs exchange {} (diff {}), not auto-corrected",
                symbol, local.position, exchange_position, diff
            );
        } else {
            debug!(
                "[Reconcile] {} positions match: {} (diff {})",
                symbol, exchange_position, diff
            );
        }

        let local_orders = (local.active_buys + local.active_sells) as usize;
        if local_orders != exchange_open_orders {
            warn!(
                "[Reconcile] {} open order drift: ledger {} ({} buys, {} sells) vs exchange {}",
                symbol, local_orders, local.active_buys, local.active_sells, exchange_open_orders
            );
        }

        let totals = self.slots.totals();
        let record = ReconcileRecord {
            symbol: symbol.clone(),
            reconcile_time: Utc::now(),
            local_position: local.position,
            exchange_position,
            position_diff: diff,
            active_buy_orders: local.active_buys,
            active_sell_orders: local.active_sells,
            pending_sell_qty: local.pending_sell_qty,
            total_buy_qty: totals.total_buy_qty,
            total_sell_qty: totals.total_sell_qty,
            estimated_profit: totals.estimated_profit,
        };

        info!(
            "[Reconcile] {} round done: local {} / exchange {}, orders {}/{}",
            symbol, local.position, exchange_position, local_orders, exchange_open_orders
        );

        Ok(ReconcileReport {
            record,
            exchange_open_orders,
            forced_sync,
        })
    }

    fn tally(&self) -> LocalTally {
        let mut tally = LocalTally::default();
        self.slots.iterate_slots(&mut |slot: &SlotSnapshot| {
            if slot.position_status == PositionStatus::Filled {
                tally.position += slot.position_qty;
            }
            if slot.has_active_order(Side::Buy) {
                tally.active_buys += 1;
            }
            if slot.has_active_order(Side::Sell) {
                tally.active_sells += 1;
                tally.pending_sell_qty += (slot.order_quantity - slot.order_filled_qty).max(0.0);
            }
        });
        tally
    }
}

/// A held reconciliation lock.
///
/// A round future dropped before `release` (task abort, caller timeout)
/// leaves the unlock to a spawned task instead of waiting out the TTL.
struct Lease {
    lock: Arc<dyn DistributedLock>,
    key: String,
    released: bool,
}

impl Lease {
    fn new(lock: Arc<dyn DistributedLock>, key: String) -> Self {
        Self {
            lock,
            key,
            released: false,
        }
    }

    async fn release(mut self) {
        if let Err(e) = self.lock.unlock(&self.key).await {
            warn!("[Reconcile] Failed to release {}: {}", self.key, e);
        }
        self.released = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let lock = Arc::clone(&self.lock);
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("[Reconcile] Round dropped while holding {}, releasing", key);
                handle.spawn(async move {
                    if let Err(e) = lock.unlock(&key).await {
                        warn!("[Reconcile] Failed to release {}: {}", key, e);
                    }
                });
            }
            Err(_) => warn!(
                "[Reconcile] No runtime to release {}, it expires with its TTL",
                key
            ),
        }
    }
}

/// Run `reconciler` every `interval` until shutdown.
///
/// Shutdown is only observed between rounds; a round in flight runs to
/// completion so its lock is released.
pub fn spawn_reconcile_task(reconciler: Arc<Reconciler>, shutdown: Arc<ShutdownManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = reconciler.config().interval();
        info!(
            "[Reconcile] Task started for {} (every {:?}, min {:?})",
            reconciler.lock_key(),
            interval,
            reconciler.config().min_interval()
        );

        loop {
            shutdown.interruptible_sleep(interval).await;
            if !shutdown.is_running() {
                break;
            }

            match reconciler.reconcile().await {
                Ok(ReconcileOutcome::Completed(_)) => {}
                Ok(ReconcileOutcome::Skipped(reason)) => {
                    debug!("[Reconcile] Round skipped: {:?}", reason);
                }
                Err(e) => warn!("[Reconcile] Round failed: {}", e),
            }
        }

        info!("[Reconcile] Task stopped for {}", reconciler.lock_key());
    })
}
