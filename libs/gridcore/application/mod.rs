//! Application layer: ledger, executor, reconciler, safety gate and engine

pub mod engine;
pub mod executor;
pub mod ledger;
pub mod reconciler;
pub mod safety;

pub use engine::{EngineError, EngineStats, GridEngine};
pub use executor::{ExchangeExecutor, OrderExecutor};
pub use ledger::{AdjustSummary, LedgerConfig, LedgerError, SlotLedger};
pub use reconciler::{
    spawn_reconcile_task, ReconcileError, ReconcileOutcome, ReconcileReport, Reconciler,
    ReconcilerConfig, SkipReason,
};
pub use safety::{GridPlan, SafetyError, SafetyGate, SafetyReport};
