//! Grid Market-Making Core
//!
//! Inventory slot ledger, reconciliation engine and the resilient exchange
//! adapter contract that every exchange integration implements.
//!
//! ## Layers
//!
//! - **domain**: orders, slots, positions and audit records (no I/O)
//! - **infrastructure**: exchange adapters, streams, config, database, locking
//! - **application**: ledger, executor, reconciler, safety gate and engine

pub mod application;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used items
pub use application::{
    GridEngine, OrderExecutor, ExchangeExecutor, Reconciler, ReconcilerConfig, SafetyGate,
    SlotLedger, LedgerConfig,
};
pub use domain::{
    Order, OrderRequest, OrderStatus, OrderUpdate, PositionStatus, Side, Slot, SlotSnapshot,
    SlotStatus,
};
pub use infrastructure::{
    init_tracing_with_level, ExchangeAdapter, ExchangeError, GridConfig, ShutdownManager,
};
