//! Domain Layer
//!
//! Pure data types shared by the ledger, the reconciler and every exchange
//! adapter. Nothing in here performs I/O.

pub mod audit;
pub mod market;
pub mod order;
pub mod slot;

pub use audit::ReconcileRecord;
pub use market::{Account, FundingRate, Kline, Position, PriceTick};
pub use order::{Order, OrderRequest, OrderStatus, OrderType, OrderUpdate, ParseEnumError, Side};
pub use slot::{
    decimals_of, round_to, ForceSyncOutcome, GridSpec, LedgerTotals, PositionStatus, Slot,
    SlotSnapshot, SlotSource, SlotStatus, QTY_EPSILON,
};
