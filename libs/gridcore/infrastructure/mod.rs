//! Infrastructure Layer
//!
//! Exchange adapters, WebSocket plumbing, configuration, persistence and
//! process lifecycle. Depends on the domain layer, never on the application
//! layer.

pub mod config;
pub mod database;
pub mod exchange;
pub mod lock;
pub mod logging;
pub mod shutdown;
pub mod stream;

// Re-export config types
pub use config::{ConfigError, GridConfig, GridParams, InstanceConfig};

// Re-export exchange types
pub use exchange::{connect_adapter, ExchangeAdapter, ExchangeError};

// Re-export persistence and locking
pub use database::{AuditDatabase, DatabaseError, PgLeaseLock, ReconcileStore};
pub use lock::{DistributedLock, InMemoryLock, LockError};

// Re-export infrastructure services
pub use logging::{init_tracing, init_tracing_with_level};
pub use shutdown::ShutdownManager;
pub use stream::{ExponentialBackoff, FixedDelay, ReconnectionStrategy, StreamConfig};
