//! Grid Market Maker - Main Library
//!
//! Thin presentation layer over the `gridcore` workspace library.
//!
//! ## Architecture
//!
//! - **bin_common**: shared helpers for binaries (config path, banners, status heartbeat)
//! - **gridcore**: ledger, reconciler, exchange adapters (re-exported from workspace)
//!
//! ## Usage in Binaries
//!
//! ```rust,ignore
//! use grid_market_maker::bin_common::{load_config_from_env, ConfigType};
//! use grid_market_maker::gridcore::GridEngine;
//! ```

pub use gridcore;

pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod runner;

    pub use cli::{load_config_from_env, parse_args, ConfigType};
    pub use runner::{print_banner, print_shutdown, spawn_status_heartbeat, RunConfig};
}
