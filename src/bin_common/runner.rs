//! Binary runner utilities
//!
//! Banners and a periodic status line for long-running binaries.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use gridcore::{GridEngine, ShutdownManager};

/// Configuration for running a binary application
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Name of the binary (for logging)
    pub name: String,
    /// Status heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl RunConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            heartbeat_interval_secs: 300, // 5 minutes default
        }
    }

    pub fn with_heartbeat(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }
}

pub fn print_banner(config: &RunConfig) {
    info!("");
    info!("========================================");
    info!("Starting {}", config.name);
    info!("Press Ctrl+C to stop");
    info!("========================================");
    info!("");
}

pub fn print_shutdown(config: &RunConfig, stats: Option<&str>) {
    info!("");
    info!("========================================");
    info!("{} stopped gracefully", config.name);
    if let Some(stats) = stats {
        info!("{}", stats);
    }
    info!("========================================");
}

/// Log every engine's ledger totals until shutdown
pub fn spawn_status_heartbeat(
    engines: Vec<Arc<GridEngine>>,
    shutdown: Arc<ShutdownManager>,
    config: &RunConfig,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(config.heartbeat_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            shutdown.interruptible_sleep(interval).await;
            if !shutdown.is_running() {
                break;
            }
            for engine in &engines {
                let ledger = engine.ledger();
                if !ledger.is_initialized() {
                    continue;
                }
                let totals = ledger.totals();
                info!(
                    "[Status] {} | slots {} | bought {:.6} | sold {:.6} | est. profit {:.4}{}",
                    engine.label(),
                    ledger.slot_count(),
                    totals.total_buy_qty,
                    totals.total_sell_qty,
                    totals.estimated_profit,
                    if ledger.is_placement_paused() { " | paused" } else { "" }
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_builder() {
        let config = RunConfig::new("gridbot").with_heartbeat(120);

        assert_eq!(config.name, "gridbot");
        assert_eq!(config.heartbeat_interval_secs, 120);
    }

    #[test]
    fn test_default_config() {
        let config = RunConfig::new("default");
        assert_eq!(config.heartbeat_interval_secs, 300);
    }
}
