use anyhow::{Context, Result};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use grid_market_maker::bin_common::{
    load_config_from_env, parse_args, print_banner, print_shutdown, spawn_status_heartbeat,
    ConfigType, RunConfig,
};
use gridcore::infrastructure::{
    connect_adapter, AuditDatabase, DistributedLock, InMemoryLock, ReconcileStore,
};
use gridcore::{init_tracing_with_level, GridConfig, GridEngine, ShutdownManager};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = parse_args()
        .into_iter()
        .find(|a| !a.starts_with('-'))
        .map(PathBuf::from)
        .unwrap_or_else(|| load_config_from_env(ConfigType::Grid));

    let config = GridConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    init_tracing_with_level(&config.log_level);
    config.log();

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.spawn_signal_handler();

    let (lock, store): (Arc<dyn DistributedLock>, Option<Arc<dyn ReconcileStore>>) =
        if config.database.is_configured() {
            let db = Arc::new(AuditDatabase::new(&config.database.url).await?);
            for instance in &config.instances {
                match db.recent_reconciliations(&instance.symbol, 1).await {
                    Ok(rows) => {
                        if let Some(last) = rows.first() {
                            info!(
                                "{}: last audited round at {} (local {} / exchange {})",
                                instance.label(),
                                last.reconcile_time,
                                last.local_position,
                                last.exchange_position
                            );
                        }
                    }
                    Err(e) => warn!("{}: reconcile history unavailable: {}", instance.label(), e),
                }
            }
            (Arc::new(db.lease_lock()), Some(db as Arc<dyn ReconcileStore>))
        } else {
            warn!("No database configured: reconcile lock is process-local and history is not kept");
            (Arc::new(InMemoryLock::new()), None)
        };

    let mut engines = Vec::with_capacity(config.instances.len());
    for instance in &config.instances {
        let adapter = connect_adapter(instance, &config.resilience, Arc::clone(&shutdown))
            .await
            .with_context(|| format!("Failed to connect {}", instance.label()))?;

        let mut engine = GridEngine::new(instance.clone(), adapter, Arc::clone(&shutdown))?
            .with_safety(config.safety.clone())
            .with_reconcile(config.reconcile.clone(), Arc::clone(&lock));
        if let Some(store) = &store {
            engine = engine.with_store(Arc::clone(store));
        }
        engines.push(Arc::new(engine));
    }

    let run_config = RunConfig::new("Grid Market Maker");
    print_banner(&run_config);
    let heartbeat = spawn_status_heartbeat(engines.clone(), Arc::clone(&shutdown), &run_config);

    let results = join_all(engines.iter().map(|engine| engine.run())).await;
    shutdown.trigger();
    heartbeat.abort();

    let mut failed = 0;
    for (engine, result) in engines.iter().zip(&results) {
        match result {
            Ok(stats) => {
                let totals = engine.ledger().totals();
                info!(
                    "{}: {} ticks, bought {:.6}, sold {:.6}, est. profit {:.4}",
                    engine.label(),
                    stats.ticks,
                    totals.total_buy_qty,
                    totals.total_sell_qty,
                    totals.estimated_profit
                );
            }
            Err(e) => {
                failed += 1;
                error!("{}: {}", engine.label(), e);
            }
        }
    }

    print_shutdown(
        &run_config,
        Some(&format!("{}/{} instances ran cleanly", engines.len() - failed, engines.len())),
    );

    if failed > 0 {
        anyhow::bail!("{} instance(s) stopped with an error", failed);
    }
    Ok(())
}
