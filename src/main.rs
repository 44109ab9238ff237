use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use vela::{Config, Engine, FileStateStore, StateStore};

const SNAPSHOT_ID: &str = "engine";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vela=info".parse().unwrap()),
        )
        .init();

    info!("Vela v{} starting", vela::VERSION);

    let config_path = std::env::args().nth(1).unwrap_or_else(|| {
        error!("Usage: vela <config.yaml>");
        std::process::exit(1);
    });

    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;
    info!(
        "Loaded {} points, {} blocks, {} alarms",
        config.points.len(),
        config.blocks.len(),
        config.alarms.len()
    );

    let state_store = match &config.engine.state_dir {
        Some(dir) => Some(FileStateStore::new(dir)?),
        None => None,
    };

    let mut engine = Engine::new(config)?;
    if let Some(store) = &state_store {
        match store.load(SNAPSHOT_ID)? {
            Some(snapshot) => {
                engine.restore_state(snapshot)?;
                info!("Restored state snapshot");
            }
            None => info!("No previous state snapshot"),
        }
    }

    let stop = engine.stop_handle();
    let mut ctrl_c = std::pin::pin!(signal::ctrl_c());

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received shutdown signal");
            stop.store(false, std::sync::atomic::Ordering::Relaxed);
        }
        res = engine.run() => {
            if let Err(e) = res {
                error!("Engine error: {}", e);
                std::process::exit(1);
            }
        }
    }

    if let Some(store) = &state_store {
        match engine.snapshot_state() {
            Ok(snapshot) => {
                store.save(SNAPSHOT_ID, &snapshot)?;
                info!("Saved state snapshot");
            }
            Err(e) => warn!("Snapshot failed: {}", e),
        }
    }

    let stats = engine.stats();
    info!(
        "Final stats: {} ticks, {} block runs, {} errors",
        stats.tick_count, stats.run_count, stats.error_count
    );

    Ok(())
}
