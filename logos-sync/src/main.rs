//! `logos-sync-server` — serves one shared object store over WebSocket.
//!
//! Usage: `logos-sync-server [config.toml]`. Settings can also come from
//! `LOGOS_SYNC__SERVER__BIND_ADDR` style environment variables.

use std::process::ExitCode;
use std::sync::Arc;

use logos_sync::{Backend, MemoryStore, RocksStore, RocksStoreConfig, Settings, StoreServer, SystemClock};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args().nth(1);
    let settings = match Settings::load(path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let clock = Arc::new(SystemClock);
    let lease = settings.server.lease;
    log::info!("Lease TTL {}ms, delete policy {:?}", lease.ttl_ms, lease.delete_policy);
    let backend: Arc<dyn Backend> = match &settings.server.storage_path {
        Some(path) => {
            let config = RocksStoreConfig {
                path: path.clone(),
                sync_writes: settings.server.sync_writes,
                broadcast_capacity: settings.server.broadcast_capacity,
                lease,
                ..RocksStoreConfig::default()
            };
            match RocksStore::open(config, clock) {
                Ok(store) => {
                    log::info!("Using RocksDB store at {}", path.display());
                    Arc::new(store)
                }
                Err(e) => {
                    log::error!("Failed to open store at {}: {e}", path.display());
                    return ExitCode::FAILURE;
                }
            }
        }
        None => {
            log::info!("Using in-memory store");
            Arc::new(MemoryStore::with_capacity(clock, settings.server.broadcast_capacity).with_policy(lease))
        }
    };

    let server = StoreServer::new(settings.server, backend);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }
    ExitCode::SUCCESS
}
