//! diagram-relay: WebSocket relay for collaborative class diagrams.
//!
//! Routes `change` events between clients editing the same document,
//! resyncs late joiners and, with `--storage`, keeps room state in RocksDB
//! across restarts.

use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

use diagram_sync::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "diagram-relay", version, about = "Realtime relay for collaborative UML diagrams")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090", env = "DIAGRAM_RELAY_BIND")]
    bind: String,

    /// RocksDB directory; rooms are memory-only when omitted
    #[arg(long, env = "DIAGRAM_RELAY_STORAGE")]
    storage: Option<PathBuf>,

    /// Frames buffered per peer before it is resynced
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    #[arg(long, default_value_t = 100)]
    max_peers_per_room: usize,

    /// WebSocket ping interval in seconds, 0 to disable
    #[arg(long, default_value_t = 30)]
    heartbeat: u64,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: args.bind,
        max_peers_per_room: args.max_peers_per_room,
        broadcast_capacity: args.broadcast_capacity,
        heartbeat_interval_secs: args.heartbeat,
        storage_path: args.storage,
    };
    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open document store: {e}");
            std::process::exit(1);
        }
    };

    info!("Starting diagram relay on {}", server.bind_addr());
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let written = server.persist_all().await;
            info!("Shutting down; persisted {written} open rooms");
        }
    }
}
