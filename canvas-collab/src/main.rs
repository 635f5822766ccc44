use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use canvas_collab::{RoomConfig, ServerConfig, SyncServer};

#[derive(Parser)]
#[command(name = "canvas-sync")]
#[command(about = "Real-time sync server for collaborative drawings")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "CANVAS_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; drawings are kept in memory when omitted
    #[arg(long, env = "CANVAS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Quiet period before a dirty room is flushed, in milliseconds
    #[arg(long, env = "CANVAS_FLUSH_DEBOUNCE_MS", default_value = "2000")]
    flush_debounce_ms: u64,

    /// Seconds of silence before a peer is evicted
    #[arg(long, env = "CANVAS_HEARTBEAT_TIMEOUT_SECS", default_value = "30")]
    heartbeat_timeout_secs: u64,

    /// Seconds an empty room lingers before teardown
    #[arg(long, env = "CANVAS_GRACE_SECS", default_value = "5")]
    grace_secs: u64,

    /// Largest accepted file data URL, in bytes
    #[arg(long, env = "CANVAS_MAX_FILE_BYTES", default_value = "4194304")]
    max_file_bytes: usize,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let mut room = RoomConfig {
            flush_debounce: Duration::from_millis(self.flush_debounce_ms),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            grace_period: Duration::from_secs(self.grace_secs),
            ..RoomConfig::default()
        };
        room.gate.max_data_url_bytes = self.max_file_bytes;

        ServerConfig {
            bind_addr: self.bind.clone(),
            storage_path: self.data_dir.clone(),
            room,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    log::info!("Starting canvas-sync...");
    let server = SyncServer::open(cli.server_config())?;
    let broker = server.broker().clone();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted; flushing rooms");
            broker.shutdown().await;
        }
    }
    Ok(())
}
