//! Relay server entry point.
//!
//! Configuration comes from `QUILL_RELAY_*` environment variables, with a
//! `.env` file in the working directory honoured:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `QUILL_RELAY_BIND_ADDR` | `127.0.0.1:9090` |
//! | `QUILL_RELAY_MAX_SUBSCRIPTIONS` | `64` |
//! | `QUILL_RELAY_BROADCAST_CAPACITY` | `256` |

use log::{error, info};
use quill_collab::{RelayConfig, RelayServer};

fn load_config() -> Result<RelayConfig, envy::Error> {
    dotenvy::dotenv().ok();
    envy::prefixed("QUILL_RELAY_").from_env::<RelayConfig>()
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid relay configuration: {e}");
            std::process::exit(2);
        }
    };
    info!("Starting quill relay on {}", config.bind_addr);

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down after {} connections, {} frames",
                stats.total_connections, stats.total_frames
            );
        }
    }
}
