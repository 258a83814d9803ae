//! Agora server — runs the room broadcast hub.
//!
//! Configured through `AGORA_*` environment variables (see
//! [`agora_hub::config`]); logging through `RUST_LOG`.

use log::{error, info};

use agora_hub::{HubServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env().inspect_err(|e| error!("Invalid configuration: {e}"))?;
    info!("Starting Agora hub on {}...", config.bind_addr);

    let server = HubServer::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
