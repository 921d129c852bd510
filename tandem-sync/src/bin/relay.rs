//! Standalone pub/sub relay for `WsTransport` clients.
//!
//! Usage: `tandem-relay [bind-addr]` (or set `TANDEM_RELAY_ADDR`).

use tandem_sync::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TANDEM_RELAY_ADDR").ok())
    {
        config.bind_addr = addr;
    }

    log::info!("Starting tandem relay on {}...", config.bind_addr);
    let server = RelayServer::bind(config).await?;
    server.run().await
}
