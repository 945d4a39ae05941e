//! Connect to a device and print lifecycle and contact activity.
//!
//! ```sh
//! cargo run --example monitor -- ws://device.local:8080/api/v1/ws http://device.local:8080
//! ```

use skywatch_client::{ClientConfig, Lifecycle, TelemetryClient};
use skywatch_core::EventType;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,skywatch_client=debug".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let mut config = ClientConfig::default();
    if let Some(ws_url) = args.next() {
        config.ws_url = ws_url;
    }
    if let Some(rest_base) = args.next() {
        config.rest_base = rest_base;
    }

    let client = TelemetryClient::new(config);
    client.init();

    let _connected = client.on(Lifecycle::Connected, |_, _| {
        tracing::info!("link up");
    });
    let _disconnected = client.on(Lifecycle::Disconnected, |_, _| {
        tracing::warn!("link down");
    });
    let _terminal = client.on(Lifecycle::MaxReconnectReached, |_, _| {
        tracing::error!("reconnect budget exhausted; call reconnect() to retry");
    });

    let _new = client.on(EventType::ContactNew, |data, _| {
        tracing::info!(id = %data["id"], kind = %data["type"], "contact new");
    });
    let _lost = client.on(EventType::ContactLost, |data, _| {
        tracing::info!(id = %data["id"], "contact lost");
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!(contacts = client.contact_count(), "shutting down");
    client.shutdown().await;
    Ok(())
}
