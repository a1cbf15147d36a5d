//! Print every event until the guest shuts down.
//!
//! Usage: `cargo run --example events -- /path/to/qmp.sock` (or `host:port`).

use aqmp::{Client, Endpoint};
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> aqmp::Result<()> {
    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/var/run/qemu-server/100.qmp".to_string());
    let endpoint: Endpoint = address.parse()?;

    let client = Client::default();
    client.connect(&endpoint).await?;

    let mut events = client.events().stream();
    while let Some(event) = events.next().await {
        println!("{event}");
        if event.event_name() == Some("SHUTDOWN") {
            break;
        }
    }

    client.disconnect().await
}
