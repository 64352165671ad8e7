//! Loopback demo: a producer and a consumer attachment in one process,
//! exchanging messages over an anonymous shared region with the full
//! doorbell → interrupt → drain path in between.
//!
//! ```sh
//! cargo run -p chime --example pingpong -- --messages 8
//! ```

use std::time::Duration;

use clap::Parser;

#[derive(Parser)]
#[command(name = "pingpong")]
#[command(about = "Send messages across a loopback shared region")]
struct Cli {
    /// Number of messages to send.
    #[arg(long, default_value_t = 4)]
    messages: u32,

    /// Payload size in bytes.
    #[arg(long, default_value_t = 32)]
    payload_size: usize,

    /// Shared region size in bytes.
    #[arg(long, default_value_t = 1 << 16)]
    region_size: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let (producer, mut consumer) = chime::loopback::attached_pair(cli.region_size)?;
    tracing::info!(
        producer_id = producer.local_id(),
        consumer_id = consumer.local_id(),
        region_size = cli.region_size,
        "attached loopback pair"
    );

    let mut drained = consumer.start_drain()?;

    for i in 0..cli.messages {
        let mut payload = format!("ping {}", i).into_bytes();
        payload.resize(cli.payload_size, b'.');
        producer.send(&payload)?;

        let message = tokio::time::timeout(Duration::from_secs(1), drained.recv())
            .await?
            .ok_or("drain channel closed")?;
        println!("{} -> {}", i, String::from_utf8_lossy(&message));
    }

    tracing::info!(messages = cli.messages, "all messages drained");
    Ok(())
}
