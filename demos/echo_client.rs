//! Echo client example

use rust_packet_network::{ClientNetwork, NetworkConfig, RawPacket, RawProtocol};
use std::net::SocketAddr;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let address: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .parse()?;

    let config = NetworkConfig::default()
        .with_thread_group_name("echo-client")
        .with_max_connect_attempts(3);
    let client = ClientNetwork::new(config, RawProtocol)?;

    println!("Connecting to {}...", address);
    let connection = client.connect_async(address).await?;
    println!("Connected!");

    let mut replies = connection.received_packets();
    for i in 1..=5 {
        let text = format!("Hello #{}", i);
        println!("Sending: {}", text);
        connection.send_with_feedback(RawPacket::from(text)).await?;

        match tokio::time::timeout(Duration::from_secs(5), replies.recv()).await {
            Ok(Some(reply)) => println!("Received: {}", String::from_utf8_lossy(reply.payload())),
            Ok(None) => {
                println!("Server closed the connection");
                break;
            }
            Err(_) => println!("No reply within 5s"),
        }
    }

    client.shutdown();
    println!("Disconnected");
    Ok(())
}
