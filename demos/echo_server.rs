//! Echo server example

use async_trait::async_trait;
use rust_packet_network::{
    Connection, ConnectionHandler, RawPacket, RawProtocol, ServerNetwork, ServerNetworkConfig,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Echo handler that sends back received packets
struct EchoHandler;

#[async_trait]
impl ConnectionHandler<RawProtocol> for EchoHandler {
    async fn on_connected(&self, connection: &Arc<Connection<RawProtocol>>) {
        println!(
            "Client connected: {} (ID: {})",
            connection.remote_address(),
            connection.id()
        );
    }

    async fn on_packet(&self, connection: &Arc<Connection<RawProtocol>>, packet: RawPacket) {
        println!(
            "Connection {} received: {}",
            connection.id(),
            String::from_utf8_lossy(packet.payload())
        );

        if let Err(e) = connection.send(packet) {
            eprintln!("Failed to send echo: {}", e);
        }
    }

    async fn on_disconnected(&self, connection: &Arc<Connection<RawProtocol>>) {
        println!(
            "Client disconnected: {} (uptime: {:?})",
            connection.id(),
            connection.uptime()
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServerNetworkConfig::new()
        .with_port_range(8080..=8090)
        .with_max_connections(100);
    let server = ServerNetwork::new(config, RawProtocol)?;
    server.serve(Arc::new(EchoHandler));

    let address = server.start()?;
    println!("Echo server listening on {}", address);

    let started = Instant::now();
    server.schedule_at_fixed_rate(
        Duration::from_secs(30),
        Duration::from_secs(30),
        move || async move {
            tracing::info!("echo server up for {:?}", started.elapsed());
        },
    );

    println!("Press Enter to stop");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    server.shutdown();
    println!("Server stopped");
    Ok(())
}
