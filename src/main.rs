use std::sync::Arc;
use std::time::Duration;

use bloomd::config::ServerConfig;
use bloomd::logging::init_logging;
use bloomd::manager::Manager;
use bloomd::server::{bind_udp_socket, Server};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> bloomd::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config.validate()?;

    init_logging(&config.log_level)?;
    tracing::info!(port = config.port, udp_port = config.udp_port, "starting bloomd");

    let manager = Arc::new(Manager::discover(&config).await?);

    let tcp_listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let udp_socket = bind_udp_socket(format!("0.0.0.0:{}", config.udp_port).parse().unwrap())?;

    tokio::spawn(manager.clone().run_flush_scheduler(Duration::from_secs(config.flush_interval)));
    tokio::spawn(manager.clone().run_cold_sweep_scheduler(Duration::from_secs(config.cold_interval)));

    let server = Server::new(tcp_listener, udp_socket, manager);
    server.run().await
}
