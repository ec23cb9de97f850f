use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::{Server, ServerEvent};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = ServerConfig::parse();

    info!("Starting server on map {}", config.map);
    info!("{} slots, {} fps", config.max_clients, config.fps);
    if config.pure {
        info!("Pure mode enabled");
    }

    let mut server = Server::new(config).await?;
    let handle = server.handle();

    // Operator console on stdin
    let console = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if console.send(ServerEvent::Console(line)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Console read failed: {}", e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            let _ = handle.send(ServerEvent::Shutdown);
        }
    });

    server.run().await?;

    Ok(())
}
