use clap::Parser;
use client::network::Client;
use client::session::ClientConfig;
use log::{info, warn};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:27960")]
    server: String,

    /// Player name
    #[arg(short = 'n', long, default_value = "player")]
    name: String,

    /// Archive to download before entering the world (repeatable)
    #[arg(short = 'd', long = "download")]
    downloads: Vec<String>,

    /// Directory downloaded archives are written to
    #[arg(long, default_value = "downloads")]
    download_dir: PathBuf,

    /// Frames to play before disconnecting; runs until dropped if absent
    #[arg(short = 'f', long)]
    frames: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let mut config = ClientConfig::new(&args.name);
    config.downloads = args.downloads;

    let mut client = Client::new(&args.server, config).await?;
    let result = client.run(args.frames).await;

    let downloads = client.session().completed_downloads();
    if !downloads.is_empty() {
        std::fs::create_dir_all(&args.download_dir)?;
    }
    for download in downloads {
        let file_name = Path::new(&download.name).file_name().unwrap_or_default();
        let path = args.download_dir.join(file_name);
        std::fs::write(&path, &download.data)?;
        info!("Saved {} ({} bytes)", path.display(), download.data.len());
    }
    for refusal in client.session().download_refusals() {
        warn!("{}", refusal);
    }

    result?;
    Ok(())
}
