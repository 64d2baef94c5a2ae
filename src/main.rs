//! Thin CLI wrapper around the library client.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tor_client::client::TorClient;
use tor_client::config::Config;

#[derive(Parser, Debug)]
#[command(name = "tor-client", about = "Minimal Tor client with a SOCKS5 front end")]
struct Args {
    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// SOCKS5 listen port (overrides the config file)
    #[arg(long)]
    socks_port: Option<u16>,

    /// Data directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = match args.config {
        Some(path) => match Config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("config error: {}", e);
                return std::process::ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    if let Some(port) = args.socks_port {
        config.socks_port = port;
    }
    if let Some(dir) = args.data_dir {
        config.data_directory = dir;
    }
    if let Err(e) = config.validate() {
        eprintln!("config error: {}", e);
        return std::process::ExitCode::FAILURE;
    }

    let client = match TorClient::bootstrap(config).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("bootstrap failed: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    };

    let runner = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run().await })
    };

    tokio::select! {
        result = runner => {
            match result {
                Ok(Ok(())) => std::process::ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    eprintln!("client error: {}", e);
                    std::process::ExitCode::FAILURE
                }
                Err(e) => {
                    eprintln!("client task panicked: {}", e);
                    std::process::ExitCode::FAILURE
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            client.shutdown().await;
            std::process::ExitCode::SUCCESS
        }
    }
}
