// src/bin/beskar-mirror.rs

//! Entry point of the mirror plugin.

use anyhow::Result;
use beskar::config::{Config, LogFormat};
use beskar::plugins::mirror;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("serve");

    match command {
        "version" => {
            println!("beskar-mirror version {VERSION}");
            Ok(())
        }
        "serve" => {
            let config_path = args
                .iter()
                .position(|arg| arg == "--config")
                .and_then(|i| args.get(i + 1))
                .map(String::as_str)
                .unwrap_or("beskar-mirror.yaml");
            let config = match Config::from_file(config_path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to load configuration from \"{config_path}\": {e}");
                    std::process::exit(1);
                }
            };

            let level = env::var("RUST_LOG").unwrap_or_else(|_| config.log.level.clone());
            match config.log.format {
                LogFormat::Text => tracing_subscriber::fmt()
                    .with_env_filter(EnvFilter::new(level))
                    .compact()
                    .init(),
                LogFormat::Json => tracing_subscriber::fmt()
                    .with_env_filter(EnvFilter::new(level))
                    .json()
                    .init(),
            }

            if let Err(e) = mirror::serve(config).await {
                error!("Plugin runtime error: {e}");
                return Err(e);
            }
            Ok(())
        }
        other => {
            eprintln!("Unknown command '{other}'. Usage: beskar-mirror [serve|version] [--config path]");
            std::process::exit(2);
        }
    }
}
