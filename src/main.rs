use std::{path::PathBuf, process::ExitCode};

use ::tracing::error;
use clap::Parser;
use service::Service;

mod abort;
mod checker;
mod config;
mod data_model;
mod health;
mod load_balancer;
mod notifier;
mod service;
mod state_store;
mod tracing;
use tracing::setup_tracing;
mod utils;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match config::ServerConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error loading config: {err:#}");
                return ExitCode::FAILURE;
            }
        },
        None => config::ServerConfig::default(),
    };

    if let Err(err) = setup_tracing(&config) {
        eprintln!("Error setting up tracing: {err:#}");
        return ExitCode::FAILURE;
    }

    let mut service = match Service::new(config) {
        Ok(service) => service,
        Err(err) => {
            error!("Error creating service: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = service.start().await {
        error!("Error running service: {err:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
