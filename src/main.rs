//! Gymnasticon entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gymnasticon::app;
use gymnasticon::cli::Cli;
use gymnasticon::config::{Settings, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting gymnasticon v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut settings = match Settings::load(&config_path) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!("{}", err);
            return ExitCode::from(1);
        }
    };
    settings.apply_cli(&cli);

    match app::run(settings).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::from(1)
        }
    }
}
