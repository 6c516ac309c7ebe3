//! Thin startup binary for the reflector.
//!
//! Loads configuration (TOML file plus CLI overrides), initializes
//! logging, and runs the reflector until interrupted.
//!
//! Exit codes: 0 clean shutdown, 1 initialization failure, 2 fatal
//! runtime error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use reflector::{Reflector, ReflectorConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reflectord", version, about = "Audio reflector for amateur-radio VoIP nodes")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the TCP+UDP listen port.
    #[arg(long, value_name = "PORT")]
    listen_port: Option<u16>,

    /// Override the shared authentication key.
    #[arg(long, value_name = "KEY")]
    auth_key: Option<String>,
}

fn load_config(args: &Args) -> Result<ReflectorConfig, reflector::ReflectorError> {
    let mut config = match &args.config {
        Some(path) => ReflectorConfig::from_toml_file(path)?,
        None => ReflectorConfig::default(),
    };
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if let Some(key) = &args.auth_key {
        config.auth_key = key.clone();
    }
    Ok(config)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "initialization failed");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async {
        let reflector = match Reflector::bind(config).await {
            Ok(reflector) => reflector,
            Err(e) => {
                tracing::error!(error = %e, "initialization failed");
                return ExitCode::from(1);
            }
        };

        tokio::select! {
            result = reflector.run() => match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "fatal runtime error");
                    ExitCode::from(2)
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                ExitCode::SUCCESS
            }
        }
    })
}
