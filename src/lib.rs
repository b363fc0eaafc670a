use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use log::{info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigFile;
use crate::config::types::Config;
use crate::device::btle::BtleTransport;
use crate::device::connection::ConnectionManager;
use crate::error::{AppRunError, ConfigError};
use crate::service::orchestrator::StatusDeliveryOrchestrator;
use crate::status::log_monitor::LogStatusSource;

pub mod config;
pub mod device;
pub mod error;
pub mod service;
pub mod status;

/// Mirrors the chat client's presence onto a BLE status light.
#[derive(Debug, Default, Parser)]
#[command(version, about)]
pub struct Args {
    /// Seconds between two checks of the chat client's log
    #[arg(short, long = "interval")]
    pub interval: Option<u64>,

    /// Log file or log directory of the chat client
    #[arg(short, long)]
    pub log_path: Option<PathBuf>,

    /// Advertised name of the status light
    #[arg(short, long)]
    pub device_name: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Command line flags take precedence over the config file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(interval) = self.interval {
            config.check_interval_seconds = interval;
        }
        if let Some(log_path) = &self.log_path {
            config.log_path = Some(log_path.clone());
        }
        if let Some(device_name) = &self.device_name {
            config.device_name = device_name.clone();
        }
        if self.verbose {
            config.verbose = true;
        }
    }
}

pub fn init_logging(verbose: bool) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::Debug)
        .level_for("btleplug", LevelFilter::Info)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");

    // the config file may still turn on debug logging
    log::set_max_level(if verbose { LevelFilter::Debug } else { LevelFilter::Info });
}

async fn run_service(args: Args) -> Result<(), AppRunError> {
    let config_file = ConfigFile::open_default()?;
    let mut instance_lock = config_file.instance_lock()?;
    let _instance_guard = instance_lock.acquire()?;

    let mut config = config_file.read_or_init().await?;
    args.apply(&mut config);
    if config.verbose {
        log::set_max_level(LevelFilter::Debug);
    }

    let log_path = config.resolved_log_path().ok_or(ConfigError::NoLogPath)?;
    info!("Device name: {:?}", config.device_name);
    info!("Chat client log: {}", log_path.to_string_lossy());

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down..."),
            Err(err) => warn!("Failed to listen for Ctrl-C: {}", err),
        }
        ctrl_c_cancel.cancel();
    });

    let transport = Arc::new(BtleTransport::new().await?);
    let manager = ConnectionManager::new(transport, config.device_name.clone(), cancel.clone());
    let source = LogStatusSource::new(log_path);

    StatusDeliveryOrchestrator::new(source, manager, config.delivery())
        .start(cancel)
        .await?;

    info!("Service stopped");
    Ok(())
}

pub fn run(args: Args) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    runtime.block_on(run_service(args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from(["presence-beacon", "-i", "10", "-d", "Simblee", "--verbose"]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.check_interval_seconds, 10);
        assert_eq!(config.device_name, "Simblee");
        assert!(config.verbose);
        assert_eq!(config.log_path, None);
    }

    #[test]
    fn no_flags_keep_config() {
        let mut config = Config { device_name: "Simblee".to_string(), ..Config::default() };
        Args::default().apply(&mut config);

        assert_eq!(config.device_name, "Simblee");
        assert_eq!(config.check_interval_seconds, 5);
    }
}
