//! hrp-monitor
//!
//! Connects to a Bluetooth Smart heart rate sensor, prints every processed sample and
//! optionally forwards the samples to UDP, CSV and bridge sinks.
//!
//! Usage:
//!   hrp-monitor --device "Polar H10" --udp 127.0.0.1:9000

use anyhow::{Context, Result};
use btleplug::platform::Adapter;
use clap::Parser;
use env_logger::Env;
use hrp_monitor::api::logger::HrmLogger;
use hrp_monitor::api::monitor::HeartRateMonitor;
use hrp_monitor::components::bridge::BridgeRelay;
use hrp_monitor::components::btle::BtleStack;
use hrp_monitor::components::csv_logger::CsvLogger;
use hrp_monitor::components::session::HrpSession;
use hrp_monitor::components::udp_logger::UdpLogger;
use hrp_monitor::core::constants::DEFAULT_LOGGER_DELIMITER;
use hrp_monitor::core::error::HrpError;
use hrp_monitor::core::events::MonitorEvent;
use hrp_monitor::model::config::{CsvLoggerConfig, MonitorConfig, UdpLoggerConfig};
use hrp_monitor::model::device::DeviceRef;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

/// Bluetooth Smart heart rate monitor client.
#[derive(Parser)]
#[command(name = "hrp-monitor", about = "Receive and log live heart rate samples from a BLE sensor")]
struct Cli {
    /// Sensor name or address. Defaults to the first sensor found.
    #[arg(long, short)]
    device: Option<String>,

    /// JSON configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Scan duration in seconds.
    #[arg(long, default_value_t = 5)]
    scan_seconds: u64,

    /// List the sensors found and exit.
    #[arg(long)]
    list: bool,

    /// Send every sample to this UDP destination.
    #[arg(long)]
    udp: Option<SocketAddr>,

    /// Append every sample to this file.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Number of samples averaged into the smoothed heart rate.
    #[arg(long)]
    smoothing: Option<usize>,

    /// Print bridge messages instead of samples.
    #[arg(long)]
    bridge: bool,

    /// Write the effective configuration to this file.
    #[arg(long)]
    save_config: Option<PathBuf>,
}

impl Cli {
    fn monitor_config(&self) -> Result<MonitorConfig> {
        let mut config = match &self.config {
            Some(path) => MonitorConfig::from_file(path)
                .with_context(|| format!("loading configuration {}", path.display()))?,
            None => MonitorConfig::default(),
        };
        if let Some(factor) = self.smoothing {
            config.session.smoothing_factor = factor;
        }
        if let Some(destination) = self.udp {
            let delimiter = config
                .udp_logger
                .as_ref()
                .map_or_else(|| DEFAULT_LOGGER_DELIMITER.to_owned(), |c| c.delimiter.clone());
            config.udp_logger = Some(UdpLoggerConfig {
                destination,
                delimiter,
            });
        }
        if let Some(path) = &self.csv {
            let delimiter = config
                .csv_logger
                .as_ref()
                .map_or_else(|| DEFAULT_LOGGER_DELIMITER.to_owned(), |c| c.delimiter.clone());
            config.csv_logger = Some(CsvLoggerConfig {
                path: path.clone(),
                delimiter,
            });
        }
        Ok(config)
    }
}

/// Picks the sensor matching `wanted` by name or address, or the first one.
fn select_device(devices: &[DeviceRef], wanted: Option<&str>) -> Option<DeviceRef> {
    match wanted {
        Some(wanted) => devices
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(wanted) || d.id.eq_ignore_ascii_case(wanted))
            .cloned(),
        None => devices.first().cloned(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        Env::default()
            .filter_or("HRP_LOG_LEVEL", "info")
            .write_style_or("HRP_LOG_STYLE", "always"),
    )
    .init();

    let cli = Cli::parse();
    let config = cli.monitor_config()?;
    if let Some(path) = &cli.save_config {
        config.store(path)?;
        info!("Configuration written to {}", path.display());
    }

    let stack = BtleStack::<Adapter>::discover().await?;
    info!("Scanning for {} s", cli.scan_seconds);
    let devices = stack.scan(Duration::from_secs(cli.scan_seconds)).await?;
    if cli.list {
        for device in &devices {
            println!("{}", device);
        }
        return Ok(());
    }
    let device = select_device(&devices, cli.device.as_deref()).ok_or(HrpError::NoDevice)?;

    let session = Arc::new(HrpSession::new(stack, config.session.clone()));
    session.set_device(device)?;
    let monitor: Arc<dyn HeartRateMonitor> = session;
    let mut events = monitor.subscribe();

    let mut loggers: Vec<Box<dyn HrmLogger>> = Vec::new();
    if let Some(udp) = &config.udp_logger {
        loggers.push(Box::new(UdpLogger::new(udp)));
    }
    if let Some(csv) = &config.csv_logger {
        loggers.push(Box::new(CsvLogger::new(csv)));
    }
    for logger in loggers.iter_mut() {
        logger.start(monitor.clone()).await?;
    }

    let _bridge = if cli.bridge {
        let (tx, mut rx) = mpsc::channel::<String>(16);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                println!("{}", message);
            }
        });
        Some(BridgeRelay::spawn(monitor.clone(), tx))
    } else {
        None
    };

    monitor.start().await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(MonitorEvent::PacketProcessed(packet)) if !cli.bridge => {
                    let stats = packet.statistics;
                    println!(
                        "{} bpm, smoothed {:.1}, min {:?}, max {:?}, beats {}, rr {:?}",
                        packet.sample.heart_rate,
                        stats.smoothed_heart_rate,
                        stats.min_heart_rate,
                        stats.max_heart_rate,
                        stats.heart_beats,
                        packet.sample.rr_intervals,
                    );
                }
                Ok(MonitorEvent::Timeout(reason)) => {
                    warn!("{}, restarting", reason);
                    monitor.reset().await?;
                }
                Ok(other) => debug!("{:?}", other),
                Err(RecvError::Lagged(skipped)) => warn!("{} events skipped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    info!("Shutting down");
    for logger in loggers.iter_mut() {
        logger.stop().await?;
    }
    monitor.dispose().await;
    Ok(())
}
