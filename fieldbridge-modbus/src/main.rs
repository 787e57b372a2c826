//! FieldBridge daemon for Modbus TCP devices.
//!
//! Loads devices from a JSON5 configuration file and/or CLI flags, starts
//! one bridge per device and polls until interrupted.

use anyhow::{Context, Result, bail};
use clap::Parser;
use fieldbridge_common::LoggingConfig;
use fieldbridge_modbus::ModbusBridge;
use fieldbridge_modbus::config::{AddressRange, BridgeConfig, ConnectionPolicy, DeviceConfig};
use std::path::PathBuf;
use tracing::info;

/// FieldBridge for Modbus TCP devices.
#[derive(Parser, Debug)]
#[command(name = "fieldbridge-modbus")]
#[command(about = "Polls Modbus TCP devices into a quality-tagged tag cache")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Modbus host address; defines an additional device next to the config file
    #[arg(long, env = "MODBUS_HOST")]
    modbus_host: Option<String>,

    /// Modbus TCP port
    #[arg(long, env = "MODBUS_PORT", default_value_t = 502)]
    modbus_port: u16,

    /// Poll rate in milliseconds
    #[arg(long, env = "MODBUS_POLLRATE", default_value_t = 1000)]
    modbus_pollrate: u64,

    /// Modbus unit id
    #[arg(long, env = "MODBUS_UNITID", default_value_t = 1)]
    modbus_unit_id: u8,

    /// Disable one-based addresses
    #[arg(long)]
    modbus_not_onebased: bool,

    /// Holding register ranges (<address> or <address>:<count>)
    #[arg(long, num_args = 1..)]
    modbus_holdingregister: Vec<AddressRange>,

    /// Input register ranges (<address> or <address>:<count>)
    #[arg(long, num_args = 1..)]
    modbus_inputregisters: Vec<AddressRange>,

    /// Coil ranges (<address> or <address>:<count>)
    #[arg(long, num_args = 1..)]
    modbus_coils: Vec<AddressRange>,

    /// Discrete input ranges (<address> or <address>:<count>)
    #[arg(long, num_args = 1..)]
    modbus_discreteinputs: Vec<AddressRange>,
}

impl Args {
    /// Build the device defined by CLI flags, if a host was given.
    fn cli_device(&self) -> Option<DeviceConfig> {
        let host = self.modbus_host.clone()?;
        Some(DeviceConfig {
            host,
            port: self.modbus_port,
            unit_id: self.modbus_unit_id,
            poll_interval_ms: self.modbus_pollrate,
            one_based: !self.modbus_not_onebased,
            connection: ConnectionPolicy::default(),
            holding_registers: self.modbus_holdingregister.clone(),
            input_registers: self.modbus_inputregisters.clone(),
            coils: self.modbus_coils.clone(),
            discrete_inputs: self.modbus_discreteinputs.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BridgeConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => BridgeConfig::default(),
    };

    if let Some(device) = args.cli_device() {
        config.devices.push(device);
    }

    if config.devices.is_empty() {
        bail!("No devices configured; provide --config or --modbus-host");
    }
    config.validate()?;

    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    fieldbridge_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting fieldbridge-modbus");

    let mut bridges = Vec::new();
    for device in &config.devices {
        info!(device = %device.label(), ranges = device.ranges().len(), "Starting device bridge");
        let bridge = ModbusBridge::connect(device);
        bridge.start_configured_polls(device);
        bridges.push(bridge);
    }

    info!(devices = bridges.len(), "Bridge running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    for bridge in &bridges {
        bridge.shutdown().await;
    }

    info!("Modbus bridge stopped");
    Ok(())
}
