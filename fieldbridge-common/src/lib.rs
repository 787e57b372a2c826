//! FieldBridge Common Library
//!
//! This crate provides shared types and utilities for FieldBridge device
//! bridges:
//!
//! - [`tag`] - Tag data model (`RegisterKind`, `TagValue`, `Quality`, `TagReading`)
//! - [`config`] - Configuration loading (JSON5 format) and logging settings
//! - [`error`] - Error types
//!
//! A supervisory layer (OPC UA server, gateway, test harness) consumes the
//! [`tag`] types when mapping bridge accessors onto its own address space.

pub mod config;
pub mod error;
pub mod tag;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use tag::{Quality, RegisterKind, TagDataType, TagReading, TagValue};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
