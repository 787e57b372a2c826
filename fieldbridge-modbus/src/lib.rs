//! FieldBridge for Modbus TCP devices.
//!
//! Polls register and coil ranges of field devices over a persistent TCP
//! connection and caches the most recent value of every tag together with a
//! quality flag reflecting connection and read health. A supervisory layer
//! exposes live tags by calling [`ModbusBridge::read_value`] and accepts
//! writes through [`ModbusBridge::write_value`].
//!
//! # Tag identifiers
//!
//! ```text
//! <root><effective_address>
//! ```
//!
//! Where:
//! - `<root>` - Caller-supplied root name, unique per device and register kind
//! - `<effective_address>` - Zero-based device address after one-based adjustment

pub mod address;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod connection;
pub mod poller;
pub mod writer;

pub use address::{AddressError, effective_address, tag_id};
pub use bridge::ModbusBridge;
pub use cache::ValueCache;
pub use config::{AddressRange, BridgeConfig, ConnectionPolicy, DeviceConfig};
pub use connection::{CloseReason, ConnectionManager, LinkState};
pub use poller::{PollHandle, PollJob};
