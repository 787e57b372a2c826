//! Per-device bridge facade.
//!
//! A [`ModbusBridge`] owns everything belonging to one device: the
//! connection supervisor, the tag cache and the poll jobs. Instances are
//! independent; running several devices means constructing several bridges,
//! with no shared mutable state between them.

use crate::address::{AddressError, check_range, effective_address};
use crate::cache::ValueCache;
use crate::config::DeviceConfig;
use crate::connection::{ConnectionManager, LinkState};
use crate::poller::{PollHandle, PollJob, spawn_poll};
use crate::writer::dispatch_write;
use fieldbridge_common::{RegisterKind, TagDataType, TagReading};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Live bridge to one Modbus TCP device.
///
/// Reads are served from the cache only; the device is never contacted on
/// the read path. Writes go to the device directly and are reflected in the
/// cache by the next poll tick of the owning range.
pub struct ModbusBridge {
    connection: Arc<ConnectionManager>,
    cache: ValueCache,
    polls: Mutex<Vec<PollHandle>>,
    one_based: bool,
    label: String,
}

impl ModbusBridge {
    /// Create a bridge and start connecting to the device.
    pub fn connect(config: &DeviceConfig) -> Self {
        let cache = ValueCache::new();
        let connection = Arc::new(ConnectionManager::connect(config, cache.clone()));
        info!(device = %config.label(), "Created Modbus device bridge");

        Self {
            connection,
            cache,
            polls: Mutex::new(Vec::new()),
            one_based: config.one_based,
            label: config.label(),
        }
    }

    /// Register a recurring poll for a configured address range.
    ///
    /// `address` is the configured (possibly one-based) starting address;
    /// it is normalized before the job is created. Rejected ranges create
    /// no job. Tags are keyed `root` + effective address, so roots must be
    /// unique per register kind.
    pub fn start_poll(
        &self,
        root: impl Into<String>,
        kind: RegisterKind,
        address: i32,
        count: u16,
        interval: Duration,
    ) -> Result<(), AddressError> {
        let start = effective_address(address, self.one_based)?;
        check_range(start, count)?;

        let job = PollJob {
            root: root.into(),
            kind,
            address: start,
            count,
            interval,
        };
        info!(
            device = %self.label,
            root = %job.root,
            kind = %kind,
            address = start,
            count,
            "Registering poll job"
        );

        let handle = spawn_poll(Arc::clone(&self.connection), self.cache.clone(), job);
        self.lock_polls().push(handle);
        Ok(())
    }

    /// Register poll jobs for every range in the device configuration,
    /// using the register kind name as the tag root.
    ///
    /// Invalid ranges are logged and skipped; valid ones still start.
    pub fn start_configured_polls(&self, config: &DeviceConfig) {
        for (kind, range) in config.ranges() {
            if let Err(e) = self.start_poll(
                kind.as_str(),
                kind,
                range.address,
                range.count,
                config.poll_interval(),
            ) {
                error!(
                    device = %self.label,
                    kind = %kind,
                    range = %range,
                    error = %e,
                    "Rejected address range, no poll job created"
                );
            }
        }
    }

    /// Read the cached value and quality of a tag.
    pub fn read_value(&self, tag: &str) -> TagReading {
        self.cache.read(tag)
    }

    /// Write a raw value to the device at an effective (zero-based)
    /// address. Returns whether the device acknowledged the write.
    pub async fn write_value(&self, kind: RegisterKind, address: u16, raw: &str) -> bool {
        dispatch_write(&self.connection, kind, address, raw).await
    }

    /// Semantic data type for tags of a register kind, for mapping onto an
    /// external type system.
    pub fn data_type(&self, kind: RegisterKind) -> TagDataType {
        kind.data_type()
    }

    /// Current connectivity state of the device link.
    pub fn link_state(&self) -> LinkState {
        self.connection.state()
    }

    /// Subscribe to connectivity transitions.
    pub fn watch_link_state(&self) -> watch::Receiver<LinkState> {
        self.connection.watch_state()
    }

    /// Number of registered poll jobs.
    pub fn poll_count(&self) -> usize {
        self.lock_polls().len()
    }

    /// Stop all poll jobs and close the connection permanently.
    pub async fn shutdown(&self) {
        info!(device = %self.label, "Shutting down bridge");
        let handles: Vec<PollHandle> = self.lock_polls().drain(..).collect();
        for handle in handles {
            handle.shutdown().await;
        }
        self.connection.end().await;
    }

    fn lock_polls(&self) -> std::sync::MutexGuard<'_, Vec<PollHandle>> {
        match self.polls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(device = %self.label, "Poll handle list lock poisoned");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldbridge_common::Quality;
    use tokio::time::sleep;

    fn dead_device() -> DeviceConfig {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        json5::from_str(&format!(
            r#"{{ host: "127.0.0.1", port: {}, connection: {{ retry_time_ms: 5000 }} }}"#,
            port
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_unpolled_tag_reads_unavailable() {
        let bridge = ModbusBridge::connect(&dead_device());
        assert_eq!(
            bridge.read_value("holding100").quality,
            Quality::BadDataUnavailable
        );
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_negative_address_rejected_without_job() {
        let bridge = ModbusBridge::connect(&dead_device());

        let result = bridge.start_poll(
            "holding",
            RegisterKind::Holding,
            -1,
            4,
            Duration::from_millis(10),
        );

        assert_eq!(result, Err(AddressError::Negative(-1)));
        assert_eq!(bridge.poll_count(), 0);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_based_poll_marks_effective_addresses() {
        let bridge = ModbusBridge::connect(&dead_device());

        // Device defaults to one-based: configured address 1 is device 0.
        bridge
            .start_poll(
                "holding",
                RegisterKind::Holding,
                1,
                2,
                Duration::from_millis(10),
            )
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while bridge.read_value("holding0").quality == Quality::BadDataUnavailable {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("poll job never ran");

        assert_eq!(bridge.read_value("holding0").quality, Quality::BadNotConnected);
        assert_eq!(bridge.read_value("holding1").quality, Quality::BadNotConnected);
        // The configured (unshifted) upper bound was not polled.
        assert_eq!(bridge.read_value("holding2").quality, Quality::BadDataUnavailable);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_configured_polls_skip_invalid_ranges() {
        let mut config = dead_device();
        config.holding_registers = vec![
            "1:2".parse().unwrap(),
            "-5".parse().unwrap(),
        ];
        config.coils = vec!["3".parse().unwrap()];

        let bridge = ModbusBridge::connect(&config);
        bridge.start_configured_polls(&config);

        // The negative range is rejected, the two valid ones start.
        assert_eq!(bridge.poll_count(), 2);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_data_type_descriptors() {
        let bridge = ModbusBridge::connect(&dead_device());
        assert_eq!(bridge.data_type(RegisterKind::Holding), TagDataType::Integer);
        assert_eq!(bridge.data_type(RegisterKind::Discrete), TagDataType::Boolean);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_to_disconnected_device_fails() {
        let bridge = ModbusBridge::connect(&dead_device());
        assert!(!bridge.write_value(RegisterKind::Coil, 5, "true").await);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_polling() {
        let bridge = ModbusBridge::connect(&dead_device());
        bridge
            .start_poll(
                "coil",
                RegisterKind::Coil,
                1,
                1,
                Duration::from_millis(10),
            )
            .unwrap();

        bridge.shutdown().await;
        assert_eq!(bridge.poll_count(), 0);

        // Cached readings survive shutdown; only polling stops.
        let quality = bridge.read_value("coil0").quality;
        assert!(
            quality == Quality::BadNotConnected || quality == Quality::BadDataUnavailable,
            "unexpected quality {:?}",
            quality
        );
    }
}
