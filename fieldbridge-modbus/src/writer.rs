//! Write dispatch.
//!
//! Converts a raw externally-supplied value into a protocol-specific
//! single-point write. Failures are reported as a boolean result, never
//! raised: the supervisory layer that initiated the write decides what to
//! do, and the poll schedule is unaffected either way. A successful write
//! does not refresh the cache; the next tick of the owning range observes
//! the new value.

use crate::connection::{ConnectionManager, close_reason};
use fieldbridge_common::RegisterKind;
use tokio_modbus::client::Writer;
use tracing::{debug, warn};

/// Parse the raw representation of a holding register value.
pub(crate) fn parse_register_value(raw: &str) -> Option<u16> {
    raw.trim().parse().ok()
}

/// Parse the raw representation of a coil value.
///
/// The literal string `"true"` means true; anything else means false.
pub(crate) fn parse_coil_value(raw: &str) -> bool {
    raw == "true"
}

enum WriteOp {
    Register(u16),
    Coil(bool),
}

/// Dispatch one write request. Returns whether the device acknowledged it.
pub(crate) async fn dispatch_write(
    conn: &ConnectionManager,
    kind: RegisterKind,
    address: u16,
    raw: &str,
) -> bool {
    match kind {
        RegisterKind::Holding => {
            let Some(value) = parse_register_value(raw) else {
                warn!(kind = %kind, address, raw, "Write value is not a 16-bit integer");
                return false;
            };
            write_single(conn, address, WriteOp::Register(value)).await
        }
        RegisterKind::Coil => {
            write_single(conn, address, WriteOp::Coil(parse_coil_value(raw))).await
        }
        RegisterKind::Input | RegisterKind::Discrete => {
            warn!(kind = %kind, address, "Register kind does not support writes");
            false
        }
    }
}

async fn write_single(conn: &ConnectionManager, address: u16, op: WriteOp) -> bool {
    let shared = conn.context();
    let mut slot = shared.lock().await;
    let Some(ctx) = slot.as_mut() else {
        warn!(address, "Write skipped, not connected");
        return false;
    };

    let result = match &op {
        WriteOp::Register(value) => ctx.write_single_register(address, *value).await,
        WriteOp::Coil(value) => ctx.write_single_coil(address, *value).await,
    };
    drop(slot);

    match result {
        Ok(Ok(())) => {
            match op {
                WriteOp::Register(value) => {
                    debug!(address, value, "Holding register write acknowledged")
                }
                WriteOp::Coil(value) => debug!(address, value, "Coil write acknowledged"),
            }
            true
        }
        Ok(Err(code)) => {
            warn!(address, exception = ?code, "Write rejected by device");
            false
        }
        Err(e) => {
            warn!(address, error = %e, "Write failed");
            conn.report_close(close_reason(&e));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ValueCache;
    use crate::config::DeviceConfig;

    fn offline_manager() -> ConnectionManager {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let device: DeviceConfig = json5::from_str(&format!(
            r#"{{ host: "127.0.0.1", port: {}, connection: {{ retry_time_ms: 5000 }} }}"#,
            port
        ))
        .unwrap();
        ConnectionManager::connect(&device, ValueCache::new())
    }

    #[test]
    fn test_parse_register_value() {
        assert_eq!(parse_register_value("42"), Some(42));
        assert_eq!(parse_register_value(" 42 "), Some(42));
        assert_eq!(parse_register_value("65535"), Some(65535));
        assert_eq!(parse_register_value("65536"), None);
        assert_eq!(parse_register_value("-1"), None);
        assert_eq!(parse_register_value("abc"), None);
    }

    #[test]
    fn test_parse_coil_value() {
        assert!(parse_coil_value("true"));
        assert!(!parse_coil_value("false"));
        assert!(!parse_coil_value("TRUE"));
        assert!(!parse_coil_value("1"));
        assert!(!parse_coil_value(""));
    }

    #[tokio::test]
    async fn test_read_only_kinds_report_failure() {
        let conn = offline_manager();
        assert!(!dispatch_write(&conn, RegisterKind::Input, 5, "1").await);
        assert!(!dispatch_write(&conn, RegisterKind::Discrete, 5, "true").await);
        conn.end().await;
    }

    #[tokio::test]
    async fn test_unparsable_register_value_reports_failure() {
        let conn = offline_manager();
        assert!(!dispatch_write(&conn, RegisterKind::Holding, 5, "not-a-number").await);
        conn.end().await;
    }

    #[tokio::test]
    async fn test_write_while_disconnected_reports_failure() {
        let conn = offline_manager();
        assert!(!dispatch_write(&conn, RegisterKind::Holding, 5, "42").await);
        assert!(!dispatch_write(&conn, RegisterKind::Coil, 5, "true").await);
        conn.end().await;
    }
}
