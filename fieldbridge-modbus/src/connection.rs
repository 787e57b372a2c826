//! Connection lifecycle supervision.
//!
//! One supervisor task owns the single TCP connection to a device and drives
//! the `Connecting -> Online -> Offline -> (Connecting | parked)` state
//! machine. Poll jobs and the write dispatcher never touch the socket
//! directly: they borrow the protocol client from a shared slot and report
//! transport failures back to the supervisor, which decides whether to
//! reconnect.
//!
//! The reconnect delay is a fixed `retry_time`, not an exponential backoff:
//! a field device that has been gone for an hour is retried at the same
//! cadence as one that dropped a single frame. A clean close (the device
//! shut the connection down on purpose) only triggers a reconnect when
//! `retry_always` is set; an errored close always does.

use crate::cache::ValueCache;
use crate::config::{ConnectionPolicy, DeviceConfig};
use fieldbridge_common::Quality;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_modbus::client::{Client as _, Context, tcp};
use tokio_modbus::slave::Slave;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connectivity state published to poll jobs and external observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Actively dialing the device.
    Connecting,
    /// Connection established; reads and writes may be issued.
    Online,
    /// Connection lost or parked; a reconnect may or may not be pending.
    Offline,
}

/// How a connection ended, as observed by the operation that hit the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly shutdown by the peer (EOF).
    Clean,
    /// Reset, timeout or any other transport fault.
    Errored,
}

/// Protocol client slot shared between the supervisor and operations.
///
/// The async mutex doubles as the per-connection request queue: the client
/// issues one request at a time, so overlapping poll ticks serialize here
/// instead of racing for the transport.
pub(crate) type SharedContext = Arc<Mutex<Option<Context>>>;

/// Handle to one device connection.
///
/// Dropping the manager does not close the connection; call [`end`] for a
/// deterministic shutdown.
///
/// [`end`]: ConnectionManager::end
#[derive(Debug)]
pub struct ConnectionManager {
    ctx: SharedContext,
    state_rx: watch::Receiver<LinkState>,
    report_tx: mpsc::Sender<CloseReason>,
    cancel: CancellationToken,
    label: String,
}

impl ConnectionManager {
    /// Spawn a supervisor for the device and return its handle.
    ///
    /// The supervisor starts dialing immediately. Tags already in `cache`
    /// are coarsely invalidated whenever the connection errors out.
    pub fn connect(config: &DeviceConfig, cache: ValueCache) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (report_tx, report_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let ctx: SharedContext = Arc::new(Mutex::new(None));

        let supervisor = Supervisor {
            host: config.host.clone(),
            port: config.port,
            unit_id: config.unit_id,
            policy: config.connection.clone(),
            label: config.label(),
            ctx: Arc::clone(&ctx),
            state_tx,
            report_rx,
            cancel: cancel.clone(),
            cache,
        };
        tokio::spawn(supervisor.run());

        Self {
            ctx,
            state_rx,
            report_tx,
            cancel,
            label: config.label(),
        }
    }

    /// Current connectivity state.
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Borrowable protocol client slot.
    pub(crate) fn context(&self) -> SharedContext {
        Arc::clone(&self.ctx)
    }

    /// Report that an operation observed the connection closing.
    ///
    /// Collapses bursts: concurrent reports from multiple poll jobs result
    /// in a single reconnect cycle. No-op after [`end`](Self::end).
    pub(crate) fn report_close(&self, reason: CloseReason) {
        let _ = self.report_tx.try_send(reason);
    }

    /// Permanently close the connection.
    ///
    /// Idempotent. Cancels the supervisor, including a reconnect attempt
    /// still waiting out its delay, and disconnects the underlying client.
    /// All subsequent close reports are ignored.
    pub async fn end(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(device = %self.label, "Closing connection permanently");
        self.cancel.cancel();

        if let Some(mut ctx) = self.ctx.lock().await.take() {
            if let Err(e) = ctx.disconnect().await {
                debug!(device = %self.label, error = %e, "Disconnect on end failed");
            }
        }
    }
}

/// Supervisor task state; consumed by [`Supervisor::run`].
struct Supervisor {
    host: String,
    port: u16,
    unit_id: u8,
    policy: ConnectionPolicy,
    label: String,
    ctx: SharedContext,
    state_tx: watch::Sender<LinkState>,
    report_rx: mpsc::Receiver<CloseReason>,
    cancel: CancellationToken,
    cache: ValueCache,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.state_tx.send_replace(LinkState::Connecting);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.connect_once() => res,
            };

            match connected {
                Ok(ctx) => {
                    *self.ctx.lock().await = Some(ctx);
                    self.state_tx.send_replace(LinkState::Online);
                    info!(device = %self.label, "Online");

                    let reason = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        reason = self.report_rx.recv() => reason,
                    };
                    // Sender side lives in the manager; a closed channel
                    // means the handle is gone and nothing can revive us.
                    let Some(reason) = reason else { break };

                    self.drop_context().await;
                    self.state_tx.send_replace(LinkState::Offline);

                    match reason {
                        CloseReason::Errored => {
                            warn!(device = %self.label, "Connection closed with error");
                            // Coarse invalidation: every tag this device has
                            // ever served is suspect until the next good poll.
                            self.cache.mark_all(Quality::Bad);
                        }
                        CloseReason::Clean => {
                            info!(device = %self.label, "Connection closed by peer");
                            if !self.policy.retry_always {
                                info!(device = %self.label, "Not reconnecting");
                                self.cancel.cancelled().await;
                                break;
                            }
                            debug!(device = %self.label, "retry_always set, reconnecting");
                        }
                    }

                    // Reports queued while we were tearing down would trigger
                    // an immediate redundant reconnect cycle.
                    while self.report_rx.try_recv().is_ok() {}

                    if !self.wait_retry().await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(device = %self.label, error = %e, "Connect failed");
                    self.state_tx.send_replace(LinkState::Offline);
                    if !self.wait_retry().await {
                        break;
                    }
                }
            }
        }

        self.drop_context().await;
        self.state_tx.send_replace(LinkState::Offline);
        debug!(device = %self.label, "Supervisor stopped");
    }

    /// Dial the device and arm TCP keepalive on the fresh socket.
    async fn connect_once(&self) -> io::Result<Context> {
        let stream = timeout(
            self.policy.connect_timeout(),
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;

        let keepalive = TcpKeepalive::new()
            .with_time(self.policy.keep_alive_delay())
            .with_interval(self.policy.keep_alive_interval())
            .with_retries(self.policy.keep_alive_probes());
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

        Ok(tcp::attach_slave(stream, Slave(self.unit_id)))
    }

    /// Sleep out the reconnect delay; returns false if cancelled meanwhile.
    async fn wait_retry(&self) -> bool {
        debug!(
            device = %self.label,
            delay_ms = self.policy.retry_time().as_millis() as u64,
            "Reconnecting after delay"
        );
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(self.policy.retry_time()) => true,
        }
    }

    async fn drop_context(&self) {
        if let Some(mut ctx) = self.ctx.lock().await.take() {
            if let Err(e) = ctx.disconnect().await {
                debug!(device = %self.label, error = %e, "Disconnect failed");
            }
        }
    }
}

/// Classify a protocol-client error as a close reason.
///
/// tokio-modbus surfaces connection death as transport errors on requests
/// rather than as socket events; an orderly EOF from the peer maps to a
/// clean close, everything else counts as errored.
pub(crate) fn close_reason(err: &(dyn std::error::Error + 'static)) -> CloseReason {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return match io_err.kind() {
                io::ErrorKind::UnexpectedEof => CloseReason::Clean,
                _ => CloseReason::Errored,
            };
        }
        source = e.source();
    }
    CloseReason::Errored
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldbridge_common::TagReading;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_device(port: u16, retry_time_ms: u64, retry_always: bool) -> DeviceConfig {
        let json = format!(
            r#"{{
                host: "127.0.0.1",
                port: {},
                connection: {{ retry_time_ms: {}, retry_always: {} }}
            }}"#,
            port, retry_time_ms, retry_always
        );
        json5::from_str(&json).unwrap()
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<LinkState>,
        target: LinkState,
    ) -> Result<(), &'static str> {
        timeout(Duration::from_secs(2), async {
            loop {
                if *rx.borrow() == target {
                    return;
                }
                rx.changed().await.expect("state channel closed");
            }
        })
        .await
        .map_err(|_| "timed out waiting for state")
    }

    #[tokio::test]
    async fn test_connects_and_goes_online() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let manager = ConnectionManager::connect(&test_device(port, 100, true), ValueCache::new());
        let mut rx = manager.watch_state();

        let (_sock, _) = listener.accept().await.unwrap();
        wait_for_state(&mut rx, LinkState::Online).await.unwrap();

        manager.end().await;
    }

    #[tokio::test]
    async fn test_dial_failure_never_goes_online() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let manager = ConnectionManager::connect(&test_device(port, 50, true), ValueCache::new());
        sleep(Duration::from_millis(300)).await;
        assert_ne!(manager.state(), LinkState::Online);

        manager.end().await;
    }

    #[tokio::test]
    async fn test_errored_close_reconnects_and_invalidates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let cache = ValueCache::new();
        cache.write("holding100".to_string(), TagReading::good(7u16));

        let manager = ConnectionManager::connect(&test_device(port, 100, false), cache.clone());
        let mut rx = manager.watch_state();

        let (_first, _) = listener.accept().await.unwrap();
        wait_for_state(&mut rx, LinkState::Online).await.unwrap();

        manager.report_close(CloseReason::Errored);
        wait_for_state(&mut rx, LinkState::Offline).await.unwrap();

        // Errored close reconnects even with retry_always disabled.
        let second = timeout(Duration::from_secs(2), listener.accept()).await;
        assert!(second.is_ok(), "expected a reconnect attempt");
        wait_for_state(&mut rx, LinkState::Online).await.unwrap();

        // Coarse invalidation covered every cached tag.
        assert_eq!(cache.read("holding100").quality, Quality::Bad);

        manager.end().await;
    }

    #[tokio::test]
    async fn test_clean_close_without_retry_always_parks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let manager = ConnectionManager::connect(&test_device(port, 50, false), ValueCache::new());
        let mut rx = manager.watch_state();

        let (_sock, _) = listener.accept().await.unwrap();
        wait_for_state(&mut rx, LinkState::Online).await.unwrap();

        manager.report_close(CloseReason::Clean);
        wait_for_state(&mut rx, LinkState::Offline).await.unwrap();

        // No reconnect may be scheduled.
        let second = timeout(Duration::from_millis(400), listener.accept()).await;
        assert!(second.is_err(), "unexpected reconnect after clean close");
        assert_eq!(manager.state(), LinkState::Offline);

        manager.end().await;
    }

    #[tokio::test]
    async fn test_clean_close_with_retry_always_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let manager = ConnectionManager::connect(&test_device(port, 50, true), ValueCache::new());
        let mut rx = manager.watch_state();

        let (_sock, _) = listener.accept().await.unwrap();
        wait_for_state(&mut rx, LinkState::Online).await.unwrap();

        manager.report_close(CloseReason::Clean);

        let second = timeout(Duration::from_secs(2), listener.accept()).await;
        assert!(second.is_ok(), "expected a reconnect attempt");

        manager.end().await;
    }

    #[tokio::test]
    async fn test_end_suppresses_reports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let manager = ConnectionManager::connect(&test_device(port, 50, true), ValueCache::new());
        let mut rx = manager.watch_state();

        let (_sock, _) = listener.accept().await.unwrap();
        wait_for_state(&mut rx, LinkState::Online).await.unwrap();

        manager.end().await;
        wait_for_state(&mut rx, LinkState::Offline).await.unwrap();

        // Reports after end() produce no state change and no reconnect.
        manager.report_close(CloseReason::Errored);
        let reconnect = timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(reconnect.is_err(), "unexpected reconnect after end()");
        assert_eq!(manager.state(), LinkState::Offline);

        // end() is idempotent.
        manager.end().await;
    }

    #[tokio::test]
    async fn test_end_cancels_pending_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let manager = ConnectionManager::connect(&test_device(port, 500, true), ValueCache::new());
        let mut rx = manager.watch_state();

        let (_sock, _) = listener.accept().await.unwrap();
        wait_for_state(&mut rx, LinkState::Online).await.unwrap();

        // Enter the retry delay window, then end before it elapses.
        manager.report_close(CloseReason::Errored);
        wait_for_state(&mut rx, LinkState::Offline).await.unwrap();
        manager.end().await;

        let reconnect = timeout(Duration::from_millis(900), listener.accept()).await;
        assert!(reconnect.is_err(), "pending reconnect fired after end()");
    }

    #[test]
    fn test_close_reason_classification() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(close_reason(&eof), CloseReason::Clean);

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(close_reason(&reset), CloseReason::Errored);

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(close_reason(&timed_out), CloseReason::Errored);

        // Errors without an io source are conservatively treated as errored.
        assert_eq!(close_reason(&std::fmt::Error), CloseReason::Errored);
    }
}
