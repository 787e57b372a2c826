//! Per-range poll scheduling.
//!
//! Each configured address range gets one recurring job. Jobs run
//! independently of each other; ticks of the same job never overlap because
//! a tick completes before the next delay starts, and overlapping ticks of
//! different jobs serialize at the shared protocol client.

use crate::address::tag_id;
use crate::cache::ValueCache;
use crate::connection::{ConnectionManager, LinkState, close_reason};
use fieldbridge_common::{Quality, RegisterKind, TagReading, TagValue};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_modbus::ExceptionCode;
use tokio_modbus::client::{Context, Reader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One recurring read of a contiguous address range.
#[derive(Debug, Clone)]
pub struct PollJob {
    /// Root name prefixed to every tag identifier of this range.
    pub root: String,
    /// Register kind read on each tick.
    pub kind: RegisterKind,
    /// Effective (zero-based) starting address.
    pub address: u16,
    /// Number of consecutive points.
    pub count: u16,
    /// Delay between ticks.
    pub interval: Duration,
}

/// Stop handle for a running poll job.
#[derive(Debug)]
pub struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Request the job to stop after its current tick.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the job and wait for it to finish.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Spawn the recurring task for a poll job.
pub(crate) fn spawn_poll(
    conn: Arc<ConnectionManager>,
    cache: ValueCache,
    job: PollJob,
) -> PollHandle {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        debug!(
            root = %job.root,
            kind = %job.kind,
            address = job.address,
            count = job.count,
            interval_ms = job.interval.as_millis() as u64,
            "Poll job started"
        );
        loop {
            if task_cancel.is_cancelled() {
                break;
            }
            tick(&conn, &cache, &job).await;
            tokio::select! {
                _ = task_cancel.cancelled() => break,
                _ = sleep(job.interval) => {}
            }
        }
        debug!(root = %job.root, address = job.address, "Poll job stopped");
    });

    PollHandle { cancel, task }
}

/// Read errors of a single tick.
#[derive(Debug, Error)]
pub(crate) enum ReadError {
    #[error("transport error: {0}")]
    Transport(#[from] tokio_modbus::Error),
    #[error("device exception: {0:?}")]
    Exception(ExceptionCode),
}

/// Execute one poll tick for a job.
async fn tick(conn: &ConnectionManager, cache: &ValueCache, job: &PollJob) {
    if conn.state() != LinkState::Online {
        cache.mark_range(&job.root, job.address, job.count, Quality::BadNotConnected);
        return;
    }

    let shared = conn.context();
    let mut slot = shared.lock().await;
    let Some(ctx) = slot.as_mut() else {
        // The supervisor tore the client down between the state check and
        // the lock; indistinguishable from not being connected.
        drop(slot);
        cache.mark_range(&job.root, job.address, job.count, Quality::BadNotConnected);
        return;
    };

    let result = read_batch(ctx, job.kind, job.address, job.count).await;
    drop(slot);

    match result {
        Ok(values) => record_success(cache, &job.root, job.address, values),
        Err(err) => {
            warn!(
                root = %job.root,
                kind = %job.kind,
                address = job.address,
                count = job.count,
                error = %err,
                "Unable to read range"
            );
            record_failure(cache, &job.root, job.address, job.count);
            if let ReadError::Transport(e) = &err {
                conn.report_close(close_reason(e));
            }
        }
    }
}

/// Issue the type-appropriate batched read.
pub(crate) async fn read_batch(
    ctx: &mut Context,
    kind: RegisterKind,
    address: u16,
    count: u16,
) -> Result<Vec<TagValue>, ReadError> {
    let values = match kind {
        RegisterKind::Holding => ctx
            .read_holding_registers(address, count)
            .await?
            .map_err(ReadError::Exception)?
            .into_iter()
            .map(TagValue::from)
            .collect(),
        RegisterKind::Input => ctx
            .read_input_registers(address, count)
            .await?
            .map_err(ReadError::Exception)?
            .into_iter()
            .map(TagValue::from)
            .collect(),
        RegisterKind::Coil => ctx
            .read_coils(address, count)
            .await?
            .map_err(ReadError::Exception)?
            .into_iter()
            .map(TagValue::from)
            .collect(),
        RegisterKind::Discrete => ctx
            .read_discrete_inputs(address, count)
            .await?
            .map_err(ReadError::Exception)?
            .into_iter()
            .map(TagValue::from)
            .collect(),
    };
    Ok(values)
}

/// Record a successful tick: the i-th address gets the i-th value.
pub(crate) fn record_success(cache: &ValueCache, root: &str, start: u16, values: Vec<TagValue>) {
    for (offset, value) in values.into_iter().enumerate() {
        cache.write(
            tag_id(root, start + offset as u16),
            TagReading {
                value: Some(value),
                quality: Quality::Good,
            },
        );
    }
}

/// Record a failed tick: the whole range goes bad, never a partial mix.
pub(crate) fn record_failure(cache: &ValueCache, root: &str, start: u16, count: u16) {
    cache.mark_range(root, start, count, Quality::BadCommunicationError);
}
