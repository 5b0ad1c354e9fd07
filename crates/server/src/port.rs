//! Async device-I/O port
//!
//! Bridges the session's async world onto the blocking
//! [`DeviceBackend`]. Each `(endpoint, direction)` pair gets one lane task
//! that executes transfers strictly in submission order; distinct lanes run
//! concurrently. A lane drives the blocking call on the runtime's blocking
//! pool and races it against three guards: the transfer's cancel handle,
//! the per-type deadline, and the device disconnect signal.
//!
//! Cancellation is advisory at the backend (a blocking libusb-style call
//! cannot be aborted mid-flight), but authoritative above: once the cancel
//! or deadline guard wins, the caller gets `ECANCELED`/`ETIMEDOUT` and any
//! late backend result is discarded.

use common::{DeviceBackend, DisconnectSignal, EndpointKind, IsoOutcome};
use protocol::{Completion, TransferError, TransferOutcome, UrbDirection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::trace;

/// One-shot handle aborting an in-flight transfer
///
/// Firing it more than once is harmless; losing the race against completion
/// simply makes the cancel a no-op.
#[derive(Clone)]
pub struct CancelHandle {
    tx: broadcast::Sender<()>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle").finish()
    }
}

/// One transfer to execute on the device
#[derive(Debug)]
pub enum TransferOp {
    ControlIn {
        setup: [u8; 8],
        length: usize,
    },
    ControlOut {
        setup: [u8; 8],
        data: Vec<u8>,
    },
    BulkIn {
        endpoint: u8,
        length: usize,
    },
    BulkOut {
        endpoint: u8,
        data: Vec<u8>,
    },
    InterruptIn {
        endpoint: u8,
        length: usize,
    },
    InterruptOut {
        endpoint: u8,
        data: Vec<u8>,
    },
    IsoIn {
        endpoint: u8,
        packet_lengths: Vec<u32>,
    },
    IsoOut {
        endpoint: u8,
        data: Vec<u8>,
        packet_lengths: Vec<u32>,
    },
}

impl TransferOp {
    pub fn kind(&self) -> EndpointKind {
        match self {
            TransferOp::ControlIn { .. } | TransferOp::ControlOut { .. } => EndpointKind::Control,
            TransferOp::BulkIn { .. } | TransferOp::BulkOut { .. } => EndpointKind::Bulk,
            TransferOp::InterruptIn { .. } | TransferOp::InterruptOut { .. } => {
                EndpointKind::Interrupt
            }
            TransferOp::IsoIn { .. } | TransferOp::IsoOut { .. } => EndpointKind::Isochronous,
        }
    }

    /// Lane key: the endpoint address, direction bit included
    fn lane(&self) -> u8 {
        match self {
            TransferOp::ControlIn { .. } => 0x80,
            TransferOp::ControlOut { .. } => 0x00,
            TransferOp::BulkIn { endpoint, .. }
            | TransferOp::BulkOut { endpoint, .. }
            | TransferOp::InterruptIn { endpoint, .. }
            | TransferOp::InterruptOut { endpoint, .. }
            | TransferOp::IsoIn { endpoint, .. }
            | TransferOp::IsoOut { endpoint, .. } => *endpoint,
        }
    }
}

struct TransferJob {
    op: TransferOp,
    timeout: Duration,
    cancel_rx: broadcast::Receiver<()>,
    reply: oneshot::Sender<TransferOutcome>,
}

/// An accepted transfer: its cancel handle and pending completion
pub struct PendingTransfer {
    pub cancel: CancelHandle,
    completion: oneshot::Receiver<TransferOutcome>,
}

impl PendingTransfer {
    /// Await the transfer outcome
    ///
    /// A vanished lane (port shut down under us) reads as disconnection.
    pub async fn wait(self) -> TransferOutcome {
        self.completion
            .await
            .unwrap_or(Err(TransferError::Disconnected))
    }
}

/// The per-device async transfer port
pub struct DeviceIo {
    backend: Arc<dyn DeviceBackend>,
    disconnect: DisconnectSignal,
    lanes: Mutex<HashMap<u8, mpsc::UnboundedSender<TransferJob>>>,
}

impl DeviceIo {
    pub fn new(backend: Arc<dyn DeviceBackend>, disconnect: DisconnectSignal) -> Self {
        Self {
            backend,
            disconnect,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a transfer on its endpoint lane
    ///
    /// Enqueueing is synchronous and order-preserving: calls made in
    /// arrival order are executed in that order on their lane. The queue is
    /// unbounded here; the session's tracker cap bounds what can be
    /// outstanding.
    pub fn submit(&self, op: TransferOp, timeout: Duration) -> PendingTransfer {
        let cancel = CancelHandle::new();
        let cancel_rx = cancel.subscribe();
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = TransferJob {
            op,
            timeout,
            cancel_rx,
            reply: reply_tx,
        };

        let lane = job.op.lane();
        let mut lanes = self.lanes.lock().unwrap();
        let sender = lanes
            .entry(lane)
            .or_insert_with(|| spawn_lane(lane, self.backend.clone(), self.disconnect.clone()));
        if let Err(mpsc::error::SendError(job)) = sender.send(job) {
            let _ = job.reply.send(Err(TransferError::Disconnected));
        }

        PendingTransfer {
            cancel,
            completion: reply_rx,
        }
    }
}

fn spawn_lane(
    lane: u8,
    backend: Arc<dyn DeviceBackend>,
    disconnect: DisconnectSignal,
) -> mpsc::UnboundedSender<TransferJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<TransferJob>();
    tokio::spawn(async move {
        let mut disconnect = disconnect;
        while let Some(job) = rx.recv().await {
            run_job(lane, &backend, &mut disconnect, job).await;
        }
        trace!(lane, "endpoint lane closed");
    });
    tx
}

async fn run_job(
    lane: u8,
    backend: &Arc<dyn DeviceBackend>,
    disconnect: &mut DisconnectSignal,
    job: TransferJob,
) {
    let TransferJob {
        op,
        timeout,
        mut cancel_rx,
        reply,
    } = job;

    // queued work observes disconnect and cancellation before touching the
    // device at all
    if disconnect.is_disconnected() {
        let _ = reply.send(Err(TransferError::Disconnected));
        return;
    }
    if cancel_rx.try_recv().is_ok() {
        let _ = reply.send(Err(TransferError::Cancelled));
        return;
    }

    let blocking_backend = backend.clone();
    let mut task =
        tokio::task::spawn_blocking(move || execute_blocking(blocking_backend.as_ref(), op, timeout));

    let early = tokio::select! {
        result = &mut task => {
            let outcome = result.unwrap_or(Err(TransferError::Io));
            let _ = reply.send(outcome);
            false
        }
        _ = cancel_rx.recv() => {
            let _ = reply.send(Err(TransferError::Cancelled));
            true
        }
        _ = disconnect.wait() => {
            let _ = reply.send(Err(TransferError::Disconnected));
            true
        }
        _ = tokio::time::sleep(timeout) => {
            let _ = reply.send(Err(TransferError::TimedOut));
            true
        }
    };

    if early {
        // the blocking call cannot be aborted; wait it out so this endpoint
        // never sees overlapped transfers
        trace!(lane, "waiting out an abandoned transfer");
        let _ = task.await;
    }
}

fn execute_blocking(
    backend: &dyn DeviceBackend,
    op: TransferOp,
    timeout: Duration,
) -> TransferOutcome {
    match op {
        TransferOp::ControlIn { setup, length } => backend
            .control_in(setup, length, timeout)
            .map(Completion::data_in),
        TransferOp::ControlOut { setup, data } => backend
            .control_out(setup, data, timeout)
            .map(Completion::data_out),
        TransferOp::BulkIn { endpoint, length } => backend
            .bulk_in(endpoint, length, timeout)
            .map(Completion::data_in),
        TransferOp::BulkOut { endpoint, data } => backend
            .bulk_out(endpoint, data, timeout)
            .map(Completion::data_out),
        TransferOp::InterruptIn { endpoint, length } => backend
            .interrupt_in(endpoint, length, timeout)
            .map(Completion::data_in),
        TransferOp::InterruptOut { endpoint, data } => backend
            .interrupt_out(endpoint, data, timeout)
            .map(Completion::data_out),
        TransferOp::IsoIn {
            endpoint,
            packet_lengths,
        } => backend
            .isochronous_in(endpoint, packet_lengths, timeout)
            .map(|outcome| iso_completion(outcome, UrbDirection::In)),
        TransferOp::IsoOut {
            endpoint,
            data,
            packet_lengths,
        } => backend
            .isochronous_out(endpoint, data, packet_lengths, timeout)
            .map(|outcome| iso_completion(outcome, UrbDirection::Out)),
    }
}

fn iso_completion(outcome: IsoOutcome, direction: UrbDirection) -> Completion {
    let actual_length = match direction {
        UrbDirection::In => outcome.data.len() as u32,
        UrbDirection::Out => outcome.packets.iter().map(|p| p.actual_length).sum(),
    };
    Completion {
        data: outcome.data,
        actual_length,
        start_frame: outcome.start_frame,
        error_count: outcome.error_count,
        iso_packets: outcome.packets,
    }
}
