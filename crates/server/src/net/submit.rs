//! Submit processor
//!
//! Validates a decoded `CMD_SUBMIT` against the session's imported device,
//! tracks it, and dispatches it to the device-I/O port. Dispatch is
//! asynchronous: the reader moves on immediately, and a spawned completion
//! task builds the `RET_SUBMIT` once the device is done. Validation
//! failures answer synchronously with the mapped errno and leave the
//! session running.

use crate::config::ServerConfig;
use crate::net::DispatchResult;
use crate::port::{DeviceIo, TransferOp};
use crate::tracker::{TrackedUrb, TrackerError, Urb, UrbTracker};
use common::{ClaimedDevice, EndpointKind};
use protocol::{
    SubmitCommand, SubmitReply, TransferError, TransferOutcome, UrbDirection, encode_ret_submit,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) async fn handle_submit(
    mut cmd: SubmitCommand,
    claimed: &ClaimedDevice,
    tracker: &Arc<UrbTracker>,
    device_io: &DeviceIo,
    writer_tx: &mpsc::Sender<Vec<u8>>,
    config: &ServerConfig,
) -> DispatchResult {
    debug!(
        seqnum = cmd.seqnum,
        ep = cmd.ep,
        direction = ?cmd.direction,
        len = cmd.buffer_length,
        "submit received"
    );

    if cmd.devid != claimed.devid() {
        warn!(
            seqnum = cmd.seqnum,
            devid = cmd.devid,
            "submit for a device this session did not import"
        );
        return reject(&cmd, TransferError::Disconnected, writer_tx).await;
    }

    let kind = match classify(&cmd, claimed) {
        Ok(kind) => kind,
        Err(error) => return reject(&cmd, error, writer_tx).await,
    };
    if let Err(error) = validate(&cmd, kind, config) {
        return reject(&cmd, error, writer_tx).await;
    }

    let payload = std::mem::take(&mut cmd.payload);
    let op = build_op(&cmd, kind, payload);
    let pending = device_io.submit(op, config.timeouts.transfer(kind));

    let entry = TrackedUrb {
        urb: Urb {
            seqnum: cmd.seqnum,
            devid: cmd.devid,
            direction: cmd.direction,
            ep: cmd.ep,
            kind,
            transfer_flags: cmd.transfer_flags,
            buffer_length: cmd.buffer_length,
            start_frame: cmd.start_frame,
            number_of_packets: cmd.number_of_packets,
            setup: cmd.setup,
            submitted_at: Instant::now(),
        },
        cancel: pending.cancel.clone(),
    };
    if let Err(e) = tracker.insert(entry) {
        // abandon the queued device operation; nobody will wait for it
        pending.cancel.cancel();
        warn!(seqnum = cmd.seqnum, "submit not tracked: {}", e);
        let error = match e {
            TrackerError::DuplicateSeqnum(_) => TransferError::InvalidArgument,
            TrackerError::CapacityExceeded => TransferError::TooManyRequests,
        };
        return reject(&cmd, error, writer_tx).await;
    }

    let tracker = tracker.clone();
    let writer_tx = writer_tx.clone();
    let seqnum = cmd.seqnum;
    tokio::spawn(async move {
        let outcome = pending.wait().await;
        // the unlink path may have retired this URB and answered for it
        let Some(entry) = tracker.take(seqnum) else {
            return;
        };
        let reply = build_reply(&entry.urb, outcome);
        let duration_ms = entry.urb.submitted_at.elapsed().as_millis() as u64;
        debug!(
            seqnum,
            status = reply.status,
            actual_length = reply.actual_length,
            duration_ms,
            "submit completed"
        );
        let _ = writer_tx.send(encode_ret_submit(&reply)).await;
    });

    Ok(())
}

/// Transfer type of the submit: endpoint 0 is control, everything else
/// comes from the claim's cached endpoint descriptors
fn classify(cmd: &SubmitCommand, claimed: &ClaimedDevice) -> Result<EndpointKind, TransferError> {
    if cmd.ep == 0 {
        return Ok(EndpointKind::Control);
    }
    claimed
        .endpoint(cmd.ep as u8, cmd.direction.is_in())
        .map(|ep| ep.kind)
        .ok_or(TransferError::InvalidArgument)
}

fn validate(
    cmd: &SubmitCommand,
    kind: EndpointKind,
    config: &ServerConfig,
) -> Result<(), TransferError> {
    if cmd.buffer_length > config.limits.max_transfer_buffer {
        return Err(TransferError::InvalidArgument);
    }
    let iso_packets = cmd.iso_packet_count();
    match kind {
        EndpointKind::Isochronous if iso_packets == 0 => Err(TransferError::InvalidArgument),
        EndpointKind::Isochronous => Ok(()),
        _ if iso_packets != 0 => Err(TransferError::InvalidArgument),
        _ => Ok(()),
    }
}

fn build_op(cmd: &SubmitCommand, kind: EndpointKind, payload: Vec<u8>) -> TransferOp {
    let endpoint = cmd.ep as u8 | if cmd.direction.is_in() { 0x80 } else { 0x00 };
    let length = cmd.buffer_length as usize;
    match (kind, cmd.direction) {
        (EndpointKind::Control, UrbDirection::In) => TransferOp::ControlIn {
            setup: cmd.setup,
            length,
        },
        (EndpointKind::Control, UrbDirection::Out) => TransferOp::ControlOut {
            setup: cmd.setup,
            data: payload,
        },
        (EndpointKind::Bulk, UrbDirection::In) => TransferOp::BulkIn { endpoint, length },
        (EndpointKind::Bulk, UrbDirection::Out) => TransferOp::BulkOut {
            endpoint,
            data: payload,
        },
        (EndpointKind::Interrupt, UrbDirection::In) => {
            TransferOp::InterruptIn { endpoint, length }
        }
        (EndpointKind::Interrupt, UrbDirection::Out) => TransferOp::InterruptOut {
            endpoint,
            data: payload,
        },
        (EndpointKind::Isochronous, UrbDirection::In) => TransferOp::IsoIn {
            endpoint,
            packet_lengths: cmd.iso_packets.iter().map(|p| p.length).collect(),
        },
        (EndpointKind::Isochronous, UrbDirection::Out) => TransferOp::IsoOut {
            endpoint,
            data: payload,
            packet_lengths: cmd.iso_packets.iter().map(|p| p.length).collect(),
        },
    }
}

async fn reject(
    cmd: &SubmitCommand,
    error: TransferError,
    writer_tx: &mpsc::Sender<Vec<u8>>,
) -> DispatchResult {
    debug!(seqnum = cmd.seqnum, status = error.status(), "submit rejected");
    let reply = SubmitReply {
        seqnum: cmd.seqnum,
        devid: cmd.devid,
        direction: cmd.direction,
        ep: cmd.ep,
        status: error.status(),
        actual_length: 0,
        start_frame: cmd.start_frame,
        number_of_packets: 0,
        error_count: 0,
        setup: cmd.setup,
        payload: Vec::new(),
        iso_packets: Vec::new(),
    };
    writer_tx.send(encode_ret_submit(&reply)).await
}

/// Reply for a URB that failed after being tracked
pub(crate) fn failed_reply(urb: &Urb, error: TransferError) -> SubmitReply {
    SubmitReply {
        seqnum: urb.seqnum,
        devid: urb.devid,
        direction: urb.direction,
        ep: urb.ep,
        status: error.status(),
        actual_length: 0,
        start_frame: urb.start_frame,
        number_of_packets: 0,
        error_count: 0,
        setup: urb.setup,
        payload: Vec::new(),
        iso_packets: Vec::new(),
    }
}

fn build_reply(urb: &Urb, outcome: TransferOutcome) -> SubmitReply {
    match outcome {
        Ok(completion) => SubmitReply {
            seqnum: urb.seqnum,
            devid: urb.devid,
            direction: urb.direction,
            ep: urb.ep,
            status: 0,
            actual_length: completion.actual_length,
            // the device schedules iso transfers; everything else echoes the
            // client's frame
            start_frame: if urb.kind == EndpointKind::Isochronous {
                completion.start_frame
            } else {
                urb.start_frame
            },
            number_of_packets: urb.number_of_packets,
            error_count: completion.error_count,
            setup: urb.setup,
            payload: if urb.direction.is_in() {
                completion.data
            } else {
                Vec::new()
            },
            iso_packets: completion.iso_packets,
        },
        Err(error) => failed_reply(urb, error),
    }
}
