//! Per-connection session engine
//!
//! A session walks the USB/IP connection through its phases:
//!
//! 1. **Handshake**: serve any number of device-list requests, then bind
//!    to a device on the first import. A failed import answers with a
//!    non-zero status and closes.
//! 2. **Operational**: read submits and unlinks in arrival order, dispatch
//!    them without blocking the reader, and serialize every response
//!    through one writer task (FIFO in completion order, not request
//!    order; importers match on seqnum).
//! 3. **Draining**: stop reading, let or make the in-flight URBs retire
//!    within the shutdown window, flush the writer.
//! 4. **Closed**: release the claim back to the registry.
//!
//! The transport is generic so tests can drive a full session over an
//! in-memory duplex pipe.

use crate::config::ServerConfig;
use crate::net::{submit, unlink};
use crate::port::DeviceIo;
use crate::tracker::UrbTracker;
use anyhow::Result;
use common::{ClaimedDevice, DeviceRegistry};
use protocol::{
    Command, OP_REP_IMPORT, OP_STATUS_ERROR, OP_STATUS_OK, OpRequest, ProtocolError,
    encode_devlist_reply, encode_import_reply, encode_op_status, read_command, read_op_request,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Responses buffered toward the socket before completions block on the
/// writer
const WRITE_QUEUE_DEPTH: usize = 64;

/// Why a session left the operational phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client closed or half-closed the connection
    ClientClosed,
    /// Client broke the wire protocol
    ProtocolViolation,
    /// The exported device disconnected
    DeviceGone,
    /// The transport failed
    TransportError,
}

/// Drive one connection from handshake to close
pub async fn run_session<S>(
    stream: S,
    peer: String,
    registry: Arc<dyn DeviceRegistry>,
    config: Arc<ServerConfig>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    info!(peer = %peer, "session opened");

    let Some(claimed) = handshake(&mut reader, &mut writer, &peer, &registry).await? else {
        info!(peer = %peer, reason = "handshake", "session closed");
        return Ok(());
    };

    operational(reader, writer, claimed, &peer, &config).await
}

/// Handshake phase: repeated device lists until one import
async fn handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    peer: &str,
    registry: &Arc<dyn DeviceRegistry>,
) -> Result<Option<ClaimedDevice>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request = match read_op_request(reader).await {
            Ok(request) => request,
            Err(ProtocolError::Io(e)) => {
                return if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Ok(None)
                } else {
                    Err(e.into())
                };
            }
            Err(e) => {
                warn!(peer = %peer, "handshake failed: {}", e);
                // best-effort error status; the client is about to lose the
                // connection either way
                let _ = writer
                    .write_all(&encode_op_status(OP_REP_IMPORT, OP_STATUS_ERROR))
                    .await;
                return Ok(None);
            }
        };

        match request {
            OpRequest::Devlist => {
                let enumerate = registry.clone();
                let devices = tokio::task::spawn_blocking(move || enumerate.list()).await?;
                let devices = match devices {
                    Ok(devices) => devices,
                    Err(e) => {
                        warn!(peer = %peer, "device enumeration failed: {}", e);
                        Vec::new()
                    }
                };
                debug!(peer = %peer, count = devices.len(), "device list requested");
                writer.write_all(&encode_devlist_reply(&devices)).await?;
            }
            OpRequest::Import { busid } => {
                let claim = registry.clone();
                let claim_busid = busid.clone();
                let claimed = tokio::task::spawn_blocking(move || claim.claim(&claim_busid)).await?;
                return match claimed {
                    Ok(claimed) => {
                        writer
                            .write_all(&encode_import_reply(
                                OP_STATUS_OK,
                                Some(claimed.description()),
                            ))
                            .await?;
                        info!(
                            peer = %peer,
                            busid = %busid,
                            devid = claimed.devid(),
                            "device imported"
                        );
                        Ok(Some(claimed))
                    }
                    Err(e) => {
                        warn!(peer = %peer, busid = %busid, "import refused: {}", e);
                        writer
                            .write_all(&encode_import_reply(OP_STATUS_ERROR, None))
                            .await?;
                        // a failed import closes the session
                        Ok(None)
                    }
                };
            }
        }
    }
}

/// Operational phase: URB traffic until EOF, error or device loss
async fn operational<S>(
    mut reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    claimed: ClaimedDevice,
    peer: &str,
    config: &ServerConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let tracker = Arc::new(UrbTracker::new(
        config.limits.max_pending_urbs_per_session as usize,
    ));
    let device_io = DeviceIo::new(claimed.backend(), claimed.disconnect_signal());
    let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
    let writer_task = tokio::spawn(write_loop(writer, writer_rx));
    let mut disconnect = claimed.disconnect_signal();
    let limits = config.limits.decode_limits();

    let reason = loop {
        // backpressure: a full tracker stops the reader before it decodes
        // another submit, so no new entries appear while full
        tokio::select! {
            _ = tracker.wait_for_room() => {}
            _ = disconnect.wait() => break CloseReason::DeviceGone,
        }

        let command = tokio::select! {
            command = read_command(&mut reader, &limits) => command,
            _ = disconnect.wait() => break CloseReason::DeviceGone,
        };

        let dispatched = match command {
            Ok(Command::Submit(cmd)) => {
                submit::handle_submit(cmd, &claimed, &tracker, &device_io, &writer_tx, config).await
            }
            Ok(Command::Unlink(cmd)) => unlink::handle_unlink(cmd, &tracker, &writer_tx).await,
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break CloseReason::ClientClosed;
            }
            Err(ProtocolError::Io(e)) => {
                debug!(peer = %peer, "transport read failed: {}", e);
                break CloseReason::TransportError;
            }
            Err(e) => {
                // operational-phase protocol errors are unrecoverable; the
                // stream framing can no longer be trusted
                warn!(peer = %peer, "protocol violation: {}", e);
                break CloseReason::ProtocolViolation;
            }
        };

        if dispatched.is_err() {
            break CloseReason::TransportError;
        }
    };

    drain(reason, &tracker, config).await;

    // closing the channel ends the writer once the buffered responses are
    // out; the drain window bounds how long that may take
    drop(writer_tx);
    let _ = tokio::time::timeout(config.timeouts.drain(), writer_task).await;

    claimed.release();
    info!(peer = %peer, reason = ?reason, "session closed");
    Ok(())
}

/// Draining phase: retire or cancel everything still tracked
async fn drain(reason: CloseReason, tracker: &Arc<UrbTracker>, config: &ServerConfig) {
    match reason {
        CloseReason::DeviceGone => {
            // in-flight and queued operations are completing with ENODEV;
            // give them the drain window to retire through the writer
            let _ = tokio::time::timeout(config.timeouts.drain(), tracker.wait_until_empty()).await;
            let leftover = tracker.cancel_all();
            if leftover > 0 {
                debug!(leftover, "URBs still pending at the drain deadline");
            }
        }
        _ => {
            let cancelled = tracker.cancel_all();
            if cancelled > 0 {
                debug!(cancelled, "cancelled pending URBs on shutdown");
            }
        }
    }
}

/// Single writer per session; responses go out FIFO in hand-off order
async fn write_loop<S>(mut writer: WriteHalf<S>, mut responses: mpsc::Receiver<Vec<u8>>)
where
    S: AsyncWrite,
{
    while let Some(bytes) = responses.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!("write failed, discarding buffered responses: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
