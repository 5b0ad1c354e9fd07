//! Unlink processor
//!
//! Cancels a previously submitted URB by sequence number. When the target
//! is still tracked, this path retires it, fires its cancel handle and
//! writes the victim's `RET_SUBMIT{ECANCELED}` itself; the device
//! completion then finds the entry gone and stays silent, so every URB
//! gets exactly one `RET_SUBMIT` no matter who wins the race. The
//! `RET_UNLINK` status is 0 either way; an already-retired target makes
//! the cancel vacuously satisfied.

use crate::net::DispatchResult;
use crate::net::submit::failed_reply;
use crate::tracker::UrbTracker;
use protocol::{TransferError, UnlinkCommand, UnlinkReply, encode_ret_submit, encode_ret_unlink};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) async fn handle_unlink(
    cmd: UnlinkCommand,
    tracker: &Arc<UrbTracker>,
    writer_tx: &mpsc::Sender<Vec<u8>>,
) -> DispatchResult {
    debug!(
        seqnum = cmd.seqnum,
        victim = cmd.victim_seqnum,
        "unlink received"
    );

    let found = match tracker.take(cmd.victim_seqnum) {
        Some(entry) => {
            entry.cancel.cancel();
            let reply = failed_reply(&entry.urb, TransferError::Cancelled);
            writer_tx.send(encode_ret_submit(&reply)).await?;
            true
        }
        None => false,
    };
    debug!(victim = cmd.victim_seqnum, found, "unlink result");

    let reply = UnlinkReply {
        seqnum: cmd.seqnum,
        devid: cmd.devid,
        direction: cmd.direction,
        ep: cmd.ep,
        status: 0,
    };
    writer_tx.send(encode_ret_unlink(&reply)).await
}
