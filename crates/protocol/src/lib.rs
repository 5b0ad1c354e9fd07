//! USB/IP wire protocol
//!
//! This crate implements the message set spoken between a USB/IP host
//! server and its importers (the Linux kernel VHCI driver among them):
//! the enumeration operations (device list, import) and the operational
//! URB traffic (submit, unlink). All multi-byte integers are big-endian.
//!
//! The encoders and decoders are pure and synchronous; stream readers for
//! live connections live in [`codec`] behind the `async` feature.
//!
//! # Example
//!
//! ```
//! use protocol::{decode_op_request, encode_devlist_request, OpRequest};
//!
//! let bytes = encode_devlist_request();
//! assert_eq!(bytes, [0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00]);
//! assert_eq!(decode_op_request(&bytes).unwrap(), OpRequest::Devlist);
//! ```

pub mod cmd;
pub mod codec;
pub mod error;
pub mod op;
pub mod status;

pub use cmd::{
    CMD_HEADER_SIZE, Command, DecodeLimits, ISO_PACKET_SIZE, IsoPacket, SubmitCommand,
    SubmitReply, USBIP_CMD_SUBMIT, USBIP_CMD_UNLINK, USBIP_RET_SUBMIT, USBIP_RET_UNLINK,
    UnlinkCommand, UnlinkReply, UrbDirection, decode_command, decode_ret_submit,
    decode_ret_unlink, encode_ret_submit, encode_ret_unlink, encode_submit_command,
    encode_unlink_command,
};
pub use error::{ProtocolError, Result};
pub use op::{
    DeviceDescription, DeviceSpeed, InterfaceDescription, OP_HEADER_SIZE, OP_REP_DEVLIST,
    OP_REP_IMPORT, OP_REQ_DEVLIST, OP_REQ_IMPORT, OP_STATUS_ERROR, OP_STATUS_OK, OpHeader,
    OpRequest, SYSFS_BUS_ID_SIZE, SYSFS_PATH_MAX, USBIP_VERSION, decode_devlist_reply,
    decode_import_reply, decode_op_request, encode_devlist_reply, encode_devlist_request,
    encode_import_reply, encode_import_request, encode_op_status,
};
pub use status::{
    Completion, RETRY_BASE_DELAY, RETRY_MAX_DELAY, TransferError, TransferOutcome, retry_backoff,
};

#[cfg(feature = "async")]
pub use codec::{read_command, read_op_request, write_message};
