//! Data-plane (operational) messages
//!
//! After a successful import the connection switches to URB traffic. Every
//! operational packet starts with the same 48-byte header: a 20-byte command
//! head followed by a 28-byte command-specific area (NUL-padded where the
//! command defines fewer fields). All integers are big-endian.
//!
//! ```text
//! +--------------+--------------+--------------+--------------+----------+
//! | command: u32 | seqnum: u32  | devid: u32   | direction: u32 | ep: u32|
//! +--------------+--------------+--------------+--------------+----------+
//! | 28-byte command area (submit fields / unlink fields / padding)       |
//! +----------------------------------------------------------------------+
//! | OUT payload (CMD_SUBMIT) or IN payload (RET_SUBMIT), if any          |
//! | isochronous packet descriptors, 16 bytes each, if any                |
//! +----------------------------------------------------------------------+
//! ```

use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Submit a URB to the exported device
pub const USBIP_CMD_SUBMIT: u32 = 0x0000_0001;
/// Cancel a previously submitted URB by sequence number
pub const USBIP_CMD_UNLINK: u32 = 0x0000_0002;
/// Completion of a submitted URB
pub const USBIP_RET_SUBMIT: u32 = 0x0000_0003;
/// Acknowledgement of an unlink request
pub const USBIP_RET_UNLINK: u32 = 0x0000_0004;

/// Size of the fixed operational header
pub const CMD_HEADER_SIZE: usize = 48;
/// Size of one isochronous packet descriptor
pub const ISO_PACKET_SIZE: usize = 16;

/// Some importers encode "not isochronous" as all-ones instead of zero
const NO_ISO_SENTINEL: u32 = 0xFFFF_FFFF;

/// Transfer direction as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrbDirection {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl UrbDirection {
    pub fn as_wire(self) -> u32 {
        match self {
            UrbDirection::Out => 0,
            UrbDirection::In => 1,
        }
    }

    pub fn from_wire(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(UrbDirection::Out),
            1 => Ok(UrbDirection::In),
            other => Err(ProtocolError::malformed(format!(
                "invalid direction {other}"
            ))),
        }
    }

    pub fn is_in(self) -> bool {
        matches!(self, UrbDirection::In)
    }
}

/// Per-packet descriptor for isochronous transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacket {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacket {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.offset);
        buf.put_u32(self.length);
        buf.put_u32(self.actual_length);
        buf.put_i32(self.status);
    }

    fn decode_from(buf: &mut &[u8]) -> Self {
        Self {
            offset: buf.get_u32(),
            length: buf.get_u32(),
            actual_length: buf.get_u32(),
            status: buf.get_i32(),
        }
    }
}

/// Decoder guard rails
///
/// `max_message_size` bounds a whole operational packet including payload and
/// iso descriptors; exceeding it is a protocol violation. The per-URB
/// transfer-buffer cap is enforced by the submit processor, not here, so an
/// oversized-but-parsable submit can still be answered with `EINVAL` without
/// losing framing.
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    pub max_message_size: usize,
    pub max_iso_packets: u32,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_message_size: 2 * 1024 * 1024,
            max_iso_packets: 1024,
        }
    }
}

/// A decoded `CMD_SUBMIT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCommand {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: UrbDirection,
    pub ep: u32,
    /// URB transfer flags, passed through bit-exactly
    pub transfer_flags: u32,
    pub buffer_length: u32,
    pub start_frame: u32,
    /// Raw wire value; use [`SubmitCommand::iso_packet_count`] to interpret
    pub number_of_packets: u32,
    /// Polling interval, passed through bit-exactly
    pub interval: u32,
    /// Control setup packet; carried on every submit, meaningful on ep 0
    pub setup: [u8; 8],
    /// OUT payload, `buffer_length` bytes; empty for IN submits
    pub payload: Vec<u8>,
    pub iso_packets: Vec<IsoPacket>,
}

impl SubmitCommand {
    /// Number of iso packets, folding both "none" encodings to zero
    pub fn iso_packet_count(&self) -> u32 {
        if self.number_of_packets == NO_ISO_SENTINEL {
            0
        } else {
            self.number_of_packets
        }
    }
}

/// A `RET_SUBMIT` to be sent back to the importer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReply {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: UrbDirection,
    pub ep: u32,
    /// Linux errno-style status; 0 on success
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    /// Echo of the submit's setup packet
    pub setup: [u8; 8],
    /// IN payload on success, `actual_length` bytes; empty otherwise
    pub payload: Vec<u8>,
    pub iso_packets: Vec<IsoPacket>,
}

/// A decoded `CMD_UNLINK`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkCommand {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: UrbDirection,
    pub ep: u32,
    /// Sequence number of the submit to cancel
    pub victim_seqnum: u32,
}

/// A `RET_UNLINK` acknowledging an unlink request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkReply {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: UrbDirection,
    pub ep: u32,
    pub status: i32,
}

/// A decoded operational request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Submit(SubmitCommand),
    Unlink(UnlinkCommand),
}

impl Command {
    pub fn seqnum(&self) -> u32 {
        match self {
            Command::Submit(submit) => submit.seqnum,
            Command::Unlink(unlink) => unlink.seqnum,
        }
    }
}

/// Partial decode of the fixed 48-byte header; extras follow on the stream
pub(crate) enum DecodedHeader {
    Submit(SubmitCommand),
    Unlink(UnlinkCommand),
}

/// Decode the fixed 48-byte header of an operational request
///
/// For submits the returned command still has empty `payload`/`iso_packets`;
/// the caller reads [`submit_extra_len`] more bytes and attaches them with
/// [`attach_submit_extras`].
pub(crate) fn decode_cmd_header(bytes: &[u8]) -> Result<DecodedHeader> {
    debug_assert!(bytes.len() >= CMD_HEADER_SIZE);
    let mut buf = bytes;
    let command = buf.get_u32();
    let seqnum = buf.get_u32();
    let devid = buf.get_u32();
    let direction = UrbDirection::from_wire(buf.get_u32())?;
    let ep = buf.get_u32();

    if devid == 0 {
        return Err(ProtocolError::malformed("devid must not be zero"));
    }
    if ep > 15 {
        return Err(ProtocolError::malformed(format!(
            "endpoint {ep} out of range"
        )));
    }

    match command {
        USBIP_CMD_SUBMIT => {
            let transfer_flags = buf.get_u32();
            let buffer_length = buf.get_i32();
            let start_frame = buf.get_u32();
            let number_of_packets = buf.get_u32();
            let interval = buf.get_u32();
            let mut setup = [0u8; 8];
            buf.copy_to_slice(&mut setup);

            if buffer_length < 0 {
                return Err(ProtocolError::malformed(format!(
                    "negative transfer buffer length {buffer_length}"
                )));
            }

            Ok(DecodedHeader::Submit(SubmitCommand {
                seqnum,
                devid,
                direction,
                ep,
                transfer_flags,
                buffer_length: buffer_length as u32,
                start_frame,
                number_of_packets,
                interval,
                setup,
                payload: Vec::new(),
                iso_packets: Vec::new(),
            }))
        }
        USBIP_CMD_UNLINK => {
            let victim_seqnum = buf.get_u32();
            Ok(DecodedHeader::Unlink(UnlinkCommand {
                seqnum,
                devid,
                direction,
                ep,
                victim_seqnum,
            }))
        }
        other => Err(ProtocolError::malformed(format!(
            "unknown command {other:#010x}"
        ))),
    }
}

/// Bytes that follow a submit header: `(payload_len, iso_len)`
pub(crate) fn submit_extra_len(
    submit: &SubmitCommand,
    limits: &DecodeLimits,
) -> Result<(usize, usize)> {
    let iso_count = submit.iso_packet_count();
    if iso_count > limits.max_iso_packets {
        return Err(ProtocolError::malformed(format!(
            "{iso_count} iso packets exceeds limit {}",
            limits.max_iso_packets
        )));
    }
    let payload_len = if submit.direction == UrbDirection::Out {
        submit.buffer_length as usize
    } else {
        0
    };
    let iso_len = iso_count as usize * ISO_PACKET_SIZE;
    let total = CMD_HEADER_SIZE + payload_len + iso_len;
    if total > limits.max_message_size {
        return Err(ProtocolError::malformed(format!(
            "message of {total} bytes exceeds limit {}",
            limits.max_message_size
        )));
    }
    Ok((payload_len, iso_len))
}

/// Attach payload and iso descriptor bytes read after the header
pub(crate) fn attach_submit_extras(submit: &mut SubmitCommand, payload: Vec<u8>, iso: &[u8]) {
    debug_assert_eq!(iso.len(), submit.iso_packet_count() as usize * ISO_PACKET_SIZE);
    submit.payload = payload;
    let mut buf = iso;
    submit.iso_packets.reserve(submit.iso_packet_count() as usize);
    for _ in 0..submit.iso_packet_count() {
        submit.iso_packets.push(IsoPacket::decode_from(&mut buf));
    }
}

/// Decode a complete operational request from a byte slice
///
/// The slice must hold exactly one message; trailing bytes are a framing
/// violation.
pub fn decode_command(bytes: &[u8], limits: &DecodeLimits) -> Result<Command> {
    if bytes.len() < CMD_HEADER_SIZE {
        return Err(ProtocolError::malformed(format!(
            "command truncated: {} of {} header bytes",
            bytes.len(),
            CMD_HEADER_SIZE
        )));
    }
    match decode_cmd_header(bytes)? {
        DecodedHeader::Submit(mut submit) => {
            let (payload_len, iso_len) = submit_extra_len(&submit, limits)?;
            let rest = &bytes[CMD_HEADER_SIZE..];
            if rest.len() != payload_len + iso_len {
                return Err(ProtocolError::malformed(format!(
                    "submit body is {} bytes, announced {}",
                    rest.len(),
                    payload_len + iso_len
                )));
            }
            attach_submit_extras(
                &mut submit,
                rest[..payload_len].to_vec(),
                &rest[payload_len..],
            );
            Ok(Command::Submit(submit))
        }
        DecodedHeader::Unlink(unlink) => {
            if bytes.len() != CMD_HEADER_SIZE {
                return Err(ProtocolError::malformed(format!(
                    "{} trailing bytes after unlink",
                    bytes.len() - CMD_HEADER_SIZE
                )));
            }
            Ok(Command::Unlink(unlink))
        }
    }
}

fn put_cmd_head(buf: &mut BytesMut, command: u32, seqnum: u32, devid: u32, dir: UrbDirection, ep: u32) {
    buf.put_u32(command);
    buf.put_u32(seqnum);
    buf.put_u32(devid);
    buf.put_u32(dir.as_wire());
    buf.put_u32(ep);
}

/// Encode a `CMD_SUBMIT`
pub fn encode_submit_command(submit: &SubmitCommand) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(
        CMD_HEADER_SIZE + submit.payload.len() + submit.iso_packets.len() * ISO_PACKET_SIZE,
    );
    put_cmd_head(
        &mut buf,
        USBIP_CMD_SUBMIT,
        submit.seqnum,
        submit.devid,
        submit.direction,
        submit.ep,
    );
    buf.put_u32(submit.transfer_flags);
    buf.put_i32(submit.buffer_length as i32);
    buf.put_u32(submit.start_frame);
    buf.put_u32(submit.number_of_packets);
    buf.put_u32(submit.interval);
    buf.put_slice(&submit.setup);
    buf.put_slice(&submit.payload);
    for packet in &submit.iso_packets {
        packet.encode_into(&mut buf);
    }
    buf.to_vec()
}

/// Encode a `RET_SUBMIT`
pub fn encode_ret_submit(reply: &SubmitReply) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(
        CMD_HEADER_SIZE + reply.payload.len() + reply.iso_packets.len() * ISO_PACKET_SIZE,
    );
    put_cmd_head(
        &mut buf,
        USBIP_RET_SUBMIT,
        reply.seqnum,
        reply.devid,
        reply.direction,
        reply.ep,
    );
    buf.put_i32(reply.status);
    buf.put_i32(reply.actual_length as i32);
    buf.put_u32(reply.start_frame);
    buf.put_u32(reply.number_of_packets);
    buf.put_u32(reply.error_count);
    buf.put_slice(&reply.setup);
    buf.put_slice(&reply.payload);
    for packet in &reply.iso_packets {
        packet.encode_into(&mut buf);
    }
    buf.to_vec()
}

/// Encode a `CMD_UNLINK`
pub fn encode_unlink_command(unlink: &UnlinkCommand) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(CMD_HEADER_SIZE);
    put_cmd_head(
        &mut buf,
        USBIP_CMD_UNLINK,
        unlink.seqnum,
        unlink.devid,
        unlink.direction,
        unlink.ep,
    );
    buf.put_u32(unlink.victim_seqnum);
    buf.put_bytes(0, 24);
    buf.to_vec()
}

/// Encode a `RET_UNLINK`
pub fn encode_ret_unlink(reply: &UnlinkReply) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(CMD_HEADER_SIZE);
    put_cmd_head(
        &mut buf,
        USBIP_RET_UNLINK,
        reply.seqnum,
        reply.devid,
        reply.direction,
        reply.ep,
    );
    buf.put_i32(reply.status);
    buf.put_bytes(0, 24);
    buf.to_vec()
}

/// Decode a `RET_SUBMIT` from a byte slice
pub fn decode_ret_submit(bytes: &[u8]) -> Result<SubmitReply> {
    if bytes.len() < CMD_HEADER_SIZE {
        return Err(ProtocolError::malformed("RET_SUBMIT truncated"));
    }
    let mut buf = bytes;
    let command = buf.get_u32();
    if command != USBIP_RET_SUBMIT {
        return Err(ProtocolError::malformed(format!(
            "expected RET_SUBMIT, got {command:#010x}"
        )));
    }
    let seqnum = buf.get_u32();
    let devid = buf.get_u32();
    let direction = UrbDirection::from_wire(buf.get_u32())?;
    let ep = buf.get_u32();
    let status = buf.get_i32();
    let actual_length = buf.get_i32();
    let start_frame = buf.get_u32();
    let number_of_packets = buf.get_u32();
    let error_count = buf.get_u32();
    let mut setup = [0u8; 8];
    buf.copy_to_slice(&mut setup);

    if actual_length < 0 {
        return Err(ProtocolError::malformed(format!(
            "negative actual length {actual_length}"
        )));
    }
    let payload_len = if direction.is_in() && status == 0 {
        actual_length as usize
    } else {
        0
    };
    let iso_count = if number_of_packets == NO_ISO_SENTINEL {
        0
    } else {
        number_of_packets as usize
    };
    if buf.len() != payload_len + iso_count * ISO_PACKET_SIZE {
        return Err(ProtocolError::malformed(format!(
            "RET_SUBMIT body is {} bytes, announced {}",
            buf.len(),
            payload_len + iso_count * ISO_PACKET_SIZE
        )));
    }
    let payload = buf[..payload_len].to_vec();
    buf.advance(payload_len);
    let mut iso_packets = Vec::with_capacity(iso_count);
    for _ in 0..iso_count {
        iso_packets.push(IsoPacket::decode_from(&mut buf));
    }

    Ok(SubmitReply {
        seqnum,
        devid,
        direction,
        ep,
        status,
        actual_length: actual_length as u32,
        start_frame,
        number_of_packets,
        error_count,
        setup,
        payload,
        iso_packets,
    })
}

/// Decode a `RET_UNLINK` from a byte slice
pub fn decode_ret_unlink(bytes: &[u8]) -> Result<UnlinkReply> {
    if bytes.len() != CMD_HEADER_SIZE {
        return Err(ProtocolError::malformed(format!(
            "RET_UNLINK is {} bytes, expected {}",
            bytes.len(),
            CMD_HEADER_SIZE
        )));
    }
    let mut buf = bytes;
    let command = buf.get_u32();
    if command != USBIP_RET_UNLINK {
        return Err(ProtocolError::malformed(format!(
            "expected RET_UNLINK, got {command:#010x}"
        )));
    }
    let seqnum = buf.get_u32();
    let devid = buf.get_u32();
    let direction = UrbDirection::from_wire(buf.get_u32())?;
    let ep = buf.get_u32();
    let status = buf.get_i32();

    Ok(UnlinkReply {
        seqnum,
        devid,
        direction,
        ep,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_submit() -> SubmitCommand {
        SubmitCommand {
            seqnum: 1,
            devid: 0x0001_0002,
            direction: UrbDirection::In,
            ep: 0,
            transfer_flags: 0,
            buffer_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
            payload: Vec::new(),
            iso_packets: Vec::new(),
        }
    }

    #[test]
    fn test_submit_roundtrip_in() {
        let submit = sample_submit();
        let bytes = encode_submit_command(&submit);
        assert_eq!(bytes.len(), CMD_HEADER_SIZE);
        let decoded = decode_command(&bytes, &DecodeLimits::default()).unwrap();
        assert_eq!(decoded, Command::Submit(submit));
    }

    #[test]
    fn test_submit_roundtrip_out_payload() {
        let mut submit = sample_submit();
        submit.direction = UrbDirection::Out;
        submit.ep = 2;
        submit.buffer_length = 4;
        submit.payload = vec![0xde, 0xad, 0xbe, 0xef];
        let bytes = encode_submit_command(&submit);
        assert_eq!(bytes.len(), CMD_HEADER_SIZE + 4);
        let decoded = decode_command(&bytes, &DecodeLimits::default()).unwrap();
        assert_eq!(decoded, Command::Submit(submit));
    }

    #[test]
    fn test_submit_roundtrip_iso() {
        let mut submit = sample_submit();
        submit.ep = 3;
        submit.number_of_packets = 2;
        submit.iso_packets = vec![
            IsoPacket {
                offset: 0,
                length: 192,
                actual_length: 0,
                status: 0,
            },
            IsoPacket {
                offset: 192,
                length: 192,
                actual_length: 0,
                status: 0,
            },
        ];
        let bytes = encode_submit_command(&submit);
        assert_eq!(bytes.len(), CMD_HEADER_SIZE + 2 * ISO_PACKET_SIZE);
        let decoded = decode_command(&bytes, &DecodeLimits::default()).unwrap();
        assert_eq!(decoded, Command::Submit(submit));
    }

    #[test]
    fn test_iso_sentinel_means_no_packets() {
        let mut submit = sample_submit();
        submit.number_of_packets = NO_ISO_SENTINEL;
        let bytes = encode_submit_command(&submit);
        let Command::Submit(decoded) = decode_command(&bytes, &DecodeLimits::default()).unwrap()
        else {
            panic!("expected submit");
        };
        assert_eq!(decoded.iso_packet_count(), 0);
        // the raw field survives for byte-exact re-encoding
        assert_eq!(encode_submit_command(&decoded), bytes);
    }

    #[test]
    fn test_unlink_roundtrip() {
        let unlink = UnlinkCommand {
            seqnum: 8,
            devid: 0x0001_0002,
            direction: UrbDirection::Out,
            ep: 0,
            victim_seqnum: 7,
        };
        let bytes = encode_unlink_command(&unlink);
        assert_eq!(bytes.len(), CMD_HEADER_SIZE);
        let decoded = decode_command(&bytes, &DecodeLimits::default()).unwrap();
        assert_eq!(decoded, Command::Unlink(unlink));
    }

    #[test]
    fn test_ret_submit_roundtrip() {
        let reply = SubmitReply {
            seqnum: 1,
            devid: 0x0001_0002,
            direction: UrbDirection::In,
            ep: 0,
            status: 0,
            actual_length: 3,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
            payload: vec![1, 2, 3],
            iso_packets: Vec::new(),
        };
        let bytes = encode_ret_submit(&reply);
        assert_eq!(bytes.len(), CMD_HEADER_SIZE + 3);
        assert_eq!(decode_ret_submit(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_ret_submit_error_has_no_payload() {
        let reply = SubmitReply {
            seqnum: 9,
            devid: 0x0001_0002,
            direction: UrbDirection::In,
            ep: 1,
            status: -110,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            setup: [0u8; 8],
            payload: Vec::new(),
            iso_packets: Vec::new(),
        };
        let bytes = encode_ret_submit(&reply);
        assert_eq!(bytes.len(), CMD_HEADER_SIZE);
    }

    #[test]
    fn test_ret_unlink_roundtrip() {
        let reply = UnlinkReply {
            seqnum: 8,
            devid: 0x0001_0002,
            direction: UrbDirection::Out,
            ep: 0,
            status: 0,
        };
        let bytes = encode_ret_unlink(&reply);
        assert_eq!(bytes.len(), CMD_HEADER_SIZE);
        assert_eq!(decode_ret_unlink(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_rejects_zero_devid() {
        let mut submit = sample_submit();
        submit.devid = 0;
        let bytes = encode_submit_command(&submit);
        let err = decode_command(&bytes, &DecodeLimits::default()).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_rejects_endpoint_out_of_range() {
        let mut submit = sample_submit();
        submit.ep = 16;
        let bytes = encode_submit_command(&submit);
        assert!(decode_command(&bytes, &DecodeLimits::default()).is_err());
    }

    #[test]
    fn test_rejects_negative_buffer_length() {
        let submit = sample_submit();
        let mut bytes = encode_submit_command(&submit);
        // transfer_buffer_length sits at offset 24
        bytes[24..28].copy_from_slice(&(-1i32).to_be_bytes());
        let err = decode_command(&bytes, &DecodeLimits::default()).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_rejects_message_over_limit() {
        let mut submit = sample_submit();
        submit.direction = UrbDirection::Out;
        submit.ep = 2;
        submit.buffer_length = 1024;
        submit.payload = vec![0; 1024];
        let bytes = encode_submit_command(&submit);
        let limits = DecodeLimits {
            max_message_size: 512,
            ..DecodeLimits::default()
        };
        assert!(decode_command(&bytes, &limits).is_err());
    }

    #[test]
    fn test_rejects_unknown_command() {
        let mut bytes = encode_unlink_command(&UnlinkCommand {
            seqnum: 1,
            devid: 0x0001_0001,
            direction: UrbDirection::Out,
            ep: 0,
            victim_seqnum: 2,
        });
        bytes[3] = 0x77;
        assert!(decode_command(&bytes, &DecodeLimits::default()).is_err());
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let mut submit = sample_submit();
        submit.direction = UrbDirection::Out;
        submit.ep = 2;
        submit.buffer_length = 8;
        submit.payload = vec![0; 8];
        let mut bytes = encode_submit_command(&submit);
        bytes.truncate(bytes.len() - 3);
        assert!(decode_command(&bytes, &DecodeLimits::default()).is_err());
    }

    #[test]
    fn test_flags_and_interval_pass_through() {
        let mut submit = sample_submit();
        submit.transfer_flags = 0xdead_beef;
        submit.interval = 0x1234_5678;
        let bytes = encode_submit_command(&submit);
        let Command::Submit(decoded) = decode_command(&bytes, &DecodeLimits::default()).unwrap()
        else {
            panic!("expected submit");
        };
        assert_eq!(decoded.transfer_flags, 0xdead_beef);
        assert_eq!(decoded.interval, 0x1234_5678);
    }
}
