//! Stream framing for USB/IP messages
//!
//! The sync `decode_*`/`encode_*` functions in [`crate::op`] and
//! [`crate::cmd`] operate on complete byte slices; this module adds the
//! incremental readers a live TCP session needs. USB/IP has no outer length
//! prefix; each message announces its own variable parts (device count,
//! transfer buffer length, iso packet count), so the readers pull exactly
//! what the headers announce and nothing more.

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, BytesMut};

#[cfg(feature = "async")]
use crate::cmd::{
    Command, DecodeLimits, attach_submit_extras, decode_cmd_header, submit_extra_len,
    CMD_HEADER_SIZE, DecodedHeader,
};
#[cfg(feature = "async")]
use crate::op::{
    OP_HEADER_SIZE, OP_REQ_DEVLIST, OP_REQ_IMPORT, OpHeader, OpRequest, SYSFS_BUS_ID_SIZE,
};
#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write `value` NUL-padded into a fixed-size field
///
/// Values longer than the field are truncated, always leaving a trailing NUL.
pub(crate) fn put_padded(buf: &mut BytesMut, value: &[u8], field_size: usize) {
    let len = value.len().min(field_size - 1);
    buf.put_slice(&value[..len]);
    buf.put_bytes(0, field_size - len);
}

/// Read a NUL-padded fixed-size field back into a string
pub(crate) fn take_padded_string(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::malformed("non-UTF-8 bytes in string field"))
}

/// Read one enumeration request from the stream
///
/// Validates the version word and operation code; the import body is read
/// only after the header proves well-formed.
#[cfg(feature = "async")]
pub async fn read_op_request<R>(reader: &mut R) -> Result<OpRequest>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; OP_HEADER_SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = OpHeader::decode(&header_bytes)?;
    header.check_version()?;

    match header.code {
        OP_REQ_DEVLIST => Ok(OpRequest::Devlist),
        OP_REQ_IMPORT => {
            let mut busid_bytes = [0u8; SYSFS_BUS_ID_SIZE];
            reader.read_exact(&mut busid_bytes).await?;
            let busid = take_padded_string(&busid_bytes)?;
            Ok(OpRequest::Import { busid })
        }
        code => Err(ProtocolError::malformed(format!(
            "unknown operation code {code:#06x}"
        ))),
    }
}

/// Read one operational request (submit or unlink) from the stream
///
/// The OUT payload and iso descriptors are only read after the header's
/// announced sizes pass the [`DecodeLimits`] checks, so a hostile length
/// can never force an allocation beyond the configured maximum.
#[cfg(feature = "async")]
pub async fn read_command<R>(reader: &mut R, limits: &DecodeLimits) -> Result<Command>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; CMD_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    match decode_cmd_header(&header)? {
        DecodedHeader::Submit(mut submit) => {
            let (payload_len, iso_len) = submit_extra_len(&submit, limits)?;
            let mut payload = vec![0u8; payload_len];
            reader.read_exact(&mut payload).await?;
            let mut iso = vec![0u8; iso_len];
            reader.read_exact(&mut iso).await?;
            attach_submit_extras(&mut submit, payload, &iso);
            Ok(Command::Submit(submit))
        }
        DecodedHeader::Unlink(unlink) => Ok(Command::Unlink(unlink)),
    }
}

/// Write an encoded message to the stream
#[cfg(feature = "async")]
pub async fn write_message<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    Ok(())
}
