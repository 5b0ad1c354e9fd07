//! rusb transfer backend
//!
//! Executes blocking USB transfers against a claimed device handle and maps
//! rusb errors onto the errno classes the wire protocol reports.

use common::{DeviceBackend, IsoOutcome};
use protocol::TransferError;
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::debug;

/// Blocking transfer backend over an open rusb device handle
///
/// The handle is shared by every endpoint lane; libusb's synchronous
/// transfer calls are thread-safe on one handle.
pub struct RusbBackend {
    handle: DeviceHandle<Context>,
}

impl RusbBackend {
    pub fn new(handle: DeviceHandle<Context>) -> Self {
        Self { handle }
    }
}

/// Fields of the 8-byte setup packet, which is little-endian unlike the
/// rest of the wire protocol
fn split_setup(setup: [u8; 8]) -> (u8, u8, u16, u16) {
    let request_type = setup[0];
    let request = setup[1];
    let value = u16::from_le_bytes([setup[2], setup[3]]);
    let index = u16::from_le_bytes([setup[4], setup[5]]);
    (request_type, request, value, index)
}

impl DeviceBackend for RusbBackend {
    fn control_in(
        &self,
        setup: [u8; 8],
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        let (request_type, request, value, index) = split_setup(setup);
        let mut buffer = vec![0u8; length];
        let read = self
            .handle
            .read_control(request_type, request, value, index, &mut buffer, timeout)
            .map_err(map_rusb_error)?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn control_out(
        &self,
        setup: [u8; 8],
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        let (request_type, request, value, index) = split_setup(setup);
        self.handle
            .write_control(request_type, request, value, index, &data, timeout)
            .map_err(map_rusb_error)
    }

    fn bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        let mut buffer = vec![0u8; length];
        let read = self
            .handle
            .read_bulk(endpoint, &mut buffer, timeout)
            .map_err(map_rusb_error)?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn bulk_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        self.handle
            .write_bulk(endpoint, &data, timeout)
            .map_err(map_rusb_error)
    }

    fn interrupt_in(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        let mut buffer = vec![0u8; length];
        let read = self
            .handle
            .read_interrupt(endpoint, &mut buffer, timeout)
            .map_err(map_rusb_error)?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn interrupt_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        self.handle
            .write_interrupt(endpoint, &data, timeout)
            .map_err(map_rusb_error)
    }

    fn isochronous_in(
        &self,
        endpoint: u8,
        _packet_lengths: Vec<u32>,
        _timeout: Duration,
    ) -> Result<IsoOutcome, TransferError> {
        // libusb's synchronous API has no isochronous path
        debug!(endpoint, "isochronous transfer refused by the rusb backend");
        Err(TransferError::InvalidArgument)
    }

    fn isochronous_out(
        &self,
        endpoint: u8,
        _data: Vec<u8>,
        _packet_lengths: Vec<u32>,
        _timeout: Duration,
    ) -> Result<IsoOutcome, TransferError> {
        debug!(endpoint, "isochronous transfer refused by the rusb backend");
        Err(TransferError::InvalidArgument)
    }
}

/// Map rusb::Error to the errno classes of the wire protocol
pub(crate) fn map_rusb_error(err: rusb::Error) -> TransferError {
    match err {
        rusb::Error::Timeout => TransferError::TimedOut,
        rusb::Error::Pipe => TransferError::Stall,
        rusb::Error::NoDevice => TransferError::Disconnected,
        rusb::Error::Access => TransferError::PermissionDenied,
        rusb::Error::Busy => TransferError::Busy,
        rusb::Error::NoMem => TransferError::NoMemory,
        rusb::Error::InvalidParam | rusb::Error::NotFound | rusb::Error::NotSupported => {
            TransferError::InvalidArgument
        }
        _ => TransferError::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransferError::TimedOut);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransferError::Stall);
        assert_eq!(
            map_rusb_error(rusb::Error::NoDevice),
            TransferError::Disconnected
        );
        assert_eq!(
            map_rusb_error(rusb::Error::Access),
            TransferError::PermissionDenied
        );
        assert_eq!(map_rusb_error(rusb::Error::Busy), TransferError::Busy);
        assert_eq!(map_rusb_error(rusb::Error::Io), TransferError::Io);
        assert_eq!(
            map_rusb_error(rusb::Error::InvalidParam),
            TransferError::InvalidArgument
        );
    }

    #[test]
    fn test_split_setup_little_endian() {
        // GET_DESCRIPTOR(DEVICE), wLength 18
        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let (request_type, request, value, index) = split_setup(setup);
        assert_eq!(request_type, 0x80);
        assert_eq!(request, 0x06);
        assert_eq!(value, 0x0100);
        assert_eq!(index, 0x0000);
    }
}
