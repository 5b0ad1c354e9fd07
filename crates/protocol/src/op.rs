//! Control-plane (enumeration) messages
//!
//! Before a connection switches into the operational phase it speaks the
//! USB/IP enumeration protocol: a fixed 8-byte operation header followed by
//! an operation-specific body. All integers are big-endian.
//!
//! ```text
//! +----------------+----------------+--------------------------------+
//! | version: u16   | code: u16      | status: u32                    |
//! +----------------+----------------+--------------------------------+
//! | body (devlist: none; import: 32-byte NUL-padded bus id)          |
//! +------------------------------------------------------------------+
//! ```

use crate::codec::{put_padded, take_padded_string};
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Protocol version spoken by this implementation
pub const USBIP_VERSION: u16 = 0x0111;

/// Request the list of exportable devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Reply carrying the device list
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Request import of a device by bus id
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Reply to an import request
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Operation status: success
pub const OP_STATUS_OK: u32 = 0;
/// Operation status: generic failure
pub const OP_STATUS_ERROR: u32 = 1;

/// Size of the sysfs path field on the wire
pub const SYSFS_PATH_MAX: usize = 256;
/// Size of the bus id field on the wire
pub const SYSFS_BUS_ID_SIZE: usize = 32;

/// Size of the operation header
pub const OP_HEADER_SIZE: usize = 8;

/// The 8-byte header carried by every enumeration message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    pub fn new(code: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status,
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.version);
        buf.put_u16(self.code);
        buf.put_u32(self.status);
    }

    /// Decode a header without validating the version word
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < OP_HEADER_SIZE {
            return Err(ProtocolError::malformed(format!(
                "operation header truncated: {} of {} bytes",
                bytes.len(),
                OP_HEADER_SIZE
            )));
        }
        let mut buf = bytes;
        Ok(Self {
            version: buf.get_u16(),
            code: buf.get_u16(),
            status: buf.get_u32(),
        })
    }

    /// Reject any version word other than [`USBIP_VERSION`]
    pub fn check_version(&self) -> Result<()> {
        if self.version != USBIP_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                version: self.version,
                expected: USBIP_VERSION,
            });
        }
        Ok(())
    }
}

/// A decoded enumeration request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRequest {
    /// `OP_REQ_DEVLIST`
    Devlist,
    /// `OP_REQ_IMPORT` with the requested bus id
    Import { busid: String },
}

/// USB device speed as encoded on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Unknown,
    /// 1.5 Mbps (USB 1.0)
    Low,
    /// 12 Mbps (USB 1.1)
    Full,
    /// 480 Mbps (USB 2.0)
    High,
    /// Wireless USB
    Wireless,
    /// 5 Gbps (USB 3.0)
    Super,
    /// 10 Gbps (USB 3.1)
    SuperPlus,
}

impl DeviceSpeed {
    pub fn as_wire(self) -> u32 {
        match self {
            DeviceSpeed::Unknown => 0,
            DeviceSpeed::Low => 1,
            DeviceSpeed::Full => 2,
            DeviceSpeed::High => 3,
            DeviceSpeed::Wireless => 4,
            DeviceSpeed::Super => 5,
            DeviceSpeed::SuperPlus => 6,
        }
    }

    /// Unrecognized values fold into [`DeviceSpeed::Unknown`]
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            1 => DeviceSpeed::Low,
            2 => DeviceSpeed::Full,
            3 => DeviceSpeed::High,
            4 => DeviceSpeed::Wireless,
            5 => DeviceSpeed::Super,
            6 => DeviceSpeed::SuperPlus,
            _ => DeviceSpeed::Unknown,
        }
    }
}

/// One interface record appended to a devlist device block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescription {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// An exportable device as advertised to clients
///
/// Immutable snapshot taken during an enumeration pass. The on-wire form is
/// a 312-byte fixed block; the devlist reply appends one 4-byte record per
/// interface, the import reply carries the block alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    /// Host-side device path (e.g. sysfs path), truncated to 255 bytes
    pub path: String,
    /// Bus id the client imports by (e.g. `"1-1"`), truncated to 31 bytes
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: DeviceSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceDescription>,
}

impl DeviceDescription {
    /// Size of the fixed device block, excluding interface records
    pub const WIRE_SIZE: usize = 312;

    /// The 32-bit device id assigned on import: `(busnum << 16) | devnum`
    pub fn devid(&self) -> u32 {
        (self.busnum << 16) | self.devnum
    }

    fn encode_into(&self, buf: &mut BytesMut, with_interfaces: bool) {
        put_padded(buf, self.path.as_bytes(), SYSFS_PATH_MAX);
        put_padded(buf, self.busid.as_bytes(), SYSFS_BUS_ID_SIZE);
        buf.put_u32(self.busnum);
        buf.put_u32(self.devnum);
        buf.put_u32(self.speed.as_wire());
        buf.put_u16(self.vendor_id);
        buf.put_u16(self.product_id);
        buf.put_u16(self.bcd_device);
        buf.put_u8(self.device_class);
        buf.put_u8(self.device_subclass);
        buf.put_u8(self.device_protocol);
        buf.put_u8(self.configuration_value);
        buf.put_u8(self.num_configurations);
        buf.put_u8(self.interfaces.len() as u8);
        if with_interfaces {
            for intf in &self.interfaces {
                buf.put_u8(intf.class);
                buf.put_u8(intf.subclass);
                buf.put_u8(intf.protocol);
                buf.put_u8(0); // padding
            }
        }
    }

    fn decode_from(buf: &mut &[u8], with_interfaces: bool) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(ProtocolError::malformed(format!(
                "device block truncated: {} of {} bytes",
                buf.len(),
                Self::WIRE_SIZE
            )));
        }
        let path = take_padded_string(&buf[..SYSFS_PATH_MAX])?;
        buf.advance(SYSFS_PATH_MAX);
        let busid = take_padded_string(&buf[..SYSFS_BUS_ID_SIZE])?;
        buf.advance(SYSFS_BUS_ID_SIZE);

        let busnum = buf.get_u32();
        let devnum = buf.get_u32();
        let speed = DeviceSpeed::from_wire(buf.get_u32());
        let vendor_id = buf.get_u16();
        let product_id = buf.get_u16();
        let bcd_device = buf.get_u16();
        let device_class = buf.get_u8();
        let device_subclass = buf.get_u8();
        let device_protocol = buf.get_u8();
        let configuration_value = buf.get_u8();
        let num_configurations = buf.get_u8();
        let num_interfaces = buf.get_u8() as usize;

        let mut interfaces = Vec::new();
        if with_interfaces {
            if buf.len() < num_interfaces * 4 {
                return Err(ProtocolError::malformed(
                    "interface records truncated".to_string(),
                ));
            }
            interfaces.reserve(num_interfaces);
            for _ in 0..num_interfaces {
                let class = buf.get_u8();
                let subclass = buf.get_u8();
                let protocol = buf.get_u8();
                let _pad = buf.get_u8();
                interfaces.push(InterfaceDescription {
                    class,
                    subclass,
                    protocol,
                });
            }
        }

        Ok(Self {
            path,
            busid,
            busnum,
            devnum,
            speed,
            vendor_id,
            product_id,
            bcd_device,
            device_class,
            device_subclass,
            device_protocol,
            configuration_value,
            num_configurations,
            interfaces,
        })
    }
}

/// Encode an `OP_REQ_DEVLIST`
pub fn encode_devlist_request() -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(OP_HEADER_SIZE);
    OpHeader::new(OP_REQ_DEVLIST, OP_STATUS_OK).encode_into(&mut buf);
    buf.to_vec()
}

/// Encode an `OP_REQ_IMPORT` for the given bus id
pub fn encode_import_request(busid: &str) -> Result<Vec<u8>> {
    if busid.len() >= SYSFS_BUS_ID_SIZE {
        return Err(ProtocolError::malformed(format!(
            "bus id longer than {} bytes",
            SYSFS_BUS_ID_SIZE - 1
        )));
    }
    let mut buf = BytesMut::with_capacity(OP_HEADER_SIZE + SYSFS_BUS_ID_SIZE);
    OpHeader::new(OP_REQ_IMPORT, OP_STATUS_OK).encode_into(&mut buf);
    put_padded(&mut buf, busid.as_bytes(), SYSFS_BUS_ID_SIZE);
    Ok(buf.to_vec())
}

/// Encode an `OP_REP_DEVLIST` carrying the full device list
pub fn encode_devlist_reply(devices: &[DeviceDescription]) -> Vec<u8> {
    let body: usize = devices
        .iter()
        .map(|d| DeviceDescription::WIRE_SIZE + d.interfaces.len() * 4)
        .sum();
    let mut buf = BytesMut::with_capacity(OP_HEADER_SIZE + 4 + body);
    OpHeader::new(OP_REP_DEVLIST, OP_STATUS_OK).encode_into(&mut buf);
    buf.put_u32(devices.len() as u32);
    for device in devices {
        device.encode_into(&mut buf, true);
    }
    buf.to_vec()
}

/// Encode an `OP_REP_IMPORT`
///
/// A successful reply (`status == 0`) carries the device block without
/// interface records; a failed reply carries the header alone.
pub fn encode_import_reply(status: u32, device: Option<&DeviceDescription>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(OP_HEADER_SIZE + DeviceDescription::WIRE_SIZE);
    OpHeader::new(OP_REP_IMPORT, status).encode_into(&mut buf);
    if status == OP_STATUS_OK {
        if let Some(device) = device {
            device.encode_into(&mut buf, false);
        }
    }
    buf.to_vec()
}

/// Encode a bare reply header, used for best-effort error responses
pub fn encode_op_status(code: u16, status: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(OP_HEADER_SIZE);
    OpHeader::new(code, status).encode_into(&mut buf);
    buf.to_vec()
}

/// Decode a complete enumeration request (header plus body)
pub fn decode_op_request(bytes: &[u8]) -> Result<OpRequest> {
    let header = OpHeader::decode(bytes)?;
    header.check_version()?;
    let body = &bytes[OP_HEADER_SIZE..];
    match header.code {
        OP_REQ_DEVLIST => {
            if !body.is_empty() {
                return Err(ProtocolError::malformed(
                    "OP_REQ_DEVLIST carries no body".to_string(),
                ));
            }
            Ok(OpRequest::Devlist)
        }
        OP_REQ_IMPORT => {
            if body.len() != SYSFS_BUS_ID_SIZE {
                return Err(ProtocolError::malformed(format!(
                    "OP_REQ_IMPORT body is {} bytes, expected {}",
                    body.len(),
                    SYSFS_BUS_ID_SIZE
                )));
            }
            let busid = take_padded_string(body)?;
            Ok(OpRequest::Import { busid })
        }
        code => Err(ProtocolError::malformed(format!(
            "unknown operation code {code:#06x}"
        ))),
    }
}

/// Decode an `OP_REP_DEVLIST` into its advertised devices
pub fn decode_devlist_reply(bytes: &[u8]) -> Result<Vec<DeviceDescription>> {
    let header = OpHeader::decode(bytes)?;
    header.check_version()?;
    if header.code != OP_REP_DEVLIST {
        return Err(ProtocolError::malformed(format!(
            "expected OP_REP_DEVLIST, got {:#06x}",
            header.code
        )));
    }
    let mut buf = &bytes[OP_HEADER_SIZE..];
    if buf.len() < 4 {
        return Err(ProtocolError::malformed("device count truncated".to_string()));
    }
    let count = buf.get_u32();
    let mut devices = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        devices.push(DeviceDescription::decode_from(&mut buf, true)?);
    }
    if !buf.is_empty() {
        return Err(ProtocolError::malformed(format!(
            "{} trailing bytes after device list",
            buf.len()
        )));
    }
    Ok(devices)
}

/// Decode an `OP_REP_IMPORT` into its status and, on success, the device
pub fn decode_import_reply(bytes: &[u8]) -> Result<(u32, Option<DeviceDescription>)> {
    let header = OpHeader::decode(bytes)?;
    header.check_version()?;
    if header.code != OP_REP_IMPORT {
        return Err(ProtocolError::malformed(format!(
            "expected OP_REP_IMPORT, got {:#06x}",
            header.code
        )));
    }
    if header.status != OP_STATUS_OK {
        return Ok((header.status, None));
    }
    let mut buf = &bytes[OP_HEADER_SIZE..];
    let device = DeviceDescription::decode_from(&mut buf, false)?;
    Ok((OP_STATUS_OK, Some(device)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device() -> DeviceDescription {
        DeviceDescription {
            path: "/sys/devices/pci0000:00/usb1/1-1".to_string(),
            busid: "1-1".to_string(),
            busnum: 1,
            devnum: 2,
            speed: DeviceSpeed::High,
            vendor_id: 0x05ac,
            product_id: 0x024f,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![InterfaceDescription {
                class: 3,
                subclass: 1,
                protocol: 1,
            }],
        }
    }

    #[test]
    fn test_devlist_request_bytes() {
        let bytes = encode_devlist_request();
        assert_eq!(bytes, vec![0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_devid_composition() {
        let device = sample_device();
        assert_eq!(device.devid(), 0x0001_0002);
    }

    #[test]
    fn test_devlist_reply_size() {
        let device = sample_device();
        let bytes = encode_devlist_reply(std::slice::from_ref(&device));
        assert_eq!(
            bytes.len(),
            OP_HEADER_SIZE + 4 + DeviceDescription::WIRE_SIZE + 4
        );
        assert_eq!(&bytes[..8], &[0x01, 0x11, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_devlist_roundtrip() {
        let devices = vec![sample_device()];
        let bytes = encode_devlist_reply(&devices);
        let decoded = decode_devlist_reply(&bytes).unwrap();
        assert_eq!(decoded, devices);
    }

    #[test]
    fn test_import_request_roundtrip() {
        let bytes = encode_import_request("1-1").unwrap();
        assert_eq!(bytes.len(), OP_HEADER_SIZE + SYSFS_BUS_ID_SIZE);
        let decoded = decode_op_request(&bytes).unwrap();
        assert_eq!(
            decoded,
            OpRequest::Import {
                busid: "1-1".to_string()
            }
        );
    }

    #[test]
    fn test_import_reply_success_has_no_interfaces() {
        let device = sample_device();
        let bytes = encode_import_reply(OP_STATUS_OK, Some(&device));
        assert_eq!(bytes.len(), OP_HEADER_SIZE + DeviceDescription::WIRE_SIZE);
        let (status, decoded) = decode_import_reply(&bytes).unwrap();
        assert_eq!(status, OP_STATUS_OK);
        let decoded = decoded.unwrap();
        assert_eq!(decoded.busid, "1-1");
        // the count survives even though the records are not serialized
        assert!(decoded.interfaces.is_empty());
    }

    #[test]
    fn test_import_reply_failure_is_header_only() {
        let bytes = encode_import_reply(OP_STATUS_ERROR, None);
        assert_eq!(bytes.len(), OP_HEADER_SIZE);
        let (status, device) = decode_import_reply(&bytes).unwrap();
        assert_eq!(status, OP_STATUS_ERROR);
        assert!(device.is_none());
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut bytes = encode_devlist_request();
        bytes[0] = 0x01;
        bytes[1] = 0x10;
        let err = decode_op_request(&bytes).unwrap_err();
        assert!(matches!(
            err,
            crate::ProtocolError::UnsupportedVersion { version: 0x0110, .. }
        ));
    }

    #[test]
    fn test_rejects_unknown_operation() {
        let mut bytes = encode_devlist_request();
        bytes[3] = 0x99;
        let err = decode_op_request(&bytes).unwrap_err();
        assert!(matches!(err, crate::ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_rejects_overlong_busid() {
        let busid = "x".repeat(SYSFS_BUS_ID_SIZE);
        assert!(encode_import_request(&busid).is_err());
    }

    #[test]
    fn test_speed_wire_values() {
        assert_eq!(DeviceSpeed::Low.as_wire(), 1);
        assert_eq!(DeviceSpeed::SuperPlus.as_wire(), 6);
        assert_eq!(DeviceSpeed::from_wire(3), DeviceSpeed::High);
        assert_eq!(DeviceSpeed::from_wire(99), DeviceSpeed::Unknown);
    }
}
