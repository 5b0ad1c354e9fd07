//! Integration tests for the USB/IP wire codec
//!
//! Verifies byte-exact encodings against known wire vectors, encode/decode
//! round-trips for every message type, and rejection of malformed input.

use protocol::{
    CMD_HEADER_SIZE, Command, DecodeLimits, DeviceDescription, DeviceSpeed, InterfaceDescription,
    IsoPacket, OP_HEADER_SIZE, OpRequest, ProtocolError, SubmitCommand, SubmitReply,
    UnlinkCommand, UnlinkReply, UrbDirection, decode_command, decode_devlist_reply,
    decode_import_reply, decode_op_request, decode_ret_submit, decode_ret_unlink,
    encode_devlist_reply, encode_devlist_request, encode_import_reply, encode_import_request,
    encode_ret_submit, encode_ret_unlink, encode_submit_command, encode_unlink_command,
};

fn make_device(busid: &str, busnum: u32, devnum: u32, vid: u16, pid: u16) -> DeviceDescription {
    DeviceDescription {
        path: format!("/sys/devices/pci0000:00/usb{busnum}/{busid}"),
        busid: busid.to_string(),
        busnum,
        devnum,
        speed: DeviceSpeed::High,
        vendor_id: vid,
        product_id: pid,
        bcd_device: 0x0100,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value: 1,
        num_configurations: 1,
        interfaces: vec![InterfaceDescription {
            class: 0x03,
            subclass: 0x01,
            protocol: 0x02,
        }],
    }
}

mod enumeration {
    use super::*;

    #[test]
    fn test_devlist_request_wire_bytes() {
        // version 0x0111, code OP_REQ_DEVLIST, status 0
        assert_eq!(
            encode_devlist_request(),
            vec![0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_devlist_reply_two_devices() {
        let devices = vec![
            make_device("1-1", 1, 2, 0x05ac, 0x024f),
            make_device("2-3", 2, 4, 0x0781, 0x5567),
        ];
        let bytes = encode_devlist_reply(&devices);

        // header + count + 2 * (312-byte block + one interface record)
        assert_eq!(
            bytes.len(),
            OP_HEADER_SIZE + 4 + 2 * (DeviceDescription::WIRE_SIZE + 4)
        );
        assert_eq!(&bytes[..8], &[0x01, 0x11, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x00, 0x02]);

        let decoded = decode_devlist_reply(&bytes).unwrap();
        assert_eq!(decoded, devices);
        assert_eq!(decoded[0].vendor_id, 0x05ac);
        assert_eq!(decoded[1].busid, "2-3");
    }

    #[test]
    fn test_devlist_reply_empty() {
        let bytes = encode_devlist_reply(&[]);
        assert_eq!(bytes.len(), OP_HEADER_SIZE + 4);
        assert!(decode_devlist_reply(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_import_request_padding() {
        let bytes = encode_import_request("9-9").unwrap();
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[..8], &[0x01, 0x11, 0x80, 0x03, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[8..11], b"9-9");
        assert!(bytes[11..].iter().all(|&b| b == 0));

        let decoded = decode_op_request(&bytes).unwrap();
        assert_eq!(
            decoded,
            OpRequest::Import {
                busid: "9-9".to_string()
            }
        );
    }

    #[test]
    fn test_import_reply_roundtrip() {
        let device = make_device("1-1", 1, 2, 0x05ac, 0x024f);
        let bytes = encode_import_reply(0, Some(&device));
        assert_eq!(bytes.len(), OP_HEADER_SIZE + DeviceDescription::WIRE_SIZE);

        let (status, decoded) = decode_import_reply(&bytes).unwrap();
        assert_eq!(status, 0);
        let decoded = decoded.unwrap();
        assert_eq!(decoded.devid(), 0x0001_0002);
        assert_eq!(decoded.path, device.path);
    }

    #[test]
    fn test_import_failure_status_passes_through() {
        let bytes = encode_import_reply(1, None);
        let (status, device) = decode_import_reply(&bytes).unwrap();
        assert_eq!(status, 1);
        assert!(device.is_none());
    }

    #[test]
    fn test_version_rejected_in_any_request() {
        for encoded in [
            encode_devlist_request(),
            encode_import_request("1-1").unwrap(),
        ] {
            let mut bytes = encoded;
            bytes[1] = 0x10;
            let err = decode_op_request(&bytes).unwrap_err();
            assert!(matches!(err, ProtocolError::UnsupportedVersion { .. }));
        }
    }

    #[test]
    fn test_truncated_header_rejected() {
        let err = decode_op_request(&[0x01, 0x11, 0x80]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }
}

mod operational {
    use super::*;

    fn descriptor_submit() -> SubmitCommand {
        // GET_DESCRIPTOR(DEVICE), 18 bytes, as a VHCI importer sends it
        SubmitCommand {
            seqnum: 1,
            devid: 0x0001_0001,
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
    fn test_control_submit_wire_layout() {
        let bytes = encode_submit_command(&descriptor_submit());
        assert_eq!(bytes.len(), CMD_HEADER_SIZE);
        // command, seqnum, devid, direction, ep
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&bytes[4..8], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&bytes[8..12], &[0x00, 0x01, 0x00, 0x01]);
        assert_eq!(&bytes[12..16], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&bytes[16..20], &[0x00, 0x00, 0x00, 0x00]);
        // transfer_buffer_length
        assert_eq!(&bytes[24..28], &[0x00, 0x00, 0x00, 0x12]);
        // setup packet occupies the last 8 header bytes
        assert_eq!(&bytes[40..48], &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
    }

    #[test]
    fn test_ret_submit_wire_layout() {
        let reply = SubmitReply {
            seqnum: 1,
            devid: 0x0001_0001,
            direction: UrbDirection::In,
            ep: 0,
            status: 0,
            actual_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
            payload: vec![0xaa; 18],
            iso_packets: Vec::new(),
        };
        let bytes = encode_ret_submit(&reply);
        assert_eq!(bytes.len(), CMD_HEADER_SIZE + 18);
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x03]);
        // status and actual_length
        assert_eq!(&bytes[20..24], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[24..28], &[0x00, 0x00, 0x00, 0x12]);
        assert_eq!(&bytes[48..], &[0xaa; 18]);
        assert_eq!(decode_ret_submit(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_negative_status_encoding() {
        let reply = SubmitReply {
            seqnum: 7,
            devid: 0x0001_0001,
            direction: UrbDirection::In,
            ep: 1,
            status: -125,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            setup: [0u8; 8],
            payload: Vec::new(),
            iso_packets: Vec::new(),
        };
        let bytes = encode_ret_submit(&reply);
        // -125 (ECANCELED) big-endian two's complement
        assert_eq!(&bytes[20..24], &[0xff, 0xff, 0xff, 0x83]);
        assert_eq!(decode_ret_submit(&bytes).unwrap().status, -125);
    }

    #[test]
    fn test_unlink_wire_layout() {
        let unlink = UnlinkCommand {
            seqnum: 8,
            devid: 0x0001_0001,
            direction: UrbDirection::Out,
            ep: 0,
            victim_seqnum: 7,
        };
        let bytes = encode_unlink_command(&unlink);
        assert_eq!(bytes.len(), CMD_HEADER_SIZE);
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x02]);
        assert_eq!(&bytes[20..24], &[0x00, 0x00, 0x00, 0x07]);
        assert!(bytes[24..].iter().all(|&b| b == 0));
        assert_eq!(
            decode_command(&bytes, &DecodeLimits::default()).unwrap(),
            Command::Unlink(unlink)
        );
    }

    #[test]
    fn test_ret_unlink_roundtrip() {
        let reply = UnlinkReply {
            seqnum: 8,
            devid: 0x0001_0001,
            direction: UrbDirection::Out,
            ep: 0,
            status: 0,
        };
        let bytes = encode_ret_unlink(&reply);
        assert_eq!(bytes.len(), CMD_HEADER_SIZE);
        assert_eq!(decode_ret_unlink(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_out_submit_roundtrips_byte_exact() {
        let mut submit = descriptor_submit();
        submit.direction = UrbDirection::Out;
        submit.ep = 2;
        submit.buffer_length = 64;
        submit.payload = (0..64).collect();
        let bytes = encode_submit_command(&submit);
        let Command::Submit(decoded) = decode_command(&bytes, &DecodeLimits::default()).unwrap()
        else {
            panic!("expected submit");
        };
        assert_eq!(encode_submit_command(&decoded), bytes);
    }

    #[test]
    fn test_iso_submit_roundtrips_byte_exact() {
        let mut submit = descriptor_submit();
        submit.ep = 3;
        submit.number_of_packets = 4;
        submit.iso_packets = (0..4)
            .map(|i| IsoPacket {
                offset: i * 256,
                length: 256,
                actual_length: 0,
                status: 0,
            })
            .collect();
        let bytes = encode_submit_command(&submit);
        assert_eq!(bytes.len(), CMD_HEADER_SIZE + 4 * 16);
        let Command::Submit(decoded) = decode_command(&bytes, &DecodeLimits::default()).unwrap()
        else {
            panic!("expected submit");
        };
        assert_eq!(encode_submit_command(&decoded), bytes);
        assert_eq!(decoded.iso_packets.len(), 4);
    }

    #[test]
    fn test_zero_length_buffer_is_valid() {
        let mut submit = descriptor_submit();
        submit.buffer_length = 0;
        let bytes = encode_submit_command(&submit);
        assert!(decode_command(&bytes, &DecodeLimits::default()).is_ok());
    }

    #[test]
    fn test_malformed_inputs_never_panic() {
        let limits = DecodeLimits::default();
        let seed = encode_submit_command(&descriptor_submit());

        // single-byte corruption across the whole header
        for i in 0..seed.len() {
            for value in [0x00, 0x01, 0x7f, 0x80, 0xff] {
                let mut bytes = seed.clone();
                bytes[i] = value;
                let _ = decode_command(&bytes, &limits);
            }
        }
        // truncations
        for len in 0..seed.len() {
            let _ = decode_command(&seed[..len], &limits);
            let _ = decode_op_request(&seed[..len]);
            let _ = decode_ret_submit(&seed[..len]);
            let _ = decode_ret_unlink(&seed[..len]);
        }
    }

    #[test]
    fn test_malformed_errors_are_classified() {
        let limits = DecodeLimits::default();
        let mut bytes = encode_submit_command(&descriptor_submit());
        bytes[3] = 0x66; // unknown command code
        match decode_command(&bytes, &limits) {
            Err(ProtocolError::Malformed { .. }) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }
}
