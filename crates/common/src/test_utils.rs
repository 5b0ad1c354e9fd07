//! Test utilities
//!
//! Programmable in-memory implementations of the device ports, plus device
//! description builders, shared by unit and integration tests across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockBackend, MockReply, sample_description};
//!
//! let backend = MockBackend::new();
//! backend.script(0x80, MockReply::data(vec![0x12, 0x01]));
//! let device = sample_description("1-1", 1, 2, 0x05ac, 0x024f);
//! assert_eq!(device.devid(), 0x0001_0002);
//! ```

use crate::device::{
    ClaimedDevice, DeviceBackend, DeviceRegistry, EndpointDescriptor, EndpointKind, IsoOutcome,
    RegistryError,
};
use protocol::{DeviceDescription, DeviceSpeed, InterfaceDescription, TransferError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What a scripted backend call produces
#[derive(Debug, Clone)]
enum MockOutcome {
    /// IN data to hand back
    Data(Vec<u8>),
    /// Byte count accepted for an OUT transfer
    Written(usize),
    /// Isochronous result
    Iso(IsoOutcome),
    Error(TransferError),
}

/// One scripted reply, optionally delayed on the blocking thread
///
/// Delays let tests stage races deterministically: a reply delayed past an
/// unlink makes the cancellation win, an immediate reply lets completion win.
#[derive(Debug, Clone)]
pub struct MockReply {
    outcome: MockOutcome,
    delay: Option<Duration>,
}

impl MockReply {
    pub fn data(bytes: Vec<u8>) -> Self {
        Self {
            outcome: MockOutcome::Data(bytes),
            delay: None,
        }
    }

    pub fn written(count: usize) -> Self {
        Self {
            outcome: MockOutcome::Written(count),
            delay: None,
        }
    }

    pub fn iso(outcome: IsoOutcome) -> Self {
        Self {
            outcome: MockOutcome::Iso(outcome),
            delay: None,
        }
    }

    pub fn error(error: TransferError) -> Self {
        Self {
            outcome: MockOutcome::Error(error),
            delay: None,
        }
    }

    /// Sleep this long on the blocking thread before replying
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Programmable in-memory [`DeviceBackend`]
///
/// Replies are scripted per endpoint address (direction bit included;
/// control transfers use 0x80/0x00). An endpoint with no scripted reply
/// answers benignly: empty data for IN, full acceptance for OUT. Every call
/// is recorded so tests can assert ordering.
pub struct MockBackend {
    scripts: Mutex<HashMap<u8, VecDeque<MockReply>>>,
    call_log: Mutex<Vec<u8>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            call_log: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for the given endpoint address
    pub fn script(&self, endpoint: u8, reply: MockReply) {
        self.scripts
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .push_back(reply);
    }

    /// Endpoint addresses in the order calls reached the backend
    pub fn calls(&self) -> Vec<u8> {
        self.call_log.lock().unwrap().clone()
    }

    fn next_reply(&self, endpoint: u8) -> Option<MockReply> {
        self.call_log.lock().unwrap().push(endpoint);
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front)
    }

    fn reply_in(&self, endpoint: u8, length: usize) -> Result<Vec<u8>, TransferError> {
        match self.next_reply(endpoint) {
            None => Ok(Vec::new()),
            Some(reply) => {
                if let Some(delay) = reply.delay {
                    std::thread::sleep(delay);
                }
                match reply.outcome {
                    MockOutcome::Data(mut data) => {
                        data.truncate(length);
                        Ok(data)
                    }
                    MockOutcome::Error(error) => Err(error),
                    _ => Err(TransferError::Io),
                }
            }
        }
    }

    fn reply_out(&self, endpoint: u8, data_len: usize) -> Result<usize, TransferError> {
        match self.next_reply(endpoint) {
            None => Ok(data_len),
            Some(reply) => {
                if let Some(delay) = reply.delay {
                    std::thread::sleep(delay);
                }
                match reply.outcome {
                    MockOutcome::Written(count) => Ok(count),
                    MockOutcome::Error(error) => Err(error),
                    _ => Err(TransferError::Io),
                }
            }
        }
    }

    fn reply_iso(&self, endpoint: u8) -> Result<IsoOutcome, TransferError> {
        match self.next_reply(endpoint) {
            None => Ok(IsoOutcome::default()),
            Some(reply) => {
                if let Some(delay) = reply.delay {
                    std::thread::sleep(delay);
                }
                match reply.outcome {
                    MockOutcome::Iso(outcome) => Ok(outcome),
                    MockOutcome::Error(error) => Err(error),
                    _ => Err(TransferError::Io),
                }
            }
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for MockBackend {
    fn control_in(
        &self,
        _setup: [u8; 8],
        length: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        self.reply_in(0x80, length)
    }

    fn control_out(
        &self,
        _setup: [u8; 8],
        data: Vec<u8>,
        _timeout: Duration,
    ) -> Result<usize, TransferError> {
        self.reply_out(0x00, data.len())
    }

    fn bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        self.reply_in(endpoint, length)
    }

    fn bulk_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        _timeout: Duration,
    ) -> Result<usize, TransferError> {
        self.reply_out(endpoint, data.len())
    }

    fn interrupt_in(
        &self,
        endpoint: u8,
        length: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransferError> {
        self.reply_in(endpoint, length)
    }

    fn interrupt_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        _timeout: Duration,
    ) -> Result<usize, TransferError> {
        self.reply_out(endpoint, data.len())
    }

    fn isochronous_in(
        &self,
        endpoint: u8,
        _packet_lengths: Vec<u32>,
        _timeout: Duration,
    ) -> Result<IsoOutcome, TransferError> {
        self.reply_iso(endpoint)
    }

    fn isochronous_out(
        &self,
        endpoint: u8,
        _data: Vec<u8>,
        _packet_lengths: Vec<u32>,
        _timeout: Duration,
    ) -> Result<IsoOutcome, TransferError> {
        self.reply_iso(endpoint)
    }
}

struct MockDevice {
    description: DeviceDescription,
    endpoints: Vec<EndpointDescriptor>,
    backend: Arc<MockBackend>,
    disconnect_tx: watch::Sender<bool>,
}

/// In-memory [`DeviceRegistry`] with exclusive claims and triggerable
/// disconnects
pub struct MockRegistry {
    devices: Mutex<HashMap<String, MockDevice>>,
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register a device with the standard sample endpoint set
    pub fn add_device(&self, description: DeviceDescription) -> Arc<MockBackend> {
        self.add_device_with_endpoints(description, sample_endpoints())
    }

    pub fn add_device_with_endpoints(
        &self,
        description: DeviceDescription,
        endpoints: Vec<EndpointDescriptor>,
    ) -> Arc<MockBackend> {
        let backend = Arc::new(MockBackend::new());
        let (disconnect_tx, _) = watch::channel(false);
        self.devices.lock().unwrap().insert(
            description.busid.clone(),
            MockDevice {
                description,
                endpoints,
                backend: backend.clone(),
                disconnect_tx,
            },
        );
        backend
    }

    /// Fire the disconnect signal for a device
    pub fn disconnect(&self, busid: &str) {
        if let Some(device) = self.devices.lock().unwrap().get(busid) {
            let _ = device.disconnect_tx.send(true);
        }
    }

    pub fn is_claimed(&self, busid: &str) -> bool {
        self.claimed.lock().unwrap().contains(busid)
    }
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry for MockRegistry {
    fn list(&self) -> Result<Vec<DeviceDescription>, RegistryError> {
        let devices = self.devices.lock().unwrap();
        let mut list: Vec<_> = devices.values().map(|d| d.description.clone()).collect();
        list.sort_by(|a, b| a.busid.cmp(&b.busid));
        Ok(list)
    }

    fn lookup(&self, busid: &str) -> Result<DeviceDescription, RegistryError> {
        self.devices
            .lock()
            .unwrap()
            .get(busid)
            .map(|d| d.description.clone())
            .ok_or_else(|| RegistryError::NotFound {
                busid: busid.to_string(),
            })
    }

    fn claim(&self, busid: &str) -> Result<ClaimedDevice, RegistryError> {
        let devices = self.devices.lock().unwrap();
        let device = devices.get(busid).ok_or_else(|| RegistryError::NotFound {
            busid: busid.to_string(),
        })?;

        let mut claimed = self.claimed.lock().unwrap();
        if !claimed.insert(busid.to_string()) {
            return Err(RegistryError::AlreadyClaimed {
                busid: busid.to_string(),
            });
        }

        let claimed_set = self.claimed.clone();
        let release_busid = busid.to_string();
        Ok(ClaimedDevice::new(
            device.description.clone(),
            device.endpoints.clone(),
            device.backend.clone(),
            device.disconnect_tx.subscribe(),
            move || {
                claimed_set.lock().unwrap().remove(&release_busid);
            },
        ))
    }
}

/// Build a device description for tests
pub fn sample_description(
    busid: &str,
    busnum: u32,
    devnum: u32,
    vendor_id: u16,
    product_id: u16,
) -> DeviceDescription {
    DeviceDescription {
        path: format!("/sys/devices/pci0000:00/usb{busnum}/{busid}"),
        busid: busid.to_string(),
        busnum,
        devnum,
        speed: DeviceSpeed::High,
        vendor_id,
        product_id,
        bcd_device: 0x0100,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value: 1,
        num_configurations: 1,
        interfaces: vec![InterfaceDescription {
            class: 0x03,
            subclass: 0x01,
            protocol: 0x01,
        }],
    }
}

/// Standard endpoint set: bulk 1 in/out, interrupt 3 in, iso 4 in/out
pub fn sample_endpoints() -> Vec<EndpointDescriptor> {
    vec![
        EndpointDescriptor {
            address: 0x81,
            kind: EndpointKind::Bulk,
            max_packet_size: 512,
            interval: 0,
        },
        EndpointDescriptor {
            address: 0x01,
            kind: EndpointKind::Bulk,
            max_packet_size: 512,
            interval: 0,
        },
        EndpointDescriptor {
            address: 0x83,
            kind: EndpointKind::Interrupt,
            max_packet_size: 64,
            interval: 10,
        },
        EndpointDescriptor {
            address: 0x84,
            kind: EndpointKind::Isochronous,
            max_packet_size: 1024,
            interval: 1,
        },
        EndpointDescriptor {
            address: 0x04,
            kind: EndpointKind::Isochronous,
            max_packet_size: 1024,
            interval: 1,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_replies_pop_in_order() {
        let backend = MockBackend::new();
        backend.script(0x81, MockReply::data(vec![1]));
        backend.script(0x81, MockReply::data(vec![2]));

        assert_eq!(
            backend.bulk_in(0x81, 64, DEFAULT_TEST_TIMEOUT).unwrap(),
            vec![1]
        );
        assert_eq!(
            backend.bulk_in(0x81, 64, DEFAULT_TEST_TIMEOUT).unwrap(),
            vec![2]
        );
        // script exhausted: benign empty reply
        assert!(
            backend
                .bulk_in(0x81, 64, DEFAULT_TEST_TIMEOUT)
                .unwrap()
                .is_empty()
        );
        assert_eq!(backend.calls(), vec![0x81, 0x81, 0x81]);
    }

    #[test]
    fn test_scripted_error() {
        let backend = MockBackend::new();
        backend.script(0x80, MockReply::error(TransferError::Stall));
        let err = backend
            .control_in([0u8; 8], 8, DEFAULT_TEST_TIMEOUT)
            .unwrap_err();
        assert_eq!(err, TransferError::Stall);
    }

    #[test]
    fn test_in_reply_clamped_to_request() {
        let backend = MockBackend::new();
        backend.script(0x80, MockReply::data(vec![0xaa; 64]));
        let data = backend
            .control_in([0u8; 8], 8, DEFAULT_TEST_TIMEOUT)
            .unwrap();
        assert_eq!(data.len(), 8);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let registry = MockRegistry::new();
        registry.add_device(sample_description("1-1", 1, 2, 0x1234, 0x5678));

        let first = registry.claim("1-1").unwrap();
        assert!(matches!(
            registry.claim("1-1"),
            Err(RegistryError::AlreadyClaimed { .. })
        ));

        drop(first);
        assert!(registry.claim("1-1").is_ok());
    }

    #[test]
    fn test_release_is_idempotent_via_explicit_release() {
        let registry = MockRegistry::new();
        registry.add_device(sample_description("1-1", 1, 2, 0x1234, 0x5678));
        let claim = registry.claim("1-1").unwrap();
        claim.release();
        assert!(!registry.is_claimed("1-1"));
        assert!(registry.claim("1-1").is_ok());
    }

    #[test]
    fn test_lookup_unknown_busid() {
        let registry = MockRegistry::new();
        assert!(matches!(
            registry.lookup("9-9"),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_reaches_claim() {
        let registry = MockRegistry::new();
        registry.add_device(sample_description("1-1", 1, 2, 0x1234, 0x5678));
        let claim = registry.claim("1-1").unwrap();
        let mut signal = claim.disconnect_signal();

        registry.disconnect("1-1");
        signal.wait().await;
        assert!(claim.is_disconnected());
    }
}
