//! Device ports shared between the session engine and the host backends
//!
//! Two contracts live here. [`DeviceRegistry`] is what an enumerator must
//! provide: list the exportable devices, look one up by bus id, and claim it
//! exclusively. [`DeviceBackend`] is the blocking transfer capability set of
//! a claimed device; the server drives it from its async device-I/O port via
//! `spawn_blocking`, so implementations are free to sit directly on a
//! synchronous USB stack.
//!
//! Tests substitute the in-memory implementations from
//! [`crate::test_utils`]; the production implementation lives in the server
//! crate on top of rusb.

use protocol::{DeviceDescription, IsoPacket, TransferError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Transfer type of an endpoint, from its descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Cached endpoint descriptor of a claimed device
///
/// `address` carries the direction bit (0x80 = IN), as USB descriptors do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub kind: EndpointKind,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Endpoint number without the direction bit (0–15)
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

/// Failures of the registry contract
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no device with bus id {busid}")]
    NotFound { busid: String },

    #[error("device {busid} is already claimed")]
    AlreadyClaimed { busid: String },

    #[error("permission denied claiming device {busid}")]
    PermissionDenied { busid: String },

    #[error("device enumeration failed: {0}")]
    Enumeration(String),
}

/// Host-side device enumerator and claimer
///
/// `list` returns a finite snapshot; callers re-enumerate rather than
/// restart it. `claim` must be exclusive: claiming an already-claimed bus id
/// fails until the previous [`ClaimedDevice`] is released.
pub trait DeviceRegistry: Send + Sync {
    fn list(&self) -> Result<Vec<DeviceDescription>, RegistryError>;

    fn lookup(&self, busid: &str) -> Result<DeviceDescription, RegistryError>;

    fn claim(&self, busid: &str) -> Result<ClaimedDevice, RegistryError>;
}

/// Result of one isochronous transfer at the backend
#[derive(Debug, Clone, Default)]
pub struct IsoOutcome {
    /// Received packet data, packed at the descriptor offsets
    pub data: Vec<u8>,
    /// Per-packet results in submission order
    pub packets: Vec<IsoPacket>,
    /// Frame the transfer was scheduled at
    pub start_frame: u32,
    /// Number of packets that completed with a non-zero status
    pub error_count: u32,
}

/// Blocking transfer capability set of a claimed device
///
/// Endpoint arguments carry the direction bit, matching the descriptors.
/// Every call owns its buffers so it can move into a blocking task whole.
/// Implementations must honor `timeout` and map their native failures onto
/// [`TransferError`].
pub trait DeviceBackend: Send + Sync {
    fn control_in(
        &self,
        setup: [u8; 8],
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransferError>;

    fn control_out(
        &self,
        setup: [u8; 8],
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<usize, TransferError>;

    fn bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransferError>;

    fn bulk_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<usize, TransferError>;

    fn interrupt_in(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransferError>;

    fn interrupt_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<usize, TransferError>;

    fn isochronous_in(
        &self,
        endpoint: u8,
        packet_lengths: Vec<u32>,
        timeout: Duration,
    ) -> Result<IsoOutcome, TransferError>;

    fn isochronous_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        packet_lengths: Vec<u32>,
        timeout: Duration,
    ) -> Result<IsoOutcome, TransferError>;
}

/// One-shot observer for a claimed device going away
#[derive(Debug, Clone)]
pub struct DisconnectSignal {
    rx: watch::Receiver<bool>,
}

impl DisconnectSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Resolves once the device has disconnected
    ///
    /// A dropped sender counts as disconnection: the registry owning the
    /// device is gone, so the device is unreachable either way.
    pub async fn wait(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }

    pub fn is_disconnected(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}

/// An exclusively claimed device, released on drop
///
/// Bundles everything a session needs: the advertised description, the
/// cached endpoint descriptors for transfer-type classification, the
/// blocking transfer backend, and the disconnect observer.
pub struct ClaimedDevice {
    description: DeviceDescription,
    endpoints: Vec<EndpointDescriptor>,
    backend: Arc<dyn DeviceBackend>,
    disconnect: DisconnectSignal,
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ClaimedDevice {
    pub fn new(
        description: DeviceDescription,
        endpoints: Vec<EndpointDescriptor>,
        backend: Arc<dyn DeviceBackend>,
        disconnect: watch::Receiver<bool>,
        on_release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            description,
            endpoints,
            backend,
            disconnect: DisconnectSignal::new(disconnect),
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn description(&self) -> &DeviceDescription {
        &self.description
    }

    /// The session device id: `(busnum << 16) | devnum`
    pub fn devid(&self) -> u32 {
        self.description.devid()
    }

    pub fn backend(&self) -> Arc<dyn DeviceBackend> {
        self.backend.clone()
    }

    /// Look up the descriptor for a non-zero endpoint number and direction
    pub fn endpoint(&self, number: u8, is_in: bool) -> Option<&EndpointDescriptor> {
        self.endpoints
            .iter()
            .find(|ep| ep.number() == number && ep.is_in() == is_in)
    }

    pub fn disconnect_signal(&self) -> DisconnectSignal {
        self.disconnect.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect.is_disconnected()
    }

    /// Release the claim explicitly; dropping does the same
    pub fn release(mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl Drop for ClaimedDevice {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for ClaimedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedDevice")
            .field("busid", &self.description.busid)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}
