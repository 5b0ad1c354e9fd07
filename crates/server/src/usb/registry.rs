//! rusb device registry
//!
//! Enumerates the host's USB devices, hands out exclusive claims, and
//! observes disconnects through libusb hotplug callbacks. A dedicated
//! thread drives `handle_events` so the callbacks actually fire; the async
//! world only ever sees the `watch` channel a claim subscribes to.

use crate::usb::transfers::RusbBackend;
use common::{ClaimedDevice, DeviceRegistry, EndpointDescriptor, EndpointKind, RegistryError};
use protocol::{DeviceDescription, DeviceSpeed, InterfaceDescription};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Bus id -> disconnect sender for every claimed device
type ClaimMap = Arc<Mutex<HashMap<String, watch::Sender<bool>>>>;

/// A VID:PID allow pattern; `None` means wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceFilter {
    vendor_id: Option<u16>,
    product_id: Option<u16>,
}

impl DeviceFilter {
    fn parse(pattern: &str) -> Result<Self, RegistryError> {
        let mut parts = pattern.split(':');
        let (Some(vid), Some(pid), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(RegistryError::Enumeration(format!(
                "invalid device filter '{pattern}', expected VID:PID"
            )));
        };
        Ok(Self {
            vendor_id: Self::parse_id(vid)?,
            product_id: Self::parse_id(pid)?,
        })
    }

    fn parse_id(value: &str) -> Result<Option<u16>, RegistryError> {
        if value == "*" {
            return Ok(None);
        }
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        u16::from_str_radix(digits, 16)
            .map(Some)
            .map_err(|_| RegistryError::Enumeration(format!("invalid id '{value}' in filter")))
    }

    fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }
}

/// Host registry over a libusb context
pub struct RusbRegistry {
    context: Context,
    filters: Vec<DeviceFilter>,
    claimed: ClaimMap,
    _hotplug: Mutex<Option<Registration<Context>>>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl RusbRegistry {
    pub fn new(filter_patterns: &[String]) -> Result<Self, RegistryError> {
        let context =
            Context::new().map_err(|e| RegistryError::Enumeration(e.to_string()))?;
        let filters = filter_patterns
            .iter()
            .map(|p| DeviceFilter::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        let claimed: ClaimMap = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let hotplug = if rusb::has_hotplug() {
            let watcher = DisconnectWatcher {
                claimed: claimed.clone(),
            };
            match HotplugBuilder::new()
                .enumerate(false)
                .register(&context, Box::new(watcher))
            {
                Ok(registration) => Some(registration),
                Err(e) => {
                    warn!("hotplug registration failed: {}", e);
                    None
                }
            }
        } else {
            warn!("hotplug not supported on this platform; disconnects surface as transfer errors");
            None
        };

        let event_thread = if hotplug.is_some() {
            let thread_context = context.clone();
            let thread_running = running.clone();
            let handle = std::thread::Builder::new()
                .name("usb-events".to_string())
                .spawn(move || {
                    while thread_running.load(Ordering::Relaxed) {
                        match thread_context.handle_events(Some(Duration::from_millis(100))) {
                            Ok(()) | Err(rusb::Error::Interrupted) => {}
                            Err(e) => {
                                warn!("USB event handling failed: {}", e);
                                std::thread::sleep(Duration::from_millis(100));
                            }
                        }
                    }
                })
                .map_err(|e| RegistryError::Enumeration(e.to_string()))?;
            Some(handle)
        } else {
            None
        };

        info!("USB registry initialized");
        Ok(Self {
            context,
            filters,
            claimed,
            _hotplug: Mutex::new(hotplug),
            event_thread: Mutex::new(event_thread),
            running,
        })
    }

    fn exportable(&self, description: &DeviceDescription) -> bool {
        // root hubs cannot be exported
        if description.vendor_id == 0x1d6b && description.device_class == 9 {
            return false;
        }
        self.filters.is_empty()
            || self
                .filters
                .iter()
                .any(|f| f.matches(description.vendor_id, description.product_id))
    }

    fn find(&self, busid: &str) -> Result<Device<Context>, RegistryError> {
        let devices = self
            .context
            .devices()
            .map_err(|e| RegistryError::Enumeration(e.to_string()))?;
        devices
            .iter()
            .find(|device| busid_for(device) == busid)
            .ok_or_else(|| RegistryError::NotFound {
                busid: busid.to_string(),
            })
    }
}

impl DeviceRegistry for RusbRegistry {
    fn list(&self) -> Result<Vec<DeviceDescription>, RegistryError> {
        let devices = self
            .context
            .devices()
            .map_err(|e| RegistryError::Enumeration(e.to_string()))?;

        let mut result = Vec::new();
        for device in devices.iter() {
            match describe(&device) {
                Ok(description) => {
                    if self.exportable(&description) {
                        result.push(description);
                    } else {
                        debug!(busid = %description.busid, "device not exportable, skipping");
                    }
                }
                Err(e) => {
                    debug!(
                        bus = device.bus_number(),
                        address = device.address(),
                        "failed to read device descriptors: {}",
                        e
                    );
                }
            }
        }
        debug!(count = result.len(), "enumerated exportable devices");
        Ok(result)
    }

    fn lookup(&self, busid: &str) -> Result<DeviceDescription, RegistryError> {
        let device = self.find(busid)?;
        let description =
            describe(&device).map_err(|e| RegistryError::Enumeration(e.to_string()))?;
        if !self.exportable(&description) {
            return Err(RegistryError::NotFound {
                busid: busid.to_string(),
            });
        }
        Ok(description)
    }

    fn claim(&self, busid: &str) -> Result<ClaimedDevice, RegistryError> {
        let device = self.find(busid)?;
        let description =
            describe(&device).map_err(|e| RegistryError::Enumeration(e.to_string()))?;
        if !self.exportable(&description) {
            return Err(RegistryError::PermissionDenied {
                busid: busid.to_string(),
            });
        }

        let mut claimed = self.claimed.lock().unwrap();
        if claimed.contains_key(busid) {
            return Err(RegistryError::AlreadyClaimed {
                busid: busid.to_string(),
            });
        }

        let handle = device.open().map_err(|e| claim_error(e, busid))?;
        let _ = handle.set_auto_detach_kernel_driver(true);

        let config = device
            .active_config_descriptor()
            .map_err(|e| RegistryError::Enumeration(e.to_string()))?;
        let mut endpoints = Vec::new();
        for interface in config.interfaces() {
            handle
                .claim_interface(interface.number())
                .map_err(|e| claim_error(e, busid))?;
            // alternate settings share endpoint numbers; the first setting
            // is what the device wakes up in
            if let Some(descriptor) = interface.descriptors().next() {
                for endpoint in descriptor.endpoint_descriptors() {
                    endpoints.push(EndpointDescriptor {
                        address: endpoint.address(),
                        kind: map_transfer_type(endpoint.transfer_type()),
                        max_packet_size: endpoint.max_packet_size(),
                        interval: endpoint.interval(),
                    });
                }
            }
        }

        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        claimed.insert(busid.to_string(), disconnect_tx);

        info!(busid = %busid, devid = description.devid(), "claimed device");
        let claim_map = self.claimed.clone();
        let release_busid = busid.to_string();
        Ok(ClaimedDevice::new(
            description,
            endpoints,
            Arc::new(RusbBackend::new(handle)),
            disconnect_rx,
            move || {
                claim_map.lock().unwrap().remove(&release_busid);
                debug!(busid = %release_busid, "released device claim");
            },
        ))
    }
}

impl Drop for RusbRegistry {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.event_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Hotplug callback feeding the disconnect watches of claimed devices
struct DisconnectWatcher {
    claimed: ClaimMap,
}

impl Hotplug<Context> for DisconnectWatcher {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            bus = device.bus_number(),
            address = device.address(),
            "device arrived"
        );
    }

    fn device_left(&mut self, device: Device<Context>) {
        let busid = busid_for(&device);
        if let Some(sender) = self.claimed.lock().unwrap().get(&busid) {
            info!(busid = %busid, "exported device disconnected");
            let _ = sender.send(true);
        } else {
            debug!(busid = %busid, "device left");
        }
    }
}

/// Kernel-style bus id: `bus-port.port...`, falling back to the device
/// address where port topology is unavailable
fn busid_for(device: &Device<Context>) -> String {
    match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => {
            let path: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
            format!("{}-{}", device.bus_number(), path.join("."))
        }
        _ => format!("{}-{}", device.bus_number(), device.address()),
    }
}

fn describe(device: &Device<Context>) -> Result<DeviceDescription, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let config = device.active_config_descriptor()?;
    let busid = busid_for(device);

    let interfaces = config
        .interfaces()
        .filter_map(|interface| interface.descriptors().next())
        .map(|descriptor| InterfaceDescription {
            class: descriptor.class_code(),
            subclass: descriptor.sub_class_code(),
            protocol: descriptor.protocol_code(),
        })
        .collect();

    Ok(DeviceDescription {
        path: format!("/sys/bus/usb/devices/{busid}"),
        busid,
        busnum: device.bus_number() as u32,
        devnum: device.address() as u32,
        speed: map_speed(device.speed()),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bcd_device: bcd(descriptor.device_version()),
        device_class: descriptor.class_code(),
        device_subclass: descriptor.sub_class_code(),
        device_protocol: descriptor.protocol_code(),
        configuration_value: config.number(),
        num_configurations: descriptor.num_configurations(),
        interfaces,
    })
}

fn claim_error(err: rusb::Error, busid: &str) -> RegistryError {
    match err {
        rusb::Error::Access => RegistryError::PermissionDenied {
            busid: busid.to_string(),
        },
        rusb::Error::Busy => RegistryError::AlreadyClaimed {
            busid: busid.to_string(),
        },
        rusb::Error::NoDevice => RegistryError::NotFound {
            busid: busid.to_string(),
        },
        other => RegistryError::Enumeration(other.to_string()),
    }
}

fn map_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> EndpointKind {
    match transfer_type {
        rusb::TransferType::Control => EndpointKind::Control,
        rusb::TransferType::Isochronous => EndpointKind::Isochronous,
        rusb::TransferType::Bulk => EndpointKind::Bulk,
        rusb::TransferType::Interrupt => EndpointKind::Interrupt,
    }
}

/// Compose a BCD release number from a rusb version triple
fn bcd(version: rusb::Version) -> u16 {
    ((version.major() as u16) << 8) | ((version.minor() as u16) << 4) | version.sub_minor() as u16
}
