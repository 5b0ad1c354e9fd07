//! Common utilities for the USB/IP host server
//!
//! This crate provides the pieces shared between the server and its tests:
//! the device registry and transfer-backend ports, error handling, logging
//! setup, and programmable in-memory port implementations for testing.

pub mod device;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use device::{
    ClaimedDevice, DeviceBackend, DeviceRegistry, DisconnectSignal, EndpointDescriptor,
    EndpointKind, IsoOutcome, RegistryError,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
