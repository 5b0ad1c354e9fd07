//! Host USB subsystem
//!
//! The rusb-backed implementations of the device ports: enumeration and
//! exclusive claiming in [`registry`], blocking transfer execution in
//! [`transfers`]. Everything here is synchronous; the async device-I/O port
//! drives it through the blocking pool.

pub mod registry;
pub mod transfers;

pub use registry::RusbRegistry;
pub use transfers::RusbBackend;
