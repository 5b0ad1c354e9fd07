//! USB/IP host server
//!
//! Exports locally attached USB devices to remote importers speaking the
//! Linux USB/IP wire protocol. The [`net`] module owns the listener and the
//! per-connection session engine; [`tracker`] and [`port`] are the URB
//! table and the async device-I/O port a session runs on; [`usb`] holds the
//! rusb-backed registry and transfer backend.

pub mod config;
pub mod net;
pub mod port;
pub mod tracker;
pub mod usb;

pub use config::ServerConfig;
pub use net::Listener;
