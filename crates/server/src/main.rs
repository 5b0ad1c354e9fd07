//! usbip-server
//!
//! Host-side USB/IP server. Exports locally attached USB devices over TCP
//! to importers speaking the Linux USB/IP protocol (the kernel's VHCI
//! driver among them).

use anyhow::{Context, Result};
use clap::Parser;
use common::{DeviceRegistry, setup_logging};
use server::config::ServerConfig;
use server::net::Listener;
use server::usb::RusbRegistry;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "usbip-server")]
#[command(
    author,
    version,
    about = "USB/IP server - export local USB devices over TCP"
)]
#[command(long_about = "
A host-side USB/IP server. Attached USB devices are exported to remote
clients speaking the Linux USB/IP protocol; a client imports a device by
bus id and drives it as if it were plugged in locally.

EXAMPLES:
    # Run with default config (port 3240, all devices)
    usbip-server

    # Run with custom config
    usbip-server --config /path/to/server.toml

    # Export only one vendor's devices
    usbip-server --config <(echo '[usb]
filters = [\"0x05ac:*\"]')

    # List exportable USB devices without starting the server
    usbip-server --list-devices

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/rust-usbip/server.toml
    3. /etc/rust-usbip/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// Bind address (overrides the config file)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// TCP port (overrides the config file)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// List exportable USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ServerConfig::default();
        let path = ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbip-server v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(
        RusbRegistry::new(&config.usb.filters).context("Failed to initialize the USB registry")?,
    );

    if args.list_devices {
        return list_devices_mode(registry.as_ref());
    }

    let listener = Listener::new(Arc::new(config), registry);
    tokio::select! {
        result = listener.run() => result,
        _ = signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

/// List exportable devices and exit
fn list_devices_mode(registry: &RusbRegistry) -> Result<()> {
    let devices = registry.list().context("Failed to enumerate devices")?;

    if devices.is_empty() {
        println!("No exportable USB devices found.");
        return Ok(());
    }

    println!("Found {} exportable device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:<12} {:04x}:{:04x}  bus {} dev {}  {:?}",
            device.busid,
            device.vendor_id,
            device.product_id,
            device.busnum,
            device.devnum,
            device.speed,
        );
    }
    Ok(())
}
