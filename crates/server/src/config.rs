//! Server configuration management

use anyhow::{Context, Result, anyhow};
use common::EndpointKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    pub port: u16,
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3240,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_connections: u32,
    pub max_pending_urbs_per_session: u32,
    pub max_transfer_buffer: u32,
    pub max_message_size: u32,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_pending_urbs_per_session: 256,
            max_transfer_buffer: 1024 * 1024,
            max_message_size: 2 * 1024 * 1024,
        }
    }
}

impl LimitSettings {
    /// Decoder guard rails derived from the configured limits
    pub fn decode_limits(&self) -> protocol::DecodeLimits {
        protocol::DecodeLimits {
            max_message_size: self.max_message_size as usize,
            ..protocol::DecodeLimits::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub timeout_control_ms: u32,
    pub timeout_bulk_ms: u32,
    pub timeout_interrupt_ms: u32,
    pub timeout_iso_ms: u32,
    pub shutdown_drain_ms: u32,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            timeout_control_ms: 5_000,
            timeout_bulk_ms: 30_000,
            timeout_interrupt_ms: 10_000,
            timeout_iso_ms: 1_000,
            shutdown_drain_ms: 5_000,
        }
    }
}

impl TimeoutSettings {
    /// Deadline for one transfer of the given type
    pub fn transfer(&self, kind: EndpointKind) -> Duration {
        let ms = match kind {
            EndpointKind::Control => self.timeout_control_ms,
            EndpointKind::Bulk => self.timeout_bulk_ms,
            EndpointKind::Interrupt => self.timeout_interrupt_ms,
            EndpointKind::Isochronous => self.timeout_iso_ms,
        };
        Duration::from_millis(ms as u64)
    }

    /// Bound on the session drain phase during shutdown
    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UsbSettings {
    /// VID:PID allow patterns; empty exports every enumerable device
    pub filters: Vec<String>,
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/rust-usbip/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("rust-usbip").join("server.toml")
        } else {
            PathBuf::from(".config/rust-usbip/server.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.server.port == 0 {
            return Err(anyhow!("Listener port must not be 0"));
        }

        if self.limits.max_connections == 0 {
            return Err(anyhow!("max_connections must be at least 1"));
        }
        if self.limits.max_pending_urbs_per_session == 0 {
            return Err(anyhow!("max_pending_urbs_per_session must be at least 1"));
        }
        if self.limits.max_transfer_buffer > self.limits.max_message_size {
            return Err(anyhow!(
                "max_transfer_buffer ({}) must not exceed max_message_size ({})",
                self.limits.max_transfer_buffer,
                self.limits.max_message_size
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        for (value, name) in [(parts[0], "VID"), (parts[1], "PID")] {
            if value != "*" {
                Self::validate_hex_id(value, name)?;
            }
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}
