/*!
Configuration management for the l91ctl application.
*/

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use tracing::warn;

use robstride_l91::protocol::{DEFAULT_ADAPTER_ADDRESS, DEFAULT_BAUD_RATE, DEFAULT_MAX_SPEED_RPM};
use robstride_l91::{ControlConfig, LinkConfig, ScanConfig};

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub link: RetryConfig,
    pub scan: ScanSettings,
    pub control: ControlSettings,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            warn!("Config file {} not found, using defaults", path.as_ref().display());
            return Ok(Self::new());
        }
        Self::load_from_file(path)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            adapter_address: self.bus.adapter_address,
            max_retries: self.link.max_retries,
            retry_delay: Duration::from_millis(self.link.retry_delay_ms),
        }
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            lo: self.scan.lo,
            hi: self.scan.hi,
            short_timeout: Duration::from_millis(self.scan.short_timeout_ms),
            long_timeout: Duration::from_millis(self.scan.long_timeout_ms),
            mask_gap_tolerance: self.scan.mask_gap_tolerance,
            stability_runs: self.scan.stability_runs,
            passive_listen: Duration::from_millis(self.scan.passive_listen_ms),
            verify_with_parameters: self.scan.verify_with_parameters,
        }
    }

    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            max_speed_rpm: self.control.max_speed_rpm,
            exchange_timeout: Duration::from_millis(self.control.exchange_timeout_ms),
            bring_up_settle: Duration::from_millis(self.control.bring_up_settle_ms),
            require_jog_ack: self.control.require_jog_ack,
        }
    }
}

/// Serial side of the adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Serial device path
    pub device: String,

    /// Baud rate
    pub baud_rate: u32,

    /// Adapter address written into every frame
    pub adapter_address: u16,

    /// Quiet period that ends a read once bytes arrived
    pub idle_gap_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            adapter_address: DEFAULT_ADAPTER_ADDRESS,
            idle_gap_ms: 20,
        }
    }
}

/// Retry policy of every exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let defaults = LinkConfig::default();
        Self {
            max_retries: defaults.max_retries,
            retry_delay_ms: defaults.retry_delay.as_millis() as u64,
        }
    }
}

/// Discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub lo: u8,
    pub hi: u8,
    pub short_timeout_ms: u64,
    pub long_timeout_ms: u64,
    pub mask_gap_tolerance: u8,
    pub stability_runs: u32,

    /// Listen for late replies after the descending pass; 0 disables
    pub passive_listen_ms: u64,

    pub verify_with_parameters: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        let defaults = ScanConfig::default();
        Self {
            lo: defaults.lo,
            hi: defaults.hi,
            short_timeout_ms: defaults.short_timeout.as_millis() as u64,
            long_timeout_ms: defaults.long_timeout.as_millis() as u64,
            mask_gap_tolerance: defaults.mask_gap_tolerance,
            stability_runs: defaults.stability_runs,
            passive_listen_ms: defaults.passive_listen.as_millis() as u64,
            verify_with_parameters: defaults.verify_with_parameters,
        }
    }
}

/// Jog and stop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    /// Jog speeds are clamped to plus or minus this
    pub max_speed_rpm: f32,
    pub exchange_timeout_ms: u64,
    pub bring_up_settle_ms: u64,

    /// Wait for a reply to jog frames
    pub require_jog_ack: bool,
}

impl Default for ControlSettings {
    fn default() -> Self {
        let defaults = ControlConfig::default();
        Self {
            max_speed_rpm: DEFAULT_MAX_SPEED_RPM,
            exchange_timeout_ms: defaults.exchange_timeout.as_millis() as u64,
            bring_up_settle_ms: defaults.bring_up_settle.as_millis() as u64,
            require_jog_ack: defaults.require_jog_ack,
        }
    }
}
