/*!
Bus session wiring configuration to a link, scanner and controller.

A session owns the one transport of the process, either the serial adapter
or the built-in simulated population.
*/

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use tracing::{info, warn};

use robstride_l91::{
    ArbitrationAwareScanner, Frame, MotorLink, MotorRegistry, ScanConfig, SerialTransport,
    SimulatedBus, Transport, VelocityController,
};

use crate::config::AppConfig;

/// Transport chosen at runtime
pub type BoxedTransport = Box<dyn Transport>;

pub struct Session {
    link: MotorLink<BoxedTransport>,
    config: AppConfig,
    simulated: bool,
}

impl Session {
    /// Open the configured serial device, or the demo population when
    /// `simulate` is set, and probe the adapter.
    pub fn open(config: AppConfig, simulate: bool) -> Result<Self> {
        let mut link_config = config.link_config();

        let transport: BoxedTransport = if simulate {
            info!("🧪 Using simulated bus");
            // Virtual time, nothing to wait for between attempts
            link_config.retry_delay = Duration::ZERO;
            Box::new(SimulatedBus::demo())
        } else {
            let transport = SerialTransport::open_with_idle_gap(
                &config.bus.device,
                config.bus.baud_rate,
                Duration::from_millis(config.bus.idle_gap_ms),
            )
            .with_context(|| format!("Failed to open serial device {}", config.bus.device))?;
            Box::new(transport)
        };

        let mut link = MotorLink::with_config(transport, link_config);
        let timeout = config.control_config().exchange_timeout;
        if !link.handshake(timeout).context("Adapter handshake failed")? {
            warn!("⚠️ Adapter did not answer AT+AT, continuing anyway");
        }

        Ok(Self {
            link,
            config,
            simulated: simulate,
        })
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run discovery with the configured settings
    pub fn scan(&mut self, config: ScanConfig) -> Result<MotorRegistry> {
        info!("🔍 Scanning ids {}..={}", config.lo, config.hi);
        let registry = ArbitrationAwareScanner::new(&mut self.link, config).scan()?;
        Ok(registry)
    }

    /// Parameter read, motion-free
    pub fn query(&mut self, id: u8, index: u16) -> Result<Frame> {
        let timeout = self.config.control_config().exchange_timeout;
        let reply = self
            .link
            .query(id, index, timeout)
            .with_context(|| format!("Query of parameter 0x{:04X} on id {} failed", index, id))?;
        Ok(reply)
    }

    pub fn into_controller(self) -> VelocityController<BoxedTransport> {
        let control = self.config.control_config();
        VelocityController::new(self.link, control)
    }

    /// Close the transport explicitly
    pub fn close(self) -> Result<()> {
        let mut transport = self.link.into_inner();
        transport.close().context("Failed to close transport")?;
        Ok(())
    }
}

/// Load a registry saved by `scan`
pub fn load_registry(path: &Path) -> Result<MotorRegistry> {
    MotorRegistry::load_from_file(path)
        .with_context(|| format!("Failed to load registry: {}", path.display()))
}

/// Map a user supplied id to a canonical id of `registry`
pub fn resolve_canonical(registry: &MotorRegistry, id: u8) -> Result<u8> {
    if registry.by_canonical_id(id).is_some() {
        return Ok(id);
    }
    match registry.by_member_id(id) {
        Some(motor) => bail!(
            "id {} is an alias of motor {}; use the canonical id {}",
            id,
            motor.canonical_id,
            motor.canonical_id
        ),
        None => bail!("id {} is not in the registry ({})", id, registry.describe_groups()),
    }
}

/// Timestamped file name for a saved registry
pub fn default_registry_path() -> String {
    format!("l91_registry_{}.json", Local::now().format("%Y%m%d_%H%M%S"))
}

/// Print a registry as a table on stdout
pub fn print_registry(registry: &MotorRegistry) {
    if registry.is_empty() {
        println!("📭 No motors answered");
        return;
    }

    println!("📋 {} motor(s) found:", registry.len());
    println!("   {:<10} {:<16} {:<11} {}", "canonical", "members", "state", "signature");
    for motor in registry.iter() {
        println!(
            "   {:<10} {:<16} {:<11} {}",
            motor.canonical_id,
            motor.describe_members(),
            format!("{:?}", motor.state).to_lowercase(),
            motor.signature.to_hex()
        );
    }
}
