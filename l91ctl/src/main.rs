/*!
# l91ctl

Command-line client for RobStride motors behind an L91 serial-to-CAN
adapter: discover motors, jog them, and stop them.

## Usage

### Discover motors
```bash
l91ctl --device /dev/ttyUSB0 scan --output registry.json
```

### Jog a motor for two seconds
```bash
l91ctl jog --registry registry.json --id 8 --speed 20 --direction reverse --duration-ms 2000
```

### Stop everything
```bash
l91ctl estop --registry registry.json
```

### Dry run without hardware
```bash
l91ctl --simulate scan
```
*/

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod config;
mod session;

use config::AppConfig;
use robstride_l91::{BusError, Direction, ScanError};
use session::{default_registry_path, load_registry, print_registry, resolve_canonical, Session};

#[derive(Parser)]
#[command(name = "l91ctl")]
#[command(about = "Discover, jog and stop RobStride motors over an L91 serial-to-CAN adapter")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "l91ctl.toml")]
    config: PathBuf,

    /// Serial device (overrides the config file)
    #[arg(short, long)]
    device: Option<String>,

    /// Baud rate (overrides the config file)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Run against a built-in simulated motor population
    #[arg(long)]
    simulate: bool,

    /// Log every frame on the wire
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Enumerate motors and group the ids they answer to
    Scan {
        /// Lowest id to probe
        #[arg(long)]
        lo: Option<u8>,

        /// Highest id to probe
        #[arg(long)]
        hi: Option<u8>,

        /// Save the registry as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Save the registry under a timestamped name
        #[arg(long)]
        save: bool,
    },

    /// Jog one motor, then stop it
    Jog {
        /// Registry saved by `scan`
        #[arg(short, long)]
        registry: PathBuf,

        /// Canonical id of the motor
        #[arg(long)]
        id: u8,

        /// Speed in RPM
        #[arg(short, long)]
        speed: f32,

        /// forward or reverse
        #[arg(long, default_value = "forward")]
        direction: Direction,

        /// Jog duration; without it, jog until Ctrl+C
        #[arg(long)]
        duration_ms: Option<u64>,
    },

    /// Jog a motor briefly several times so it can be spotted
    Pulse {
        /// Registry saved by `scan`
        #[arg(short, long)]
        registry: PathBuf,

        /// Canonical id of the motor
        #[arg(long)]
        id: u8,

        /// Number of pulses
        #[arg(long, default_value = "3")]
        count: u32,

        /// Speed in RPM
        #[arg(short, long, default_value = "5.0")]
        speed: f32,
    },

    /// Halt and deactivate one motor
    Stop {
        /// Motor id
        #[arg(long)]
        id: u8,
    },

    /// Halt and deactivate every motor of a registry
    Estop {
        /// Registry saved by `scan`
        #[arg(short, long)]
        registry: PathBuf,
    },

    /// Read a parameter without moving the motor
    Query {
        /// Motor id
        #[arg(long)]
        id: u8,

        /// Parameter index in hex, e.g. 00C4
        #[arg(long, value_parser = parse_hex_u16, default_value = "00C4")]
        index: u16,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "l91ctl.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging to stderr to keep stdout for results
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Config { output } = &cli.command {
        return generate_config_file(output);
    }

    let mut config = AppConfig::load_or_default(&cli.config)?;
    if let Some(device) = cli.device {
        config.bus.device = device;
    }
    if let Some(baud) = cli.baud {
        config.bus.baud_rate = baud;
    }

    let session = Session::open(config, cli.simulate)?;
    if session.is_simulated() {
        println!("🧪 Simulation mode, no hardware is touched");
    }

    match cli.command {
        Commands::Scan { lo, hi, output, save } => run_scan(session, lo, hi, output, save),
        Commands::Jog { registry, id, speed, direction, duration_ms } => {
            run_jog(session, registry, id, speed, direction, duration_ms)
        }
        Commands::Pulse { registry, id, count, speed } => run_pulse(session, registry, id, count, speed),
        Commands::Stop { id } => run_stop(session, id),
        Commands::Estop { registry } => run_estop(session, registry),
        Commands::Query { id, index } => run_query(session, id, index),
        Commands::Config { .. } => Ok(()),
    }
}

/// Discover motors and print the registry
fn run_scan(
    mut session: Session,
    lo: Option<u8>,
    hi: Option<u8>,
    output: Option<PathBuf>,
    save: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut scan = session.config().scan_config();
    scan.lo = lo.unwrap_or(scan.lo);
    scan.hi = hi.unwrap_or(scan.hi);

    println!("🚀 Scanning ids {}..={} ({} run(s))", scan.lo, scan.hi, scan.stability_runs);

    let registry = match session.scan(scan) {
        Ok(registry) => registry,
        Err(e) => {
            if let Some(ScanError::Unstable { observed }) = e.downcast_ref::<ScanError>() {
                println!("❌ SCAN UNSTABLE: the runs disagree, no grouping was accepted");
                for (run, registry) in observed.iter().enumerate() {
                    println!("   run {}: {}", run + 1, registry.describe_groups());
                }
            }
            return Err(e.into());
        }
    };

    print_registry(&registry);

    let path = match (output, save) {
        (Some(path), _) => Some(path),
        (None, true) => Some(PathBuf::from(default_registry_path())),
        (None, false) => None,
    };
    if let Some(path) = path {
        registry.save_to_file(&path)?;
        println!("💾 Registry saved to {}", path.display());
    }

    session.close()?;
    println!("✅ Scan complete");
    Ok(())
}

/// Jog one motor for a fixed time or until Ctrl+C
fn run_jog(
    session: Session,
    registry: PathBuf,
    id: u8,
    speed: f32,
    direction: Direction,
    duration_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = load_registry(&registry)?;
    let id = resolve_canonical(&registry, id)?;
    let running = install_stop_handler()?;
    let mut controller = session.into_controller().with_run_flag(running);

    if let Some(ms) = duration_ms {
        println!("🔄 Jogging motor {} {} at {} RPM for {} ms, Ctrl+C stops early", id, direction, speed, ms);
        return report_control(controller.jog(id, speed, direction, Duration::from_millis(ms)));
    }

    let command = match controller.start_jog(id, speed, direction) {
        Ok(command) => command,
        Err(e) => return report_control(Err(e)),
    };
    println!(
        "🔄 Jogging motor {} at {:.2} RPM, press Ctrl+C to stop",
        id,
        command.speed_rpm()
    );

    while controller.is_running() {
        thread::sleep(Duration::from_millis(50));
    }

    report_control(controller.stop(id))
}

fn run_pulse(
    session: Session,
    registry: PathBuf,
    id: u8,
    count: u32,
    speed: f32,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = load_registry(&registry)?;
    let id = resolve_canonical(&registry, id)?;
    let running = install_stop_handler()?;
    let mut controller = session.into_controller().with_run_flag(running);

    println!("💡 Pulsing motor {} {} time(s), watch for movement", id, count);
    report_control(controller.pulse(
        id,
        count,
        Duration::from_millis(300),
        Duration::from_millis(500),
        speed,
    ))
}

fn run_stop(session: Session, id: u8) -> Result<(), Box<dyn std::error::Error>> {
    let mut controller = session.into_controller();
    println!("🛑 Stopping motor {}", id);
    report_control(controller.stop(id))
}

fn run_estop(session: Session, registry: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let registry = load_registry(&registry)?;
    let mut controller = session.into_controller();

    println!("🚨 EMERGENCY STOP of {} motor(s)", registry.len());
    report_control(controller.emergency_stop_all(&registry))
}

fn run_query(mut session: Session, id: u8, index: u16) -> Result<(), Box<dyn std::error::Error>> {
    let reply = session.query(id, index)?;
    println!("📨 id {} parameter 0x{:04X}: {}", id, index, hex::encode(&reply.payload));
    session.close()?;
    Ok(())
}

/// Set up the Ctrl+C handler for motion commands. The returned flag is
/// cleared on Ctrl+C, and the controller then stops the motor.
fn install_stop_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        println!("\n🛑 Received Ctrl+C, stopping motor...");
        flag.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

/// Print the outcome of a control call; stop failures are shouted
fn report_control(
    result: Result<(), robstride_l91::ControlError>,
) -> Result<(), Box<dyn std::error::Error>> {
    match result {
        Ok(()) => {
            println!("✅ Done");
            Ok(())
        }
        Err(e) if e.is_stop_failure() => {
            error!("{}", e);
            println!("🚨🚨 {} 🚨🚨", e);
            println!("🚨 CHECK THE MOTOR PHYSICALLY, IT MAY STILL BE ENABLED");
            Err(BusError::from(e).into())
        }
        Err(e) => {
            println!("❌ {}", e);
            Err(BusError::from(e).into())
        }
    }
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex index '{}': {}", s, e))
}

/// Generate a default configuration file
fn generate_config_file(output_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::new();
    config.save_to_file(output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   l91ctl --config {} scan", output_path.display());

    Ok(())
}
