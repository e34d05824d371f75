// gattlink — BLE GATT session CLI
//
// Drives a session against the in-process loopback radio and manages the
// settings file shared with host applications.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use gattlink_core::gatt::types::{CharacteristicInfo, CharacteristicProperties};
use gattlink_core::gatt::CCCD_UUID;
use gattlink_core::{
    ActionTag, BleSession, BondState, CharacteristicRef, DeviceAddress, EventForwarder, GattStatus,
    LoopbackTransport, Peripheral, ScanEvent, ScanForwarder, ServiceInfo, SessionEvent,
    SessionSettings, TracingLogger,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000_180D_0000_1000_8000_0080_5F9B_34FB);
const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x0000_2A37_0000_1000_8000_0080_5F9B_34FB);
const BODY_SENSOR_LOCATION: Uuid = Uuid::from_u128(0x0000_2A38_0000_1000_8000_0080_5F9B_34FB);

/// How long to wait for any single session event
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "gattlink")]
#[command(about = "GattLink — BLE GATT client sessions", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted session against a simulated heart rate monitor
    Demo {
        /// Address of the simulated peripheral
        #[arg(short, long, default_value = "C4:7C:8D:6A:00:01")]
        address: String,
        /// Make this many reads fail before one succeeds
        #[arg(long, default_value = "0")]
        fail_reads: usize,
        /// Pair with the peripheral before connecting
        #[arg(long)]
        bond: bool,
        /// Print the final session snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Scan simulated peripherals
    Scan {
        /// Number of simulated peripherals advertising
        #[arg(short, long, default_value = "5")]
        count: u8,
        /// Only report peripherals advertising this service
        #[arg(short, long)]
        service: Option<Uuid>,
        /// Scan duration in milliseconds
        #[arg(short, long, default_value = "500")]
        duration: u64,
    },
    /// Manage settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print every setting
    Show,
    /// Write default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    Set { key: String, value: String },
    Get { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let settings_path = match cli.config {
        Some(path) => path,
        None => config::settings_file()?,
    };
    tracing::debug!("Using settings file {}", settings_path.display());

    match cli.command {
        Commands::Demo {
            address,
            fail_reads,
            bond,
            json,
        } => cmd_demo(&settings_path, &address, fail_reads, bond, json).await,
        Commands::Scan {
            count,
            service,
            duration,
        } => cmd_scan(&settings_path, count, service, duration).await,
        Commands::Config { action } => cmd_config(&settings_path, action),
    }
}

fn heart_rate_monitor(address: DeviceAddress) -> Peripheral {
    Peripheral::new(address)
        .with_name("GattLink HRM")
        .with_rssi(-52)
        .with_service(ServiceInfo {
            uuid: HEART_RATE_SERVICE,
            characteristics: vec![
                CharacteristicInfo {
                    uuid: HEART_RATE_MEASUREMENT,
                    properties: CharacteristicProperties {
                        notify: true,
                        ..Default::default()
                    },
                    descriptors: vec![CCCD_UUID],
                },
                CharacteristicInfo {
                    uuid: BODY_SENSOR_LOCATION,
                    properties: CharacteristicProperties {
                        read: true,
                        write: true,
                        ..Default::default()
                    },
                    descriptors: vec![],
                },
            ],
        })
        .with_value(
            CharacteristicRef::new(HEART_RATE_SERVICE, BODY_SENSOR_LOCATION),
            [0x01u8],
        )
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connected(address) => {
            println!("  {} Connected to {}", "✓".green(), address.to_string().bright_cyan())
        }
        SessionEvent::Disconnected { address, status } => println!(
            "  {} Disconnected from {} (status {})",
            "●".yellow(),
            address.to_string().bright_cyan(),
            status
        ),
        SessionEvent::ServicesDiscovered(services) => {
            println!("  {} Discovered {} service(s)", "✓".green(), services.len());
            for service in services {
                println!("      {}", service.uuid.to_string().dimmed());
                for characteristic in &service.characteristics {
                    println!("        └ {}", characteristic.uuid.to_string().dimmed());
                }
            }
        }
        SessionEvent::CharacteristicRead {
            characteristic,
            value,
        } => println!(
            "  {} Read {} = {:02X?}",
            "✓".green(),
            characteristic.characteristic,
            value
        ),
        SessionEvent::CharacteristicWrite {
            characteristic,
            status,
        } => println!(
            "  {} Wrote {} (status {})",
            "✓".green(),
            characteristic.characteristic,
            status
        ),
        SessionEvent::CharacteristicChanged {
            characteristic,
            value,
        } => println!(
            "  {} Notification {} = {:02X?}",
            "↯".bright_magenta(),
            characteristic.characteristic,
            value
        ),
        SessionEvent::DescriptorWrite { descriptor, status } => println!(
            "  {} Descriptor {} written (status {})",
            "✓".green(),
            descriptor.descriptor,
            status
        ),
        SessionEvent::BondStateChanged { state, address } => {
            println!("  {} Bond with {}: {:?}", "●".blue(), address, state)
        }
        SessionEvent::MtuChanged(mtu) => println!("  {} MTU is now {}", "✓".green(), mtu),
        SessionEvent::RemoteRssi(rssi) => println!("  {} RSSI {} dBm", "✓".green(), rssi),
        SessionEvent::ActionFailed { action, status } => println!(
            "  {} {} gave up (status {})",
            "✗".red(),
            action,
            status
        ),
    }
}

/// Wait for the next event matching `want`, printing everything seen
async fn expect_event<F>(
    events: &mut UnboundedReceiver<SessionEvent>,
    what: &str,
    want: F,
) -> Result<SessionEvent>
where
    F: Fn(&SessionEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .with_context(|| format!("Timed out waiting for {}", what))?
            .context("Session stopped")?;
        print_event(&event);
        if want(&event) {
            return Ok(event);
        }
    }
}

async fn cmd_demo(
    settings_path: &Path,
    address: &str,
    fail_reads: usize,
    bond: bool,
    json: bool) -> Result<()> {
    let settings = config::load_or_init(settings_path)?;
    let address: DeviceAddress = address.parse().context("Invalid peripheral address")?;

    println!("{}", "GattLink demo session".bold());
    println!("  {} {}", "Settings:".dimmed(), settings_path.display());
    println!();

    let radio = Arc::new(LoopbackTransport::new());
    radio.advertise(heart_rate_monitor(address));
    radio.set_rssi_jitter(4);
    if fail_reads > 0 {
        radio.fail_next(ActionTag::ReadCharacteristic, GattStatus::READ_NOT_PERMITTED, fail_reads);
    }

    let (listener, mut events) = EventForwarder::channel();
    let session = BleSession::builder(radio.clone())
        .adapter(radio.clone())
        .settings(settings)
        .logger(Arc::new(TracingLogger))
        .listener(listener)
        .spawn()?;
    radio.attach(session.transport_events());

    let measurement = CharacteristicRef::new(HEART_RATE_SERVICE, HEART_RATE_MEASUREMENT);
    let location = CharacteristicRef::new(HEART_RATE_SERVICE, BODY_SENSOR_LOCATION);

    if bond {
        session.create_bond(address)?;
        expect_event(&mut events, "pairing", |e| {
            matches!(
                e,
                SessionEvent::BondStateChanged { state, .. } if *state != BondState::Bonding
            )
        })
        .await?;
    }

    session.connect(address)?;
    expect_event(&mut events, "connection", |e| matches!(e, SessionEvent::Connected(_))).await?;

    session.discover_services()?;
    session.change_mtu(247)?;
    session.read_characteristic(location)?;
    session.write_characteristic(location, &[0x02])?;
    session.set_characteristic_notification(measurement, true)?;
    session.read_remote_rssi()?;
    session.read_remote_rssi()?;

    expect_event(&mut events, "RSSI", |e| matches!(e, SessionEvent::RemoteRssi(_))).await?;

    for bpm in [68u8, 71, 75] {
        if !radio.notify(&address, measurement, &[0x00, bpm]) {
            anyhow::bail!("Peripheral is not subscribed for notifications");
        }
        expect_event(&mut events, "notification", |e| {
            matches!(e, SessionEvent::CharacteristicChanged { .. })
        })
        .await?;
    }

    let snapshot = session.snapshot().await?;
    session.disconnect()?;
    expect_event(&mut events, "disconnect", |e| {
        matches!(e, SessionEvent::Disconnected { .. })
    })
    .await?;

    if json {
        println!();
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    session.shutdown()?;
    println!();
    println!("{}", "Demo complete".green().bold());
    Ok(())
}

async fn cmd_scan(
    settings_path: &Path,
    count: u8,
    service: Option<Uuid>,
    duration: u64) -> Result<()> {
    let settings = config::load_or_init(settings_path)?;

    let radio = Arc::new(LoopbackTransport::new());
    for i in 0..count {
        let address = DeviceAddress::new([0xC4, 0x7C, 0x8D, 0x6A, 0x10, i]);
        let peripheral = if i % 2 == 0 {
            heart_rate_monitor(address).with_rssi(-40 - i16::from(i) * 3)
        } else {
            Peripheral::new(address)
                .with_name(format!("Beacon {}", i))
                .with_rssi(-70 - i16::from(i))
        };
        radio.advertise(peripheral);
    }

    let session = BleSession::builder(radio.clone())
        .adapter(radio.clone())
        .settings(settings)
        .spawn()?;
    radio.attach(session.transport_events());

    let (scan_listener, mut scan_events) = ScanForwarder::channel();
    session.set_scan_listener(Some(scan_listener))?;

    println!("{}", "Scanning...".bold());
    match service {
        Some(uuid) => session.start_scan_for_service(uuid, None)?,
        None => session.start_scan(Vec::new())?,
    }

    let deadline = tokio::time::sleep(Duration::from_millis(duration));
    tokio::pin!(deadline);
    let mut found = 0usize;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = scan_events.recv() => match event {
                Some(ScanEvent::Result(result)) => {
                    found += 1;
                    println!(
                        "  {} {:<24} {:>4} dBm  {}",
                        result.address.to_string().bright_cyan(),
                        result.name.as_deref().unwrap_or("(unnamed)"),
                        result.rssi,
                        result
                            .service_uuids
                            .iter()
                            .map(Uuid::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                            .dimmed()
                    );
                }
                Some(ScanEvent::Failed(failure)) => {
                    println!("  {} Scan failed: {}", "✗".red(), failure);
                    break;
                }
                None => break,
            },
        }
    }

    session.stop_scan()?;
    session.shutdown()?;
    println!();
    println!("{} {} peripheral(s) found", "✓".green(), found);
    Ok(())
}

fn cmd_config(settings_path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let settings = config::load_or_init(settings_path)?;
            println!("{}", "Settings".bold());
            println!("  {}", settings_path.display().to_string().dimmed());
            println!();
            for (key, value) in config::list(&settings) {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Init { force } => {
            if settings_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    settings_path.display()
                );
            }
            config::save(&SessionSettings::default(), settings_path)?;
            println!("{} Wrote {}", "✓".green(), settings_path.display());
        }

        ConfigAction::Set { key, value } => {
            let mut settings = config::load_or_init(settings_path)?;
            config::set(&mut settings, &key, &value)?;
            config::save(&settings, settings_path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            let settings = config::load_or_init(settings_path)?;
            match config::get(&settings, &key) {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }
    }

    Ok(())
}
