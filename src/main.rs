//! Command line companion for InfiniTime watches.
//!
//! Connects to the paired watch (or the one given with `--device`) and runs one
//! filesystem, firmware or notification command against it.

use anyhow::Context;
use clap::{Parser, Subcommand};
use infinilink::domain::device::{DeviceInfoField, SettingsDeviceManager};
use infinilink::domain::firmware::{self, FirmwareImage};
use infinilink::domain::models::{AppEvent, ConnectionStatus, DeviceId, DeviceUpdate};
use infinilink::domain::settings::SettingsService;
use infinilink::infrastructure::bluetooth::backend::BtleplugPlatform;
use infinilink::infrastructure::bluetooth::blefs::upload;
use infinilink::infrastructure::logging::init_logger;
use infinilink::{BluetoothService, WatchClient};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "infinilink")]
#[command(about = "Talk to an InfiniTime watch over Bluetooth LE")]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Watch identifier; the paired watch is used when omitted
    #[arg(short, long, global = true)]
    device: Option<String>,
    /// Seconds to wait for the watch to become ready
    #[arg(long, global = true, default_value = "30")]
    timeout: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for watches that are not paired yet
    Scan {
        /// Scan duration in seconds (defaults to the configured scan timeout)
        #[arg(short = 's', long)]
        duration: Option<u64>,
    },
    /// List watches connected before
    Devices,
    /// Stay connected and print everything the watch reports
    Watch,
    /// List a directory on the watch
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Copy a file from the watch
    Read {
        path: String,
        /// Local file to write; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Copy a local file to the watch. A destination ending in `/` is a directory.
    Write { local: PathBuf, remote: String },
    /// Delete a file or empty directory on the watch
    Rm { path: String },
    /// Rename or move a file on the watch
    Mv { from: String, to: String },
    /// Create a directory on the watch
    Mkdir { path: String },
    /// Save the watch's settings blob to a local file
    Backup { output: PathBuf },
    /// Restore the watch's settings blob from a local file
    Restore { input: PathBuf },
    /// Install a firmware package (.zip), or a separate image and init packet
    Dfu {
        /// DFU package with manifest.json
        #[arg(required_unless_present = "image", conflicts_with_all = ["image", "init"])]
        package: Option<PathBuf>,
        /// Application image (.bin)
        #[arg(long, requires = "init")]
        image: Option<PathBuf>,
        /// Init packet (.dat)
        #[arg(long, requires = "image")]
        init: Option<PathBuf>,
        /// Version of the image, checked against what the watch runs
        #[arg(long)]
        version: Option<String>,
        /// Install even when the watch already runs this version or newer
        #[arg(long)]
        force: bool,
    },
    /// Forget a watch (the paired one when no id is given)
    Unpair { id: Option<String> },
    /// Show a notification on the watch
    Notify { title: String, body: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => SettingsService::with_path(path)?,
        None => SettingsService::new()?,
    };
    let _log_guard = init_logger(&settings.get().log_settings)?;
    let scan_timeout = settings.get().scan_timeout();
    let settings = Arc::new(Mutex::new(settings));

    let (ble_tx, ble_rx) = mpsc::unbounded_channel();
    let platform = Arc::new(BtleplugPlatform::start(ble_tx).await?);
    let (app_tx, mut app_rx) = mpsc::unbounded_channel();
    let devices = Box::new(SettingsDeviceManager::new(settings.clone()));
    let service = BluetoothService::new(platform, devices, settings, app_tx);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let service_task = tokio::spawn(service.run(commands_rx, ble_rx));
    let client = WatchClient::new(commands_tx);

    let result = match cli.command {
        Commands::Devices => list_devices(&client).await,
        Commands::Unpair { id } => client
            .unpair(id.map(DeviceId::new))
            .await
            .map(|()| println!("Unpaired"))
            .map_err(Into::into),
        Commands::Scan { duration } => {
            let duration = duration.map(Duration::from_secs).unwrap_or(scan_timeout);
            scan(&client, duration).await
        }
        command => {
            let timeout = Duration::from_secs(cli.timeout);
            match connect(&client, &mut app_rx, cli.device.map(DeviceId::new), timeout).await {
                Ok(firmware) => {
                    let reporter = tokio::spawn(report_events(app_rx));
                    let result = run_online(&client, command, firmware).await;
                    reporter.abort();
                    result
                }
                Err(e) => Err(e),
            }
        }
    };

    if let Err(e) = client.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    drop(client);
    let _ = service_task.await;
    result
}

async fn list_devices(client: &WatchClient) -> anyhow::Result<()> {
    for device in client.known_devices().await? {
        let firmware = if device.info.firmware.is_empty() {
            "unknown"
        } else {
            device.info.firmware.as_str()
        };
        println!("{}  {}  firmware {}", device.id, device.name, firmware);
    }
    Ok(())
}

async fn scan(client: &WatchClient, duration: Duration) -> anyhow::Result<()> {
    println!("Scanning for watches ({} seconds)...", duration.as_secs());
    client.set_pairing_new_device(true)?;
    client.scan_for_new_devices().await?;
    tokio::time::sleep(duration).await;
    client.stop_scan().await?;
    client.set_pairing_new_device(false)?;

    let found = client.discovered().await?;
    println!("\nFound {} watches:", found.len());
    for peripheral in found {
        let rssi = peripheral
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());
        println!("  {} ({}) RSSI: {}", peripheral.display_name(), peripheral.id, rssi);
    }
    Ok(())
}

/// Waits until the watch is ready. Returns the firmware version it reported, if any.
async fn connect(
    client: &WatchClient,
    events: &mut mpsc::UnboundedReceiver<AppEvent>,
    device: Option<DeviceId>,
    timeout: Duration,
) -> anyhow::Result<Option<String>> {
    let deadline = Instant::now() + timeout;

    if let Some(id) = device {
        let known = client.known_devices().await?.iter().any(|d| d.id == id);
        if known {
            client
                .switch_device(id.clone())
                .await
                .with_context(|| format!("could not switch to {}", id))?;
        } else {
            connect_new(client, &id, deadline).await?;
        }
    }

    let mut firmware = None;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| anyhow::anyhow!("watch not ready after {} seconds", timeout.as_secs()))?
            .ok_or_else(|| anyhow::anyhow!("Bluetooth service stopped"))?;
        match event {
            AppEvent::ConnectionStatus(ConnectionStatus::Ready) => break,
            AppEvent::ConnectionStatus(status) => info!(?status, "Connection status"),
            AppEvent::DeviceUpdate(DeviceUpdate::Info(DeviceInfoField::Firmware, version)) => {
                firmware = Some(version)
            }
            AppEvent::UserError(message) => anyhow::bail!(message),
            AppEvent::ReconnectGaveUp(id) => anyhow::bail!("gave up reconnecting to {}", id),
            _ => {}
        }
    }
    Ok(firmware)
}

/// Connects to a watch that was never paired, leaving any pending reconnect.
async fn connect_new(client: &WatchClient, id: &DeviceId, deadline: Instant) -> anyhow::Result<()> {
    if let Err(e) = client.disconnect().await {
        warn!("Could not stop the current connection: {}", e);
    }
    client.set_pairing_new_device(true)?;
    client.scan_for_new_devices().await?;
    loop {
        match client.connect(id.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if Instant::now() >= deadline => {
                return Err(e).with_context(|| format!("could not reach {}", id));
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
}

async fn run_online(
    client: &WatchClient,
    command: Commands,
    firmware: Option<String>,
) -> anyhow::Result<()> {
    match command {
        Commands::Watch => {
            println!("Connected. Press Ctrl+C to exit.");
            tokio::signal::ctrl_c().await?;
        }
        Commands::Ls { path } => {
            for entry in client.list_dir(&path).await? {
                let kind = if entry.is_dir { 'd' } else { '-' };
                println!("{} {:>8}  {}", kind, entry.size, entry.path);
            }
        }
        Commands::Read { path, output } => {
            let data = client.read_file(&path).await?;
            match output {
                Some(output) => {
                    tokio::fs::write(&output, &data).await?;
                    println!("Read {} bytes into {}", data.len(), output.display());
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&data)?;
                }
            }
        }
        Commands::Write { local, remote } => {
            let contents = tokio::fs::read(&local)
                .await
                .with_context(|| format!("reading {}", local.display()))?;
            let payload = upload::prepare_payload(&local, contents, None)?;
            let target = if remote.ends_with('/') {
                upload::upload_path(&remote, &local)
            } else {
                remote
            };
            let size = payload.len();
            let free = client.write_file(&target, payload).await?;
            println!("Wrote {} bytes to {} ({} bytes free)", size, target, free);
        }
        Commands::Rm { path } => client.delete(&path).await?,
        Commands::Mv { from, to } => client.rename(&from, &to).await?,
        Commands::Mkdir { path } => client.make_dir(&path).await?,
        Commands::Backup { output } => {
            let blob = client.read_settings_blob().await?;
            tokio::fs::write(&output, &blob).await?;
            println!("Saved {} bytes of watch settings", blob.len());
        }
        Commands::Restore { input } => {
            let blob = tokio::fs::read(&input).await?;
            client.write_settings_blob(blob).await?;
            println!("Restored watch settings");
        }
        Commands::Dfu {
            package,
            image,
            init,
            version,
            force,
        } => {
            let mut update = load_firmware(package, image, init).await?;
            if let Some(version) = version {
                update = update.with_version(version);
            }
            if let (Some(current), Some(candidate)) = (&firmware, &update.version) {
                if firmware::is_recovery_mode(current) {
                    info!("Watch runs recovery firmware, installing regardless of version");
                } else if !force && !firmware::update_available(current, candidate) {
                    println!("Watch already runs {}; use --force to reinstall", current);
                    return Ok(());
                }
            }
            client.update_firmware(update).await?;
            println!("Firmware installed, the watch is rebooting");
        }
        Commands::Notify { title, body } => client.send_notification(&title, &body).await?,
        Commands::Scan { .. } | Commands::Devices | Commands::Unpair { .. } => {
            anyhow::bail!("command does not use a watch connection")
        }
    }
    Ok(())
}

async fn load_firmware(
    package: Option<PathBuf>,
    image: Option<PathBuf>,
    init: Option<PathBuf>,
) -> anyhow::Result<FirmwareImage> {
    if let Some(package) = package {
        let bytes = tokio::fs::read(&package)
            .await
            .with_context(|| format!("reading {}", package.display()))?;
        return FirmwareImage::from_package(std::io::Cursor::new(bytes))
            .with_context(|| format!("unpacking {}", package.display()));
    }
    let (Some(image), Some(init)) = (image, init) else {
        anyhow::bail!("give a DFU package or both --image and --init");
    };
    let init_packet = tokio::fs::read(&init)
        .await
        .with_context(|| format!("reading {}", init.display()))?;
    let application = tokio::fs::read(&image)
        .await
        .with_context(|| format!("reading {}", image.display()))?;
    Ok(FirmwareImage::new(init_packet, application))
}

async fn report_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::FsProgress(progress) => {
                eprint!(
                    "\r{} {:>3.0}%",
                    progress.operation,
                    progress.fraction() * 100.0
                );
            }
            AppEvent::DfuProgress(progress) => {
                eprint!("\rfirmware {:>3.0}%", progress.fraction * 100.0);
            }
            AppEvent::DfuFailed(reason) => eprintln!("\nFirmware update failed: {}", reason),
            AppEvent::DeviceUpdate(update) => println!("{:?}", update),
            AppEvent::MusicEvent(event) => println!("Music: {:?}", event),
            AppEvent::ConnectionStatus(status) => info!(?status, "Connection status"),
            AppEvent::UserError(message) => eprintln!("{}", message),
            AppEvent::LogMessage(message) => info!(severity = ?message.severity, "{}", message.message),
            _ => {}
        }
    }
}
