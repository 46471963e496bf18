use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use log::{info, warn};

use sunfibre_ble_lib::config::SessionConfig;
use sunfibre_ble_lib::core::bluetooth::{
    BleError, BleResult, BleSessionManager, DimLedMode, PeripheralHandle, ServiceId, Subscription,
    TelemetryUpdate, codec, normalize_address,
};
use sunfibre_ble_lib::logging::SessionLogger;
use sunfibre_ble_lib::state::AppState;

const ADAPTER_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(version, about = "Scan, inspect and control SunFibre lighting devices", long_about = None)]
struct Args {
    /// Path to the session config file. Defaults to the platform config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds to scan for a device before giving up.
    #[arg(long, default_value_t = 10)]
    scan_seconds: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List nearby SunFibre devices.
    Scan,
    /// Connect and print every readable value.
    Status { address: String },
    /// Connect and print changes and telemetry until Ctrl-C.
    Monitor { address: String },
    /// Set the light mode: off, on-strong, on-mild, flash-slow or flash-fast.
    SetMode { address: String, mode: DimLedMode },
    /// Configure the RFID reader.
    Rfid {
        address: String,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        /// Tag id to pair with.
        #[arg(long, conflicts_with = "unpair")]
        pair: Option<u32>,
        #[arg(long)]
        unpair: bool,
    },
    /// Read one characteristic and print it as base64 and hex.
    Read {
        address: String,
        /// led, monitor, rfid or info.
        service: ServiceId,
        /// Characteristic index within the service.
        index: usize,
    },
    /// Write a base64 payload to one characteristic.
    Write {
        address: String,
        service: ServiceId,
        index: usize,
        value: String,
    },
    /// Print the effective config.
    Config {
        /// Also write it to the config path.
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config.clone() {
        Some(path) => path,
        None => SessionConfig::default_path().ok_or_else(|| anyhow!("No config directory available"))?,
    };
    let config = SessionConfig::load_config(&config_path).await?;
    SessionLogger::init_from_env_or(config.log_level());

    if let Command::Config { write } = args.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        if write {
            config.save_config(&config_path).await?;
        }
        return Ok(());
    }

    let app_state = AppState::new(config).await?;
    let manager = app_state.get_session_manager_arc();
    if !manager.start().await {
        info!("Waiting for the Bluetooth adapter to power on...");
    }
    manager
        .wait_until_ready(ADAPTER_READY_TIMEOUT)
        .await
        .context("Bluetooth is off or scanning is not permitted")?;

    let result = run(&manager, args.command, Duration::from_secs(args.scan_seconds)).await;

    for device in manager.devices().into_iter().filter(|d| d.is_connected()) {
        if let Err(e) = manager.disconnect(device.address()).await {
            warn!("{}", e);
        }
    }
    manager.shutdown().await;
    result
}

async fn run(manager: &BleSessionManager, command: Command, scan_time: Duration) -> Result<()> {
    match command {
        Command::Scan => scan(manager, scan_time).await,
        Command::Status { address } => {
            let device = connect_to(manager, &address, scan_time).await?;
            print_status(&device).await;
            Ok(())
        }
        Command::Monitor { address } => {
            let device = connect_to(manager, &address, scan_time).await?;
            monitor(manager, &device).await
        }
        Command::SetMode { address, mode } => {
            let device = connect_to(manager, &address, scan_time).await?;
            device.write_dim_led_mode(mode).await?;
            println!("Light mode: {:?}", device.read_dim_led_mode().await?);
            Ok(())
        }
        Command::Rfid {
            address,
            enable,
            disable,
            pair,
            unpair,
        } => {
            let device = connect_to(manager, &address, scan_time).await?;
            configure_rfid(&device, enable, disable, pair, unpair).await
        }
        Command::Read { address, service, index } => {
            let device = connect_to(manager, &address, scan_time).await?;
            let value = device.read_raw("raw value", service, index).await?;
            println!("{}  ({})", codec::encode_text_safe(&value), codec::to_hex_string(&value));
            Ok(())
        }
        Command::Write {
            address,
            service,
            index,
            value,
        } => {
            let payload = codec::decode_text_safe(&value).map_err(BleError::from)?;
            let device = connect_to(manager, &address, scan_time).await?;
            device.write_raw("raw value", service, index, &payload).await?;
            println!("Wrote {}", codec::to_hex_string(&payload));
            Ok(())
        }
        Command::Config { .. } => Ok(()),
    }
}

async fn scan(manager: &BleSessionManager, duration: Duration) -> Result<()> {
    let services = manager.config().scan_services.clone();
    manager
        .start_scan(&services, Some(Box::new(|e: BleError| warn!("{}", e))))
        .await?;
    tokio::time::sleep(duration).await;
    manager.stop_scan().await;

    for device in manager.devices() {
        println!(
            "{}  {:<20} {:>4} dBm  {:?}",
            device.address(),
            device.advertised_name(),
            device.signal_strength(),
            device.connection_state()
        );
    }
    Ok(())
}

/// Scans until `address` shows up, then connects to it.
async fn connect_to(manager: &BleSessionManager, address: &str, scan_time: Duration) -> Result<PeripheralHandle> {
    let address = normalize_address(address);
    let address = address.as_str();
    if manager.registry().get(address).is_none() {
        let services = manager.config().scan_services.clone();
        manager.start_scan(&services, None).await?;
        let mut devices = manager.registry().subscribe();
        let found = tokio::time::timeout(
            scan_time,
            devices.wait_for(|devices| devices.iter().any(|d| d.address() == address)),
        )
        .await
        .is_ok_and(|waited| waited.is_ok());
        manager.stop_scan().await;
        if !found {
            bail!("Device {} not found within {} s", address, scan_time.as_secs());
        }
    }

    let table = manager.connect(address).await?;
    info!("Connected to {}: {}", address, table.summary());
    manager
        .peripheral(address)
        .ok_or_else(|| anyhow!("Device {} vanished after connecting", address))
}

fn show<T: std::fmt::Debug>(value: BleResult<T>) -> String {
    match value {
        Ok(value) => format!("{:?}", value),
        Err(e) if e.is_feature_unsupported() => "unsupported".to_string(),
        Err(e) => format!("error ({})", e),
    }
}

async fn print_status(device: &PeripheralHandle) {
    println!("Device:        {} ({})", device.advertised_name(), device.address());
    println!("Signal:        {} dBm", device.signal_strength());
    println!("Firmware:      {}", show(device.read_firmware_version().await));
    println!("Light mode:    {}", show(device.read_dim_led_mode().await));
    println!("Debug LED:     {}", show(device.read_debug_led().await));
    println!("LED voltage:   {} mV", show(device.read_led_voltage().await));
    println!("LED current:   {} mA", show(device.read_led_current().await));
    println!("Battery:       {}", show(device.read_battery().await));
    println!("Charging:      {}", show(device.read_battery_charging().await));
    println!("Temperature:   {}", show(device.read_temperature().await));
    println!("RFID enabled:  {}", show(device.read_rfid_enabled().await));
    println!("RFID paired:   {}", show(device.read_rfid_paired_tag_id().await));
    println!("RFID detected: {}", show(device.read_rfid_detected_tag_id().await));
}

async fn monitor(manager: &BleSessionManager, device: &PeripheralHandle) -> Result<()> {
    let mut subscriptions: Vec<Subscription> = Vec::new();
    let monitors: [BleResult<Subscription>; 3] = [
        device.monitor_dim_led_mode(|mode| println!("Light mode -> {:?}", mode), None),
        device.monitor_battery_charging(|charging| println!("Charging -> {}", charging), None),
        device.monitor_rfid_detected_tag_id(|tag| println!("RFID detected -> {}", tag), None),
    ];
    for monitor in monitors {
        match monitor {
            Ok(subscription) => subscriptions.push(subscription),
            Err(e) if e.is_feature_unsupported() => info!("{}", e),
            Err(e) => return Err(e.into()),
        }
    }
    subscriptions.push(device.on_disconnected(|address| println!("{} disconnected", address)));
    subscriptions.push(manager.start_telemetry(device.address(), |update| match update {
        TelemetryUpdate::LedVoltage(mv) => println!("LED voltage: {} mV", mv),
        TelemetryUpdate::LedCurrent(ma) => println!("LED current: {} mA", ma),
        TelemetryUpdate::Temperature(t) => println!("Temperature: {}", t),
        TelemetryUpdate::Battery(status) => println!("Battery: {:?}", status),
        TelemetryUpdate::RfidEnabled(enabled) => println!("RFID enabled: {}", enabled),
        TelemetryUpdate::RfidPairedTagId(tag) => println!("RFID paired: {}", tag),
    })?);

    println!("Monitoring {}, press Ctrl-C to stop.", device.address());
    tokio::signal::ctrl_c().await?;

    for subscription in &subscriptions {
        subscription.cancel();
    }
    Ok(())
}

async fn configure_rfid(
    device: &PeripheralHandle,
    enable: bool,
    disable: bool,
    pair: Option<u32>,
    unpair: bool,
) -> Result<()> {
    if enable || disable {
        device.write_rfid_enabled(enable).await?;
    }
    if let Some(tag_id) = pair {
        // the reserved "no tag" value is rejected by the encoder
        device.write_rfid_paired_tag_id(tag_id.into()).await?;
    } else if unpair {
        device.write_rfid_paired_tag_id(-1).await?;
    }

    println!("RFID enabled:  {}", show(device.read_rfid_enabled().await));
    println!("RFID paired:   {}", show(device.read_rfid_paired_tag_id().await));
    Ok(())
}
