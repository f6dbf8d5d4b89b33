//! usb-monitor
//!
//! Watches USB devices come and go, optionally requests access to each one,
//! and prints every monitor event.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use monitor::config::MonitorConfig;
use monitor::{DeviceEvent, DeviceMonitor, DeviceState, RusbHost, Worker, event_channel};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use usb_types::DeviceDescriptor;

#[derive(Parser, Debug)]
#[command(name = "usb-monitor")]
#[command(author, version, about = "USB device monitor and permission broker")]
#[command(long_about = "
Tracks USB devices as they are attached and detached, brokers access
permission, and reports every transition.

EXAMPLES:
    # Watch all devices
    usb-monitor

    # Watch and open every device as soon as it appears
    usb-monitor --request

    # List matching devices and exit
    usb-monitor --list-devices

    # Machine readable output
    usb-monitor --json

CONFIGURATION:
    The monitor looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-monitor/monitor.toml
    3. /etc/usb-monitor/monitor.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List matching USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Request permission for every announced device
    #[arg(long)]
    request: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = MonitorConfig::default();
        let path = MonitorConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        MonitorConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        MonitorConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.monitor.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-monitor v{}", env!("CARGO_PKG_VERSION"));

    let host = RusbHost::new().context("Failed to initialize libusb")?;
    let worker = Worker::spawn("usb-monitor").context("Failed to start worker thread")?;
    let monitor = DeviceMonitor::new(Arc::new(host), worker.handle(), config.settings());
    monitor.set_filters(config.device_filters()?)?;

    let result = if args.list_devices {
        list_devices_mode(&monitor, args.json)
    } else {
        let request = args.request || config.monitor.auto_request_permission;
        watch_mode(&monitor, request, args.json).await
    };

    info!("Shutting down monitor...");
    monitor.destroy();
    worker.shutdown();

    result
}

/// List matching devices and exit
fn list_devices_mode(monitor: &DeviceMonitor, as_json: bool) -> Result<()> {
    let devices = monitor.device_list()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let permission = if monitor.has_permission(&device)? {
            "yes"
        } else {
            "no"
        };
        println!(
            "  {:04x}:{:04x} - {} {}",
            device.vendor_id,
            device.product_id,
            device.display_manufacturer(),
            device.display_product()
        );
        println!(
            "      Bus {:03} Device {:03} Class {:02x}/{:02x}/{:02x} Access: {}",
            device.bus_number, device.device_address, device.class, device.subclass, device.protocol, permission
        );
        if let Some(serial) = &device.serial_number {
            println!("      Serial: {}", serial);
        }
        println!();
    }

    Ok(())
}

/// Print events until Ctrl+C
async fn watch_mode(monitor: &DeviceMonitor, request: bool, as_json: bool) -> Result<()> {
    let (listener, events) = event_channel();
    monitor.register(listener).context("Failed to register monitor")?;

    info!("Watching USB devices, press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else {
                    warn!("Event channel closed");
                    break;
                };
                print_event(&event, as_json);
                if request && let DeviceEvent::Attach(device) = &event {
                    request_if_idle(monitor, device);
                }
            }
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Error waiting for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    Ok(())
}

/// Poll re-announcements must not re-prompt for devices already handled
fn request_if_idle(monitor: &DeviceMonitor, device: &DeviceDescriptor) {
    match monitor.state_of(device) {
        DeviceState::Connected | DeviceState::PermissionPending | DeviceState::Denied => {}
        _ => {
            if let Err(e) = monitor.request_permission(device) {
                error!("Failed to request permission for {}: {}", device, e);
            }
        }
    }
}

fn print_event(event: &DeviceEvent, as_json: bool) {
    if as_json {
        let created_new = match event {
            DeviceEvent::Connect { created_new, .. } => Some(*created_new),
            _ => None,
        };
        let line = json!({
            "event": event.kind(),
            "device": event.device(),
            "created_new": created_new,
        });
        println!("{}", line);
        return;
    }

    match event {
        DeviceEvent::Connect {
            device, created_new, ..
        } => println!(
            "connect     {}{}",
            device,
            if *created_new { "" } else { " (existing handle)" }
        ),
        other => println!("{:<11} {}", other.kind(), other.device()),
    }
}
