//! rust-usbip server
//!
//! USB/IP server that exports locally-attached USB devices to remote
//! clients over TCP. Network sessions run on the Tokio runtime; USB
//! operations run on a dedicated worker thread bridged with channels.

mod config;
mod network;
mod usb;

use anyhow::{Context, Result};
use clap::Parser;
use common::{HostBridge, HostEvent, create_host_bridge, setup_logging};
use config::ServerConfig;
use network::UsbIpServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use usb::adapter::TransferAdapter;
use usb::host::RusbHostController;
use usb::registry::DeviceRegistry;
use usb::spawn_usb_worker;

#[derive(Parser, Debug)]
#[command(name = "usbip-server")]
#[command(
    author,
    version,
    about = "USB/IP server - export local USB devices over the network"
)]
#[command(long_about = "
A USB/IP server endpoint. Exports locally-attached USB devices so a
remote host's USB stack can use them as if they were plugged in locally.

EXAMPLES:
    # Run with default config (port 3240)
    usbip-server

    # Run with custom config
    usbip-server --config /path/to/server.toml

    # List exportable USB devices without starting the server
    usbip-server --list-devices

    # Override the listening port
    usbip-server --port 3241

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
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List exportable USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// TCP port to listen on (overrides config)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

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
        ServerConfig::load(Some(config::expand_config_path(path)))
            .context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("rust-usbip server v{}", env!("CARGO_PKG_VERSION"));

    // USB subsystem: controller owned by a dedicated worker thread
    let (bridge, worker) = create_host_bridge();
    let controller = RusbHostController::new(
        Duration::from_millis(config.usb.string_wait_ms),
        config.usb.filters.clone(),
    )
    .context("Failed to initialize USB host controller")?;
    let worker_handle = spawn_usb_worker(worker, Box::new(controller));

    // All state is rebuilt from the live host capability at startup
    let registry = Arc::new(DeviceRegistry::new());
    match bridge.enumerate().await {
        Ok(devices) => {
            for device in devices {
                let busid = device.busid.clone();
                if let Err(e) = registry.register(device) {
                    warn!("skipping {}: {}", busid, e);
                }
            }
        }
        Err(e) => warn!("initial enumeration failed: {}", e),
    }
    info!("exporting {} devices", registry.len());

    if args.list_devices {
        print_device_list(&registry);
        let _ = bridge.shutdown().await;
        let _ = worker_handle.join();
        return Ok(());
    }

    spawn_removal_watcher(bridge.clone(), Arc::clone(&registry));

    let adapter = TransferAdapter::new(bridge.clone());
    let server = UsbIpServer::bind(&config, Arc::clone(&registry), adapter).await?;
    info!("listening on {}", server.local_addr()?);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("server error: {:#}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Teardown: sessions die with the runtime and their claims release on
    // drop; the worker drains its queue and exits
    info!("shutting down USB subsystem...");
    if let Err(e) = bridge.shutdown().await {
        warn!("USB worker shutdown failed: {}", e);
    }
    if worker_handle.join().is_err() {
        warn!("USB worker thread panicked");
    }

    info!("shutdown complete");
    Ok(())
}

/// Drop vanished devices from the registry as the worker reports them
fn spawn_removal_watcher(bridge: HostBridge, registry: Arc<DeviceRegistry>) {
    tokio::spawn(async move {
        while let Ok(event) = bridge.recv_event().await {
            match event {
                HostEvent::DeviceGone { busid } => {
                    if registry.remove(&busid) {
                        warn!("device {} removed from registry", busid);
                    }
                }
            }
        }
    });
}

fn print_device_list(registry: &DeviceRegistry) {
    let devices = registry.list();
    if devices.is_empty() {
        println!("No exportable USB devices found.");
        return;
    }

    println!("Exportable USB devices:");
    for device in devices {
        let label = match (&device.manufacturer, &device.product) {
            (Some(manufacturer), Some(product)) => format!("{manufacturer} {product}"),
            (_, Some(product)) => product.clone(),
            _ => "(unknown)".to_string(),
        };
        println!(
            "  {:<12} {:04x}:{:04x}  {}",
            device.busid, device.vendor_id, device.product_id, label
        );
    }
}
