use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use gc_bridge::ble::ipc::serve_worker;
use gc_bridge::ble::{BleBackend, RadioHandle, WorkerClient};
use gc_bridge::emulation::{BackendKind, PlatformBackends};
use gc_bridge::persistence::{SettingsStore, MAX_SLOTS};
use gc_bridge::slots::SlotManager;
use gc_bridge::usb::UsbBus;
use gc_bridge::BridgeError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "gc-bridge", version, about = "Bridges NSO GameCube controllers to virtual gamepads")]
struct Args {
    /// Settings file (default: ~/.config/gc-bridge/settings.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of controller slots
    #[arg(long, default_value_t = MAX_SLOTS as u8, value_parser = clap::value_parser!(u8).range(1..=4))]
    slots: u8,

    /// Emulation backend: xbox360 or dolphin
    #[arg(long)]
    emulation: Option<BackendKind>,

    /// Connect every available controller on startup
    #[arg(long)]
    auto_connect: bool,

    /// Wired controller path for the next free slot; may be repeated
    #[arg(long = "device", value_name = "PATH")]
    devices: Vec<String>,

    /// Drive the Bluetooth radio from a separate worker process
    #[arg(long)]
    radio_worker: bool,

    /// Act as that worker: serve the radio protocol on stdin/stdout
    #[arg(long, hide = true)]
    ble_worker: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.ble_worker)?;

    if args.ble_worker {
        return run_worker(args.config).await;
    }

    let (manager, store) = start(args).await?;
    log_status_changes(&manager);

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

    info!("Shutting down");
    manager.shutdown().await;
    store.save().await.map_err(BridgeError::from)?;
    Ok(())
}

async fn start(args: Args) -> std::result::Result<(SlotManager, Arc<SettingsStore>), BridgeError> {
    let path = args.config.unwrap_or_else(SettingsStore::default_path);
    let store = Arc::new(SettingsStore::load(path.clone()).await);

    let mut settings = store.snapshot().await;
    if let Some(kind) = args.emulation {
        settings.emulation_mode = kind;
    }

    let radio = if args.radio_worker {
        spawn_radio_worker(&path).await
    } else {
        open_radio().await.map(BleBackend::from)
    };
    let manager = SlotManager::new(
        args.slots as usize,
        store.clone(),
        &settings,
        usb_bus(),
        radio,
        Arc::new(PlatformBackends),
    );

    if !args.devices.is_empty() {
        let listed = args.devices.len();
        let connected = manager.connect_listed(args.devices).await;
        info!("Connected {} of {} listed controllers", connected, listed);
    }

    if args.auto_connect || settings.auto_connect {
        manager.auto_connect().await;
    } else {
        info!("Auto-connect disabled, waiting for Ctrl-C");
    }

    Ok((manager, store))
}

async fn run_worker(config: Option<PathBuf>) -> Result<()> {
    let store = SettingsStore::load(config.unwrap_or_else(SettingsStore::default_path)).await;
    let timings = store.snapshot().await.timings.pairing();
    let radio = open_radio()
        .await
        .ok_or_else(|| eyre!("No Bluetooth radio available"))?;
    serve_worker(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        radio,
        timings,
    )
    .await
    .map_err(BridgeError::from)?;
    Ok(())
}

async fn spawn_radio_worker(config: &Path) -> Option<BleBackend> {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            warn!("Cannot locate own executable for the radio worker: {}", e);
            return None;
        }
    };
    let worker_args = [
        "--ble-worker".to_string(),
        "--config".to_string(),
        config.display().to_string(),
    ];
    let client = match WorkerClient::spawn(&exe, &worker_args).await {
        Ok(client) => client,
        Err(e) => {
            warn!("Radio worker failed to start: {}", e);
            return None;
        }
    };
    match client.open(None).await {
        Ok(()) => Some(client.into()),
        Err(e) => {
            warn!("Radio worker has no radio: {}", e);
            client.shutdown().await;
            None
        }
    }
}

#[cfg(feature = "ble")]
async fn open_radio() -> Option<RadioHandle> {
    match gc_bridge::ble::platform::PlatformTransport::open().await {
        Ok(transport) => {
            let (radio, _actor) = RadioHandle::spawn(Box::new(transport));
            Some(radio)
        }
        Err(e) => {
            warn!("Bluetooth unavailable, wireless controllers disabled: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "ble"))]
async fn open_radio() -> Option<RadioHandle> {
    warn!("Built without the `ble` feature, wireless controllers are unavailable");
    None
}

#[cfg(feature = "hid")]
fn usb_bus() -> Arc<dyn UsbBus> {
    Arc::new(gc_bridge::usb::HidapiBus)
}

#[cfg(not(feature = "hid"))]
fn usb_bus() -> Arc<dyn UsbBus> {
    warn!("Built without the `hid` feature, wired controllers are unavailable");
    Arc::new(gc_bridge::usb::NoUsb)
}

fn log_status_changes(manager: &SlotManager) {
    for index in 0..manager.slot_count() {
        let Ok(mut status) = manager.subscribe(index) else {
            continue;
        };
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = status.borrow_and_update().clone();
                info!(
                    "Slot {} [{} {}]: {}",
                    index + 1,
                    current.mode,
                    current.state,
                    current.message
                );
            }
        });
    }
}

fn setup(worker: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env(worker);
    Ok(())
}

fn setup_logging_env(worker: bool) {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty();
    if worker {
        // stdout carries the worker protocol.
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}
