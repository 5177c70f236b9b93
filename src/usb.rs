//! Wired controllers.
//!
//! [`UsbBus`] enumerates and opens devices; the hidapi implementation is behind the `hid`
//! feature. Reads are non-blocking so the pipeline can drain and keep only the newest frame.

use crate::ble::protocol;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const VENDOR_ID: u16 = 0x057E;
pub const PRODUCT_ID: u16 = 0x2073;

/// Largest input report the controller sends.
pub const REPORT_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    #[error("USB enumeration failed: {0}")]
    Enumerate(String),
    #[error("Could not open {0}: {1}")]
    Open(String, String),
    #[error("USB device not found")]
    NotFound,
    #[error("USB IO error: {0}")]
    Io(String),
    #[error("USB support not compiled in")]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub path: String,
    pub serial: Option<String>,
}

pub trait UsbDevice: Send + 'static {
    /// Returns 0 when no report is pending.
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, UsbError>;

    fn write(&mut self, data: &[u8]) -> Result<usize, UsbError>;
}

pub trait UsbBus: Send + Sync + 'static {
    fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>, UsbError>;

    fn open(&self, path: &str) -> Result<Box<dyn UsbDevice>, UsbError>;
}

/// One open device shared by the read loop and the slot's command writes (rumble).
#[derive(Clone)]
pub struct SharedUsbDevice(Arc<Mutex<Box<dyn UsbDevice>>>);

impl SharedUsbDevice {
    pub fn new(device: Box<dyn UsbDevice>) -> Self {
        Self(Arc::new(Mutex::new(device)))
    }
}

impl UsbDevice for SharedUsbDevice {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, UsbError> {
        self.0.lock().read_nonblocking(buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, UsbError> {
        self.0.lock().write(data)
    }
}

/// Commands that switch the controller into input streaming and light its player LED.
pub fn init_commands(slot: usize) -> [Vec<u8>; 2] {
    [
        protocol::report_data_defaults(protocol::IFACE_USB),
        protocol::set_led(protocol::IFACE_USB, protocol::led_mask(slot)),
    ]
}

pub fn initialize(device: &mut dyn UsbDevice, slot: usize) -> Result<(), UsbError> {
    for command in init_commands(slot) {
        let written = device.write(&command)?;
        debug!("USB init command 0x{:02X}: {} bytes", command[0], written);
    }
    info!("USB controller initialized for slot {}", slot);
    Ok(())
}

/// Placeholder bus for builds without a USB backend.
pub struct NoUsb;

impl UsbBus for NoUsb {
    fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>, UsbError> {
        Ok(Vec::new())
    }

    fn open(&self, _path: &str) -> Result<Box<dyn UsbDevice>, UsbError> {
        Err(UsbError::Unsupported)
    }
}

#[cfg(feature = "hid")]
pub use hid::HidapiBus;

#[cfg(feature = "hid")]
mod hid {
    use super::*;
    use hidapi::{HidApi, HidDevice};
    use std::ffi::CString;

    pub struct HidapiBus;

    struct HidController {
        device: HidDevice,
    }

    impl UsbDevice for HidController {
        fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, UsbError> {
            self.device
                .read(buf)
                .map_err(|e| UsbError::Io(e.to_string()))
        }

        fn write(&mut self, data: &[u8]) -> Result<usize, UsbError> {
            let mut report = Vec::with_capacity(data.len() + 1);
            report.push(0x00);
            report.extend_from_slice(data);
            self.device
                .write(&report)
                .map_err(|e| UsbError::Io(e.to_string()))
        }
    }

    impl UsbBus for HidapiBus {
        fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>, UsbError> {
            let api = HidApi::new().map_err(|e| UsbError::Enumerate(e.to_string()))?;
            Ok(api
                .device_list()
                .filter(|info| info.vendor_id() == VENDOR_ID && info.product_id() == PRODUCT_ID)
                .map(|info| UsbDeviceInfo {
                    path: info.path().to_string_lossy().into_owned(),
                    serial: info.serial_number().map(str::to_string),
                })
                .collect())
        }

        fn open(&self, path: &str) -> Result<Box<dyn UsbDevice>, UsbError> {
            let api = HidApi::new().map_err(|e| UsbError::Open(path.to_string(), e.to_string()))?;
            let c_path =
                CString::new(path).map_err(|e| UsbError::Open(path.to_string(), e.to_string()))?;
            let device = api
                .open_path(&c_path)
                .map_err(|e| UsbError::Open(path.to_string(), e.to_string()))?;
            device
                .set_blocking_mode(false)
                .map_err(|e| UsbError::Open(path.to_string(), e.to_string()))?;
            Ok(Box::new(HidController { device }))
        }
    }
}
