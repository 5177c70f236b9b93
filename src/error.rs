//! Crate-wide error type.

use crate::ble::ipc::IpcError;
use crate::ble::{PairingFailure, TransportError};
use crate::calibration::CalibrationError;
use crate::emulation::EmulationError;
use crate::persistence::SettingsError;
use crate::pipeline::PipelineError;
use crate::slots::SlotError;
use crate::usb::UsbError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Bluetooth error: {0}")]
    Transport(#[from] TransportError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingFailure),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Emulation error: {0}")]
    Emulation(#[from] EmulationError),

    #[error("Slot error: {0}")]
    Slot(#[from] SlotError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Worker protocol error: {0}")]
    Ipc(#[from] IpcError),

    #[error("USB error: {0}")]
    Usb(#[from] UsbError),
}
