//! Bridge for GameCube-style NSO controllers.
//!
//! Raw USB and BLE frames are translated into one canonical report, calibrated, and fed to a
//! virtual gamepad. Up to four controllers run concurrently, each in its own [`slots`] slot.

pub mod ble;
pub mod calibration;
pub mod emulation;
pub mod error;
pub mod persistence;
pub mod pipeline;
pub mod report;
pub mod slots;
pub mod usb;

pub use error::BridgeError;
