use super::claims::DeviceId;
use crate::ble::session::BleLink;
use crate::calibration::CalibrationEngine;
use crate::emulation::RumbleState;
use crate::persistence::ConnectionMode;
use crate::pipeline::SharedBackend;
use crate::usb::SharedUsbDevice;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SlotState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Emulating,
}

impl SlotState {
    pub fn is_connected(self) -> bool {
        matches!(self, SlotState::Connected | SlotState::Emulating)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SlotState::Disconnected => "Disconnected",
            SlotState::Connecting => "Connecting",
            SlotState::Connected => "Connected",
            SlotState::Emulating => "Emulating",
        };
        write!(f, "{}", label)
    }
}

/// Published to observers whenever a slot changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlotStatus {
    pub index: usize,
    pub state: SlotState,
    pub mode: ConnectionMode,
    pub device: Option<String>,
    pub message: String,
    pub reconnecting: bool,
    pub connected_since: Option<DateTime<Utc>>,
}

/// Command path to the connected controller.
pub(crate) enum SlotLink {
    Usb(SharedUsbDevice),
    Ble(BleLink),
}

/// Everything one slot owns. Guarded by the manager's per-slot lock.
pub(crate) struct Slot {
    pub index: usize,
    pub state: SlotState,
    pub mode: ConnectionMode,
    /// Device currently claimed by this slot.
    pub device: Option<DeviceId>,
    /// Last device this slot was connected to, kept across disconnects.
    pub last_device: Option<DeviceId>,
    pub link: Option<SlotLink>,
    pub engine: Option<Arc<CalibrationEngine>>,
    pub backend: SharedBackend,
    pub rumble: RumbleState,
    /// Bumped on every connect and teardown so stale supervisors back off.
    pub generation: u64,
    pub connection: Option<CancellationToken>,
    pub supervisor: Option<JoinHandle<()>>,
    pub pending: Option<CancellationToken>,
    pub reconnect: Option<CancellationToken>,
    pub connected_since: Option<DateTime<Utc>>,
    pub message: String,
}

impl Slot {
    pub fn new(index: usize, mode: ConnectionMode) -> Self {
        Self {
            index,
            state: SlotState::Disconnected,
            mode,
            device: None,
            last_device: None,
            link: None,
            engine: None,
            backend: Arc::new(Mutex::new(None)),
            rumble: RumbleState::default(),
            generation: 0,
            connection: None,
            supervisor: None,
            pending: None,
            reconnect: None,
            connected_since: None,
            message: "Disconnected".to_string(),
        }
    }

    pub fn is_emulating(&self) -> bool {
        self.backend.lock().is_some()
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus {
            index: self.index,
            state: self.state,
            mode: self.mode,
            device: self.device.as_ref().map(DeviceId::key),
            message: self.message.clone(),
            reconnecting: self.reconnect.is_some(),
            connected_since: self.connected_since,
        }
    }
}
