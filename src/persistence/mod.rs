//! # Persistence Module
//!
//! Settings that survive a restart: global options, per-slot connection preferences, timing
//! knobs and the calibration profiles of every controller the bridge has seen.
//!
//! ## Key Abstractions
//! - **Device-keyed profiles**: calibration belongs to the controller (USB path or BLE address),
//!   never to the slot it happens to sit in.
//! - **Fail-safe loading**: every field has a default, so a missing or corrupted file degrades to
//!   defaults rather than preventing startup. See [`settings_store::SettingsStore`].

pub mod settings_store;

pub use settings_store::{SettingsError, SettingsStore};

use crate::ble::{BdAddr, PairingTimings};
use crate::calibration::CalibrationProfile;
use crate::emulation::BackendKind;
use crate::pipeline::PipelineSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const MAX_SLOTS: usize = 4;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    Usb,
    Ble,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Usb => write!(f, "USB"),
            ConnectionMode::Ble => write!(f, "BLE"),
        }
    }
}

/// What a slot reconnects to when no runtime identity is known yet.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct SlotPreferences {
    pub connection_mode: ConnectionMode,
    pub preferred_device_path: Option<String>,
    pub preferred_ble_address: Option<BdAddr>,
}

/// Timeouts and intervals, in milliseconds so the file stays readable.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeTimings {
    pub command_response_ms: u64,
    pub led_response_ms: u64,
    pub encryption_ms: u64,
    pub attempt_pause_ms: u64,
    pub scan_timeout_ms: u64,
    pub scan_poll_ms: u64,
    pub usb_poll_ms: u64,
    pub ble_dequeue_ms: u64,
    pub usb_reconnect_ms: u64,
    pub ble_reconnect_ms: u64,
    pub observer_throttle: u32,
}

impl Default for BridgeTimings {
    fn default() -> Self {
        Self {
            command_response_ms: 3000,
            led_response_ms: 2000,
            encryption_ms: 5000,
            attempt_pause_ms: 300,
            scan_timeout_ms: 10_000,
            scan_poll_ms: 300,
            usb_poll_ms: 4,
            ble_dequeue_ms: 4,
            usb_reconnect_ms: 2000,
            ble_reconnect_ms: 3000,
            observer_throttle: 3,
        }
    }
}

impl BridgeTimings {
    pub fn pairing(&self) -> PairingTimings {
        PairingTimings {
            response: Duration::from_millis(self.command_response_ms),
            led_response: Duration::from_millis(self.led_response_ms),
            encryption: Duration::from_millis(self.encryption_ms),
            attempt_pause: Duration::from_millis(self.attempt_pause_ms),
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
            scan_poll: Duration::from_millis(self.scan_poll_ms),
            ..PairingTimings::default()
        }
    }

    pub fn pipeline(&self) -> PipelineSettings {
        PipelineSettings {
            observer_throttle: self.observer_throttle,
            ..PipelineSettings::default()
        }
    }

    pub fn usb_poll(&self) -> Duration {
        Duration::from_millis(self.usb_poll_ms)
    }

    pub fn ble_dequeue(&self) -> Duration {
        Duration::from_millis(self.ble_dequeue_ms)
    }

    pub fn reconnect_backoff(&self, mode: ConnectionMode) -> Duration {
        match mode {
            ConnectionMode::Usb => Duration::from_millis(self.usb_reconnect_ms),
            ConnectionMode::Ble => Duration::from_millis(self.ble_reconnect_ms),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeSettings {
    pub auto_connect: bool,
    pub emulation_mode: BackendKind,
    /// Global switch copied into every loaded profile.
    pub trigger_bump_100_percent: bool,
    pub saved_at: Option<DateTime<Utc>>,
    pub timings: BridgeTimings,
    pub slots: Vec<SlotPreferences>,
    /// Keyed by device identity.
    pub profiles: BTreeMap<String, CalibrationProfile>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            auto_connect: false,
            emulation_mode: BackendKind::default(),
            trigger_bump_100_percent: false,
            saved_at: None,
            timings: BridgeTimings::default(),
            slots: vec![SlotPreferences::default(); MAX_SLOTS],
            profiles: BTreeMap::new(),
        }
    }
}

impl BridgeSettings {
    pub fn slot(&self, index: usize) -> SlotPreferences {
        self.slots.get(index).cloned().unwrap_or_default()
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut SlotPreferences {
        if self.slots.len() <= index {
            self.slots.resize(index + 1, SlotPreferences::default());
        }
        &mut self.slots[index]
    }

    /// The stored profile for a device, or defaults, with the global trigger mode applied.
    pub fn profile(&self, device_key: &str) -> CalibrationProfile {
        let mut profile = self
            .profiles
            .get(device_key)
            .copied()
            .unwrap_or_default()
            .sanitized();
        profile.bump_is_full_scale = self.trigger_bump_100_percent;
        profile
    }

    pub fn set_profile(&mut self, device_key: &str, profile: CalibrationProfile) {
        self.profiles.insert(device_key.to_string(), profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: BridgeSettings = toml::from_str("auto_connect = true\n").unwrap();
        assert!(settings.auto_connect);
        assert_eq!(settings.slots.len(), MAX_SLOTS);
        assert_eq!(settings.timings, BridgeTimings::default());
        assert_eq!(settings.emulation_mode, BackendKind::DolphinPipe);
    }

    #[test]
    fn profile_lookup_applies_global_trigger_mode() {
        let mut settings = BridgeSettings::default();
        let mut stored = CalibrationProfile::default();
        stored.left_stick.x.center = 2000.0;
        stored.left_stick.x.range = 0.0;
        settings.set_profile("AA:BB:CC:DD:EE:FF", stored);
        settings.trigger_bump_100_percent = true;

        let loaded = settings.profile("AA:BB:CC:DD:EE:FF");
        assert_eq!(loaded.left_stick.x.center, 2000.0);
        assert_eq!(loaded.left_stick.x.range, 1.0);
        assert!(loaded.bump_is_full_scale);
        assert_eq!(
            settings.profile("/dev/hidraw9").left_stick,
            CalibrationProfile::default().left_stick
        );
    }

    #[test]
    fn timings_convert_to_component_settings() {
        let timings = BridgeTimings {
            scan_timeout_ms: 1500,
            observer_throttle: 5,
            ..BridgeTimings::default()
        };
        assert_eq!(timings.pairing().scan_timeout, Duration::from_millis(1500));
        assert_eq!(timings.pairing().response, Duration::from_secs(3));
        assert_eq!(timings.pipeline().observer_throttle, 5);
        assert_eq!(
            timings.reconnect_backoff(ConnectionMode::Ble),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn slot_mut_grows_preferences() {
        let mut settings = BridgeSettings {
            slots: Vec::new(),
            ..BridgeSettings::default()
        };
        settings.slot_mut(2).preferred_device_path = Some("/dev/hidraw1".to_string());
        assert_eq!(settings.slots.len(), 3);
        assert_eq!(settings.slot(0), SlotPreferences::default());
        assert_eq!(settings.slot(7), SlotPreferences::default());
    }
}
