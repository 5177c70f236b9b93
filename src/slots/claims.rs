//! Which slot owns which physical controller.

use crate::ble::BdAddr;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// Raw identity of a controller, also the key its calibration is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceId {
    Usb(String),
    Ble(BdAddr),
}

impl DeviceId {
    pub fn key(&self) -> String {
        match self {
            DeviceId::Usb(path) => path.clone(),
            DeviceId::Ble(addr) => addr.to_string(),
        }
    }

    pub fn ble_address(&self) -> Option<BdAddr> {
        match self {
            DeviceId::Ble(addr) => Some(*addr),
            DeviceId::Usb(_) => None,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Usb(path) => write!(f, "USB {}", path),
            DeviceId::Ble(addr) => write!(f, "BLE {}", addr),
        }
    }
}

/// A device identity maps to at most one slot.
#[derive(Debug, Default)]
pub struct ClaimRegistry {
    owners: Mutex<HashMap<DeviceId, usize>>,
}

impl ClaimRegistry {
    /// Claims `device` for `slot`. Re-claiming your own device succeeds; otherwise the
    /// current owner is returned.
    pub fn claim(&self, device: &DeviceId, slot: usize) -> Result<(), usize> {
        let mut owners = self.owners.lock();
        match owners.get(device) {
            Some(&owner) if owner != slot => Err(owner),
            _ => {
                owners.insert(device.clone(), slot);
                Ok(())
            }
        }
    }

    pub fn release(&self, device: &DeviceId, slot: usize) {
        let mut owners = self.owners.lock();
        if owners.get(device) == Some(&slot) {
            owners.remove(device);
        }
    }

    pub fn owner(&self, device: &DeviceId) -> Option<usize> {
        self.owners.lock().get(device).copied()
    }

    /// BLE addresses held by slots other than `slot`.
    pub fn ble_addresses_except(&self, slot: usize) -> Vec<BdAddr> {
        self.owners
            .lock()
            .iter()
            .filter(|(_, &owner)| owner != slot)
            .filter_map(|(device, _)| device.ble_address())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_slot_cannot_take_a_claimed_device() {
        let claims = ClaimRegistry::default();
        let pad = DeviceId::Usb("/dev/hidraw2".to_string());
        assert_eq!(claims.claim(&pad, 0), Ok(()));
        assert_eq!(claims.claim(&pad, 1), Err(0));
        assert_eq!(claims.claim(&pad, 0), Ok(()));

        claims.release(&pad, 1);
        assert_eq!(claims.owner(&pad), Some(0));
        claims.release(&pad, 0);
        assert_eq!(claims.claim(&pad, 1), Ok(()));
    }

    #[test]
    fn excludes_only_other_slots_ble_devices() {
        let claims = ClaimRegistry::default();
        let a: BdAddr = "98:B6:E9:00:00:01".parse().unwrap();
        let b: BdAddr = "98:B6:E9:00:00:02".parse().unwrap();
        claims.claim(&DeviceId::Ble(a), 0).unwrap();
        claims.claim(&DeviceId::Ble(b), 1).unwrap();
        claims.claim(&DeviceId::Usb("p".to_string()), 2).unwrap();

        assert_eq!(claims.ble_addresses_except(1), vec![a]);
        assert_eq!(DeviceId::Ble(a).key(), "98:B6:E9:00:00:01");
    }
}
