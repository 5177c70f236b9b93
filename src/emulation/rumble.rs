//! Rumble command packets.

use crate::ble::protocol;

/// ATT handle of the combined command + rumble channel.
pub const BLE_RUMBLE_HANDLE: u16 = 0x0016;
pub const BLE_RUMBLE_PACKET_LEN: usize = 21;
const BLE_RUMBLE_TID_BASE: u8 = 0x50;

/// Per-slot rumble toggle with the rotating 4-bit transaction id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RumbleState {
    tid: u8,
    on: bool,
}

impl RumbleState {
    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn transaction_id(&self) -> u8 {
        self.tid
    }

    /// Whether moving to `on` would change anything.
    pub fn changes(&self, on: bool) -> bool {
        self.on != on
    }

    /// Build the next BLE packet and advance the transaction id.
    pub fn next_ble_packet(&mut self, on: bool) -> [u8; BLE_RUMBLE_PACKET_LEN] {
        let mut packet = [0u8; BLE_RUMBLE_PACKET_LEN];
        packet[1] = BLE_RUMBLE_TID_BASE | (self.tid & 0x0F);
        packet[2] = on as u8;
        self.tid = (self.tid + 1) & 0x0F;
        self.on = on;
        packet
    }

    /// Vibration command for the USB command endpoint.
    pub fn next_usb_command(&mut self, on: bool) -> Vec<u8> {
        self.on = on;
        protocol::vibration(protocol::IFACE_USB, on)
    }
}
