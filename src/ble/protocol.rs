//! Command channel framing and fixed ATT handles.
//!
//! Every command is `[id, 0x91, iface, sub, 0x00, len, 0x00, 0x00, payload..]`. Responses
//! arrive as notifications on [`H_CMD_RESPONSE`] and echo the command id in their first byte.

use super::BdAddr;

pub const H_SVC1_ENABLE: u16 = 0x0005;
pub const H_INPUT_REPORT: u16 = 0x000A;
pub const H_INPUT_CCCD: u16 = 0x000B;
pub const H_CMD_WRITE: u16 = 0x0014;
pub const H_CMD_RESPONSE: u16 = 0x001A;
pub const H_CMD_RESP_CCCD: u16 = 0x001B;

pub const CMD_SPI_READ: u8 = 0x02;
pub const CMD_REPORT_DATA: u8 = 0x03;
pub const CMD_SET_LED: u8 = 0x09;
pub const CMD_VIBRATION: u8 = 0x0A;
pub const CMD_PAIRING: u8 = 0x15;

const REQ_TYPE: u8 = 0x91;
pub const IFACE_USB: u8 = 0x00;
pub const IFACE_BLE: u8 = 0x01;

pub const CCCD_ENABLE: [u8; 2] = [0x01, 0x00];
pub const CCCD_DISABLE: [u8; 2] = [0x00, 0x00];

/// SPI flash locations, little endian on the wire.
pub const SPI_DEVICE_INFO: u32 = 0x0001_3000;
pub const SPI_PAIRING_DATA: u32 = 0x001F_A000;
pub const SPI_LEFT_STICK_CALIBRATION: u32 = 0x0001_3080;
pub const SPI_RIGHT_STICK_CALIBRATION: u32 = 0x0001_30C0;
pub const SPI_BLOCK: u8 = 0x40;

/// Offset of the flash payload inside an SPI read response.
pub const SPI_RESPONSE_HEADER: usize = 16;

/// Player indicator patterns, indexed by slot.
pub const LED_MAP: [u8; 8] = [0x01, 0x03, 0x05, 0x06, 0x07, 0x09, 0x0A, 0x0B];

pub fn led_mask(slot: usize) -> u8 {
    LED_MAP[slot.min(LED_MAP.len() - 1)]
}

fn header(cmd: u8, iface: u8, sub: u8, len: u8) -> Vec<u8> {
    vec![cmd, REQ_TYPE, iface, sub, 0x00, len, 0x00, 0x00]
}

pub fn spi_read(address: u32, size: u8) -> Vec<u8> {
    let mut cmd = header(CMD_SPI_READ, IFACE_BLE, 0x04, 0x08);
    cmd.extend_from_slice(&[size, 0x7E, 0x00, 0x00]);
    cmd.extend_from_slice(&address.to_le_bytes());
    cmd
}

pub fn set_led(iface: u8, mask: u8) -> Vec<u8> {
    let mut cmd = header(CMD_SET_LED, iface, 0x07, 0x08);
    cmd.extend_from_slice(&[mask, 0, 0, 0, 0, 0, 0, 0]);
    cmd
}

/// Input report defaults (report mode, feature mask).
pub fn report_data_defaults(iface: u8) -> Vec<u8> {
    let mut cmd = header(CMD_REPORT_DATA, iface, 0x0D, 0x08);
    cmd.extend_from_slice(&[0x01, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    cmd
}

/// Motor on or off. Also how rumble reaches the controller over stacks without raw handle access.
pub fn vibration(iface: u8, on: bool) -> Vec<u8> {
    let mut cmd = header(CMD_VIBRATION, iface, 0x02, 0x04);
    cmd.extend_from_slice(&[on as u8, 0x00, 0x00, 0x00]);
    cmd
}

/// Pairing step 1: our address, then the same address with its top byte decremented.
pub fn pair_address(local: &BdAddr) -> Vec<u8> {
    let addr = local.to_le_bytes();
    let mut addr_m1 = addr;
    addr_m1[5] = addr_m1[5].wrapping_sub(1);

    let mut cmd = header(CMD_PAIRING, IFACE_BLE, 0x01, 0x0E);
    cmd.extend_from_slice(&[0x00, 0x02]);
    cmd.extend_from_slice(&addr);
    cmd.extend_from_slice(&addr_m1);
    cmd
}

/// Pairing step 2: public key A.
pub fn pair_public_key(key: &[u8; 16]) -> Vec<u8> {
    let mut cmd = header(CMD_PAIRING, IFACE_BLE, 0x04, 0x11);
    cmd.push(0x00);
    cmd.extend_from_slice(key);
    cmd
}

/// Pairing step 3: challenge.
pub fn pair_challenge(challenge: &[u8; 16]) -> Vec<u8> {
    let mut cmd = header(CMD_PAIRING, IFACE_BLE, 0x02, 0x11);
    cmd.push(0x00);
    cmd.extend_from_slice(challenge);
    cmd
}

/// Pairing step 4: finalize.
pub fn pair_finalize() -> Vec<u8> {
    let mut cmd = header(CMD_PAIRING, IFACE_BLE, 0x03, 0x01);
    cmd.push(0x00);
    cmd
}

/// A notification from the command response characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse(pub Vec<u8>);

impl CommandResponse {
    pub fn command(&self) -> Option<u8> {
        self.0.first().copied()
    }

    pub fn answers(&self, cmd: u8) -> bool {
        self.command() == Some(cmd)
    }

    /// Flash payload of an SPI read response.
    pub fn spi_payload(&self) -> &[u8] {
        self.0.get(SPI_RESPONSE_HEADER..).unwrap_or(&[])
    }

    /// The last 16 bytes, where key material and proofs are carried.
    pub fn trailing_block(&self) -> Option<[u8; 16]> {
        let len = self.0.len();
        if len < 16 {
            return None;
        }
        let mut block = [0u8; 16];
        block.copy_from_slice(&self.0[len - 16..]);
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spi_read_places_address_little_endian() {
        assert_eq!(
            spi_read(SPI_PAIRING_DATA, SPI_BLOCK),
            vec![0x02, 0x91, 0x01, 0x04, 0x00, 0x08, 0x00, 0x00, 0x40, 0x7E, 0x00, 0x00, 0x00, 0xA0, 0x1F, 0x00]
        );
    }

    #[test]
    fn pair_address_appends_decremented_copy() {
        let cmd = pair_address(&BdAddr::FALLBACK_LOCAL);
        assert_eq!(&cmd[..10], &[0x15, 0x91, 0x01, 0x01, 0x00, 0x0E, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(&cmd[10..16], &[0xF5, 0xF4, 0xF3, 0xF2, 0xF1, 0xF0]);
        assert_eq!(&cmd[16..22], &[0xF5, 0xF4, 0xF3, 0xF2, 0xF1, 0xEF]);
    }

    #[test]
    fn pairing_key_commands_carry_sixteen_bytes() {
        let key = [0xAB; 16];
        let cmd = pair_public_key(&key);
        assert_eq!(cmd.len(), 25);
        assert_eq!(&cmd[..9], &[0x15, 0x91, 0x01, 0x04, 0x00, 0x11, 0x00, 0x00, 0x00]);
        assert_eq!(&cmd[9..], &key);
        assert_eq!(pair_challenge(&key)[3], 0x02);
        assert_eq!(pair_finalize(), vec![0x15, 0x91, 0x01, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn led_mask_saturates_past_the_table() {
        assert_eq!(led_mask(0), 0x01);
        assert_eq!(led_mask(3), 0x06);
        assert_eq!(led_mask(42), 0x0B);
        assert_eq!(set_led(IFACE_BLE, 0x05)[8], 0x05);
    }

    #[test]
    fn vibration_toggles_the_ninth_byte() {
        assert_eq!(
            vibration(IFACE_BLE, true),
            vec![0x0A, 0x91, 0x01, 0x02, 0x00, 0x04, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(vibration(IFACE_USB, false)[2..], [0x00, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }
}
