//! Raw frame to [`CanonicalReport`] translation.
//!
//! Three wire layouts exist for the same controller:
//!
//! ```text
//! USB            [3..6]  per-byte buttons   [6..12]  sticks  [13] LT [14] RT
//! BLE native     [4..8]  per-byte buttons   [10..16] sticks  [60] LT [61] RT (full only)
//! BLE bitmask    [0]=0x21 [5..9] u32 LE mask [10..16] sticks  [16] LT [17] RT (when present)
//! ```
//!
//! Translation never fails. Frames below a dialect's minimum length decode to the all-zero
//! report, which the pipeline treats as "no new data".

use super::{Button, ButtonSet, CanonicalReport, RawStick};

/// First byte of a frame relayed by the legacy bridge protocol.
pub const BITMASK_REPORT_ID: u8 = 0x21;

/// Native BLE notifications shorter than this are command responses, not input.
pub const BLE_MIN_INPUT_LEN: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Usb,
    BleBitmask,
    BleNativeShort,
    BleNativeFull,
}

impl Dialect {
    pub const fn min_len(self) -> usize {
        match self {
            Dialect::Usb => 15,
            Dialect::BleBitmask => 16,
            Dialect::BleNativeShort => 16,
            Dialect::BleNativeFull => 62,
        }
    }

    pub fn accepts(self, frame: &[u8]) -> bool {
        frame.len() >= self.min_len()
    }

    /// Classify a BLE notification payload by its first byte and length.
    ///
    /// Returns `None` for payloads that carry no input (command responses).
    ///
    /// A leading `0x21` always wins: any frame of bitmask length that starts with it is decoded as
    /// bitmask, even when it is long enough to be a native report.
    pub fn detect_ble(frame: &[u8]) -> Option<Dialect> {
        match frame.first() {
            Some(&BITMASK_REPORT_ID) if frame.len() >= Dialect::BleBitmask.min_len() => {
                Some(Dialect::BleBitmask)
            }
            _ if frame.len() >= Dialect::BleNativeFull.min_len() => Some(Dialect::BleNativeFull),
            _ if frame.len() >= BLE_MIN_INPUT_LEN => Some(Dialect::BleNativeShort),
            _ => None,
        }
    }
}

/// A raw frame tagged with the layout it was produced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFrame<'a> {
    Usb(&'a [u8]),
    BleBitmask(&'a [u8]),
    BleNativeShort(&'a [u8]),
    BleNativeFull(&'a [u8]),
}

impl<'a> RawFrame<'a> {
    pub fn new(dialect: Dialect, bytes: &'a [u8]) -> Self {
        match dialect {
            Dialect::Usb => RawFrame::Usb(bytes),
            Dialect::BleBitmask => RawFrame::BleBitmask(bytes),
            Dialect::BleNativeShort => RawFrame::BleNativeShort(bytes),
            Dialect::BleNativeFull => RawFrame::BleNativeFull(bytes),
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            RawFrame::Usb(_) => Dialect::Usb,
            RawFrame::BleBitmask(_) => Dialect::BleBitmask,
            RawFrame::BleNativeShort(_) => Dialect::BleNativeShort,
            RawFrame::BleNativeFull(_) => Dialect::BleNativeFull,
        }
    }

    pub fn bytes(&self) -> &'a [u8] {
        match *self {
            RawFrame::Usb(b)
            | RawFrame::BleBitmask(b)
            | RawFrame::BleNativeShort(b)
            | RawFrame::BleNativeFull(b) => b,
        }
    }
}

struct ByteBit {
    byte: usize,
    mask: u8,
    button: Button,
}

const fn bb(byte: usize, mask: u8, button: Button) -> ByteBit {
    ByteBit { byte, mask, button }
}

struct MaskBit {
    mask: u32,
    button: Button,
}

const fn mb(mask: u32, button: Button) -> MaskBit {
    MaskBit { mask, button }
}

const USB_BUTTONS: [ByteBit; 18] = [
    bb(3, 0x01, Button::B),
    bb(3, 0x02, Button::A),
    bb(3, 0x04, Button::Y),
    bb(3, 0x08, Button::X),
    bb(3, 0x10, Button::R),
    bb(3, 0x20, Button::Z),
    bb(3, 0x40, Button::Start),
    bb(4, 0x01, Button::DDown),
    bb(4, 0x02, Button::DRight),
    bb(4, 0x04, Button::DLeft),
    bb(4, 0x08, Button::DUp),
    bb(4, 0x10, Button::L),
    bb(4, 0x20, Button::ZL),
    bb(5, 0x01, Button::Home),
    bb(5, 0x02, Button::Capture),
    bb(5, 0x04, Button::GR),
    bb(5, 0x08, Button::GL),
    bb(5, 0x10, Button::Chat),
];

// Native BLE reports keep the Switch 2 button word at offset 4, read byte by byte.
const NATIVE_BUTTONS: [ByteBit; 18] = [
    bb(4, 0x01, Button::Y),
    bb(4, 0x02, Button::X),
    bb(4, 0x04, Button::B),
    bb(4, 0x08, Button::A),
    bb(4, 0x40, Button::R),
    bb(4, 0x80, Button::Z),
    bb(5, 0x02, Button::Start),
    bb(5, 0x10, Button::Home),
    bb(5, 0x20, Button::Capture),
    bb(5, 0x40, Button::Chat),
    bb(6, 0x01, Button::DDown),
    bb(6, 0x02, Button::DUp),
    bb(6, 0x04, Button::DRight),
    bb(6, 0x08, Button::DLeft),
    bb(6, 0x40, Button::L),
    bb(6, 0x80, Button::ZL),
    bb(7, 0x01, Button::GR),
    bb(7, 0x02, Button::GL),
];

const BITMASK_OFFSET: usize = 5;

const BITMASK_BUTTONS: [MaskBit; 18] = [
    mb(0x0000_0001, Button::Y),
    mb(0x0000_0002, Button::A),
    mb(0x0000_0004, Button::X),
    mb(0x0000_0008, Button::B),
    mb(0x0000_0010, Button::Start),
    mb(0x0000_0040, Button::R),
    mb(0x0000_0080, Button::Z),
    mb(0x0000_0100, Button::DUp),
    mb(0x0000_0200, Button::DDown),
    mb(0x0000_0400, Button::DLeft),
    mb(0x0000_0800, Button::DRight),
    mb(0x0000_1000, Button::L),
    mb(0x0000_2000, Button::ZL),
    mb(0x0001_0000, Button::Home),
    mb(0x0002_0000, Button::Capture),
    mb(0x0004_0000, Button::Chat),
    mb(0x0100_0000, Button::GR),
    mb(0x0200_0000, Button::GL),
];

const USB_STICKS: usize = 6;
const BLE_STICKS: usize = 10;

const USB_TRIGGERS: (usize, usize) = (13, 14);
const NATIVE_TRIGGERS: (usize, usize) = (60, 61);
const BITMASK_TRIGGERS: (usize, usize) = (16, 17);

/// Decode a raw frame. Pure: identical input always yields identical output.
pub fn translate(frame: RawFrame<'_>) -> CanonicalReport {
    let bytes = frame.bytes();
    if !frame.dialect().accepts(bytes) {
        return CanonicalReport::default();
    }

    let mut report = match frame {
        RawFrame::Usb(b) => CanonicalReport {
            buttons: decode_bytes(b, &USB_BUTTONS),
            ..decode_analog(b, USB_STICKS, Some(USB_TRIGGERS))
        },
        RawFrame::BleNativeShort(b) => CanonicalReport {
            buttons: decode_bytes(b, &NATIVE_BUTTONS),
            ..decode_analog(b, BLE_STICKS, None)
        },
        RawFrame::BleNativeFull(b) => CanonicalReport {
            buttons: decode_bytes(b, &NATIVE_BUTTONS),
            ..decode_analog(b, BLE_STICKS, Some(NATIVE_TRIGGERS))
        },
        RawFrame::BleBitmask(b) => CanonicalReport {
            buttons: decode_mask(b, &BITMASK_BUTTONS),
            ..decode_analog(b, BLE_STICKS, Some(BITMASK_TRIGGERS))
        },
    };

    synthesize_triggers(&mut report);
    report
}

pub fn translate_bytes(bytes: &[u8], dialect: Dialect) -> CanonicalReport {
    translate(RawFrame::new(dialect, bytes))
}

fn decode_bytes(frame: &[u8], table: &[ByteBit]) -> ButtonSet {
    table
        .iter()
        .filter(|bit| frame.get(bit.byte).is_some_and(|b| b & bit.mask != 0))
        .map(|bit| bit.button)
        .collect()
}

fn decode_mask(frame: &[u8], table: &[MaskBit]) -> ButtonSet {
    let mut word = [0u8; 4];
    for (i, slot) in word.iter_mut().enumerate() {
        *slot = frame.get(BITMASK_OFFSET + i).copied().unwrap_or(0);
    }
    let mask = u32::from_le_bytes(word);
    table
        .iter()
        .filter(|bit| mask & bit.mask != 0)
        .map(|bit| bit.button)
        .collect()
}

fn decode_analog(
    frame: &[u8],
    stick_offset: usize,
    triggers: Option<(usize, usize)>,
) -> CanonicalReport {
    let (left_stick, right_stick) = unpack_sticks(frame, stick_offset);
    let (left_trigger, right_trigger) = triggers
        .map(|(l, r)| {
            (
                frame.get(l).copied().unwrap_or(0),
                frame.get(r).copied().unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));

    CanonicalReport {
        buttons: ButtonSet::empty(),
        left_stick,
        right_stick,
        left_trigger,
        right_trigger,
    }
}

/// Two sticks, 12 bits per axis, packed little endian into six bytes.
fn unpack_sticks(frame: &[u8], offset: usize) -> (RawStick, RawStick) {
    let byte = |i: usize| frame.get(offset + i).copied().unwrap_or(0) as u16;
    let left = RawStick {
        x: byte(0) | ((byte(1) & 0x0F) << 8),
        y: (byte(1) >> 4) | (byte(2) << 4),
    };
    let right = RawStick {
        x: byte(3) | ((byte(4) & 0x0F) << 8),
        y: (byte(4) >> 4) | (byte(5) << 4),
    };
    (left, right)
}

fn synthesize_triggers(report: &mut CanonicalReport) {
    if report.left_trigger != 0 || report.right_trigger != 0 {
        return;
    }
    if report.buttons.contains(Button::L) {
        report.left_trigger = u8::MAX;
    }
    if report.buttons.contains(Button::R) {
        report.right_trigger = u8::MAX;
    }
}
