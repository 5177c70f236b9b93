//! Canonical controller snapshot
//!
//! Every transport (USB polling, BLE notifications) ends up here: the translator turns raw
//! frames into a [`CanonicalReport`] and all later stages (calibration, emulation, observers)
//! only ever look at this type. Field meaning never depends on where the frame came from.

pub mod translator;

pub use translator::{translate, translate_bytes, Dialect, RawFrame};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The 18 digital inputs of the controller.
///
/// Declaration order is the bit position inside [`ButtonSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Button {
    B,
    A,
    Y,
    X,
    R,
    Z,
    Start,
    DDown,
    DRight,
    DLeft,
    DUp,
    L,
    ZL,
    Home,
    Capture,
    GR,
    GL,
    Chat,
}

impl Button {
    pub const ALL: [Button; 18] = [
        Button::B,
        Button::A,
        Button::Y,
        Button::X,
        Button::R,
        Button::Z,
        Button::Start,
        Button::DDown,
        Button::DRight,
        Button::DLeft,
        Button::DUp,
        Button::L,
        Button::ZL,
        Button::Home,
        Button::Capture,
        Button::GR,
        Button::GL,
        Button::Chat,
    ];

    const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            Button::B => "B",
            Button::A => "A",
            Button::Y => "Y",
            Button::X => "X",
            Button::R => "R",
            Button::Z => "Z",
            Button::Start => "Start",
            Button::DDown => "Dpad Down",
            Button::DRight => "Dpad Right",
            Button::DLeft => "Dpad Left",
            Button::DUp => "Dpad Up",
            Button::L => "L",
            Button::ZL => "ZL",
            Button::Home => "Home",
            Button::Capture => "Capture",
            Button::GR => "GR",
            Button::GL => "GL",
            Button::Chat => "Chat",
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compact set of pressed buttons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ButtonSet(u32);

impl ButtonSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, button: Button) {
        self.0 |= button.bit();
    }

    pub fn set(&mut self, button: Button, pressed: bool) {
        if pressed {
            self.0 |= button.bit();
        } else {
            self.0 &= !button.bit();
        }
    }

    pub fn contains(&self, button: Button) -> bool {
        self.0 & button.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Button> + '_ {
        Button::ALL.into_iter().filter(|b| self.contains(*b))
    }
}

impl FromIterator<Button> for ButtonSet {
    fn from_iter<I: IntoIterator<Item = Button>>(iter: I) -> Self {
        let mut set = ButtonSet::empty();
        for button in iter {
            set.insert(button);
        }
        set
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StickSide {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerSide {
    Left,
    Right,
}

/// Raw 12-bit stick position as reported by the hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RawStick {
    pub x: u16,
    pub y: u16,
}

/// Transport independent input snapshot.
///
/// Sticks are raw 12-bit values (0..=4095), triggers raw bytes. An all-zero report means
/// "no data" and is what the translator yields for frames it cannot decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CanonicalReport {
    pub buttons: ButtonSet,
    pub left_stick: RawStick,
    pub right_stick: RawStick,
    pub left_trigger: u8,
    pub right_trigger: u8,
}

impl CanonicalReport {
    pub fn is_zero(&self) -> bool {
        *self == CanonicalReport::default()
    }

    pub fn pressed(&self, button: Button) -> bool {
        self.buttons.contains(button)
    }

    pub fn stick(&self, side: StickSide) -> RawStick {
        match side {
            StickSide::Left => self.left_stick,
            StickSide::Right => self.right_stick,
        }
    }

    pub fn trigger(&self, side: TriggerSide) -> u8 {
        match side {
            TriggerSide::Left => self.left_trigger,
            TriggerSide::Right => self.right_trigger,
        }
    }
}
