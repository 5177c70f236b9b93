//! Stick and trigger calibration
//!
//! A [`CalibrationProfile`] belongs to a physical controller (keyed by its device identity),
//! never to a slot. Profiles start from defaults, are only changed by the capture routines in
//! [`capture`] and [`trigger_wizard`], and are persisted through the settings store.
//!
//! The hot path reads a copied profile ([`CalibrationProfile`] is `Copy`), so normalizing a
//! frame never touches shared state.

pub mod capture;
pub mod engine;
pub mod trigger_wizard;

pub use capture::{LivePreview, StickCapture};
pub use engine::{CalibrationEngine, CalibrationSnapshot, NormalizedInput};
pub use trigger_wizard::{TriggerWizard, WizardPrompt, WizardStep};

use crate::report::StickSide;
use serde::{Deserialize, Serialize};

pub const DEFAULT_STICK_CENTER: f64 = 2048.0;
pub const DEFAULT_STICK_RANGE: f64 = 2048.0;

pub const DEFAULT_TRIGGER_BASE: f64 = 32.0;
pub const DEFAULT_TRIGGER_BUMP: f64 = 190.0;
pub const DEFAULT_TRIGGER_MAX: f64 = 230.0;

const GATE_EPSILON: f64 = 1e-6;

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("No stick capture in progress")]
    NoCaptureActive,

    #[error("Invalid calibration data: {0}")]
    InvalidProfile(String),
}

/// `(raw - center) / max(range, 1)` clamped to `[-1, 1]`.
pub fn normalize(raw: f64, center: f64, range: f64) -> f64 {
    ((raw - center) / range.max(1.0)).clamp(-1.0, 1.0)
}

/// Map a raw trigger byte to 0..=255 using the trigger's base and either its bump or its
/// fully pressed point as 100%. Zero or negative ranges produce 0.
pub fn calibrate_trigger(raw: u8, base: f64, bump: f64, max: f64, bump_is_full_scale: bool) -> u8 {
    let calibrated = (raw as f64 - base).max(0.0);
    let range = if bump_is_full_scale {
        bump - base
    } else {
        max - base
    };
    if range <= 0.0 {
        return 0;
    }
    ((calibrated / range) * 255.0).clamp(0.0, 255.0) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisCalibration {
    pub center: f64,
    pub range: f64,
}

impl AxisCalibration {
    pub fn new(center: f64, range: f64) -> Self {
        Self {
            center,
            range: range.max(1.0),
        }
    }

    pub fn normalize(&self, raw: f64) -> f64 {
        normalize(raw, self.center, self.range)
    }
}

impl Default for AxisCalibration {
    fn default() -> Self {
        Self::new(DEFAULT_STICK_CENTER, DEFAULT_STICK_RANGE)
    }
}

/// Eight normalized gate vertices, one per 45° sector starting at +X, counter clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Octagon(pub [(f64, f64); 8]);

impl Octagon {
    /// The regular octagon inscribed in the unit circle.
    pub fn regular() -> Self {
        let mut vertices = [(0.0, 0.0); 8];
        for (i, vertex) in vertices.iter_mut().enumerate() {
            *vertex = sector_unit_vector(i);
        }
        Self(vertices)
    }

    pub fn vertices(&self) -> &[(f64, f64); 8] {
        &self.0
    }

    /// Distance from the origin to the gate boundary along `(dx, dy)`.
    pub fn boundary_radius(&self, dx: f64, dy: f64) -> Option<f64> {
        let len = dx.hypot(dy);
        if len < GATE_EPSILON {
            return None;
        }
        let (ux, uy) = (dx / len, dy / len);

        let mut nearest: Option<f64> = None;
        for i in 0..8 {
            let (ax, ay) = self.0[i];
            let (bx, by) = self.0[(i + 1) % 8];
            let (ex, ey) = (bx - ax, by - ay);
            let denom = cross(ux, uy, ex, ey);
            if denom.abs() < GATE_EPSILON {
                continue;
            }
            let t = cross(ax, ay, ex, ey) / denom;
            let s = cross(ax, ay, ux, uy) / denom;
            if t > GATE_EPSILON && (-GATE_EPSILON..=1.0 + GATE_EPSILON).contains(&s) {
                nearest = Some(nearest.map_or(t, |n: f64| n.min(t)));
            }
        }
        nearest
    }

    /// Stretch a normalized stick position so the gate boundary lands on the unit square edge.
    pub fn rescale(&self, x: f64, y: f64) -> (f64, f64) {
        match self.boundary_radius(x, y) {
            Some(radius) if radius > 1e-3 => {
                ((x / radius).clamp(-1.0, 1.0), (y / radius).clamp(-1.0, 1.0))
            }
            _ => (x, y),
        }
    }
}

impl Default for Octagon {
    fn default() -> Self {
        Self::regular()
    }
}

fn cross(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    ax * by - ay * bx
}

pub(crate) fn sector_unit_vector(sector: usize) -> (f64, f64) {
    let angle = (sector as f64 * 45.0).to_radians();
    (angle.cos(), angle.sin())
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StickCalibration {
    pub x: AxisCalibration,
    pub y: AxisCalibration,
    /// `None` means the default regular octagon.
    pub octagon: Option<Octagon>,
}

impl StickCalibration {
    pub fn normalize(&self, raw_x: u16, raw_y: u16) -> (f64, f64) {
        let x = self.x.normalize(raw_x as f64);
        let y = self.y.normalize(raw_y as f64);
        self.octagon.unwrap_or_default().rescale(x, y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerCalibration {
    pub base: f64,
    pub bump: f64,
    pub max: f64,
}

impl TriggerCalibration {
    pub fn apply(&self, raw: u8, bump_is_full_scale: bool) -> u8 {
        calibrate_trigger(raw, self.base, self.bump, self.max, bump_is_full_scale)
    }
}

impl Default for TriggerCalibration {
    fn default() -> Self {
        Self {
            base: DEFAULT_TRIGGER_BASE,
            bump: DEFAULT_TRIGGER_BUMP,
            max: DEFAULT_TRIGGER_MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationProfile {
    pub left_stick: StickCalibration,
    pub right_stick: StickCalibration,
    pub left_trigger: TriggerCalibration,
    pub right_trigger: TriggerCalibration,
    /// 100% trigger output at the bump instead of at full press.
    pub bump_is_full_scale: bool,
}

impl CalibrationProfile {
    pub fn stick(&self, side: StickSide) -> &StickCalibration {
        match side {
            StickSide::Left => &self.left_stick,
            StickSide::Right => &self.right_stick,
        }
    }

    pub fn stick_mut(&mut self, side: StickSide) -> &mut StickCalibration {
        match side {
            StickSide::Left => &mut self.left_stick,
            StickSide::Right => &mut self.right_stick,
        }
    }

    /// Restore the range invariant on data that did not come from the capture routines.
    pub fn sanitized(mut self) -> Self {
        for stick in [&mut self.left_stick, &mut self.right_stick] {
            stick.x.range = stick.x.range.max(1.0);
            stick.y.range = stick.y.range.max(1.0);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalize_guards_zero_range() {
        assert_eq!(normalize(10.0, 0.0, 0.0), 1.0);
        assert_eq!(normalize(0.5, 0.0, 0.0), 0.5);
    }

    #[test]
    fn trigger_zero_range_yields_zero() {
        for bump_mode in [true, false] {
            assert_eq!(calibrate_trigger(32, 32.0, 32.0, 32.0, bump_mode), 0);
            assert_eq!(calibrate_trigger(200, 50.0, 50.0, 50.0, bump_mode), 0);
            assert_eq!(calibrate_trigger(32, 32.0, 190.0, 230.0, bump_mode), 0);
        }
    }

    #[test]
    fn trigger_scales_to_bump_or_max() {
        assert_eq!(calibrate_trigger(190, 32.0, 190.0, 230.0, true), 255);
        assert_eq!(calibrate_trigger(230, 32.0, 190.0, 230.0, false), 255);
        assert_eq!(calibrate_trigger(131, 32.0, 190.0, 230.0, false), 127);
        assert_eq!(calibrate_trigger(10, 32.0, 190.0, 230.0, false), 0);
        assert_eq!(calibrate_trigger(255, 32.0, 190.0, 230.0, true), 255);
    }

    #[test]
    fn regular_octagon_boundary_on_vertices_is_one() {
        let gate = Octagon::regular();
        for i in 0..8 {
            let (x, y) = sector_unit_vector(i);
            let r = gate.boundary_radius(x, y).unwrap_or_default();
            assert!((r - 1.0).abs() < 1e-9, "sector {} radius {}", i, r);
        }
    }

    #[test]
    fn shrunken_gate_rescales_to_full_throw() {
        let mut vertices = Octagon::regular().0;
        for v in vertices.iter_mut() {
            v.0 *= 0.8;
            v.1 *= 0.8;
        }
        let gate = Octagon(vertices);
        let (x, y) = gate.rescale(0.8, 0.0);
        assert!((x - 1.0).abs() < 1e-9);
        assert!(y.abs() < 1e-9);
        assert_eq!(gate.rescale(0.0, 0.0), (0.0, 0.0));
    }

    #[test]
    fn missing_gate_behaves_like_regular_octagon() {
        let uncaptured = StickCalibration::default();
        let captured = StickCalibration {
            octagon: Some(Octagon::regular()),
            ..StickCalibration::default()
        };
        for (raw_x, raw_y) in [(3788, 2764), (2048, 2048), (400, 3900), (4095, 0)] {
            assert_eq!(
                uncaptured.normalize(raw_x, raw_y),
                captured.normalize(raw_x, raw_y)
            );
        }
    }

    #[test]
    fn sanitized_restores_minimum_range() {
        let mut profile = CalibrationProfile::default();
        profile.left_stick.x.range = 0.0;
        profile.right_stick.y.range = -4.0;
        let profile = profile.sanitized();
        assert_eq!(profile.left_stick.x.range, 1.0);
        assert_eq!(profile.right_stick.y.range, 1.0);
    }

    proptest! {
        #[test]
        fn normalize_stays_in_unit_range(raw in 0.0f64..4096.0, center in 0.0f64..4096.0, range in -10.0f64..4096.0) {
            let v = normalize(raw, center, range);
            prop_assert!((-1.0..=1.0).contains(&v));
        }

        #[test]
        fn normalize_center_is_zero(center in 0.0f64..4096.0, range in 0.0f64..4096.0) {
            prop_assert_eq!(normalize(center, center, range), 0.0);
        }
    }
}
