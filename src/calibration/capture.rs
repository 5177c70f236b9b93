//! Interactive stick capture.
//!
//! While active, every frame widens the per-axis extrema and keeps the farthest sample seen
//! in each of the eight 45° sectors (measured from the profile's *current* center). Finishing
//! derives the new center/range and rebuilds the octagon gate from those sector samples.

use super::{normalize, sector_unit_vector, AxisCalibration, CalibrationProfile, Octagon};
use crate::report::{CanonicalReport, RawStick, StickSide};

const AXES: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Extent {
    min: Option<u16>,
    max: Option<u16>,
}

impl Extent {
    fn track(&mut self, value: u16) {
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    /// Provisional center/range, only when the axis actually moved.
    fn calibration(&self) -> Option<AxisCalibration> {
        match (self.min, self.max) {
            (Some(min), Some(max)) if max > min => {
                let (min, max) = (min as f64, max as f64);
                Some(AxisCalibration::new((min + max) / 2.0, (max - min) / 2.0))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct SectorSamples {
    dist: [f64; 8],
    point: [RawStick; 8],
}

impl SectorSamples {
    fn track(&mut self, sample: RawStick, center_x: f64, center_y: f64) {
        let dx = sample.x as f64 - center_x;
        let dy = sample.y as f64 - center_y;
        let dist = dx.hypot(dy);
        if dist <= 0.0 {
            return;
        }
        let angle = dy.atan2(dx).to_degrees().rem_euclid(360.0);
        let sector = (angle / 45.0).round() as usize % 8;
        if dist > self.dist[sector] {
            self.dist[sector] = dist;
            self.point[sector] = sample;
        }
    }

    fn octagon(&self, x: &AxisCalibration, y: &AxisCalibration) -> Octagon {
        let mut vertices = [(0.0, 0.0); 8];
        for (i, vertex) in vertices.iter_mut().enumerate() {
            *vertex = if self.dist[i] > 0.0 {
                (
                    normalize(self.point[i].x as f64, x.center, x.range),
                    normalize(self.point[i].y as f64, y.center, y.range),
                )
            } else {
                sector_unit_vector(i)
            };
        }
        Octagon(vertices)
    }
}

/// Snapshot for drawing the in-progress gate of one stick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivePreview {
    pub x: AxisCalibration,
    pub y: AxisCalibration,
    pub sector_distances: [f64; 8],
    pub sector_samples: [RawStick; 8],
    pub octagon: Octagon,
}

/// Which axes a finished capture actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub left_x: bool,
    pub left_y: bool,
    pub right_x: bool,
    pub right_y: bool,
}

impl CaptureOutcome {
    pub fn any(&self) -> bool {
        self.left_x || self.left_y || self.right_x || self.right_y
    }
}

#[derive(Debug, Clone, Default)]
pub struct StickCapture {
    active: bool,
    // left x, left y, right x, right y
    extents: [Extent; AXES],
    sectors: [SectorSamples; 2],
}

impl StickCapture {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn start(&mut self) {
        *self = StickCapture {
            active: true,
            ..StickCapture::default()
        };
    }

    pub fn track(&mut self, report: &CanonicalReport, profile: &CalibrationProfile) {
        if !self.active {
            return;
        }
        let (l, r) = (report.left_stick, report.right_stick);
        for (extent, value) in self.extents.iter_mut().zip([l.x, l.y, r.x, r.y]) {
            extent.track(value);
        }
        for (i, side) in [StickSide::Left, StickSide::Right].into_iter().enumerate() {
            let stick = profile.stick(side);
            self.sectors[i].track(report.stick(side), stick.x.center, stick.y.center);
        }
    }

    /// Fold the captured data into `profile`. Axes that never moved keep their old values.
    pub fn finish(&mut self, profile: &mut CalibrationProfile) -> CaptureOutcome {
        if !std::mem::replace(&mut self.active, false) {
            return CaptureOutcome::default();
        }
        let [left_x, left_y, right_x, right_y] = self.extents.map(|e| e.calibration());
        let outcome = CaptureOutcome {
            left_x: left_x.is_some(),
            left_y: left_y.is_some(),
            right_x: right_x.is_some(),
            right_y: right_y.is_some(),
        };
        if let Some(cal) = left_x {
            profile.left_stick.x = cal;
        }
        if let Some(cal) = left_y {
            profile.left_stick.y = cal;
        }
        if let Some(cal) = right_x {
            profile.right_stick.x = cal;
        }
        if let Some(cal) = right_y {
            profile.right_stick.y = cal;
        }

        for (i, side) in [StickSide::Left, StickSide::Right].into_iter().enumerate() {
            let stick = profile.stick_mut(side);
            let x = AxisCalibration::new(stick.x.center, stick.x.range);
            let y = AxisCalibration::new(stick.y.center, stick.y.range);
            stick.octagon = Some(self.sectors[i].octagon(&x, &y));
        }
        outcome
    }

    /// Gate preview built from the provisional center/range of the extrema seen so far.
    pub fn live_preview(&self, side: StickSide, profile: &CalibrationProfile) -> LivePreview {
        let (ix, iy, sectors) = match side {
            StickSide::Left => (0, 1, &self.sectors[0]),
            StickSide::Right => (2, 3, &self.sectors[1]),
        };
        let stick = profile.stick(side);
        let x = self.extents[ix]
            .calibration()
            .unwrap_or_else(|| AxisCalibration::new(stick.x.center, stick.x.range));
        let y = self.extents[iy]
            .calibration()
            .unwrap_or_else(|| AxisCalibration::new(stick.y.center, stick.y.range));

        LivePreview {
            x,
            y,
            sector_distances: sectors.dist,
            sector_samples: sectors.point,
            octagon: sectors.octagon(&x, &y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(lx: u16, ly: u16, rx: u16, ry: u16) -> CanonicalReport {
        CanonicalReport {
            left_stick: RawStick { x: lx, y: ly },
            right_stick: RawStick { x: rx, y: ry },
            ..CanonicalReport::default()
        }
    }

    #[test]
    fn capture_of_two_samples_sets_center_and_range() {
        let mut profile = CalibrationProfile::default();
        let mut capture = StickCapture::default();
        capture.start();
        capture.track(&report(100, 2048, 2048, 2048), &profile);
        capture.track(&report(4000, 2048, 2048, 2048), &profile);
        let outcome = capture.finish(&mut profile);

        assert!(outcome.left_x);
        assert!(!outcome.left_y && !outcome.right_x && !outcome.right_y);
        assert_eq!(profile.left_stick.x.center, 2050.0);
        assert_eq!(profile.left_stick.x.range, 1950.0);
        assert!((profile.left_stick.x.normalize(100.0) + 1.0).abs() < 1e-9);
        assert!((profile.left_stick.x.normalize(4000.0) - 1.0).abs() < 1e-9);
        // untouched axes keep defaults
        assert_eq!(profile.left_stick.y, AxisCalibration::default());
    }

    #[test]
    fn finished_octagon_always_has_eight_vertices() {
        let mut profile = CalibrationProfile::default();
        let mut capture = StickCapture::default();
        capture.start();
        capture.track(&report(3000, 2048, 2048, 2048), &profile);
        capture.finish(&mut profile);

        let left = profile.left_stick.octagon.unwrap_or_default();
        assert_eq!(left.vertices().len(), 8);
        // sector 0 was sampled, the rest fall back to the unit circle
        assert!((left.vertices()[0].0 - (3000.0 - 2048.0) / 2048.0).abs() < 1e-9);
        let (x2, y2) = left.vertices()[2];
        assert!(x2.abs() < 1e-9 && (y2 - 1.0).abs() < 1e-9);
        assert_eq!(profile.right_stick.octagon, Some(Octagon::regular()));
    }

    #[test]
    fn sectors_bucket_by_rounded_angle() {
        let profile = CalibrationProfile::default();
        let mut capture = StickCapture::default();
        capture.start();
        // 40 degrees rounds into sector 1, 20 degrees into sector 0
        capture.track(&report(2048 + 766, 2048 + 643, 2048, 2048), &profile);
        capture.track(&report(2048 + 500, 2048 + 182, 2048, 2048), &profile);
        let preview = capture.live_preview(StickSide::Left, &profile);
        assert!(preview.sector_distances[1] > 0.0);
        assert!(preview.sector_distances[0] > 0.0);
        assert_eq!(preview.sector_distances[4], 0.0);
    }

    #[test]
    fn live_preview_uses_provisional_center() {
        let profile = CalibrationProfile::default();
        let mut capture = StickCapture::default();
        capture.start();
        capture.track(&report(1000, 2048, 2048, 2048), &profile);
        capture.track(&report(3000, 2048, 2048, 2048), &profile);
        let preview = capture.live_preview(StickSide::Left, &profile);
        assert_eq!(preview.x.center, 2000.0);
        assert_eq!(preview.x.range, 1000.0);
        assert_eq!(preview.y, AxisCalibration::default());
    }

    #[test]
    fn inactive_capture_ignores_frames() {
        let mut profile = CalibrationProfile::default();
        let mut capture = StickCapture::default();
        capture.track(&report(0, 0, 4095, 4095), &profile);
        let outcome = capture.finish(&mut profile);
        assert!(!outcome.any());
        assert_eq!(profile, CalibrationProfile::default());
    }
}
