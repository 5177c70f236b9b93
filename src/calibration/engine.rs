//! Per-device calibration state shared between a slot's read loop and control calls.
//!
//! The read loop calls [`CalibrationEngine::observe`] for every frame and keeps its own copy of
//! the profile, refreshed only when [`CalibrationEngine::generation`] moves. Capture control
//! (start/finish, wizard steps) takes the lock; the steady-state hot path does not.

use super::{
    CalibrationError, CalibrationProfile, LivePreview, StickCapture, TriggerWizard, WizardPrompt,
    WizardStep,
};
use crate::report::{ButtonSet, CanonicalReport, StickSide};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use tracing::{debug, info};

/// Calibrated values ready for an emulation backend.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NormalizedInput {
    pub left_stick: (f64, f64),
    pub right_stick: (f64, f64),
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub buttons: ButtonSet,
}

impl CalibrationProfile {
    pub fn apply(&self, report: &CanonicalReport) -> NormalizedInput {
        NormalizedInput {
            left_stick: self
                .left_stick
                .normalize(report.left_stick.x, report.left_stick.y),
            right_stick: self
                .right_stick
                .normalize(report.right_stick.x, report.right_stick.y),
            left_trigger: self
                .left_trigger
                .apply(report.left_trigger, self.bump_is_full_scale),
            right_trigger: self
                .right_trigger
                .apply(report.right_trigger, self.bump_is_full_scale),
            buttons: report.buttons,
        }
    }
}

struct EngineState {
    profile: CalibrationProfile,
    capture: StickCapture,
    wizard: TriggerWizard,
}

pub struct CalibrationEngine {
    state: Mutex<EngineState>,
    generation: AtomicU64,
    capturing: AtomicBool,
    last_left_trigger: AtomicU8,
    last_right_trigger: AtomicU8,
}

impl CalibrationEngine {
    pub fn new(profile: CalibrationProfile) -> Self {
        Self {
            state: Mutex::new(EngineState {
                profile: profile.sanitized(),
                capture: StickCapture::default(),
                wizard: TriggerWizard::default(),
            }),
            generation: AtomicU64::new(0),
            capturing: AtomicBool::new(false),
            last_left_trigger: AtomicU8::new(0),
            last_right_trigger: AtomicU8::new(0),
        }
    }

    /// Bumped whenever the profile changes.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn profile(&self) -> CalibrationProfile {
        self.state.lock().profile
    }

    pub fn replace_profile(&self, profile: CalibrationProfile) {
        let mut state = self.state.lock();
        state.profile = profile.sanitized();
        self.bump_generation();
    }

    pub fn set_bump_full_scale(&self, enabled: bool) {
        let mut state = self.state.lock();
        if state.profile.bump_is_full_scale != enabled {
            state.profile.bump_is_full_scale = enabled;
            self.bump_generation();
        }
    }

    /// Feed one translated frame. Called from the read loop only.
    pub fn observe(&self, report: &CanonicalReport) {
        self.last_left_trigger
            .store(report.left_trigger, Ordering::Relaxed);
        self.last_right_trigger
            .store(report.right_trigger, Ordering::Relaxed);

        if self.capturing.load(Ordering::Acquire) {
            let mut state = self.state.lock();
            let EngineState {
                profile, capture, ..
            } = &mut *state;
            capture.track(report, profile);
        }
    }

    pub fn last_raw_triggers(&self) -> (u8, u8) {
        (
            self.last_left_trigger.load(Ordering::Relaxed),
            self.last_right_trigger.load(Ordering::Relaxed),
        )
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }

    pub fn start_stick_capture(&self) {
        let mut state = self.state.lock();
        state.capture.start();
        self.capturing.store(true, Ordering::Release);
        info!("Stick capture started");
    }

    pub fn finish_stick_capture(&self) -> Result<CalibrationProfile, CalibrationError> {
        let mut state = self.state.lock();
        if !state.capture.is_active() {
            return Err(CalibrationError::NoCaptureActive);
        }
        self.capturing.store(false, Ordering::Release);

        let EngineState {
            profile, capture, ..
        } = &mut *state;
        let outcome = capture.finish(profile);
        info!("Stick capture finished: {:?}", outcome);
        self.bump_generation();
        Ok(state.profile)
    }

    pub fn live_preview(&self, side: StickSide) -> Option<LivePreview> {
        let state = self.state.lock();
        state
            .capture
            .is_active()
            .then(|| state.capture.live_preview(side, &state.profile))
    }

    pub fn wizard_step(&self) -> WizardStep {
        self.state.lock().wizard.step()
    }

    pub fn advance_trigger_wizard(&self) -> WizardPrompt {
        let (left, right) = self.last_raw_triggers();
        let mut state = self.state.lock();
        let EngineState {
            profile, wizard, ..
        } = &mut *state;
        let prompt = wizard.advance(left, right, profile);
        debug!("Trigger wizard step {:?} (raw {} / {})", prompt.step, left, right);
        if prompt.completed {
            info!("Trigger calibration completed: {:?} / {:?}", profile.left_trigger, profile.right_trigger);
            self.bump_generation();
        }
        prompt
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// A read loop's private copy of the profile.
pub struct CalibrationSnapshot {
    profile: CalibrationProfile,
    generation: u64,
}

impl CalibrationSnapshot {
    pub fn new(engine: &CalibrationEngine) -> Self {
        Self {
            generation: engine.generation(),
            profile: engine.profile(),
        }
    }

    /// Re-read the profile only if the engine changed since the last call.
    pub fn refresh(&mut self, engine: &CalibrationEngine) -> &CalibrationProfile {
        let current = engine.generation();
        if current != self.generation {
            self.profile = engine.profile();
            self.generation = current;
        }
        &self.profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RawStick;

    fn report(lx: u16, lt: u8, rt: u8) -> CanonicalReport {
        CanonicalReport {
            left_stick: RawStick { x: lx, y: 2048 },
            right_stick: RawStick { x: 2048, y: 2048 },
            left_trigger: lt,
            right_trigger: rt,
            ..CanonicalReport::default()
        }
    }

    #[test]
    fn capture_through_engine_updates_snapshot() {
        let engine = CalibrationEngine::new(CalibrationProfile::default());
        let mut snapshot = CalibrationSnapshot::new(&engine);

        engine.start_stick_capture();
        engine.observe(&report(100, 0, 0));
        engine.observe(&report(4000, 0, 0));
        let profile = engine.finish_stick_capture().unwrap();
        assert_eq!(profile.left_stick.x.center, 2050.0);

        let refreshed = snapshot.refresh(&engine);
        assert_eq!(refreshed.left_stick.x.range, 1950.0);
        let input = refreshed.apply(&report(4000, 0, 0));
        assert!((input.left_stick.0 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn finish_without_start_is_rejected() {
        let engine = CalibrationEngine::new(CalibrationProfile::default());
        assert!(matches!(
            engine.finish_stick_capture(),
            Err(CalibrationError::NoCaptureActive)
        ));
        assert_eq!(engine.generation(), 0);
    }

    #[test]
    fn wizard_reads_latest_observed_triggers() {
        let engine = CalibrationEngine::new(CalibrationProfile::default());
        engine.advance_trigger_wizard();
        engine.observe(&report(2048, 10, 12));
        engine.advance_trigger_wizard();
        let profile = engine.profile();
        assert_eq!(profile.left_trigger.base, 10.0);
        assert_eq!(profile.right_trigger.base, 12.0);
        assert_eq!(engine.wizard_step(), WizardStep::AwaitLeftBump);
    }

    #[test]
    fn frames_outside_capture_do_not_touch_profile() {
        let engine = CalibrationEngine::new(CalibrationProfile::default());
        engine.observe(&report(0, 0, 0));
        assert_eq!(engine.profile(), CalibrationProfile::default());
        assert!(engine.live_preview(StickSide::Left).is_none());
    }
}
