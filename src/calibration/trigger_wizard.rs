//! Six step trigger calibration wizard.
//!
//! The wizard never reads the device itself. Each `advance` consumes the latest raw trigger
//! values the pipeline has already observed.

use super::CalibrationProfile;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum WizardStep {
    #[default]
    Idle,
    AwaitBase,
    AwaitLeftBump,
    AwaitLeftMax,
    AwaitRightBump,
    AwaitRightMax,
}

impl WizardStep {
    pub fn index(self) -> u8 {
        match self {
            WizardStep::Idle => 0,
            WizardStep::AwaitBase => 1,
            WizardStep::AwaitLeftBump => 2,
            WizardStep::AwaitLeftMax => 3,
            WizardStep::AwaitRightBump => 4,
            WizardStep::AwaitRightMax => 5,
        }
    }
}

/// What an operator should be told after a wizard step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WizardPrompt {
    pub step: WizardStep,
    pub action_label: &'static str,
    pub status: &'static str,
    /// Set once the final step wrote the profile.
    pub completed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TriggerWizard {
    step: WizardStep,
}

impl TriggerWizard {
    pub fn step(&self) -> WizardStep {
        self.step
    }

    pub fn is_running(&self) -> bool {
        self.step != WizardStep::Idle
    }

    pub fn cancel(&mut self) {
        self.step = WizardStep::Idle;
    }

    /// Record the value the current step waits for and move on.
    pub fn advance(&mut self, last_left: u8, last_right: u8, profile: &mut CalibrationProfile) -> WizardPrompt {
        let (next, action_label, status) = match self.step {
            WizardStep::Idle => (
                WizardStep::AwaitBase,
                "Continue",
                "Release both triggers, then click Continue",
            ),
            WizardStep::AwaitBase => {
                profile.left_trigger.base = last_left as f64;
                profile.right_trigger.base = last_right as f64;
                (
                    WizardStep::AwaitLeftBump,
                    "Continue",
                    "Push LEFT trigger to analog max (before click)",
                )
            }
            WizardStep::AwaitLeftBump => {
                profile.left_trigger.bump = last_left as f64;
                (
                    WizardStep::AwaitLeftMax,
                    "Continue",
                    "Fully press LEFT trigger past the bump",
                )
            }
            WizardStep::AwaitLeftMax => {
                profile.left_trigger.max = last_left as f64;
                (
                    WizardStep::AwaitRightBump,
                    "Continue",
                    "Push RIGHT trigger to analog max (before click)",
                )
            }
            WizardStep::AwaitRightBump => {
                profile.right_trigger.bump = last_right as f64;
                (
                    WizardStep::AwaitRightMax,
                    "Continue",
                    "Fully press RIGHT trigger past the bump",
                )
            }
            WizardStep::AwaitRightMax => {
                profile.right_trigger.max = last_right as f64;
                (
                    WizardStep::Idle,
                    "Calibrate Triggers",
                    "Trigger calibration completed",
                )
            }
        };
        let completed = self.step == WizardStep::AwaitRightMax;
        self.step = next;
        WizardPrompt {
            step: next,
            action_label,
            status,
            completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_walkthrough_records_every_threshold() {
        let mut wizard = TriggerWizard::default();
        let mut profile = CalibrationProfile::default();

        let prompt = wizard.advance(0, 0, &mut profile);
        assert_eq!(prompt.step, WizardStep::AwaitBase);
        assert_eq!(prompt.status, "Release both triggers, then click Continue");

        wizard.advance(20, 25, &mut profile);
        wizard.advance(180, 25, &mut profile);
        wizard.advance(240, 25, &mut profile);
        wizard.advance(20, 170, &mut profile);
        let done = wizard.advance(20, 235, &mut profile);

        assert!(done.completed);
        assert_eq!(done.step, WizardStep::Idle);
        assert_eq!(done.status, "Trigger calibration completed");
        assert_eq!(profile.left_trigger.base, 20.0);
        assert_eq!(profile.left_trigger.bump, 180.0);
        assert_eq!(profile.left_trigger.max, 240.0);
        assert_eq!(profile.right_trigger.base, 25.0);
        assert_eq!(profile.right_trigger.bump, 170.0);
        assert_eq!(profile.right_trigger.max, 235.0);
        assert!(!wizard.is_running());
    }

    #[test]
    fn step_indices_follow_the_wizard_order() {
        let mut wizard = TriggerWizard::default();
        let mut profile = CalibrationProfile::default();
        let mut seen = vec![wizard.step().index()];
        for _ in 0..6 {
            seen.push(wizard.advance(0, 0, &mut profile).step.index());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 0]);
    }
}
