//! Emulation backends
//!
//! The pipeline only knows the [`EmulationBackend`] trait. Concrete backends turn the
//! normalized stream into an OS virtual pad or an emulator's input pipe; the Dolphin pipe
//! variant lives in [`dolphin`], platform virtual pads are supplied through a
//! [`BackendFactory`].

pub mod dolphin;
pub mod rumble;

pub use dolphin::DolphinPipe;
pub use rumble::RumbleState;

use crate::calibration::NormalizedInput;
use crate::report::{Button, TriggerSide};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Called with `(large_motor, small_motor)` when the host sends force feedback.
pub type RumbleCallback = Box<dyn Fn(u8, u8) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum EmulationError {
    #[error("Emulation backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to write to backend: {0}")]
    WriteError(String),

    #[error("Backend setup cancelled")]
    Cancelled,

    #[error("Backend already closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Xbox360,
    #[default]
    DolphinPipe,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Xbox360 => write!(f, "Xbox 360"),
            BackendKind::DolphinPipe => write!(f, "Dolphin pipe"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xbox360" | "xbox" => Ok(BackendKind::Xbox360),
            "dolphin" | "dolphin_pipe" | "pipe" => Ok(BackendKind::DolphinPipe),
            other => Err(format!("unknown emulation mode '{}'", other)),
        }
    }
}

/// A virtual controller fed one frame at a time.
///
/// Setters stage state; [`EmulationBackend::flush`] commits the frame.
pub trait EmulationBackend: Send + 'static {
    fn kind(&self) -> BackendKind;

    /// Signed normalized, `-1.0..=1.0`.
    fn set_left_stick(&mut self, x: f64, y: f64);

    fn set_right_stick(&mut self, x: f64, y: f64);

    fn set_trigger(&mut self, side: TriggerSide, value: u8);

    fn set_button(&mut self, button: Button, pressed: bool);

    fn flush(&mut self) -> Result<(), EmulationError>;

    /// Return every control to neutral and commit.
    fn reset(&mut self) -> Result<(), EmulationError>;

    fn close(&mut self) -> Result<(), EmulationError>;

    /// Register for host force feedback. Returns `false` if the backend never produces any.
    fn on_rumble(&mut self, _callback: RumbleCallback) -> bool {
        false
    }
}

/// Creates backends for slots on demand.
#[async_trait]
pub trait BackendFactory: Send + Sync + 'static {
    async fn create(
        &self,
        kind: BackendKind,
        slot: usize,
        cancel: CancellationToken,
    ) -> Result<Box<dyn EmulationBackend>, EmulationError>;
}

/// Backends this crate can build on its own.
#[derive(Debug, Clone, Default)]
pub struct PlatformBackends;

#[async_trait]
impl BackendFactory for PlatformBackends {
    async fn create(
        &self,
        kind: BackendKind,
        slot: usize,
        cancel: CancellationToken,
    ) -> Result<Box<dyn EmulationBackend>, EmulationError> {
        match kind {
            BackendKind::DolphinPipe => {
                let pipe = dolphin::connect(slot, cancel).await?;
                info!("Slot {} emulating through Dolphin pipe", slot + 1);
                Ok(Box::new(pipe))
            }
            BackendKind::Xbox360 => Err(EmulationError::Unavailable(
                "no Xbox 360 virtual pad driver registered".to_string(),
            )),
        }
    }
}

pub const STICK_SCALE: f64 = 32767.0;

/// Quantize a normalized axis the way virtual pads expect it.
pub fn scale_axis(value: f64) -> i16 {
    (value * STICK_SCALE).clamp(-STICK_SCALE, STICK_SCALE) as i16
}

/// Push one calibrated frame into a backend. Digital L/R force a full trigger.
pub fn forward(
    backend: &mut dyn EmulationBackend,
    input: &NormalizedInput,
) -> Result<(), EmulationError> {
    backend.set_left_stick(input.left_stick.0, input.left_stick.1);
    backend.set_right_stick(input.right_stick.0, input.right_stick.1);

    for button in Button::ALL {
        backend.set_button(button, input.buttons.contains(button));
    }

    let left = if input.buttons.contains(Button::L) {
        u8::MAX
    } else {
        input.left_trigger
    };
    let right = if input.buttons.contains(Button::R) {
        u8::MAX
    } else {
        input.right_trigger
    };
    backend.set_trigger(TriggerSide::Left, left);
    backend.set_trigger(TriggerSide::Right, right);

    backend.flush()
}

/// Reset and close, logging instead of failing.
pub fn shutdown_backend(mut backend: Box<dyn EmulationBackend>, slot: usize) {
    if let Err(e) = backend.reset() {
        warn!("Slot {}: backend reset failed: {}", slot + 1, e);
    }
    if let Err(e) = backend.close() {
        warn!("Slot {}: backend close failed: {}", slot + 1, e);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    pub enum BackendCall {
        LeftStick(f64, f64),
        RightStick(f64, f64),
        Trigger(TriggerSide, u8),
        Button(Button, bool),
        Flush,
        Reset,
        Close,
    }

    /// Records every call; shared log so tests can inspect after handing the box away.
    pub struct RecordingBackend {
        pub calls: Arc<Mutex<Vec<BackendCall>>>,
        pub rumble: Arc<Mutex<Option<RumbleCallback>>>,
    }

    impl RecordingBackend {
        pub fn new() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                rumble: Arc::new(Mutex::new(None)),
            }
        }
    }

    impl EmulationBackend for RecordingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::DolphinPipe
        }
        fn set_left_stick(&mut self, x: f64, y: f64) {
            self.calls.lock().push(BackendCall::LeftStick(x, y));
        }
        fn set_right_stick(&mut self, x: f64, y: f64) {
            self.calls.lock().push(BackendCall::RightStick(x, y));
        }
        fn set_trigger(&mut self, side: TriggerSide, value: u8) {
            self.calls.lock().push(BackendCall::Trigger(side, value));
        }
        fn set_button(&mut self, button: Button, pressed: bool) {
            self.calls.lock().push(BackendCall::Button(button, pressed));
        }
        fn flush(&mut self) -> Result<(), EmulationError> {
            self.calls.lock().push(BackendCall::Flush);
            Ok(())
        }
        fn reset(&mut self) -> Result<(), EmulationError> {
            self.calls.lock().push(BackendCall::Reset);
            Ok(())
        }
        fn close(&mut self) -> Result<(), EmulationError> {
            self.calls.lock().push(BackendCall::Close);
            Ok(())
        }
        fn on_rumble(&mut self, callback: RumbleCallback) -> bool {
            *self.rumble.lock() = Some(callback);
            true
        }
    }

    /// Factory handing out recording backends and counting creations.
    #[derive(Default)]
    pub struct RecordingFactory {
        pub created: Mutex<Vec<(BackendKind, usize)>>,
        pub logs: Mutex<Vec<Arc<Mutex<Vec<BackendCall>>>>>,
        pub rumble_hooks: Mutex<Vec<Arc<Mutex<Option<RumbleCallback>>>>>,
    }

    #[async_trait]
    impl BackendFactory for RecordingFactory {
        async fn create(
            &self,
            kind: BackendKind,
            slot: usize,
            _cancel: CancellationToken,
        ) -> Result<Box<dyn EmulationBackend>, EmulationError> {
            let backend = RecordingBackend::new();
            self.created.lock().push((kind, slot));
            self.logs.lock().push(backend.calls.clone());
            self.rumble_hooks.lock().push(backend.rumble.clone());
            Ok(Box::new(backend))
        }
    }
}
