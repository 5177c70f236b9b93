//! Per-slot read loop.
//!
//! One task per slot pulls the newest raw frame, translates it, runs calibration and forwards
//! the result straight into the slot's emulation backend. Observers get a throttled copy through
//! a watch channel.

pub mod source;

pub use source::{FrameSource, Pulled};

use crate::calibration::{CalibrationEngine, CalibrationSnapshot, NormalizedInput};
use crate::emulation::{self, EmulationBackend};
use crate::report::translator::{translate, RawFrame};
use crate::report::CanonicalReport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The slot's emulation backend, swapped in and out by the slot manager.
pub type SharedBackend = Arc<Mutex<Option<Box<dyn EmulationBackend>>>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("Read loop stopped")]
    Stopped,
    #[error("Input source lost: {0}")]
    SourceLost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineExit {
    Stopped,
    Lost(String),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Publish every n-th frame to observers.
    pub observer_throttle: u32,
    pub stats_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            observer_throttle: 3,
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// What observers see.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputSnapshot {
    pub raw: CanonicalReport,
    pub input: NormalizedInput,
    pub frame: u64,
}

#[derive(Debug, Default)]
struct FrameStats {
    processed: u64,
    superseded: u64,
    short: u64,
    backend_errors: u64,
}

pub struct Pipeline {
    slot: usize,
    source: FrameSource,
    engine: Arc<CalibrationEngine>,
    backend: SharedBackend,
    observers: watch::Sender<InputSnapshot>,
    settings: PipelineSettings,
    stats: FrameStats,
}

impl Pipeline {
    pub fn new(
        slot: usize,
        source: FrameSource,
        engine: Arc<CalibrationEngine>,
        backend: SharedBackend,
        observers: watch::Sender<InputSnapshot>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            slot,
            source,
            engine,
            backend,
            observers,
            settings,
            stats: FrameStats::default(),
        }
    }

    /// Runs one frame through translation, calibration and emulation.
    fn process(&mut self, pulled: &Pulled, snapshot: &mut CalibrationSnapshot) {
        self.stats.superseded += pulled.superseded as u64;
        if !pulled.dialect.accepts(&pulled.bytes) {
            self.stats.short += 1;
            return;
        }

        let report = translate(RawFrame::new(pulled.dialect, &pulled.bytes));
        self.engine.observe(&report);
        let input = snapshot.refresh(&self.engine).apply(&report);

        if let Some(backend) = self.backend.lock().as_mut() {
            if let Err(e) = emulation::forward(backend.as_mut(), &input) {
                self.stats.backend_errors += 1;
                debug!("Slot {}: emulation update failed: {}", self.slot + 1, e);
            }
        }

        self.stats.processed += 1;
        let throttle = u64::from(self.settings.observer_throttle.max(1));
        if self.stats.processed % throttle == 0 {
            self.observers.send_replace(InputSnapshot {
                raw: report,
                input,
                frame: self.stats.processed,
            });
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> PipelineExit {
        info!("Slot {}: {} read loop started", self.slot + 1, self.source.label());
        let mut snapshot = CalibrationSnapshot::new(&self.engine);
        let mut next_stats = Instant::now() + self.settings.stats_interval;

        let exit = loop {
            if cancel.is_cancelled() {
                break PipelineExit::Stopped;
            }
            match self.source.pull(&cancel).await {
                Ok(Some(pulled)) => self.process(&pulled, &mut snapshot),
                Ok(None) => {}
                Err(PipelineError::Stopped) => break PipelineExit::Stopped,
                Err(PipelineError::SourceLost(reason)) => break PipelineExit::Lost(reason),
            }

            if Instant::now() >= next_stats {
                debug!(
                    "Slot {}: {} frames, {} superseded, {} short, {} backend errors",
                    self.slot + 1,
                    self.stats.processed,
                    self.stats.superseded,
                    self.stats.short,
                    self.stats.backend_errors
                );
                next_stats = Instant::now() + self.settings.stats_interval;
            }
        };

        match &exit {
            PipelineExit::Stopped => info!("Slot {}: read loop stopped", self.slot + 1),
            PipelineExit::Lost(reason) => warn!("Slot {}: input lost: {}", self.slot + 1, reason),
        }
        exit
    }
}

pub struct PipelineHandle {
    cancel: CancellationToken,
    task: JoinHandle<PipelineExit>,
}

impl PipelineHandle {
    pub fn spawn(pipeline: Pipeline, cancel: CancellationToken) -> Self {
        let task = tokio::spawn(pipeline.run(cancel.clone()));
        Self { cancel, task }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the loop to end on its own (source lost) or after cancellation.
    pub async fn wait(self) -> PipelineExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => PipelineExit::Lost(format!("read loop panicked: {}", e)),
        }
    }

    pub async fn stop(self) -> PipelineExit {
        self.cancel.cancel();
        self.wait().await
    }
}
