//! Dolphin named pipe backend.
//!
//! One command per line, fixed point values in `0..1`:
//! `SET MAIN x y`, `SET C x y`, `SET L v`, `SET R v`, `PRESS name`, `RELEASE name`.

use super::{scale_axis, BackendKind, EmulationBackend, EmulationError, STICK_SCALE};
use crate::report::{Button, TriggerSide};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PIPE_PREFIX: &str = "gc_controller";
const OPEN_RETRY: Duration = Duration::from_millis(500);

pub fn pipe_name(slot: usize) -> String {
    format!("{}_{}", PIPE_PREFIX, slot + 1)
}

fn dolphin_name(button: Button) -> Option<&'static str> {
    match button {
        Button::A => Some("A"),
        Button::B => Some("B"),
        Button::X => Some("X"),
        Button::Y => Some("Y"),
        Button::Start => Some("START"),
        Button::Z => Some("Z"),
        Button::ZL => Some("L"),
        Button::DUp => Some("D_UP"),
        Button::DDown => Some("D_DOWN"),
        Button::DLeft => Some("D_LEFT"),
        Button::DRight => Some("D_RIGHT"),
        _ => None,
    }
}

fn stick_value(v: f64) -> f64 {
    (scale_axis(v) as f64 / STICK_SCALE + 1.0) / 2.0
}

/// Button lines are derived at flush time from the difference between the buttons the pad
/// wants held and the ones Dolphin last received, so a dropped frame is repaired by the next one.
pub struct DolphinPipe<W: Write + Send + 'static> {
    out: W,
    pending: String,
    /// Tail of a frame the reader has only partly taken. Always written before anything else.
    backlog: Vec<u8>,
    held: BTreeSet<&'static str>,
    committed: BTreeSet<&'static str>,
    closed: bool,
}

enum Sent {
    All,
    Nothing,
    Partly(usize),
}

impl<W: Write + Send + 'static> DolphinPipe<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            pending: String::with_capacity(256),
            backlog: Vec::new(),
            held: BTreeSet::new(),
            committed: BTreeSet::new(),
            closed: false,
        }
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) {
        // writing into a String cannot fail
        let _ = self.pending.write_fmt(args);
        self.pending.push('\n');
    }

    fn button_lines(&mut self) {
        let released: Vec<_> = self.committed.difference(&self.held).copied().collect();
        let pressed: Vec<_> = self.held.difference(&self.committed).copied().collect();
        for name in released {
            self.line(format_args!("RELEASE {}", name));
        }
        for name in pressed {
            self.line(format_args!("PRESS {}", name));
        }
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<Sent> {
        let mut offset = 0;
        while offset < bytes.len() {
            match self.out.write(&bytes[offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(if offset == 0 {
                        Sent::Nothing
                    } else {
                        Sent::Partly(offset)
                    });
                }
                Err(e) => return Err(e),
            }
        }
        self.out.flush()?;
        Ok(Sent::All)
    }

    fn drain_backlog(&mut self) -> io::Result<bool> {
        if self.backlog.is_empty() {
            return Ok(true);
        }
        let backlog = std::mem::take(&mut self.backlog);
        match self.send(&backlog)? {
            Sent::All => Ok(true),
            Sent::Nothing => {
                self.backlog = backlog;
                Ok(false)
            }
            Sent::Partly(n) => {
                self.backlog = backlog[n..].to_vec();
                Ok(false)
            }
        }
    }

    fn commit(&mut self) -> Result<(), EmulationError> {
        if self.closed {
            self.pending.clear();
            return Err(EmulationError::Closed);
        }
        let write_err = |e: io::Error| EmulationError::WriteError(e.to_string());

        if !self.drain_backlog().map_err(write_err)? {
            debug!("Dolphin pipe still full, frame dropped");
            self.pending.clear();
            return Ok(());
        }

        self.button_lines();
        if self.pending.is_empty() {
            return Ok(());
        }
        let frame = std::mem::take(&mut self.pending);
        match self.send(frame.as_bytes()).map_err(write_err)? {
            Sent::All => self.committed = self.held.clone(),
            // reader is behind; button changes are sent again with the next frame
            Sent::Nothing => debug!("Dolphin pipe full, frame dropped"),
            Sent::Partly(n) => {
                self.backlog = frame.as_bytes()[n..].to_vec();
                self.committed = self.held.clone();
            }
        }
        self.pending = frame;
        self.pending.clear();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn writer(&self) -> &W {
        &self.out
    }
}

impl<W: Write + Send + 'static> EmulationBackend for DolphinPipe<W> {
    fn kind(&self) -> BackendKind {
        BackendKind::DolphinPipe
    }

    fn set_left_stick(&mut self, x: f64, y: f64) {
        self.line(format_args!("SET MAIN {:.4} {:.4}", stick_value(x), stick_value(y)));
    }

    fn set_right_stick(&mut self, x: f64, y: f64) {
        self.line(format_args!("SET C {:.4} {:.4}", stick_value(x), stick_value(y)));
    }

    fn set_trigger(&mut self, side: TriggerSide, value: u8) {
        let name = match side {
            TriggerSide::Left => "L",
            TriggerSide::Right => "R",
        };
        self.line(format_args!("SET {} {:.4}", name, value as f64 / 255.0));
    }

    fn set_button(&mut self, button: Button, pressed: bool) {
        let Some(name) = dolphin_name(button) else {
            return;
        };
        if pressed {
            self.held.insert(name);
        } else {
            self.held.remove(name);
        }
    }

    fn flush(&mut self) -> Result<(), EmulationError> {
        self.commit()
    }

    fn reset(&mut self) -> Result<(), EmulationError> {
        self.pending.clear();
        self.held.clear();
        self.line(format_args!("SET MAIN 0.5000 0.5000"));
        self.line(format_args!("SET C 0.5000 0.5000"));
        self.line(format_args!("SET L 0.0000"));
        self.line(format_args!("SET R 0.0000"));
        self.commit()
    }

    fn close(&mut self) -> Result<(), EmulationError> {
        if self.closed {
            return Ok(());
        }
        if let Err(e) = self.reset() {
            debug!("Reset before close failed: {}", e);
        }
        self.closed = true;
        Ok(())
    }
}

/// Candidate Dolphin user directories that exist on this machine.
pub fn dolphin_user_dirs() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(path) = std::env::var("DOLPHIN_EMU_USERPATH") {
        candidates.push(PathBuf::from(path));
    }
    if let Some(home) = dirs::home_dir() {
        if cfg!(target_os = "macos") {
            candidates.push(home.join("Library/Application Support/Dolphin"));
        } else {
            candidates.push(home.join(".var/app/org.DolphinEmu.dolphin-emu/data/dolphin-emu"));
            candidates.push(home.join(".dolphin-emu"));
        }
    }
    if let Some(data) = dirs::data_dir() {
        candidates.push(data.join("dolphin-emu"));
    }

    let mut seen = BTreeSet::new();
    candidates
        .into_iter()
        .filter(|p| p.is_dir())
        .filter(|p| seen.insert(p.canonicalize().unwrap_or_else(|_| p.clone())))
        .collect()
}

#[cfg(unix)]
pub use fifo::{connect, FifoWriter};

#[cfg(unix)]
mod fifo {
    use super::*;
    use tokio::net::unix::pipe;

    /// Non-blocking writer over the FIFO's send half.
    pub struct FifoWriter(pipe::Sender);

    impl Write for FifoWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.try_write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn ensure_fifo(path: &Path) -> Result<(), EmulationError> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EmulationError::Unavailable(format!("{}: {}", parent.display(), e)))?;
        }
        let status = tokio::process::Command::new("mkfifo")
            .arg(path)
            .status()
            .await
            .map_err(|e| EmulationError::Unavailable(format!("mkfifo: {}", e)))?;
        if !status.success() {
            return Err(EmulationError::Unavailable(format!(
                "mkfifo {} exited with {}",
                path.display(),
                status
            )));
        }
        info!("Created Dolphin pipe {}", path.display());
        Ok(())
    }

    /// Create the slot's pipe in every Dolphin user dir and wait for Dolphin to open one.
    pub async fn connect(
        slot: usize,
        cancel: CancellationToken,
    ) -> Result<DolphinPipe<FifoWriter>, EmulationError> {
        let mut user_dirs = dolphin_user_dirs();
        if user_dirs.is_empty() {
            let fallback = dirs::data_dir()
                .ok_or_else(|| EmulationError::Unavailable("no data directory".to_string()))?;
            user_dirs.push(fallback.join("dolphin-emu"));
        }

        let mut paths = Vec::new();
        for dir in user_dirs {
            let path = dir.join("Pipes").join(pipe_name(slot));
            match ensure_fifo(&path).await {
                Ok(()) => paths.push(path),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        if paths.is_empty() {
            return Err(EmulationError::Unavailable(format!(
                "could not create pipe {}",
                pipe_name(slot)
            )));
        }

        info!("Waiting for Dolphin to open {:?}", paths);
        loop {
            for path in &paths {
                match pipe::OpenOptions::new().open_sender(path) {
                    Ok(sender) => {
                        info!("Dolphin attached to {}", path.display());
                        return Ok(DolphinPipe::new(FifoWriter(sender)));
                    }
                    Err(e) => debug!("{} not ready: {}", path.display(), e),
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(EmulationError::Cancelled),
                _ = tokio::time::sleep(OPEN_RETRY) => {}
            }
        }
    }
}

#[cfg(not(unix))]
pub async fn connect(
    _slot: usize,
    _cancel: CancellationToken,
) -> Result<DolphinPipe<io::Sink>, EmulationError> {
    Err(EmulationError::Unavailable(
        "Dolphin pipes need a Unix FIFO".to_string(),
    ))
}
