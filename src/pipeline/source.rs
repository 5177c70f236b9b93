//! Raw frame producers for the read loop.

use super::PipelineError;
use crate::ble::LinkEvent;
use crate::report::translator::Dialect;
use crate::usb::{UsbDevice, REPORT_SIZE};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Upper bound on reads per USB drain cycle.
const USB_DRAIN_LIMIT: usize = 64;

/// The newest frame of one read cycle plus how many older ones it replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pulled {
    pub dialect: Dialect,
    pub bytes: Vec<u8>,
    pub superseded: usize,
}

pub enum FrameSource {
    Usb {
        device: Box<dyn UsbDevice>,
        poll: Duration,
    },
    Ble {
        reports: mpsc::Receiver<Vec<u8>>,
        events: mpsc::Receiver<LinkEvent>,
        dequeue: Duration,
    },
}

impl FrameSource {
    pub fn label(&self) -> &'static str {
        match self {
            FrameSource::Usb { .. } => "USB",
            FrameSource::Ble { .. } => "BLE",
        }
    }

    /// Waits at most one polling interval. `Ok(None)` means nothing new arrived.
    pub async fn pull(&mut self, cancel: &CancellationToken) -> Result<Option<Pulled>, PipelineError> {
        match self {
            FrameSource::Usb { device, poll } => {
                if let Some(pulled) = drain_usb(device.as_mut())? {
                    return Ok(Some(pulled));
                }
                tokio::select! {
                    _ = cancel.cancelled() => Err(PipelineError::Stopped),
                    _ = tokio::time::sleep(*poll) => Ok(None),
                }
            }
            FrameSource::Ble {
                reports,
                events,
                dequeue,
            } => {
                let mut latest = None;
                let mut superseded = 0;
                loop {
                    match reports.try_recv() {
                        Ok(bytes) => {
                            if let Some(dialect) = Dialect::detect_ble(&bytes) {
                                if latest.is_some() {
                                    superseded += 1;
                                }
                                latest = Some((dialect, bytes));
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            if latest.is_none() {
                                return Err(PipelineError::SourceLost(
                                    "notification queue closed".to_string(),
                                ));
                            }
                            break;
                        }
                    }
                }
                if let Some((dialect, bytes)) = latest {
                    return Ok(Some(Pulled {
                        dialect,
                        bytes,
                        superseded,
                    }));
                }

                tokio::select! {
                    _ = cancel.cancelled() => Err(PipelineError::Stopped),
                    event = events.recv() => match event {
                        Some(LinkEvent::Disconnected { reason }) => Err(PipelineError::SourceLost(reason)),
                        Some(_) => Ok(None),
                        None => Err(PipelineError::SourceLost("link closed".to_string())),
                    },
                    report = tokio::time::timeout(*dequeue, reports.recv()) => match report {
                        Ok(Some(bytes)) => Ok(Dialect::detect_ble(&bytes).map(|dialect| Pulled {
                            dialect,
                            bytes,
                            superseded: 0,
                        })),
                        Ok(None) => Err(PipelineError::SourceLost("notification queue closed".to_string())),
                        Err(_) => Ok(None),
                    },
                }
            }
        }
    }
}

fn drain_usb(device: &mut dyn UsbDevice) -> Result<Option<Pulled>, PipelineError> {
    let mut buf = [0u8; REPORT_SIZE];
    let mut latest: Option<Vec<u8>> = None;
    let mut superseded = 0;
    for _ in 0..USB_DRAIN_LIMIT {
        let n = device
            .read_nonblocking(&mut buf)
            .map_err(|e| PipelineError::SourceLost(e.to_string()))?;
        if n == 0 {
            break;
        }
        if latest.is_some() {
            superseded += 1;
        }
        latest = Some(buf[..n].to_vec());
    }
    Ok(latest.map(|bytes| Pulled {
        dialect: Dialect::Usb,
        bytes,
        superseded,
    }))
}
