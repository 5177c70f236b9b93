//! Watches a slot's read loop and brings the controller back after it drops.

use super::{cancel_reconnect, close_link, DeviceId, SlotError, SlotManager};
use crate::persistence::ConnectionMode;
use crate::pipeline::{PipelineExit, PipelineHandle};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs for the lifetime of one connection.
pub(super) fn supervise(
    manager: SlotManager,
    index: usize,
    generation: u64,
    handle: PipelineHandle,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let reason = match handle.wait().await {
            PipelineExit::Stopped => return,
            PipelineExit::Lost(reason) => reason,
        };
        manager.handle_lost(index, generation, reason).await;
    })
}

impl SlotManager {
    /// Unexpected drop: remember whether the slot was emulating, tear down and start retrying.
    async fn handle_lost(&self, index: usize, generation: u64, reason: String) {
        let link = {
            let Ok(mut slot) = self.lock(index).await else {
                return;
            };
            let live = slot
                .connection
                .as_ref()
                .is_some_and(|c| !c.is_cancelled());
            if slot.generation != generation || !live {
                return;
            }

            let was_emulating = slot.is_emulating();
            let mode = slot.mode;
            warn!(
                "Slot {}: controller lost ({}), reconnecting{}",
                index + 1,
                reason,
                if was_emulating { ", emulation will resume" } else { "" }
            );
            let (_, link) = self.teardown(&mut slot, "Controller disconnected, reconnecting...");

            cancel_reconnect(&mut slot);
            let token = self.shared.shutdown.child_token();
            slot.reconnect = Some(token.clone());
            self.publish(&slot);

            tokio::spawn(reconnect_loop(self.clone(), index, mode, was_emulating, token));
            link
        };
        close_link(link).await;
    }

    /// One attempt through the normal connect path.
    async fn reconnect_once(
        &self,
        index: usize,
        mode: ConnectionMode,
        cancel: &CancellationToken,
    ) -> Result<DeviceId, SlotError> {
        match mode {
            ConnectionMode::Usb => {
                let mut slot = self.lock(index).await?;
                if cancel.is_cancelled() {
                    return Err(SlotError::Cancelled);
                }
                self.connect_usb_locked(&mut slot, None).await
            }
            ConnectionMode::Ble => {
                let (token, target) = {
                    let mut slot = self.lock(index).await?;
                    if cancel.is_cancelled() {
                        return Err(SlotError::Cancelled);
                    }
                    let remembered = slot.last_device.as_ref().and_then(DeviceId::ble_address);
                    let target = match remembered {
                        Some(addr) => Some(addr),
                        None => {
                            self.shared
                                .settings
                                .snapshot()
                                .await
                                .slot(index)
                                .preferred_ble_address
                        }
                    };
                    (self.begin_ble(&mut slot, Some(cancel))?, target)
                };
                self.finish_ble(index, target, token).await
            }
        }
    }
}

/// Fixed backoff retry. Checks the cancel token before every attempt so an explicit disconnect
/// always wins.
async fn reconnect_loop(
    manager: SlotManager,
    index: usize,
    mode: ConnectionMode,
    resume_emulation: bool,
    cancel: CancellationToken,
) {
    let backoff = manager.shared.timings.reconnect_backoff(mode);
    let mut attempt = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Slot {}: reconnect aborted", index + 1);
                return;
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        attempt += 1;

        match manager.reconnect_once(index, mode, &cancel).await {
            Ok(device) => {
                info!("Slot {}: reconnected to {} (attempt {})", index + 1, device, attempt);
                if resume_emulation {
                    if let Err(e) = manager.start_emulation(index).await {
                        warn!("Slot {}: could not resume emulation: {}", index + 1, e);
                    }
                }
                return;
            }
            Err(SlotError::Cancelled) => {
                info!("Slot {}: reconnect aborted", index + 1);
                return;
            }
            Err(e) => debug!("Slot {}: reconnect attempt {} failed: {}", index + 1, attempt, e),
        }
    }
}
