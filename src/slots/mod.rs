//! # Slot Manager
//!
//! Up to four controllers run side by side. Each slot owns one read loop, one optional emulation
//! backend and the command path to its controller; the manager owns device claims and the
//! reconnect policy.
//!
//! Every slot sits behind its own async lock. BLE bring-up releases that lock while pairing so a
//! disconnect can cancel a scan in progress; everything else runs under it.

pub mod claims;
mod reconnect;
pub mod slot;

pub use claims::{ClaimRegistry, DeviceId};
pub use slot::{SlotState, SlotStatus};

use crate::ble::session::LiveSession;
use crate::ble::{BdAddr, BleBackend, PairingFailure, PairingRequest, SessionPhase, TransportError};
use crate::calibration::{CalibrationEngine, CalibrationError, CalibrationProfile, WizardPrompt};
use crate::emulation::{self, BackendFactory, BackendKind, EmulationBackend, EmulationError, RumbleCallback};
use crate::persistence::{BridgeSettings, BridgeTimings, ConnectionMode, SettingsError, SettingsStore, MAX_SLOTS};
use crate::pipeline::{FrameSource, InputSnapshot, Pipeline, PipelineHandle};
use crate::usb::{self, SharedUsbDevice, UsbBus, UsbDevice, UsbError};
use chrono::Utc;
use slot::{Slot, SlotLink};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("Slot {} does not exist", .0 + 1)]
    NoSuchSlot(usize),

    #[error("{device} is in use by slot {}", .owner + 1)]
    DeviceInUse { device: String, owner: usize },

    #[error("Slot {} is busy ({state})", .slot + 1)]
    Busy { slot: usize, state: SlotState },

    #[error("Slot {} is not connected", .0 + 1)]
    NotConnected(usize),

    #[error("No controller found")]
    NoDevice,

    #[error("Bluetooth is not available")]
    NoRadio,

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error(transparent)]
    Usb(#[from] UsbError),

    #[error(transparent)]
    Pairing(#[from] PairingFailure),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Emulation(#[from] EmulationError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

struct Shared {
    slots: Vec<Mutex<Slot>>,
    claims: ClaimRegistry,
    usb: Arc<dyn UsbBus>,
    radio: Option<BleBackend>,
    factory: Arc<dyn BackendFactory>,
    settings: Arc<SettingsStore>,
    timings: BridgeTimings,
    emulation: BackendKind,
    status: Vec<watch::Sender<SlotStatus>>,
    inputs: Vec<watch::Sender<InputSnapshot>>,
    shutdown: CancellationToken,
}

/// Handle to every slot. Cheap to clone.
#[derive(Clone)]
pub struct SlotManager {
    shared: Arc<Shared>,
}

impl SlotManager {
    pub fn new(
        slot_count: usize,
        settings: Arc<SettingsStore>,
        initial: &BridgeSettings,
        usb: Arc<dyn UsbBus>,
        radio: Option<BleBackend>,
        factory: Arc<dyn BackendFactory>,
    ) -> Self {
        let count = slot_count.clamp(1, MAX_SLOTS);
        let slots: Vec<Slot> = (0..count)
            .map(|i| Slot::new(i, initial.slot(i).connection_mode))
            .collect();
        let status = slots
            .iter()
            .map(|slot| watch::channel(slot.status()).0)
            .collect();
        let inputs = (0..count)
            .map(|_| watch::channel(InputSnapshot::default()).0)
            .collect();

        info!(
            "Slot manager ready: {} slots, {} emulation, BLE {}",
            count,
            initial.emulation_mode,
            if radio.is_some() { "available" } else { "unavailable" }
        );

        Self {
            shared: Arc::new(Shared {
                slots: slots.into_iter().map(Mutex::new).collect(),
                claims: ClaimRegistry::default(),
                usb,
                radio,
                factory,
                settings,
                timings: initial.timings.clone(),
                emulation: initial.emulation_mode,
                status,
                inputs,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn claims(&self) -> &ClaimRegistry {
        &self.shared.claims
    }

    async fn lock(&self, index: usize) -> Result<MutexGuard<'_, Slot>, SlotError> {
        let slot = self
            .shared
            .slots
            .get(index)
            .ok_or(SlotError::NoSuchSlot(index))?;
        Ok(slot.lock().await)
    }

    fn publish(&self, slot: &Slot) {
        self.shared.status[slot.index].send_replace(slot.status());
    }

    pub fn status(&self, index: usize) -> Result<SlotStatus, SlotError> {
        self.shared
            .status
            .get(index)
            .map(|tx| tx.borrow().clone())
            .ok_or(SlotError::NoSuchSlot(index))
    }

    pub fn subscribe(&self, index: usize) -> Result<watch::Receiver<SlotStatus>, SlotError> {
        self.shared
            .status
            .get(index)
            .map(watch::Sender::subscribe)
            .ok_or(SlotError::NoSuchSlot(index))
    }

    /// Throttled stream of translated and calibrated input for observers.
    pub fn subscribe_input(&self, index: usize) -> Result<watch::Receiver<InputSnapshot>, SlotError> {
        self.shared
            .inputs
            .get(index)
            .map(watch::Sender::subscribe)
            .ok_or(SlotError::NoSuchSlot(index))
    }

    // ---- USB ----

    /// Connects a wired controller. With an explicit `path` only that device is tried; otherwise
    /// the slot's last device, then its preferred device, then any unclaimed one.
    pub async fn connect_usb(&self, index: usize, path: Option<String>) -> Result<DeviceId, SlotError> {
        let mut slot = self.lock(index).await?;
        cancel_reconnect(&mut slot);
        self.connect_usb_locked(&mut slot, path).await
    }

    async fn connect_usb_locked(
        &self,
        slot: &mut Slot,
        path: Option<String>,
    ) -> Result<DeviceId, SlotError> {
        if slot.state != SlotState::Disconnected {
            return Err(SlotError::Busy {
                slot: slot.index,
                state: slot.state,
            });
        }

        let explicit = path.is_some();
        let candidates = match path {
            Some(path) => vec![path],
            None => self.usb_candidates(slot).await?,
        };
        debug!("Slot {}: USB candidates {:?}", slot.index + 1, candidates);

        let mut last_error = SlotError::NoDevice;
        for path in candidates {
            let device_id = DeviceId::Usb(path.clone());
            if let Err(owner) = self.shared.claims.claim(&device_id, slot.index) {
                let error = SlotError::DeviceInUse {
                    device: device_id.to_string(),
                    owner,
                };
                if explicit {
                    warn!("Slot {}: {}", slot.index + 1, error);
                    return Err(error);
                }
                last_error = error;
                continue;
            }

            match self.open_usb(&path, slot.index) {
                Ok(device) => {
                    let source = FrameSource::Usb {
                        device: Box::new(device.clone()),
                        poll: self.shared.timings.usb_poll(),
                    };
                    self.install(slot, device_id.clone(), source, SlotLink::Usb(device))
                        .await;
                    return Ok(device_id);
                }
                Err(e) => {
                    warn!("Slot {}: could not open {}: {}", slot.index + 1, path, e);
                    self.shared.claims.release(&device_id, slot.index);
                    last_error = e.into();
                }
            }
        }
        Err(last_error)
    }

    async fn usb_candidates(&self, slot: &Slot) -> Result<Vec<String>, SlotError> {
        let present: Vec<String> = self
            .shared
            .usb
            .enumerate()?
            .into_iter()
            .map(|info| info.path)
            .collect();
        let preferred = self
            .shared
            .settings
            .snapshot()
            .await
            .slot(slot.index)
            .preferred_device_path;
        let remembered = match &slot.last_device {
            Some(DeviceId::Usb(path)) => Some(path.clone()),
            _ => None,
        };

        let mut candidates: Vec<String> = Vec::new();
        let ordered = remembered.into_iter().chain(preferred).chain(present.iter().cloned());
        for path in ordered {
            let owned_elsewhere = self
                .shared
                .claims
                .owner(&DeviceId::Usb(path.clone()))
                .is_some_and(|owner| owner != slot.index);
            if present.contains(&path) && !owned_elsewhere && !candidates.contains(&path) {
                candidates.push(path);
            }
        }
        Ok(candidates)
    }

    fn open_usb(&self, path: &str, index: usize) -> Result<SharedUsbDevice, UsbError> {
        let mut device = self.shared.usb.open(path)?;
        usb::initialize(device.as_mut(), index)?;
        Ok(SharedUsbDevice::new(device))
    }

    // ---- BLE ----

    /// Pairs a wireless controller. `target` limits discovery to one address.
    pub async fn connect_ble(&self, index: usize, target: Option<BdAddr>) -> Result<DeviceId, SlotError> {
        let token = {
            let mut slot = self.lock(index).await?;
            cancel_reconnect(&mut slot);
            self.begin_ble(&mut slot, None)?
        };
        self.finish_ble(index, target, token).await
    }

    fn begin_ble(
        &self,
        slot: &mut Slot,
        parent: Option<&CancellationToken>,
    ) -> Result<CancellationToken, SlotError> {
        if self.shared.radio.is_none() {
            return Err(SlotError::NoRadio);
        }
        if slot.state != SlotState::Disconnected {
            return Err(SlotError::Busy {
                slot: slot.index,
                state: slot.state,
            });
        }
        let token = parent.unwrap_or(&self.shared.shutdown).child_token();
        slot.pending = Some(token.clone());
        slot.state = SlotState::Connecting;
        slot.mode = ConnectionMode::Ble;
        slot.message = SessionPhase::Idle.status().to_string();
        self.publish(slot);
        Ok(token)
    }

    async fn finish_ble(
        &self,
        index: usize,
        target: Option<BdAddr>,
        token: CancellationToken,
    ) -> Result<DeviceId, SlotError> {
        let radio = self.shared.radio.clone().ok_or(SlotError::NoRadio)?;
        let request = PairingRequest {
            slot: index,
            target,
            exclude: self.shared.claims.ble_addresses_except(index),
        };
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Idle);
        let forwarder = self.forward_phases(index, phase_rx);
        let result = radio
            .pair(request, self.shared.timings.pairing(), token.clone(), phase_tx)
            .await;
        if let Err(e) = forwarder.await {
            debug!("Slot {}: phase forwarder ended abnormally: {}", index + 1, e);
        }

        let mut slot = self.lock(index).await?;
        if token.is_cancelled() {
            // Disconnected while pairing; the disconnect already reset the slot.
            drop(slot);
            if let Ok(live) = result {
                live.link.close().await;
            }
            return Err(SlotError::Cancelled);
        }
        slot.pending = None;

        match result {
            Ok(live) => self.install_ble(&mut slot, live).await,
            Err(failure) => {
                warn!("Slot {}: pairing failed in {}: {}", index + 1, failure.phase, failure.error);
                slot.state = SlotState::Disconnected;
                slot.message = format!("Connection failed: {}", failure.error);
                self.publish(&slot);
                Err(failure.into())
            }
        }
    }

    async fn install_ble(&self, slot: &mut Slot, live: LiveSession) -> Result<DeviceId, SlotError> {
        let device_id = DeviceId::Ble(live.address());
        if let Err(owner) = self.shared.claims.claim(&device_id, slot.index) {
            live.link.close().await;
            slot.state = SlotState::Disconnected;
            slot.message = "Disconnected".to_string();
            self.publish(slot);
            return Err(SlotError::DeviceInUse {
                device: device_id.to_string(),
                owner,
            });
        }

        let LiveSession {
            link,
            reports,
            events,
            encrypted,
            challenge_verified,
            ..
        } = live;
        debug!(
            "Slot {}: link encrypted {}, challenge verified {}",
            slot.index + 1,
            encrypted,
            challenge_verified
        );
        let source = FrameSource::Ble {
            reports,
            events,
            dequeue: self.shared.timings.ble_dequeue(),
        };
        self.install(slot, device_id.clone(), source, SlotLink::Ble(link))
            .await;
        Ok(device_id)
    }

    /// Mirrors pairing progress into the slot status until the session ends.
    fn forward_phases(&self, index: usize, mut phases: watch::Receiver<SessionPhase>) -> JoinHandle<()> {
        let status = self.shared.status[index].clone();
        tokio::spawn(async move {
            while phases.changed().await.is_ok() {
                let phase = *phases.borrow_and_update();
                status.send_modify(|s| s.message = phase.status().to_string());
            }
        })
    }

    // ---- shared connect / teardown ----

    async fn install(&self, slot: &mut Slot, device_id: DeviceId, source: FrameSource, link: SlotLink) {
        let index = slot.index;
        let profile = self.shared.settings.snapshot().await.profile(&device_id.key());
        let engine = Arc::new(CalibrationEngine::new(profile));
        let pipeline = Pipeline::new(
            index,
            source,
            engine.clone(),
            slot.backend.clone(),
            self.shared.inputs[index].clone(),
            self.shared.timings.pipeline(),
        );
        let cancel = self.shared.shutdown.child_token();
        let handle = PipelineHandle::spawn(pipeline, cancel.clone());

        slot.generation += 1;
        slot.supervisor = Some(tokio::spawn(reconnect::supervise(
            self.clone(),
            index,
            slot.generation,
            handle,
        )));
        slot.connection = Some(cancel);
        slot.engine = Some(engine);
        slot.mode = match link {
            SlotLink::Usb(_) => ConnectionMode::Usb,
            SlotLink::Ble(_) => ConnectionMode::Ble,
        };
        slot.link = Some(link);
        slot.device = Some(device_id.clone());
        slot.last_device = Some(device_id.clone());
        slot.rumble = Default::default();
        slot.reconnect = None;
        slot.state = SlotState::Connected;
        slot.connected_since = Some(Utc::now());
        slot.message = format!("Connected ({})", device_id);
        self.publish(slot);
        info!("Slot {}: connected to {}", index + 1, device_id);

        let mode = slot.mode;
        let remembered = self
            .shared
            .settings
            .update(|settings| {
                let prefs = settings.slot_mut(index);
                prefs.connection_mode = mode;
                match &device_id {
                    DeviceId::Usb(path) => prefs.preferred_device_path = Some(path.clone()),
                    DeviceId::Ble(addr) => prefs.preferred_ble_address = Some(*addr),
                }
            })
            .await;
        if let Err(e) = remembered {
            warn!("Slot {}: could not remember device: {}", index + 1, e);
        }
    }

    /// Stops the read loop and emulation and releases the device. The caller publishes and
    /// closes the returned link outside the lock.
    fn teardown(&self, slot: &mut Slot, message: &str) -> (Option<JoinHandle<()>>, Option<SlotLink>) {
        slot.generation += 1;
        if let Some(connection) = slot.connection.take() {
            connection.cancel();
        }
        if let Some(backend) = slot.backend.lock().take() {
            emulation::shutdown_backend(backend, slot.index);
        }
        if let Some(device) = slot.device.take() {
            self.shared.claims.release(&device, slot.index);
        }
        slot.engine = None;
        slot.rumble = Default::default();
        slot.connected_since = None;
        slot.state = SlotState::Disconnected;
        slot.message = message.to_string();
        (slot.supervisor.take(), slot.link.take())
    }

    /// Explicit disconnect. Wins over any pending pairing or reconnect.
    pub async fn disconnect(&self, index: usize) -> Result<(), SlotError> {
        let (supervisor, link) = {
            let mut slot = self.lock(index).await?;
            cancel_reconnect(&mut slot);
            if let Some(pending) = slot.pending.take() {
                pending.cancel();
            }
            let torn = self.teardown(&mut slot, "Disconnected");
            self.publish(&slot);
            torn
        };
        close_link(link).await;
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                debug!("Slot {}: supervisor ended abnormally: {}", index + 1, e);
            }
        }
        info!("Slot {}: disconnected", index + 1);
        Ok(())
    }

    // ---- emulation ----

    pub async fn start_emulation(&self, index: usize) -> Result<(), SlotError> {
        let (connection, generation) = {
            let slot = self.lock(index).await?;
            match slot.state {
                SlotState::Emulating => return Ok(()),
                SlotState::Connected => {}
                _ => return Err(SlotError::NotConnected(index)),
            }
            let connection = slot
                .connection
                .clone()
                .ok_or(SlotError::NotConnected(index))?;
            (connection, slot.generation)
        };

        let kind = self.shared.emulation;
        let mut backend = self
            .shared
            .factory
            .create(kind, index, connection.child_token())
            .await?;

        let mut slot = self.lock(index).await?;
        if slot.generation != generation || slot.state != SlotState::Connected {
            let already = slot.state == SlotState::Emulating && slot.generation == generation;
            emulation::shutdown_backend(backend, index);
            return if already {
                Ok(())
            } else {
                Err(SlotError::NotConnected(index))
            };
        }

        self.hook_rumble(index, backend.as_mut());
        *slot.backend.lock() = Some(backend);
        slot.state = SlotState::Emulating;
        slot.message = format!("Emulating ({})", kind);
        self.publish(&slot);
        info!("Slot {}: emulation started ({})", index + 1, kind);
        Ok(())
    }

    /// Routes host force feedback to the controller's rumble motor.
    fn hook_rumble(&self, index: usize, backend: &mut dyn EmulationBackend) {
        let (tx, mut rx) = mpsc::channel::<bool>(8);
        let callback: RumbleCallback = Box::new(move |large, small| {
            let _ = tx.try_send(large > 0 || small > 0);
        });
        if !backend.on_rumble(callback) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(on) = rx.recv().await {
                if let Err(e) = manager.send_rumble(index, on).await {
                    debug!("Slot {}: rumble not sent: {}", index + 1, e);
                }
            }
        });
    }

    pub async fn stop_emulation(&self, index: usize) -> Result<(), SlotError> {
        let mut slot = self.lock(index).await?;
        let backend = slot.backend.lock().take();
        if let Some(backend) = backend {
            emulation::shutdown_backend(backend, index);
            info!("Slot {}: emulation stopped", index + 1);
        }
        if slot.rumble.is_on() {
            if let Err(e) = send_rumble_locked(&mut slot, false).await {
                debug!("Slot {}: could not stop rumble: {}", index + 1, e);
            }
        }
        if slot.state == SlotState::Emulating {
            slot.state = SlotState::Connected;
            slot.message = "Connected".to_string();
            self.publish(&slot);
        }
        Ok(())
    }

    /// Returns whether a packet went out; repeating the current state sends nothing.
    pub async fn send_rumble(&self, index: usize, on: bool) -> Result<bool, SlotError> {
        let mut slot = self.lock(index).await?;
        send_rumble_locked(&mut slot, on).await
    }

    // ---- calibration ----

    fn engine_of(slot: &Slot) -> Result<(Arc<CalibrationEngine>, String), SlotError> {
        match (&slot.engine, &slot.device) {
            (Some(engine), Some(device)) => Ok((engine.clone(), device.key())),
            _ => Err(SlotError::NotConnected(slot.index)),
        }
    }

    pub async fn start_stick_capture(&self, index: usize) -> Result<(), SlotError> {
        let slot = self.lock(index).await?;
        let (engine, _) = Self::engine_of(&slot)?;
        engine.start_stick_capture();
        Ok(())
    }

    /// Finalizes the capture and stores the profile under the device's identity.
    pub async fn finish_stick_capture(&self, index: usize) -> Result<CalibrationProfile, SlotError> {
        let (engine, key) = Self::engine_of(&*self.lock(index).await?)?;
        let profile = engine.finish_stick_capture()?;
        self.shared.settings.save_profile(&key, profile).await?;
        Ok(profile)
    }

    pub async fn advance_trigger_wizard(&self, index: usize) -> Result<WizardPrompt, SlotError> {
        let (engine, key) = Self::engine_of(&*self.lock(index).await?)?;
        let prompt = engine.advance_trigger_wizard();
        if prompt.completed {
            self.shared.settings.save_profile(&key, engine.profile()).await?;
        }
        Ok(prompt)
    }

    // ---- bulk ----

    /// Connects every slot it can and starts emulation on each. The first pass honors preferred
    /// devices, the second fills the remaining USB slots with any unclaimed controller.
    pub async fn auto_connect(&self) -> usize {
        let settings = self.shared.settings.snapshot().await;
        let mut connected = 0;

        for index in 0..self.slot_count() {
            let prefs = settings.slot(index);
            let result = match prefs.connection_mode {
                ConnectionMode::Usb => match prefs.preferred_device_path {
                    Some(path) => self.connect_usb(index, Some(path)).await,
                    None => continue,
                },
                ConnectionMode::Ble => match prefs.preferred_ble_address {
                    Some(addr) if self.shared.radio.is_some() => {
                        self.connect_ble(index, Some(addr)).await
                    }
                    _ => continue,
                },
            };
            connected += self.finish_auto_connect(index, result).await;
        }

        for index in 0..self.slot_count() {
            if settings.slot(index).connection_mode != ConnectionMode::Usb
                || self.lock(index).await.map(|s| s.state).ok() != Some(SlotState::Disconnected)
            {
                continue;
            }
            match self.connect_usb(index, None).await {
                Err(SlotError::NoDevice) => break,
                result => connected += self.finish_auto_connect(index, result).await,
            }
        }

        info!("Auto-connect finished: {} controller(s)", connected);
        connected
    }

    /// Connects the given wired controllers to consecutive slots and starts emulation on each.
    /// A path that fails is logged and its slot goes to the next path.
    pub async fn connect_listed(&self, paths: Vec<String>) -> usize {
        let mut index = 0;
        for path in paths {
            if index >= self.slot_count() {
                warn!("No free slot left for {}", path);
                continue;
            }
            match self.connect_usb(index, Some(path.clone())).await {
                Ok(_) => {
                    if let Err(e) = self.start_emulation(index).await {
                        warn!("Slot {}: emulation not started: {}", index + 1, e);
                    }
                    index += 1;
                }
                Err(e) => warn!("Slot {}: could not connect {}: {}", index + 1, path, e),
            }
        }
        index
    }

    async fn finish_auto_connect(&self, index: usize, result: Result<DeviceId, SlotError>) -> usize {
        match result {
            Ok(_) => {
                if let Err(e) = self.start_emulation(index).await {
                    warn!("Slot {}: emulation not started: {}", index + 1, e);
                }
                1
            }
            Err(e) => {
                info!("Slot {}: auto-connect skipped: {}", index + 1, e);
                0
            }
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down {} slots", self.slot_count());
        for index in 0..self.slot_count() {
            if let Err(e) = self.disconnect(index).await {
                warn!("Slot {}: {}", index + 1, e);
            }
        }
        self.shared.shutdown.cancel();
        if let Some(radio) = &self.shared.radio {
            radio.shutdown().await;
        }
    }
}

fn cancel_reconnect(slot: &mut Slot) {
    if let Some(reconnect) = slot.reconnect.take() {
        debug!("Slot {}: pending reconnect cancelled", slot.index + 1);
        reconnect.cancel();
    }
}

async fn close_link(link: Option<SlotLink>) {
    match link {
        Some(SlotLink::Ble(link)) => link.close().await,
        Some(SlotLink::Usb(_)) | None => {}
    }
}

async fn send_rumble_locked(slot: &mut Slot, on: bool) -> Result<bool, SlotError> {
    if !slot.rumble.changes(on) {
        return Ok(false);
    }
    match slot.link.as_mut() {
        Some(SlotLink::Usb(device)) => {
            let command = slot.rumble.next_usb_command(on);
            device.write(&command)?;
        }
        Some(SlotLink::Ble(link)) => {
            let packet = slot.rumble.next_ble_packet(on);
            link.write_rumble(packet.to_vec()).await?;
        }
        None => return Err(SlotError::NotConnected(slot.index)),
    }
    debug!("Slot {}: rumble {}", slot.index + 1, if on { "on" } else { "off" });
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::discovery::NINTENDO_COMPANY_ID;
    use crate::ble::protocol;
    use crate::ble::session::PairingError;
    use crate::ble::transport::testing::MockTransport;
    use crate::ble::{Advertisement, RadioHandle};
    use crate::emulation::rumble::BLE_RUMBLE_HANDLE;
    use crate::emulation::testing::{BackendCall, RecordingFactory};
    use crate::report::Button;
    use crate::usb::testing::MockUsbBus;
    use std::time::Duration;
    use tokio::time::sleep;

    const PAD: &str = "98:B6:E9:11:22:33";

    fn setup(
        bus: MockUsbBus,
        radio: Option<BleBackend>,
        settings: BridgeSettings,
    ) -> (SlotManager, Arc<RecordingFactory>, Arc<SettingsStore>) {
        let store = Arc::new(SettingsStore::in_memory(settings.clone()));
        let factory = Arc::new(RecordingFactory::default());
        let manager = SlotManager::new(
            MAX_SLOTS,
            store.clone(),
            &settings,
            Arc::new(bus),
            radio,
            factory.clone(),
        );
        (manager, factory, store)
    }

    fn ble_radio() -> (MockTransport, RadioHandle) {
        let mock = MockTransport::new(vec![Advertisement {
            address: PAD.parse().unwrap(),
            name: Some("DeviceName".to_string()),
            rssi: -50,
            manufacturer_ids: vec![NINTENDO_COMPANY_ID],
        }]);
        let (radio, _worker) = RadioHandle::spawn(Box::new(mock.clone()));
        (mock, radio)
    }

    fn usb_frame(left_x: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 64];
        frame[6] = (left_x & 0xFF) as u8;
        frame[7] = ((left_x >> 8) & 0x0F) as u8;
        frame[8] = 0x80;
        frame[9..12].copy_from_slice(&[0x00, 0x08, 0x80]);
        frame
    }

    fn vibration_writes(bus: &MockUsbBus, path: &str) -> Vec<Vec<u8>> {
        bus.writes(path)
            .into_iter()
            .filter(|w| w.first() == Some(&protocol::CMD_VIBRATION))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn second_slot_cannot_claim_a_connected_device() {
        let bus = MockUsbBus::with_devices(&["p"]);
        let (manager, _factory, _store) = setup(bus.clone(), None, BridgeSettings::default());

        let device = manager.connect_usb(0, Some("p".to_string())).await.unwrap();
        assert_eq!(device, DeviceId::Usb("p".to_string()));

        let err = manager
            .connect_usb(1, Some("p".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, SlotError::DeviceInUse { owner: 0, .. }));
        assert_eq!(err.to_string(), "USB p is in use by slot 1");

        assert_eq!(manager.status(0).unwrap().state, SlotState::Connected);
        assert_eq!(manager.status(1).unwrap().state, SlotState::Disconnected);
        assert_eq!(manager.claims().owner(&device), Some(0));
        assert_eq!(bus.opens("p"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unspecified_connect_prefers_saved_device_then_any_free_one() {
        let bus = MockUsbBus::with_devices(&["a", "b"]);
        let mut settings = BridgeSettings::default();
        settings.slot_mut(1).preferred_device_path = Some("b".to_string());
        let (manager, _factory, store) = setup(bus.clone(), None, settings);

        assert_eq!(manager.connect_usb(1, None).await.unwrap(), DeviceId::Usb("b".to_string()));
        assert_eq!(manager.connect_usb(0, None).await.unwrap(), DeviceId::Usb("a".to_string()));
        assert!(matches!(manager.connect_usb(2, None).await, Err(SlotError::NoDevice)));
        assert!(matches!(
            manager.connect_usb(0, None).await,
            Err(SlotError::Busy { slot: 0, .. })
        ));

        // Init commands went to each device exactly once.
        assert_eq!(bus.writes("a").len(), 2);
        assert_eq!(
            store.snapshot().await.slot(0).preferred_device_path.as_deref(),
            Some("a")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lost_emulating_slot_reconnects_and_resumes_emulation() {
        let bus = MockUsbBus::with_devices(&["p"]);
        let (manager, factory, _store) = setup(bus.clone(), None, BridgeSettings::default());
        manager.connect_usb(0, None).await.unwrap();
        manager.start_emulation(0).await.unwrap();
        assert_eq!(manager.status(0).unwrap().state, SlotState::Emulating);

        bus.unplug("p");
        sleep(Duration::from_millis(100)).await;
        let status = manager.status(0).unwrap();
        assert_eq!(status.state, SlotState::Disconnected);
        assert!(status.reconnecting);
        assert_eq!(manager.claims().owner(&DeviceId::Usb("p".to_string())), None);
        let first = factory.logs.lock()[0].clone();
        assert!(first.lock().contains(&BackendCall::Reset));
        assert!(first.lock().contains(&BackendCall::Close));

        // One failed attempt while the controller is gone.
        sleep(Duration::from_secs(3)).await;
        assert_eq!(manager.status(0).unwrap().state, SlotState::Disconnected);

        bus.plug("p");
        sleep(Duration::from_secs(3)).await;
        let status = manager.status(0).unwrap();
        assert_eq!(status.state, SlotState::Emulating);
        assert!(!status.reconnecting);
        assert_eq!(factory.created.lock().len(), 2);
        assert_eq!(bus.opens("p"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_aborts_pending_reconnect() {
        let bus = MockUsbBus::with_devices(&["p"]);
        let (manager, factory, _store) = setup(bus.clone(), None, BridgeSettings::default());
        manager.connect_usb(0, None).await.unwrap();
        manager.start_emulation(0).await.unwrap();

        bus.unplug("p");
        sleep(Duration::from_millis(100)).await;
        assert!(manager.status(0).unwrap().reconnecting);

        manager.disconnect(0).await.unwrap();
        bus.plug("p");
        sleep(Duration::from_secs(10)).await;

        let status = manager.status(0).unwrap();
        assert_eq!(status.state, SlotState::Disconnected);
        assert!(!status.reconnecting);
        assert_eq!(bus.opens("p"), 1);
        assert_eq!(factory.created.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn host_force_feedback_toggles_usb_rumble_on_change_only() {
        let bus = MockUsbBus::with_devices(&["p"]);
        let (manager, factory, _store) = setup(bus.clone(), None, BridgeSettings::default());
        manager.connect_usb(0, None).await.unwrap();
        manager.start_emulation(0).await.unwrap();

        let hook = factory.rumble_hooks.lock()[0].clone();
        for (large, small) in [(200, 0), (90, 10), (0, 0)] {
            if let Some(callback) = hook.lock().as_ref() {
                callback(large, small);
            }
            sleep(Duration::from_millis(10)).await;
        }

        let writes = vibration_writes(&bus, "p");
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0][8], 1);
        assert_eq!(writes[1][8], 0);
        assert!(!manager.send_rumble(0, false).await.unwrap());
        assert!(matches!(
            manager.send_rumble(3, true).await,
            Err(SlotError::NotConnected(3))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stick_capture_is_saved_under_the_device_identity() {
        let bus = MockUsbBus::with_devices(&["p"]);
        let (manager, _factory, store) = setup(bus.clone(), None, BridgeSettings::default());
        manager.connect_usb(0, None).await.unwrap();

        manager.start_stick_capture(0).await.unwrap();
        for x in [100, 4000] {
            bus.push_frame("p", usb_frame(x));
            sleep(Duration::from_millis(10)).await;
        }
        let profile = manager.finish_stick_capture(0).await.unwrap();
        assert_eq!(profile.left_stick.x.center, 2050.0);
        assert_eq!(profile.left_stick.x.range, 1950.0);
        assert_eq!(store.snapshot().await.profiles["p"], profile);

        // The next connection of the same controller starts from the saved profile.
        manager.disconnect(0).await.unwrap();
        manager.connect_usb(2, Some("p".to_string())).await.unwrap();
        assert!(matches!(
            manager.finish_stick_capture(2).await,
            Err(SlotError::Calibration(CalibrationError::NoCaptureActive))
        ));
        assert!(matches!(
            manager.start_stick_capture(0).await,
            Err(SlotError::NotConnected(0))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ble_slot_pairs_streams_and_rumbles() {
        let (mock, radio) = ble_radio();
        let addr: BdAddr = PAD.parse().unwrap();
        let (manager, _factory, store) = setup(MockUsbBus::default(), Some(radio.into()), BridgeSettings::default());

        assert_eq!(manager.connect_ble(0, None).await.unwrap(), DeviceId::Ble(addr));
        let status = manager.status(0).unwrap();
        assert_eq!(status.state, SlotState::Connected);
        assert_eq!(status.mode, ConnectionMode::Ble);
        assert_eq!(status.device.as_deref(), Some(PAD));
        assert_eq!(store.snapshot().await.slot(0).preferred_ble_address, Some(addr));

        let inputs = manager.subscribe_input(0).unwrap();
        let mut frame = vec![0u8; 20];
        frame[0] = 0x21;
        frame[5] = 0x02;
        for _ in 0..3 {
            assert!(mock.notify(addr, protocol::H_INPUT_REPORT, frame.clone()));
            sleep(Duration::from_millis(10)).await;
        }
        assert!(inputs.borrow().input.buttons.contains(Button::A));

        assert!(manager.send_rumble(0, true).await.unwrap());
        let rumble: Vec<Vec<u8>> = mock
            .state
            .lock()
            .writes
            .iter()
            .filter(|w| w.1 == BLE_RUMBLE_HANDLE)
            .map(|w| w.2.clone())
            .collect();
        assert_eq!(rumble.len(), 1);
        assert_eq!(&rumble[0][..3], &[0x00, 0x50, 0x01]);

        // The only controller belongs to slot 1 already.
        let err = manager.connect_ble(1, None).await.unwrap_err();
        assert!(matches!(
            err,
            SlotError::Pairing(PairingFailure {
                error: PairingError::NoDevices,
                ..
            })
        ));
        assert_eq!(manager.status(1).unwrap().state, SlotState::Disconnected);

        manager.disconnect(0).await.unwrap();
        assert_eq!(mock.subscription_count(), 0);
        assert!(!mock.is_linked(addr));
    }

    #[tokio::test(start_paused = true)]
    async fn ble_slot_runs_through_a_radio_worker() {
        use crate::ble::ipc::{serve_worker, WorkerClient};
        use crate::ble::PairingTimings;
        use tokio::io::BufReader;

        let (mock, radio) = ble_radio();
        let addr: BdAddr = PAD.parse().unwrap();
        let (parent, worker) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let server = tokio::spawn(serve_worker(
            BufReader::new(worker_read),
            worker_write,
            radio,
            PairingTimings::default(),
        ));
        let (parent_read, parent_write) = tokio::io::split(parent);
        let client = WorkerClient::connect(BufReader::new(parent_read), parent_write)
            .await
            .unwrap();
        let (manager, _factory, _store) = setup(MockUsbBus::default(), Some(client.into()), BridgeSettings::default());

        assert_eq!(manager.connect_ble(0, None).await.unwrap(), DeviceId::Ble(addr));
        assert_eq!(manager.status(0).unwrap().state, SlotState::Connected);

        let inputs = manager.subscribe_input(0).unwrap();
        let mut frame = vec![0u8; 20];
        frame[0] = 0x21;
        frame[5] = 0x02;
        for _ in 0..3 {
            assert!(mock.notify(addr, protocol::H_INPUT_REPORT, frame.clone()));
            sleep(Duration::from_millis(10)).await;
        }
        assert!(inputs.borrow().input.buttons.contains(Button::A));

        manager.disconnect(0).await.unwrap();
        manager.shutdown().await;
        server.await.unwrap().unwrap();
        assert!(!mock.is_linked(addr));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_ble_link_reconnects_to_the_same_controller() {
        let (mock, radio) = ble_radio();
        let addr: BdAddr = PAD.parse().unwrap();
        let (manager, factory, _store) = setup(MockUsbBus::default(), Some(radio.into()), BridgeSettings::default());
        manager.connect_ble(0, None).await.unwrap();
        manager.start_emulation(0).await.unwrap();

        mock.drop_link(addr);
        sleep(Duration::from_millis(100)).await;
        assert!(manager.status(0).unwrap().reconnecting);

        sleep(Duration::from_secs(10)).await;
        let status = manager.status(0).unwrap();
        assert_eq!(status.state, SlotState::Emulating);
        assert_eq!(status.device.as_deref(), Some(PAD));
        assert!(mock.is_linked(addr));
        assert_eq!(factory.created.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_a_scan_in_progress() {
        let (mock, radio) = ble_radio();
        let (manager, _factory, _store) = setup(MockUsbBus::default(), Some(radio.into()), BridgeSettings::default());

        let pairing = manager.clone();
        let attempt = tokio::spawn(async move { pairing.connect_ble(0, None).await });
        sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.status(0).unwrap().state, SlotState::Connecting);

        manager.disconnect(0).await.unwrap();
        assert!(matches!(attempt.await.unwrap(), Err(SlotError::Cancelled)));
        assert_eq!(manager.status(0).unwrap().state, SlotState::Disconnected);
        assert_eq!(mock.subscription_count(), 0);
        assert!(!mock.state.lock().scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_connect_fills_slots_and_starts_emulation() {
        let bus = MockUsbBus::with_devices(&["a", "b", "c"]);
        let mut settings = BridgeSettings::default();
        settings.slot_mut(0).preferred_device_path = Some("c".to_string());
        let (manager, factory, _store) = setup(bus.clone(), None, settings);

        assert_eq!(manager.auto_connect().await, 3);
        assert_eq!(manager.status(0).unwrap().device.as_deref(), Some("c"));
        assert_eq!(manager.status(1).unwrap().device.as_deref(), Some("a"));
        assert_eq!(manager.status(2).unwrap().device.as_deref(), Some("b"));
        assert_eq!(manager.status(3).unwrap().state, SlotState::Disconnected);
        assert_eq!(factory.created.lock().len(), 3);

        manager.shutdown().await;
        for index in 0..MAX_SLOTS {
            assert_eq!(manager.status(index).unwrap().state, SlotState::Disconnected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn listed_device_that_fails_does_not_stop_the_rest() {
        let bus = MockUsbBus::with_devices(&["a", "b"]);
        let (manager, factory, _store) = setup(bus.clone(), None, BridgeSettings::default());

        let paths = vec!["gone".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(manager.connect_listed(paths).await, 2);
        assert_eq!(manager.status(0).unwrap().device.as_deref(), Some("a"));
        assert_eq!(manager.status(1).unwrap().device.as_deref(), Some("b"));
        assert_eq!(manager.status(0).unwrap().state, SlotState::Emulating);
        assert_eq!(manager.status(2).unwrap().state, SlotState::Disconnected);
        assert_eq!(factory.created.lock().len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn connect_ble_without_radio_is_rejected() {
        let (manager, _factory, _store) =
            setup(MockUsbBus::default(), None, BridgeSettings::default());
        assert!(matches!(manager.connect_ble(0, None).await, Err(SlotError::NoRadio)));
        assert!(matches!(manager.status(9), Err(SlotError::NoSuchSlot(9))));
        assert!(matches!(
            manager.start_emulation(0).await,
            Err(SlotError::NotConnected(0))
        ));
    }
}
