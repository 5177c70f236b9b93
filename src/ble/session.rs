//! BLE bring-up of one controller.
//!
//! [`PairingSession`] is a typestate machine: every step consumes the session in one state and
//! returns it in the next, or tears the link down and returns a [`PairingFailure`] naming the
//! phase that failed. Sessions are never reused; a retry starts again from [`Idle`].
//!
//! Each transition enters the phase it is named after, does that phase's work and waits (bounded)
//! for the controller's answer. A disconnect at any point before streaming is a hard failure.

use super::crypto::{encryption_candidates, KeyMaterial, SpiKey};
use super::discovery::rank_candidates;
use super::ipc::WorkerClient;
use super::protocol::{self, CommandResponse};
use super::radio::RadioHandle;
use super::transport::{LinkEvent, TransportError};
use super::{Advertisement, BdAddr};
use statum::{machine, state};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const REPORT_QUEUE: usize = 64;
const RESPONSE_QUEUE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("Cancelled")]
    Cancelled,
    #[error("No controller found")]
    NoDevices,
    #[error("Controller {0} not found")]
    TargetNotFound(BdAddr),
    #[error("Could not connect to any candidate")]
    ConnectFailed,
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("Disconnected: {0}")]
    Disconnected(String),
    #[error("Link encryption failed after {0} attempts")]
    EncryptionFailed(usize),
    #[error("Not connected")]
    NotConnected,
    #[error("Radio worker: {0}")]
    Worker(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Externally visible progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Discovering,
    AwaitingDeviceMatch,
    Connected,
    ServiceEnabled,
    DeviceInfoRead,
    PairingHandshake1,
    PairingHandshake2,
    PairingHandshake3,
    PairingHandshake4,
    LinkEncrypting,
    LedSet,
    FeaturesConfigured,
    CalibrationRead,
    StreamingEnabled,
    Streaming,
}

impl SessionPhase {
    const ALL: [SessionPhase; 16] = [
        SessionPhase::Idle,
        SessionPhase::Discovering,
        SessionPhase::AwaitingDeviceMatch,
        SessionPhase::Connected,
        SessionPhase::ServiceEnabled,
        SessionPhase::DeviceInfoRead,
        SessionPhase::PairingHandshake1,
        SessionPhase::PairingHandshake2,
        SessionPhase::PairingHandshake3,
        SessionPhase::PairingHandshake4,
        SessionPhase::LinkEncrypting,
        SessionPhase::LedSet,
        SessionPhase::FeaturesConfigured,
        SessionPhase::CalibrationRead,
        SessionPhase::StreamingEnabled,
        SessionPhase::Streaming,
    ];

    /// Earliest phase reporting `status`. Handshake steps share one text and map to the first.
    pub fn from_status(status: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|phase| phase.status() == status)
    }

    pub fn status(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "Idle",
            SessionPhase::Discovering => "Scanning for controller...",
            SessionPhase::AwaitingDeviceMatch => "Looking for a matching controller...",
            SessionPhase::Connected => "Connecting...",
            SessionPhase::ServiceEnabled => "Setting up command channel...",
            SessionPhase::DeviceInfoRead => "Reading device info...",
            SessionPhase::PairingHandshake1
            | SessionPhase::PairingHandshake2
            | SessionPhase::PairingHandshake3
            | SessionPhase::PairingHandshake4 => "Pairing (proprietary)...",
            SessionPhase::LinkEncrypting => "Encrypting link...",
            SessionPhase::LedSet => "Setting LED...",
            SessionPhase::FeaturesConfigured => "Configuring features...",
            SessionPhase::CalibrationRead => "Reading calibration...",
            SessionPhase::StreamingEnabled => "Enabling input...",
            SessionPhase::Streaming => "Connected via BLE",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status())
    }
}

/// Why a session ended, and where.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{phase:?} failed: {error}")]
pub struct PairingFailure {
    pub phase: SessionPhase,
    pub error: PairingError,
}

impl PairingFailure {
    pub fn is_cancelled(&self) -> bool {
        self.error == PairingError::Cancelled
    }
}

#[derive(Debug, Clone, Default)]
pub struct PairingRequest {
    pub slot: usize,
    pub target: Option<BdAddr>,
    /// Addresses owned by other slots.
    pub exclude: Vec<BdAddr>,
}

#[derive(Debug, Clone)]
pub struct PairingTimings {
    pub response: Duration,
    pub led_response: Duration,
    pub encryption: Duration,
    pub attempt_pause: Duration,
    pub scan_timeout: Duration,
    pub scan_poll: Duration,
    pub settle: Duration,
}

impl Default for PairingTimings {
    fn default() -> Self {
        Self {
            response: Duration::from_secs(3),
            led_response: Duration::from_secs(2),
            encryption: Duration::from_secs(5),
            attempt_pause: Duration::from_millis(300),
            scan_timeout: Duration::from_secs(10),
            scan_poll: Duration::from_millis(300),
            settle: Duration::from_millis(200),
        }
    }
}

#[derive(Debug)]
struct ActiveLink {
    address: BdAddr,
    events: mpsc::Receiver<LinkEvent>,
    responses: mpsc::Receiver<Vec<u8>>,
    response_sink: Option<mpsc::Sender<Vec<u8>>>,
    subscriptions: Vec<u16>,
}

/// Data collected during the handshake.
#[derive(Debug, Clone, Default)]
struct Collected {
    device_info: Vec<u8>,
    keys: Option<KeyMaterial>,
    challenge_verified: bool,
    spi_key: Option<SpiKey>,
    encrypted: bool,
    factory_calibration: [Vec<u8>; 2],
}

#[state]
#[derive(Debug, Clone)]
pub enum PairingState {
    Idle,
    Discovering,
    AwaitingDeviceMatch,
    Connected,
    ServiceEnabled,
    DeviceInfoRead,
    PairingHandshake1,
    PairingHandshake2,
    PairingHandshake3,
    PairingHandshake4,
    LinkEncrypting,
    LedSet,
    FeaturesConfigured,
    CalibrationRead,
    StreamingEnabled,
    Streaming,
}

#[machine]
#[derive(Debug)]
pub struct PairingSession<S: PairingState> {
    radio: RadioHandle,
    request: PairingRequest,
    timings: PairingTimings,
    cancel: CancellationToken,
    phase_tx: watch::Sender<SessionPhase>,
    scanning: bool,
    candidates: Vec<Advertisement>,
    link: Option<ActiveLink>,
    collected: Collected,
    reports: Option<mpsc::Receiver<Vec<u8>>>,
    completed: Vec<SessionPhase>,
}

async fn recv_event(events: &mut mpsc::Receiver<LinkEvent>) -> Result<LinkEvent, PairingError> {
    match events.recv().await {
        Some(LinkEvent::Disconnected { reason }) => Err(PairingError::Disconnected(reason)),
        Some(event) => Ok(event),
        None => Err(PairingError::Disconnected("link closed".to_string())),
    }
}

impl<S: PairingState> PairingSession<S> {
    pub fn phase(&self) -> SessionPhase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    fn enter(&mut self, phase: SessionPhase) {
        debug!("Slot {}: {}", self.request.slot, phase.status());
        self.phase_tx.send_replace(phase);
    }

    fn mark_done(&mut self) {
        let phase = self.phase();
        self.completed.push(phase);
    }

    fn address(&self) -> Result<BdAddr, PairingError> {
        self.link
            .as_ref()
            .map(|link| link.address)
            .ok_or(PairingError::NotConnected)
    }

    async fn pause(&self, duration: Duration) -> Result<(), PairingError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PairingError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn subscribe_handle(
        &mut self,
        handle: u16,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), PairingError> {
        let address = self.address()?;
        self.radio.subscribe(address, handle, sink).await?;
        if let Some(link) = self.link.as_mut() {
            link.subscriptions.push(handle);
        }
        Ok(())
    }

    async fn unsubscribe_handle(&mut self, handle: u16) -> Result<(), PairingError> {
        let address = self.address()?;
        self.radio.unsubscribe(address, handle).await?;
        if let Some(link) = self.link.as_mut() {
            link.subscriptions.retain(|h| *h != handle);
        }
        Ok(())
    }

    /// Waits for the response to `cmd`, skipping stale answers to earlier commands.
    async fn wait_response(
        &mut self,
        cmd: u8,
        timeout: Duration,
    ) -> Result<CommandResponse, PairingError> {
        let cancel = self.cancel.clone();
        let link = self.link.as_mut().ok_or(PairingError::NotConnected)?;
        let deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(PairingError::Cancelled),
                event = recv_event(&mut link.events) => {
                    let event = event?;
                    debug!("Link event while waiting for 0x{:02X}: {:?}", cmd, event);
                }
                data = link.responses.recv() => {
                    let Some(data) = data else {
                        return Err(PairingError::Disconnected("command channel closed".to_string()));
                    };
                    let response = CommandResponse(data);
                    if response.answers(cmd) {
                        return Ok(response);
                    }
                    debug!("Ignoring response 0x{:02X?} while waiting for 0x{:02X}", response.command(), cmd);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(PairingError::Timeout(format!("response to command 0x{:02X}", cmd)));
                }
            }
        }
    }

    /// Writes a command and waits for its echo.
    async fn command(
        &mut self,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<CommandResponse, PairingError> {
        let cmd = data.first().copied().unwrap_or_default();
        let address = self.address()?;
        self.radio
            .write(address, protocol::H_CMD_WRITE, data, false)
            .await?;
        self.wait_response(cmd, timeout).await
    }

    /// Releases everything the session holds on the radio.
    async fn teardown(&mut self) {
        if self.scanning {
            if let Err(e) = self.radio.stop_scan().await {
                debug!("Stopping scan during teardown: {}", e);
            }
            self.scanning = false;
        }
        if let Some(link) = self.link.take() {
            for handle in &link.subscriptions {
                if let Err(e) = self.radio.unsubscribe(link.address, *handle).await {
                    debug!("Unsubscribing 0x{:04X}: {}", handle, e);
                }
            }
            if let Err(e) = self.radio.disconnect(link.address).await {
                debug!("Disconnecting {}: {}", link.address, e);
            }
        }
        self.reports = None;
    }

    async fn fail(mut self, error: PairingError) -> PairingFailure {
        let phase = self.phase();
        if error == PairingError::Cancelled {
            info!("Slot {}: pairing cancelled during {:?}", self.request.slot, phase);
        } else {
            warn!("Slot {}: pairing failed during {:?}: {}", self.request.slot, phase, error);
        }
        self.teardown().await;
        PairingFailure { phase, error }
    }
}

impl PairingSession<Idle> {
    pub fn create(
        radio: RadioHandle,
        request: PairingRequest,
        timings: PairingTimings,
        cancel: CancellationToken,
        phase_tx: watch::Sender<SessionPhase>,
    ) -> Self {
        phase_tx.send_replace(SessionPhase::Idle);
        Self::new(
            radio,
            request,
            timings,
            cancel,
            phase_tx,
            false,
            Vec::new(),
            None,
            Collected::default(),
            None,
            Vec::new(),
        )
    }

    pub async fn start_discovery(mut self) -> Result<PairingSession<Discovering>, PairingFailure> {
        self.enter(SessionPhase::Discovering);
        if self.cancel.is_cancelled() {
            return Err(self.fail(PairingError::Cancelled).await);
        }
        match self.radio.start_scan().await {
            Ok(()) => {
                self.scanning = true;
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e.into()).await),
        }
    }
}

impl PairingSession<Discovering> {
    async fn run_scan(&mut self) -> Result<(), PairingError> {
        let deadline = Instant::now() + self.timings.scan_timeout;
        let seen = loop {
            self.pause(self.timings.scan_poll).await?;
            let seen = self.radio.scan_results().await?;
            if let Some(target) = self.request.target {
                if seen.iter().any(|ad| ad.address == target) {
                    info!("Slot {}: target {} found during scan", self.request.slot, target);
                    break seen;
                }
            }
            if Instant::now() >= deadline {
                break seen;
            }
        };
        self.radio.stop_scan().await?;
        self.scanning = false;

        if let Some(target) = self.request.target {
            if !seen.iter().any(|ad| ad.address == target) {
                return Err(PairingError::TargetNotFound(target));
            }
        }
        self.candidates = rank_candidates(&seen, self.request.target, &self.request.exclude);
        if self.candidates.is_empty() {
            return Err(PairingError::NoDevices);
        }
        info!(
            "Slot {}: {} candidate(s) after scan",
            self.request.slot,
            self.candidates.len()
        );
        Ok(())
    }

    pub async fn match_device(
        mut self,
    ) -> Result<PairingSession<AwaitingDeviceMatch>, PairingFailure> {
        self.enter(SessionPhase::AwaitingDeviceMatch);
        match self.run_scan().await {
            Ok(()) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<AwaitingDeviceMatch> {
    async fn run_connect(&mut self) -> Result<(), PairingError> {
        let candidates = std::mem::take(&mut self.candidates);
        for candidate in candidates {
            if self.cancel.is_cancelled() {
                return Err(PairingError::Cancelled);
            }
            let name = candidate.name.as_deref().unwrap_or("(no name)");
            info!("Slot {}: trying {} ({})", self.request.slot, name, candidate.address);
            match self.radio.connect(candidate.address).await {
                Ok(events) => {
                    let (response_sink, responses) = mpsc::channel(RESPONSE_QUEUE);
                    self.link = Some(ActiveLink {
                        address: candidate.address,
                        events,
                        responses,
                        response_sink: Some(response_sink),
                        subscriptions: Vec::new(),
                    });
                    return Ok(());
                }
                Err(e) => warn!("Slot {}: {}", self.request.slot, e),
            }
        }
        Err(PairingError::ConnectFailed)
    }

    pub async fn connect(mut self) -> Result<PairingSession<Connected>, PairingFailure> {
        self.enter(SessionPhase::Connected);
        match self.run_connect().await {
            Ok(()) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<Connected> {
    async fn run_enable_service(&mut self) -> Result<(), PairingError> {
        let address = self.address()?;
        self.radio
            .write(address, protocol::H_SVC1_ENABLE, protocol::CCCD_ENABLE.to_vec(), true)
            .await?;
        self.pause(self.timings.settle).await?;

        let sink = self
            .link
            .as_mut()
            .and_then(|link| link.response_sink.take())
            .ok_or(PairingError::NotConnected)?;
        self.subscribe_handle(protocol::H_CMD_RESPONSE, sink).await?;
        self.radio
            .write(address, protocol::H_CMD_RESP_CCCD, protocol::CCCD_ENABLE.to_vec(), true)
            .await?;
        self.pause(self.timings.settle).await
    }

    pub async fn enable_service(mut self) -> Result<PairingSession<ServiceEnabled>, PairingFailure> {
        self.enter(SessionPhase::ServiceEnabled);
        match self.run_enable_service().await {
            Ok(()) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<ServiceEnabled> {
    pub async fn read_device_info(mut self) -> Result<PairingSession<DeviceInfoRead>, PairingFailure> {
        self.enter(SessionPhase::DeviceInfoRead);
        let timeout = self.timings.response;
        match self
            .command(protocol::spi_read(protocol::SPI_DEVICE_INFO, protocol::SPI_BLOCK), timeout)
            .await
        {
            Ok(response) => {
                self.collected.device_info = response.spi_payload().to_vec();
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<DeviceInfoRead> {
    async fn run_send_address(&mut self) -> Result<(), PairingError> {
        if self.radio.manages_security() {
            debug!("Slot {}: platform stack owns pairing, skipping key exchange", self.request.slot);
            return Ok(());
        }
        let local = match self.radio.local_address().await? {
            Some(addr) => addr,
            None => {
                debug!("Radio has no public address, using fallback");
                BdAddr::FALLBACK_LOCAL
            }
        };
        let timeout = self.timings.response;
        self.command(protocol::pair_address(&local), timeout).await?;
        Ok(())
    }

    pub async fn send_address(mut self) -> Result<PairingSession<PairingHandshake1>, PairingFailure> {
        self.enter(SessionPhase::PairingHandshake1);
        match self.run_send_address().await {
            Ok(()) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<PairingHandshake1> {
    pub async fn send_public_key(mut self) -> Result<PairingSession<PairingHandshake2>, PairingFailure> {
        self.enter(SessionPhase::PairingHandshake2);
        if self.radio.manages_security() {
            self.mark_done();
            return Ok(self.transition());
        }
        let keys = KeyMaterial::generate(&mut rand::thread_rng());
        let timeout = self.timings.response;
        let result = self
            .command(protocol::pair_public_key(&keys.public_key_a), timeout)
            .await;
        self.collected.keys = Some(keys);
        match result {
            Ok(_) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<PairingHandshake2> {
    async fn run_send_challenge(&mut self) -> Result<(), PairingError> {
        if self.radio.manages_security() {
            return Ok(());
        }
        let keys = self.collected.keys.clone().ok_or(PairingError::NotConnected)?;
        let timeout = self.timings.response;
        let response = self
            .command(protocol::pair_challenge(&keys.challenge), timeout)
            .await?;
        // A bad proof is not fatal: the flash-stored key is still tried during encryption.
        self.collected.challenge_verified = match response.trailing_block() {
            Some(proof) if keys.verify_challenge(&proof) => true,
            _ => {
                warn!(
                    "Slot {}: challenge response did not verify, continuing",
                    self.request.slot
                );
                false
            }
        };
        Ok(())
    }

    pub async fn send_challenge(mut self) -> Result<PairingSession<PairingHandshake3>, PairingFailure> {
        self.enter(SessionPhase::PairingHandshake3);
        match self.run_send_challenge().await {
            Ok(()) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<PairingHandshake3> {
    pub async fn finalize(mut self) -> Result<PairingSession<PairingHandshake4>, PairingFailure> {
        self.enter(SessionPhase::PairingHandshake4);
        if self.radio.manages_security() {
            self.mark_done();
            return Ok(self.transition());
        }
        let timeout = self.timings.response;
        match self.command(protocol::pair_finalize(), timeout).await {
            Ok(_) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<PairingHandshake4> {
    async fn read_pairing_data(&mut self) -> Result<Option<SpiKey>, PairingError> {
        let timeout = self.timings.response;
        match self
            .command(protocol::spi_read(protocol::SPI_PAIRING_DATA, protocol::SPI_BLOCK), timeout)
            .await
        {
            Ok(response) => Ok(SpiKey::from_response(&response.0)),
            Err(PairingError::Timeout(what)) => {
                warn!("Slot {}: no pairing data ({}), continuing", self.request.slot, what);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Waits for the outcome of one enable-encryption request.
    async fn await_encryption(&mut self) -> Result<bool, PairingError> {
        let cancel = self.cancel.clone();
        let timeout = self.timings.encryption;
        let link = self.link.as_mut().ok_or(PairingError::NotConnected)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(PairingError::Cancelled),
            event = link.events.recv() => match event {
                Some(LinkEvent::EncryptionChanged { encrypted }) => Ok(encrypted),
                Some(LinkEvent::EncryptionFailed { reason }) => {
                    debug!("Encryption attempt rejected: {}", reason);
                    Ok(false)
                }
                Some(LinkEvent::Disconnected { reason }) => Err(PairingError::Disconnected(reason)),
                None => Err(PairingError::Disconnected("link closed".to_string())),
            },
            _ = tokio::time::sleep(timeout) => Ok(false),
        }
    }

    async fn run_encryption(&mut self) -> Result<(), PairingError> {
        let address = self.address()?;
        if self.radio.manages_security() {
            if !self.radio.is_encrypted(address).await? {
                return Err(PairingError::NotConnected);
            }
            debug!("Slot {}: link secured by the platform stack", self.request.slot);
            self.collected.encrypted = true;
            return Ok(());
        }

        let spi_key = self.read_pairing_data().await?;
        self.collected.spi_key = spi_key;

        if self.radio.is_encrypted(address).await? {
            debug!("Slot {}: link already encrypted", self.request.slot);
            self.collected.encrypted = true;
            return Ok(());
        }

        let derived = self.collected.keys.as_ref().map(|k| k.derived_ltk);
        let candidates = encryption_candidates(derived.as_ref(), spi_key.as_ref());
        for (attempt, key) in candidates.iter().enumerate() {
            debug!(
                "Slot {}: encryption attempt {}/{} (ediv 0x{:04X})",
                self.request.slot,
                attempt + 1,
                candidates.len(),
                key.ediv
            );
            match self.radio.enable_encryption(address, *key).await {
                Ok(()) => {
                    if self.await_encryption().await? {
                        info!("Slot {}: link encrypted", self.request.slot);
                        self.collected.encrypted = true;
                        return Ok(());
                    }
                }
                Err(e) => debug!("Encryption request refused: {}", e),
            }
            self.pause(self.timings.attempt_pause).await?;
        }
        Err(PairingError::EncryptionFailed(candidates.len()))
    }

    pub async fn encrypt_link(mut self) -> Result<PairingSession<LinkEncrypting>, PairingFailure> {
        self.enter(SessionPhase::LinkEncrypting);
        match self.run_encryption().await {
            Ok(()) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<LinkEncrypting> {
    async fn run_set_led(&mut self) -> Result<(), PairingError> {
        let mask = protocol::led_mask(self.request.slot);
        let timeout = self.timings.led_response;
        self.command(protocol::set_led(protocol::IFACE_BLE, mask), timeout)
            .await?;
        self.pause(self.timings.settle).await
    }

    pub async fn set_led(mut self) -> Result<PairingSession<LedSet>, PairingFailure> {
        self.enter(SessionPhase::LedSet);
        match self.run_set_led().await {
            Ok(()) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<LedSet> {
    pub async fn configure_features(mut self) -> Result<PairingSession<FeaturesConfigured>, PairingFailure> {
        self.enter(SessionPhase::FeaturesConfigured);
        let timeout = self.timings.response;
        match self
            .command(protocol::report_data_defaults(protocol::IFACE_BLE), timeout)
            .await
        {
            Ok(_) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<FeaturesConfigured> {
    async fn run_read_calibration(&mut self) -> Result<(), PairingError> {
        let timeout = self.timings.response;
        let addresses = [
            protocol::SPI_LEFT_STICK_CALIBRATION,
            protocol::SPI_RIGHT_STICK_CALIBRATION,
        ];
        for (i, address) in addresses.into_iter().enumerate() {
            let response = self
                .command(protocol::spi_read(address, protocol::SPI_BLOCK), timeout)
                .await?;
            self.collected.factory_calibration[i] = response.spi_payload().to_vec();
        }
        Ok(())
    }

    pub async fn read_calibration(mut self) -> Result<PairingSession<CalibrationRead>, PairingFailure> {
        self.enter(SessionPhase::CalibrationRead);
        match self.run_read_calibration().await {
            Ok(()) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<CalibrationRead> {
    async fn run_enable_streaming(&mut self) -> Result<(), PairingError> {
        let address = self.address()?;
        let (report_tx, report_rx) = mpsc::channel(REPORT_QUEUE);
        self.subscribe_handle(protocol::H_INPUT_REPORT, report_tx).await?;
        self.reports = Some(report_rx);
        self.radio
            .write(address, protocol::H_INPUT_CCCD, protocol::CCCD_ENABLE.to_vec(), true)
            .await?;
        self.radio
            .write(address, protocol::H_CMD_RESP_CCCD, protocol::CCCD_DISABLE.to_vec(), true)
            .await?;
        self.unsubscribe_handle(protocol::H_CMD_RESPONSE).await
    }

    pub async fn enable_streaming(mut self) -> Result<PairingSession<StreamingEnabled>, PairingFailure> {
        self.enter(SessionPhase::StreamingEnabled);
        match self.run_enable_streaming().await {
            Ok(()) => {
                self.mark_done();
                Ok(self.transition())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }
}

impl PairingSession<StreamingEnabled> {
    pub async fn start_streaming(mut self) -> Result<PairingSession<Streaming>, PairingFailure> {
        self.enter(SessionPhase::Streaming);
        if self.cancel.is_cancelled() {
            return Err(self.fail(PairingError::Cancelled).await);
        }
        self.mark_done();
        Ok(self.transition())
    }
}

impl PairingSession<Streaming> {
    pub fn into_live(mut self) -> Result<LiveSession, PairingError> {
        let link = self.link.take().ok_or(PairingError::NotConnected)?;
        let reports = self.reports.take().ok_or(PairingError::NotConnected)?;
        info!(
            "Slot {}: streaming from {} after {} phases",
            self.request.slot,
            link.address,
            self.completed.len()
        );
        let collected = std::mem::take(&mut self.collected);
        Ok(LiveSession {
            link: BleLink {
                address: link.address,
                route: LinkRoute::Radio {
                    radio: self.radio.clone(),
                    subscriptions: link.subscriptions,
                },
            },
            slot: self.request.slot,
            reports,
            events: link.events,
            device_info: collected.device_info,
            factory_calibration: collected.factory_calibration,
            encrypted: collected.encrypted,
            challenge_verified: collected.challenge_verified,
        })
    }
}

/// Radio access for a connected controller after bring-up.
#[derive(Debug, Clone)]
pub struct BleLink {
    address: BdAddr,
    route: LinkRoute,
}

#[derive(Debug, Clone)]
enum LinkRoute {
    Radio {
        radio: RadioHandle,
        subscriptions: Vec<u16>,
    },
    /// The link lives in a radio worker process.
    Worker { client: WorkerClient, slot: usize },
}

impl BleLink {
    pub(crate) fn through_worker(client: WorkerClient, slot: usize, address: BdAddr) -> Self {
        Self {
            address,
            route: LinkRoute::Worker { client, slot },
        }
    }

    pub fn address(&self) -> BdAddr {
        self.address
    }

    pub async fn write_rumble(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        match &self.route {
            LinkRoute::Radio { radio, .. } => {
                radio
                    .write(self.address, crate::emulation::rumble::BLE_RUMBLE_HANDLE, packet, false)
                    .await
            }
            LinkRoute::Worker { client, slot } => client
                .rumble(*slot, &packet)
                .await
                .map_err(|_| TransportError::WorkerStopped),
        }
    }

    pub async fn close(&self) {
        match &self.route {
            LinkRoute::Radio {
                radio,
                subscriptions,
            } => {
                for handle in subscriptions {
                    if let Err(e) = radio.unsubscribe(self.address, *handle).await {
                        debug!("Unsubscribing 0x{:04X}: {}", handle, e);
                    }
                }
                if let Err(e) = radio.disconnect(self.address).await {
                    debug!("Disconnecting {}: {}", self.address, e);
                }
            }
            LinkRoute::Worker { client, slot } => client.release(*slot).await,
        }
    }
}

/// A controller that finished bring-up and is streaming input reports.
#[derive(Debug)]
pub struct LiveSession {
    pub link: BleLink,
    pub slot: usize,
    pub reports: mpsc::Receiver<Vec<u8>>,
    pub events: mpsc::Receiver<LinkEvent>,
    pub device_info: Vec<u8>,
    pub factory_calibration: [Vec<u8>; 2],
    pub encrypted: bool,
    pub challenge_verified: bool,
}

impl LiveSession {
    pub fn address(&self) -> BdAddr {
        self.link.address
    }
}

/// Runs a fresh session from discovery to streaming.
pub async fn pair(
    radio: RadioHandle,
    request: PairingRequest,
    timings: PairingTimings,
    cancel: CancellationToken,
    phase_tx: watch::Sender<SessionPhase>,
) -> Result<LiveSession, PairingFailure> {
    let session = PairingSession::create(radio, request, timings, cancel, phase_tx.clone());
    let streaming = session
        .start_discovery()
        .await?
        .match_device()
        .await?
        .connect()
        .await?
        .enable_service()
        .await?
        .read_device_info()
        .await?
        .send_address()
        .await?
        .send_public_key()
        .await?
        .send_challenge()
        .await?
        .finalize()
        .await?
        .encrypt_link()
        .await?
        .set_led()
        .await?
        .configure_features()
        .await?
        .read_calibration()
        .await?
        .enable_streaming()
        .await?
        .start_streaming()
        .await?;
    streaming.into_live().map_err(|error| PairingFailure {
        phase: SessionPhase::Streaming,
        error,
    })
}
