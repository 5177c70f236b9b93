//! JSON-lines protocol for running the radio in a separate, privileged process.
//!
//! The parent writes one [`WorkerRequest`] per line; the worker answers with [`WorkerEvent`]
//! lines. Binary payloads travel as standard base64. [`serve_worker`] is the worker end,
//! [`WorkerClient`] the parent end.

use super::radio::RadioHandle;
use super::session::{
    pair, BleLink, LiveSession, PairingError, PairingFailure, PairingRequest, PairingTimings,
    SessionPhase, REPORT_QUEUE,
};
use super::transport::LinkEvent;
use super::BdAddr;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_QUEUE: usize = 256;
const REQUEST_QUEUE: usize = 64;
const PAIRING_QUEUE: usize = 32;
const LINK_EVENT_QUEUE: usize = 8;
const WORKER_EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Malformed message: {0}")]
    Json(String),
    #[error("Malformed payload: {0}")]
    Payload(String),
    #[error("Radio worker is gone")]
    Closed,
    #[error("Radio worker: {0}")]
    Worker(String),
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        IpcError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerRequest {
    Open {
        #[serde(default)]
        hci_index: Option<u32>,
    },
    ScanConnect {
        slot_index: usize,
        #[serde(default)]
        target_address: Option<BdAddr>,
        #[serde(default)]
        exclude_addresses: Vec<BdAddr>,
    },
    Rumble {
        slot_index: usize,
        data: String,
    },
    Disconnect {
        #[serde(default)]
        slot_index: Option<usize>,
        #[serde(default)]
        address: Option<BdAddr>,
    },
    #[serde(alias = "close")]
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "e", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready,
    OpenOk,
    Error { ctx: String, msg: String },
    Status { s: usize, msg: String },
    Connected { s: usize, mac: BdAddr },
    ConnectError { s: usize, msg: String },
    Data { s: usize, d: String },
    Disconnected { s: usize },
}

impl WorkerEvent {
    pub fn data(slot: usize, payload: &[u8]) -> Self {
        WorkerEvent::Data {
            s: slot,
            d: STANDARD.encode(payload),
        }
    }

    fn error(ctx: &str, msg: impl ToString) -> Self {
        WorkerEvent::Error {
            ctx: ctx.to_string(),
            msg: msg.to_string(),
        }
    }
}

pub fn decode_payload(data: &str) -> Result<Vec<u8>, IpcError> {
    STANDARD
        .decode(data)
        .map_err(|e| IpcError::Payload(e.to_string()))
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(message).map_err(|e| IpcError::Json(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

pub fn parse_request(line: &str) -> Result<WorkerRequest, IpcError> {
    serde_json::from_str(line).map_err(|e| IpcError::Json(e.to_string()))
}

pub fn parse_event(line: &str) -> Result<WorkerEvent, IpcError> {
    serde_json::from_str(line).map_err(|e| IpcError::Json(e.to_string()))
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), IpcError> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

// ---- worker ----

struct SlotTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type Links = Arc<Mutex<HashMap<usize, BleLink>>>;

/// Executes requests from `reader` against the radio and streams events to `writer` until
/// `shutdown`, end of input, or the parent no longer reading.
pub async fn serve_worker<R, W>(
    reader: R,
    mut writer: W,
    radio: RadioHandle,
    timings: PairingTimings,
) -> Result<(), IpcError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (events, mut event_rx) = mpsc::channel::<WorkerEvent>(EVENT_QUEUE);
    let writer_task: JoinHandle<Result<(), IpcError>> = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            write_line(&mut writer, &encode_line(&event)?).await?;
        }
        Ok(())
    });

    let mut tasks: HashMap<usize, SlotTask> = HashMap::new();
    let links: Links = Arc::new(Mutex::new(HashMap::new()));
    let mut lines = reader.lines();

    if events.send(WorkerEvent::Ready).await.is_ok() {
        info!("Radio worker ready");
    }

    loop {
        let line = tokio::select! {
            _ = events.closed() => {
                warn!("Parent stopped reading, radio worker exiting");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("Worker input failed: {}", e);
                    break;
                }
            },
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match parse_request(line) {
            Ok(request) => {
                debug!("Worker request: {:?}", request);
                match request {
                    WorkerRequest::Open { .. } => Some(match radio.local_address().await {
                        Ok(_) => WorkerEvent::OpenOk,
                        Err(e) => WorkerEvent::error("open", e),
                    }),
                    WorkerRequest::ScanConnect {
                        slot_index,
                        target_address,
                        exclude_addresses,
                    } => {
                        if let Some(previous) = tasks.remove(&slot_index) {
                            previous.cancel.cancel();
                        }
                        let cancel = CancellationToken::new();
                        let handle = tokio::spawn(run_slot(
                            radio.clone(),
                            PairingRequest {
                                slot: slot_index,
                                target: target_address,
                                exclude: exclude_addresses,
                            },
                            timings.clone(),
                            cancel.clone(),
                            events.clone(),
                            links.clone(),
                        ));
                        tasks.insert(slot_index, SlotTask { cancel, handle });
                        None
                    }
                    WorkerRequest::Rumble { slot_index, data } => match decode_payload(&data) {
                        Ok(payload) => {
                            let link = links.lock().get(&slot_index).cloned();
                            if let Some(link) = link {
                                tokio::spawn(async move {
                                    if let Err(e) = link.write_rumble(payload).await {
                                        debug!("Rumble write failed: {}", e);
                                    }
                                });
                            }
                            None
                        }
                        Err(e) => Some(WorkerEvent::error("rumble", e)),
                    },
                    WorkerRequest::Disconnect {
                        slot_index,
                        address,
                    } => {
                        if let Some(task) = slot_index.and_then(|slot| tasks.remove(&slot)) {
                            task.cancel.cancel();
                            if let Err(e) = task.handle.await {
                                warn!("Slot task ended abnormally: {}", e);
                            }
                        }
                        if let Some(address) = address {
                            if let Err(e) = radio.disconnect(address).await {
                                debug!("Disconnect {}: {}", address, e);
                            }
                        }
                        None
                    }
                    WorkerRequest::Shutdown => {
                        info!("Radio worker shutting down");
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("Ignoring request: {}", e);
                Some(WorkerEvent::error("parse", e))
            }
        };
        if let Some(reply) = reply {
            if events.send(reply).await.is_err() {
                warn!("Parent stopped reading, radio worker exiting");
                break;
            }
        }
    }

    for (_, task) in tasks.drain() {
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!("Slot task ended abnormally: {}", e);
        }
    }
    drop(events);
    writer_task
        .await
        .map_err(|e| IpcError::Io(e.to_string()))?
}

async fn run_slot(
    radio: RadioHandle,
    request: PairingRequest,
    timings: PairingTimings,
    cancel: CancellationToken,
    events: mpsc::Sender<WorkerEvent>,
    links: Links,
) {
    let slot = request.slot;
    let (phase_tx, mut phase_rx) = watch::channel(SessionPhase::Idle);
    let status_events = events.clone();
    let status_task = tokio::spawn(async move {
        while phase_rx.changed().await.is_ok() {
            let msg = phase_rx.borrow_and_update().status().to_string();
            if status_events
                .send(WorkerEvent::Status { s: slot, msg })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let result = pair(radio, request, timings, cancel.clone(), phase_tx).await;
    // The status stream ends once the session drops its sender.
    if let Err(e) = status_task.await {
        debug!("Slot {} status stream ended abnormally: {}", slot, e);
    }

    let mut live = match result {
        Ok(live) => live,
        Err(failure) => {
            if !failure.is_cancelled() {
                let event = WorkerEvent::ConnectError {
                    s: slot,
                    msg: failure.to_string(),
                };
                if events.send(event).await.is_err() {
                    debug!("Slot {} failure went unheard", slot);
                }
            }
            return;
        }
    };

    let connected = WorkerEvent::Connected {
        s: slot,
        mac: live.address(),
    };
    if events.send(connected).await.is_err() {
        live.link.close().await;
        return;
    }
    links.lock().insert(slot, live.link.clone());

    let lost = loop {
        tokio::select! {
            _ = cancel.cancelled() => break false,
            report = live.reports.recv() => match report {
                Some(report) => {
                    if events.send(WorkerEvent::data(slot, &report)).await.is_err() {
                        break false;
                    }
                }
                None => break true,
            },
            event = live.events.recv() => match event {
                Some(LinkEvent::Disconnected { reason }) | Some(LinkEvent::EncryptionFailed { reason }) => {
                    info!("Slot {} link lost: {}", slot, reason);
                    break true;
                }
                Some(other) => debug!("Slot {} link event: {:?}", slot, other),
                None => break true,
            },
        }
    };
    links.lock().remove(&slot);
    live.link.close().await;
    if lost && events.send(WorkerEvent::Disconnected { s: slot }).await.is_err() {
        debug!("Slot {} disconnect went unheard", slot);
    }
}

// ---- parent ----

/// What the parent learns about one slot while its session runs in the worker.
#[derive(Debug)]
enum PairingUpdate {
    Status(String),
    Connected {
        address: BdAddr,
        reports: mpsc::Receiver<Vec<u8>>,
        events: mpsc::Receiver<LinkEvent>,
    },
    Failed(PairingError),
}

#[derive(Debug)]
enum Route {
    Pairing(mpsc::Sender<PairingUpdate>),
    Live {
        reports: mpsc::Sender<Vec<u8>>,
        events: mpsc::Sender<LinkEvent>,
    },
}

#[derive(Debug)]
struct ClientShared {
    requests: mpsc::Sender<WorkerRequest>,
    routes: Mutex<HashMap<usize, Route>>,
    opening: Mutex<Option<oneshot::Sender<Result<(), String>>>>,
    child: Mutex<Option<Child>>,
}

impl ClientShared {
    /// Applies one worker event. Pairing updates are returned for the caller to deliver.
    fn route(&self, event: WorkerEvent) -> Option<(mpsc::Sender<PairingUpdate>, PairingUpdate)> {
        let mut routes = self.routes.lock();
        match event {
            WorkerEvent::Ready => None,
            WorkerEvent::OpenOk => {
                self.finish_open(Ok(()));
                None
            }
            WorkerEvent::Error { ctx, msg } => {
                if ctx == "open" {
                    self.finish_open(Err(msg));
                } else {
                    warn!("Radio worker {} error: {}", ctx, msg);
                }
                None
            }
            WorkerEvent::Status { s, msg } => match routes.get(&s) {
                Some(Route::Pairing(tx)) => Some((tx.clone(), PairingUpdate::Status(msg))),
                _ => None,
            },
            WorkerEvent::Connected { s, mac } => {
                let Some(Route::Pairing(tx)) = routes.remove(&s) else {
                    debug!("Slot {}: unexpected connect to {}", s, mac);
                    return None;
                };
                let (reports_tx, reports) = mpsc::channel(REPORT_QUEUE);
                let (events_tx, events) = mpsc::channel(LINK_EVENT_QUEUE);
                routes.insert(
                    s,
                    Route::Live {
                        reports: reports_tx,
                        events: events_tx,
                    },
                );
                Some((
                    tx,
                    PairingUpdate::Connected {
                        address: mac,
                        reports,
                        events,
                    },
                ))
            }
            WorkerEvent::ConnectError { s, msg } => match routes.remove(&s) {
                Some(Route::Pairing(tx)) => Some((tx, PairingUpdate::Failed(PairingError::Worker(msg)))),
                _ => None,
            },
            WorkerEvent::Data { s, d } => {
                // Reports are dropped while the reader is behind.
                let closed = match (routes.get(&s), decode_payload(&d)) {
                    (Some(Route::Live { reports, .. }), Ok(payload)) => {
                        matches!(reports.try_send(payload), Err(TrySendError::Closed(_)))
                    }
                    (_, Err(e)) => {
                        debug!("Slot {}: {}", s, e);
                        false
                    }
                    _ => false,
                };
                if closed {
                    routes.remove(&s);
                }
                None
            }
            WorkerEvent::Disconnected { s } => match routes.remove(&s) {
                Some(Route::Pairing(tx)) => Some((
                    tx,
                    PairingUpdate::Failed(PairingError::Disconnected("worker dropped the link".to_string())),
                )),
                Some(Route::Live { events, .. }) => {
                    let lost = LinkEvent::Disconnected {
                        reason: "worker lost the link".to_string(),
                    };
                    if events.try_send(lost).is_err() {
                        debug!("Slot {}: nobody was reading the link", s);
                    }
                    None
                }
                None => None,
            },
        }
    }

    fn finish_open(&self, result: Result<(), String>) {
        let Some(waiter) = self.opening.lock().take() else {
            return;
        };
        if waiter.send(result).is_err() {
            debug!("Open answer arrived after the caller gave up");
        }
    }

    /// Closing every route ends pending sessions and live read loops alike.
    fn worker_gone(&self) {
        self.routes.lock().clear();
        self.opening.lock().take();
    }
}

/// Parent side of the worker protocol. Cheap to clone; the worker is told to stop when the last
/// clone drops.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    shared: Arc<ClientShared>,
}

impl WorkerClient {
    /// Starts `program` as a radio worker on piped stdio.
    pub async fn spawn(program: &Path, args: &[String]) -> Result<Self, IpcError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IpcError::Io("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IpcError::Io("worker stdout unavailable".to_string()))?;
        info!("Started radio worker {} (pid {:?})", program.display(), child.id());

        let client = Self::connect(BufReader::new(stdout), stdin).await?;
        *client.shared.child.lock() = Some(child);
        Ok(client)
    }

    /// Talks to a worker over an existing pair of streams once it has announced itself.
    pub async fn connect<R, W>(reader: R, writer: W) -> Result<Self, IpcError>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut lines = reader.lines();
        loop {
            let line = lines
                .next_line()
                .await?
                .ok_or_else(|| IpcError::Io("worker exited before it was ready".to_string()))?;
            match parse_event(&line)? {
                WorkerEvent::Ready => break,
                other => debug!("Worker event before ready: {:?}", other),
            }
        }

        let (requests, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let shared = Arc::new(ClientShared {
            requests,
            routes: Mutex::new(HashMap::new()),
            opening: Mutex::new(None),
            child: Mutex::new(None),
        });
        tokio::spawn(write_requests(writer, request_rx));
        tokio::spawn(dispatch_events(lines, Arc::downgrade(&shared)));
        Ok(Self { shared })
    }

    async fn send(&self, request: WorkerRequest) -> Result<(), IpcError> {
        self.shared
            .requests
            .send(request)
            .await
            .map_err(|_| IpcError::Closed)
    }

    /// Asks the worker to bring up its radio.
    pub async fn open(&self, hci_index: Option<u32>) -> Result<(), IpcError> {
        let (tx, rx) = oneshot::channel();
        *self.shared.opening.lock() = Some(tx);
        self.send(WorkerRequest::Open { hci_index }).await?;
        rx.await.map_err(|_| IpcError::Closed)?.map_err(IpcError::Worker)
    }

    /// Runs a session in the worker and mirrors its progress into `phase_tx`.
    pub async fn pair(
        &self,
        request: PairingRequest,
        cancel: CancellationToken,
        phase_tx: watch::Sender<SessionPhase>,
    ) -> Result<LiveSession, PairingFailure> {
        let slot = request.slot;
        let mut phase = SessionPhase::Idle;
        let (tx, mut updates) = mpsc::channel(PAIRING_QUEUE);
        self.shared.routes.lock().insert(slot, Route::Pairing(tx));

        let started = self
            .send(WorkerRequest::ScanConnect {
                slot_index: slot,
                target_address: request.target,
                exclude_addresses: request.exclude,
            })
            .await;
        if let Err(e) = started {
            self.shared.routes.lock().remove(&slot);
            return Err(PairingFailure {
                phase,
                error: PairingError::Worker(e.to_string()),
            });
        }

        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => {
                    self.release(slot).await;
                    return Err(PairingFailure { phase, error: PairingError::Cancelled });
                }
                update = updates.recv() => update,
            };
            match update {
                Some(PairingUpdate::Status(msg)) => {
                    if let Some(next) = SessionPhase::from_status(&msg) {
                        phase = next;
                        phase_tx.send_replace(next);
                    }
                }
                Some(PairingUpdate::Connected {
                    address,
                    reports,
                    events,
                }) => {
                    phase_tx.send_replace(SessionPhase::Streaming);
                    info!("Slot {}: worker connected {}", slot + 1, address);
                    return Ok(LiveSession {
                        link: BleLink::through_worker(self.clone(), slot, address),
                        slot,
                        reports,
                        events,
                        device_info: Vec::new(),
                        factory_calibration: Default::default(),
                        encrypted: true,
                        challenge_verified: false,
                    });
                }
                Some(PairingUpdate::Failed(error)) => return Err(PairingFailure { phase, error }),
                None => {
                    return Err(PairingFailure {
                        phase,
                        error: PairingError::Disconnected("radio worker exited".to_string()),
                    })
                }
            }
        }
    }

    pub async fn rumble(&self, slot: usize, packet: &[u8]) -> Result<(), IpcError> {
        self.send(WorkerRequest::Rumble {
            slot_index: slot,
            data: STANDARD.encode(packet),
        })
        .await
    }

    /// Ends the slot's session in the worker, connected or not.
    pub async fn release(&self, slot: usize) {
        self.shared.routes.lock().remove(&slot);
        let request = WorkerRequest::Disconnect {
            slot_index: Some(slot),
            address: None,
        };
        if let Err(e) = self.send(request).await {
            debug!("Slot {}: release not delivered: {}", slot + 1, e);
        }
    }

    /// Stops the worker and waits briefly for the process to exit.
    pub async fn shutdown(&self) {
        if let Err(e) = self.send(WorkerRequest::Shutdown).await {
            debug!("Radio worker shutdown not delivered: {}", e);
        }
        let child = self.shared.child.lock().take();
        let Some(mut child) = child else {
            return;
        };
        match tokio::time::timeout(WORKER_EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!("Radio worker exited: {}", status),
            Ok(Err(e)) => warn!("Waiting for radio worker: {}", e),
            Err(_) => {
                warn!("Radio worker did not exit, killing it");
                if let Err(e) = child.kill().await {
                    warn!("Killing radio worker: {}", e);
                }
            }
        }
    }
}

async fn write_requests<W: AsyncWrite + Unpin>(mut writer: W, mut requests: mpsc::Receiver<WorkerRequest>) {
    while let Some(request) = requests.recv().await {
        let line = match encode_line(&request) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping request {:?}: {}", request, e);
                continue;
            }
        };
        if let Err(e) = write_line(&mut writer, &line).await {
            warn!("Radio worker stopped accepting requests: {}", e);
            break;
        }
    }
}

async fn dispatch_events<R: AsyncBufRead + Unpin>(mut lines: Lines<R>, shared: Weak<ClientShared>) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Reading radio worker failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let event = match parse_event(line.trim()) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring radio worker output: {}", e);
                continue;
            }
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if let Some((tx, update)) = shared.route(event) {
            if tx.send(update).await.is_err() {
                debug!("Pairing update for a session that already ended");
            }
        }
    }
    warn!("Radio worker closed its output");
    if let Some(shared) = shared.upgrade() {
        shared.worker_gone();
    }
}
