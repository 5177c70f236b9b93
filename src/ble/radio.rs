//! Single owner of the BLE transport.
//!
//! All slots share one radio. [`RadioHandle`] serializes every call through a bounded command
//! queue into one worker task, so commands from different pairing sessions never interleave.

use super::crypto::LinkKey;
use super::transport::{BleTransport, LinkEvent, TransportError};
use super::{Advertisement, BdAddr};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

type Reply<T> = oneshot::Sender<Result<T, TransportError>>;

macro_rules! handle_command {
    ($action:expr, $reply:expr) => {
        if $reply.send($action.await).is_err() {
            debug!("Radio caller went away before the reply");
        }
    };
}

#[derive(Debug)]
enum RadioCommand {
    LocalAddress {
        reply: Reply<Option<BdAddr>>,
    },
    StartScan {
        reply: Reply<()>,
    },
    ScanResults {
        reply: Reply<Vec<Advertisement>>,
    },
    StopScan {
        reply: Reply<()>,
    },
    Connect {
        address: BdAddr,
        reply: Reply<mpsc::Receiver<LinkEvent>>,
    },
    Disconnect {
        address: BdAddr,
        reply: Reply<()>,
    },
    IsEncrypted {
        address: BdAddr,
        reply: Reply<bool>,
    },
    Write {
        address: BdAddr,
        handle: u16,
        data: Vec<u8>,
        with_response: bool,
        reply: Reply<()>,
    },
    Subscribe {
        address: BdAddr,
        handle: u16,
        sink: mpsc::Sender<Vec<u8>>,
        reply: Reply<()>,
    },
    Unsubscribe {
        address: BdAddr,
        handle: u16,
        reply: Reply<()>,
    },
    EnableEncryption {
        address: BdAddr,
        key: LinkKey,
        reply: Reply<()>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct RadioHandle {
    tx: mpsc::Sender<RadioCommand>,
    os_security: bool,
}

impl RadioHandle {
    pub fn spawn(transport: Box<dyn BleTransport>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<RadioCommand>(64);
        let os_security = transport.manages_security();
        let handle = tokio::spawn(run_radio(transport, rx));
        (Self { tx, os_security }, handle)
    }

    /// See [`BleTransport::manages_security`].
    pub fn manages_security(&self) -> bool {
        self.os_security
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> RadioCommand,
    ) -> Result<T, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| TransportError::WorkerStopped)?;
        rx.await.map_err(|_| TransportError::WorkerStopped)?
    }

    pub async fn local_address(&self) -> Result<Option<BdAddr>, TransportError> {
        self.request(|reply| RadioCommand::LocalAddress { reply }).await
    }

    pub async fn start_scan(&self) -> Result<(), TransportError> {
        self.request(|reply| RadioCommand::StartScan { reply }).await
    }

    pub async fn scan_results(&self) -> Result<Vec<Advertisement>, TransportError> {
        self.request(|reply| RadioCommand::ScanResults { reply }).await
    }

    pub async fn stop_scan(&self) -> Result<(), TransportError> {
        self.request(|reply| RadioCommand::StopScan { reply }).await
    }

    pub async fn connect(&self, address: BdAddr) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
        self.request(|reply| RadioCommand::Connect { address, reply })
            .await
    }

    pub async fn disconnect(&self, address: BdAddr) -> Result<(), TransportError> {
        self.request(|reply| RadioCommand::Disconnect { address, reply })
            .await
    }

    pub async fn is_encrypted(&self, address: BdAddr) -> Result<bool, TransportError> {
        self.request(|reply| RadioCommand::IsEncrypted { address, reply })
            .await
    }

    pub async fn write(
        &self,
        address: BdAddr,
        handle: u16,
        data: Vec<u8>,
        with_response: bool,
    ) -> Result<(), TransportError> {
        self.request(|reply| RadioCommand::Write {
            address,
            handle,
            data,
            with_response,
            reply,
        })
        .await
    }

    pub async fn subscribe(
        &self,
        address: BdAddr,
        handle: u16,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), TransportError> {
        self.request(|reply| RadioCommand::Subscribe {
            address,
            handle,
            sink,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(&self, address: BdAddr, handle: u16) -> Result<(), TransportError> {
        self.request(|reply| RadioCommand::Unsubscribe {
            address,
            handle,
            reply,
        })
        .await
    }

    pub async fn enable_encryption(&self, address: BdAddr, key: LinkKey) -> Result<(), TransportError> {
        self.request(|reply| RadioCommand::EnableEncryption {
            address,
            key,
            reply,
        })
        .await
    }

    pub async fn shutdown(&self) {
        if self.tx.send(RadioCommand::Shutdown).await.is_err() {
            debug!("Radio worker already stopped");
        }
    }
}

async fn run_radio(mut transport: Box<dyn BleTransport>, mut rx: mpsc::Receiver<RadioCommand>) {
    info!("BLE radio worker started");
    while let Some(command) = rx.recv().await {
        match command {
            RadioCommand::LocalAddress { reply } => {
                if reply.send(Ok(transport.local_address().await)).is_err() {
                    debug!("Radio caller went away before the reply");
                }
            }
            RadioCommand::StartScan { reply } => {
                handle_command!(transport.start_scan(), reply);
            }
            RadioCommand::ScanResults { reply } => {
                if reply.send(Ok(transport.scan_results().await)).is_err() {
                    debug!("Radio caller went away before the reply");
                }
            }
            RadioCommand::StopScan { reply } => {
                handle_command!(transport.stop_scan(), reply);
            }
            RadioCommand::Connect { address, reply } => {
                debug!("Radio: connect {}", address);
                handle_command!(transport.connect(address), reply);
            }
            RadioCommand::Disconnect { address, reply } => {
                debug!("Radio: disconnect {}", address);
                handle_command!(transport.disconnect(address), reply);
            }
            RadioCommand::IsEncrypted { address, reply } => {
                if reply.send(Ok(transport.is_encrypted(address).await)).is_err() {
                    debug!("Radio caller went away before the reply");
                }
            }
            RadioCommand::Write {
                address,
                handle,
                data,
                with_response,
                reply,
            } => {
                handle_command!(transport.write(address, handle, data, with_response), reply);
            }
            RadioCommand::Subscribe {
                address,
                handle,
                sink,
                reply,
            } => {
                handle_command!(transport.subscribe(address, handle, sink), reply);
            }
            RadioCommand::Unsubscribe {
                address,
                handle,
                reply,
            } => {
                handle_command!(transport.unsubscribe(address, handle), reply);
            }
            RadioCommand::EnableEncryption {
                address,
                key,
                reply,
            } => {
                handle_command!(transport.enable_encryption(address, key), reply);
            }
            RadioCommand::Shutdown => {
                info!("BLE radio worker shutting down");
                break;
            }
        }
    }
    debug!("BLE radio worker exited");
}
