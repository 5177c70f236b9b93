//! Boundary to the platform BLE stack.
//!
//! Implementations expose ATT handle access (raw, or mapped through [`super::gatt`]) and link
//! encryption; everything above this trait is platform independent. Calls are expected to return
//! promptly: outcomes that take time (disconnects, encryption changes) arrive as [`LinkEvent`]s.

use super::crypto::LinkKey;
use super::{Advertisement, BdAddr};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Radio unavailable: {0}")]
    Unavailable(String),
    #[error("Scan failed: {0}")]
    ScanFailed(String),
    #[error("Connection to {0} failed: {1}")]
    ConnectFailed(BdAddr, String),
    #[error("Not connected to {0}")]
    NotConnected(BdAddr),
    #[error("Write to handle 0x{0:04X} failed: {1}")]
    WriteFailed(u16, String),
    #[error("Subscription to handle 0x{0:04X} failed: {1}")]
    SubscribeFailed(u16, String),
    #[error("Encryption request failed: {0}")]
    EncryptionFailed(String),
    #[error("Radio worker stopped")]
    WorkerStopped,
}

/// Asynchronous link notifications for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Disconnected { reason: String },
    EncryptionChanged { encrypted: bool },
    EncryptionFailed { reason: String },
}

#[async_trait]
pub trait BleTransport: Send + 'static {
    /// Address of the local adapter, if the stack reports one.
    async fn local_address(&mut self) -> Option<BdAddr>;

    async fn start_scan(&mut self) -> Result<(), TransportError>;

    /// Everything seen since the scan started.
    async fn scan_results(&mut self) -> Vec<Advertisement>;

    async fn stop_scan(&mut self) -> Result<(), TransportError>;

    async fn connect(&mut self, address: BdAddr) -> Result<mpsc::Receiver<LinkEvent>, TransportError>;

    async fn disconnect(&mut self, address: BdAddr) -> Result<(), TransportError>;

    async fn is_encrypted(&mut self, address: BdAddr) -> bool;

    async fn write(
        &mut self,
        address: BdAddr,
        handle: u16,
        data: Vec<u8>,
        with_response: bool,
    ) -> Result<(), TransportError>;

    /// Routes notifications of `handle` into `sink`. Implementations drop values when the sink is full.
    async fn subscribe(
        &mut self,
        address: BdAddr,
        handle: u16,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, address: BdAddr, handle: u16) -> Result<(), TransportError>;

    /// Starts LE encryption; the outcome arrives as a [`LinkEvent`].
    async fn enable_encryption(&mut self, address: BdAddr, key: LinkKey) -> Result<(), TransportError>;

    /// `true` when the platform stack pairs and encrypts links itself. Sessions then skip the
    /// controller's proprietary key exchange.
    fn manages_security(&self) -> bool {
        false
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory radio that answers the controller command channel.

    use super::*;
    use crate::ble::crypto::{derive_ltk, expected_challenge_response};
    use crate::ble::protocol;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EncryptionBehavior {
        Accept,
        Reject,
        Ignore,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ProofBehavior {
        Valid,
        Garbage,
    }

    pub struct MockState {
        pub advertisements: Vec<Advertisement>,
        pub scanning: bool,
        pub links: HashMap<BdAddr, mpsc::Sender<LinkEvent>>,
        pub subscriptions: HashMap<(BdAddr, u16), mpsc::Sender<Vec<u8>>>,
        pub writes: Vec<(BdAddr, u16, Vec<u8>)>,
        pub encrypted: HashSet<BdAddr>,
        pub keys_tried: Vec<LinkKey>,
        pub encryption: EncryptionBehavior,
        pub proof: ProofBehavior,
        pub silent_commands: HashSet<u8>,
        pub connect_attempts: Vec<BdAddr>,
        pub os_security: bool,
        public_keys: HashMap<BdAddr, [u8; 16]>,
    }

    #[derive(Clone)]
    pub struct MockTransport {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        pub fn new(advertisements: Vec<Advertisement>) -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState {
                    advertisements,
                    scanning: false,
                    links: HashMap::new(),
                    subscriptions: HashMap::new(),
                    writes: Vec::new(),
                    encrypted: HashSet::new(),
                    keys_tried: Vec::new(),
                    encryption: EncryptionBehavior::Accept,
                    proof: ProofBehavior::Valid,
                    silent_commands: HashSet::new(),
                    connect_attempts: Vec::new(),
                    os_security: false,
                    public_keys: HashMap::new(),
                })),
            }
        }

        pub fn set_encryption(&self, behavior: EncryptionBehavior) {
            self.state.lock().encryption = behavior;
        }

        pub fn subscription_count(&self) -> usize {
            self.state.lock().subscriptions.len()
        }

        pub fn is_linked(&self, address: BdAddr) -> bool {
            self.state.lock().links.contains_key(&address)
        }

        /// Pushes a notification as if the controller had sent it.
        pub fn notify(&self, address: BdAddr, handle: u16, data: Vec<u8>) -> bool {
            let sink = self.state.lock().subscriptions.get(&(address, handle)).cloned();
            sink.map(|s| s.try_send(data).is_ok()).unwrap_or(false)
        }

        /// Simulates the controller dropping off.
        pub fn drop_link(&self, address: BdAddr) {
            let mut state = self.state.lock();
            state.subscriptions.retain(|(addr, _), _| *addr != address);
            state.encrypted.remove(&address);
            if let Some(link) = state.links.remove(&address) {
                let _ = link.try_send(LinkEvent::Disconnected {
                    reason: "connection timeout".to_string(),
                });
            }
        }

        fn respond(state: &mut MockState, address: BdAddr, command: &[u8]) {
            let Some(&cmd) = command.first() else {
                return;
            };
            if state.silent_commands.contains(&cmd) {
                return;
            }
            let mut response = vec![cmd, 0x01, 0x00, 0x00];
            match cmd {
                protocol::CMD_SPI_READ => {
                    response.resize(protocol::SPI_RESPONSE_HEADER, 0);
                    let mut block = vec![0u8; protocol::SPI_BLOCK as usize];
                    let address_field = command.get(12..16).unwrap_or(&[]);
                    if address_field == protocol::SPI_PAIRING_DATA.to_le_bytes() {
                        block[0x1A..0x2A].copy_from_slice(&[0x5A; 16]);
                    } else {
                        block.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
                    }
                    response.extend_from_slice(&block);
                }
                protocol::CMD_PAIRING => match command.get(3) {
                    Some(0x04) => {
                        let mut key = [0u8; 16];
                        key.copy_from_slice(&command[9..25]);
                        state.public_keys.insert(address, key);
                    }
                    Some(0x02) => {
                        let mut challenge = [0u8; 16];
                        challenge.copy_from_slice(&command[9..25]);
                        let proof = match (state.proof, state.public_keys.get(&address)) {
                            (ProofBehavior::Valid, Some(key)) => {
                                expected_challenge_response(&derive_ltk(key), &challenge)
                            }
                            _ => [0xEE; 16],
                        };
                        response.extend_from_slice(&proof);
                    }
                    _ => {}
                },
                _ => {}
            }
            if let Some(sink) = state.subscriptions.get(&(address, protocol::H_CMD_RESPONSE)) {
                let _ = sink.try_send(response);
            }
        }
    }

    #[async_trait]
    impl BleTransport for MockTransport {
        async fn local_address(&mut self) -> Option<BdAddr> {
            None
        }

        async fn start_scan(&mut self) -> Result<(), TransportError> {
            self.state.lock().scanning = true;
            Ok(())
        }

        async fn scan_results(&mut self) -> Vec<Advertisement> {
            let state = self.state.lock();
            if state.scanning {
                state.advertisements.clone()
            } else {
                Vec::new()
            }
        }

        async fn stop_scan(&mut self) -> Result<(), TransportError> {
            self.state.lock().scanning = false;
            Ok(())
        }

        async fn connect(&mut self, address: BdAddr) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
            let mut state = self.state.lock();
            state.connect_attempts.push(address);
            if !state.advertisements.iter().any(|ad| ad.address == address) {
                return Err(TransportError::ConnectFailed(address, "not found".to_string()));
            }
            let (tx, rx) = mpsc::channel(8);
            state.links.insert(address, tx);
            Ok(rx)
        }

        async fn disconnect(&mut self, address: BdAddr) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            state.subscriptions.retain(|(addr, _), _| *addr != address);
            state.encrypted.remove(&address);
            state.links.remove(&address);
            Ok(())
        }

        async fn is_encrypted(&mut self, address: BdAddr) -> bool {
            self.state.lock().encrypted.contains(&address)
        }

        async fn write(
            &mut self,
            address: BdAddr,
            handle: u16,
            data: Vec<u8>,
            _with_response: bool,
        ) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            if !state.links.contains_key(&address) {
                return Err(TransportError::NotConnected(address));
            }
            state.writes.push((address, handle, data.clone()));
            if handle == protocol::H_CMD_WRITE {
                Self::respond(&mut state, address, &data);
            }
            Ok(())
        }

        async fn subscribe(
            &mut self,
            address: BdAddr,
            handle: u16,
            sink: mpsc::Sender<Vec<u8>>,
        ) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            if !state.links.contains_key(&address) {
                return Err(TransportError::NotConnected(address));
            }
            state.subscriptions.insert((address, handle), sink);
            Ok(())
        }

        async fn unsubscribe(&mut self, address: BdAddr, handle: u16) -> Result<(), TransportError> {
            self.state.lock().subscriptions.remove(&(address, handle));
            Ok(())
        }

        async fn enable_encryption(&mut self, address: BdAddr, key: LinkKey) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            state.keys_tried.push(key);
            let event = match state.encryption {
                EncryptionBehavior::Accept => {
                    state.encrypted.insert(address);
                    Some(LinkEvent::EncryptionChanged { encrypted: true })
                }
                EncryptionBehavior::Reject => Some(LinkEvent::EncryptionFailed {
                    reason: "PIN or key missing".to_string(),
                }),
                EncryptionBehavior::Ignore => None,
            };
            if let (Some(event), Some(link)) = (event, state.links.get(&address)) {
                let _ = link.try_send(event);
            }
            Ok(())
        }

        fn manages_security(&self) -> bool {
            self.state.lock().os_security
        }
    }
}
