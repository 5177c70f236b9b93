//! BLE side of the bridge
//!
//! The radio is a single shared resource: [`radio::RadioHandle`] owns the transport inside one
//! actor task and every slot's [`session::PairingSession`] talks to it through that handle. The
//! session walks the controller's proprietary bring-up (handshake, key derivation, link
//! encryption, feature setup) and ends in a [`session::LiveSession`] that streams input reports.
//! The same sessions can run in a separate radio worker process, see [`ipc`].

pub mod crypto;
pub mod discovery;
pub mod gatt;
pub mod ipc;
#[cfg(feature = "ble")]
pub mod platform;
pub mod protocol;
pub mod radio;
pub mod session;
pub mod transport;

pub use discovery::Advertisement;
pub use ipc::WorkerClient;
pub use radio::RadioHandle;
pub use session::{LiveSession, PairingFailure, PairingRequest, PairingTimings, SessionPhase};
pub use transport::{BleTransport, LinkEvent, TransportError};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Where sessions run: on a radio this process owns, or inside a radio worker process.
#[derive(Debug, Clone)]
pub enum BleBackend {
    Local(RadioHandle),
    Worker(WorkerClient),
}

impl BleBackend {
    pub async fn pair(
        &self,
        request: PairingRequest,
        timings: PairingTimings,
        cancel: CancellationToken,
        phase_tx: watch::Sender<SessionPhase>,
    ) -> Result<LiveSession, PairingFailure> {
        match self {
            BleBackend::Local(radio) => session::pair(radio.clone(), request, timings, cancel, phase_tx).await,
            // The worker applies its own timings.
            BleBackend::Worker(client) => client.pair(request, cancel, phase_tx).await,
        }
    }

    pub async fn shutdown(&self) {
        if let BleBackend::Worker(client) = self {
            client.shutdown().await;
        }
    }
}

impl From<RadioHandle> for BleBackend {
    fn from(radio: RadioHandle) -> Self {
        BleBackend::Local(radio)
    }
}

impl From<WorkerClient> for BleBackend {
    fn from(client: WorkerClient) -> Self {
        BleBackend::Worker(client)
    }
}

/// Bluetooth device address, stored most significant byte first (display order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// Used when the radio cannot report its own address.
    pub const FALLBACK_LOCAL: BdAddr = BdAddr([0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5]);

    /// Wire order (least significant byte first).
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    pub fn oui(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid Bluetooth address: {0}")]
pub struct AddrParseError(String);

impl FromStr for BdAddr {
    type Err = AddrParseError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, optionally with a `/P` or `/R` address type suffix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bare = trimmed
            .strip_suffix("/P")
            .or_else(|| trimmed.strip_suffix("/R"))
            .unwrap_or(trimmed);

        let mut bytes = [0u8; 6];
        let mut parts = bare.split([':', '-']);
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| AddrParseError(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddrParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddrParseError(s.to_string()));
        }
        Ok(BdAddr(bytes))
    }
}

impl Serialize for BdAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BdAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_strips_type_suffix() {
        let addr: BdAddr = "98:B6:E9:01:02:03/P".parse().unwrap();
        assert_eq!(addr, BdAddr([0x98, 0xB6, 0xE9, 0x01, 0x02, 0x03]));
        assert_eq!(addr.to_string(), "98:B6:E9:01:02:03");
        assert_eq!(addr.oui(), [0x98, 0xB6, 0xE9]);
        assert!("98:B6:E9:01:02".parse::<BdAddr>().is_err());
        assert!("98:B6:E9:01:02:03:04".parse::<BdAddr>().is_err());
        assert!("zz:B6:E9:01:02:03".parse::<BdAddr>().is_err());
    }

    #[test]
    fn wire_order_is_reversed() {
        assert_eq!(
            BdAddr::FALLBACK_LOCAL.to_le_bytes(),
            [0xF5, 0xF4, 0xF3, 0xF2, 0xF1, 0xF0]
        );
    }
}
