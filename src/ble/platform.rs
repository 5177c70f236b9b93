//! [`BleTransport`] over the operating system's Bluetooth stack.
//!
//! The OS owns pairing and link encryption here and hides ATT handles, so handle writes are
//! translated through a [`GattLayout`] resolved when the link comes up. Sessions notice
//! [`BleTransport::manages_security`] and skip the controller's own key exchange.

use super::crypto::LinkKey;
use super::discovery::RSSI_UNKNOWN;
use super::gatt::{CharInfo, GattLayout, WriteAction};
use super::transport::{BleTransport, LinkEvent, TransportError};
use super::{Advertisement, BdAddr};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LINK_EVENT_QUEUE: usize = 16;

type Watchers = Arc<Mutex<HashMap<PeripheralId, mpsc::Sender<LinkEvent>>>>;
type Sinks = Arc<Mutex<HashMap<u16, mpsc::Sender<Vec<u8>>>>>;

struct Link {
    peripheral: Peripheral,
    layout: GattLayout,
    characteristics: Vec<Characteristic>,
    sinks: Sinks,
    pump: JoinHandle<()>,
}

impl Link {
    fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

pub struct PlatformTransport {
    adapter: Adapter,
    links: HashMap<BdAddr, Link>,
    watchers: Watchers,
    disconnects: JoinHandle<()>,
}

impl PlatformTransport {
    /// Opens the first adapter the OS reports.
    pub async fn open() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(unavailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(unavailable)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Unavailable("no Bluetooth adapter".to_string()))?;
        match adapter.adapter_info().await {
            Ok(name) => info!("Using Bluetooth adapter {}", name),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let watchers: Watchers = Arc::default();
        let events = adapter.events().await.map_err(unavailable)?;
        let disconnects = tokio::spawn(watch_disconnects(events, watchers.clone()));
        Ok(Self {
            adapter,
            links: HashMap::new(),
            watchers,
            disconnects,
        })
    }

    async fn find(&self, address: BdAddr) -> Result<Peripheral, TransportError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::ConnectFailed(address, e.to_string()))?;
        peripherals
            .into_iter()
            .find(|p| to_bd_addr(p.address()) == Some(address))
            .ok_or_else(|| TransportError::ConnectFailed(address, "not seen while scanning".to_string()))
    }

    fn link(&self, address: BdAddr) -> Result<&Link, TransportError> {
        self.links.get(&address).ok_or(TransportError::NotConnected(address))
    }

    async fn set_notifications(
        &self,
        address: BdAddr,
        source: u16,
        enable: bool,
    ) -> Result<(), TransportError> {
        let link = self.link(address)?;
        for uuid in link.layout.sources(source) {
            let Some(characteristic) = link.characteristic(uuid) else {
                continue;
            };
            let result = if enable {
                link.peripheral.subscribe(characteristic).await
            } else {
                link.peripheral.unsubscribe(characteristic).await
            };
            result.map_err(|e| TransportError::SubscribeFailed(source, e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for PlatformTransport {
    fn drop(&mut self) {
        self.disconnects.abort();
        for link in self.links.values() {
            link.pump.abort();
        }
    }
}

#[async_trait]
impl BleTransport for PlatformTransport {
    async fn local_address(&mut self) -> Option<BdAddr> {
        None
    }

    async fn start_scan(&mut self) -> Result<(), TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::ScanFailed(e.to_string()))
    }

    async fn scan_results(&mut self) -> Vec<Advertisement> {
        let peripherals = match self.adapter.peripherals().await {
            Ok(peripherals) => peripherals,
            Err(e) => {
                debug!("Listing peripherals failed: {}", e);
                return Vec::new();
            }
        };
        let mut seen = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let Some(address) = to_bd_addr(props.address) else {
                continue;
            };
            seen.push(Advertisement {
                address,
                name: props.local_name,
                rssi: props.rssi.unwrap_or(RSSI_UNKNOWN),
                manufacturer_ids: props.manufacturer_data.keys().copied().collect(),
            });
        }
        seen
    }

    async fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| TransportError::ScanFailed(e.to_string()))
    }

    async fn connect(&mut self, address: BdAddr) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
        if self.links.contains_key(&address) {
            self.disconnect(address).await?;
        }
        let fail = |e: btleplug::Error| TransportError::ConnectFailed(address, e.to_string());

        let peripheral = self.find(address).await?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await.map_err(fail)?;
        }
        peripheral.discover_services().await.map_err(fail)?;

        let characteristics: Vec<Characteristic> = peripheral.characteristics().into_iter().collect();
        let infos: Vec<CharInfo> = characteristics.iter().map(char_info).collect();
        let Some(layout) = GattLayout::resolve(&infos) else {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnecting {}: {}", address, e);
            }
            return Err(TransportError::ConnectFailed(
                address,
                "no controller service".to_string(),
            ));
        };
        debug!("{}: command channel {}", address, layout.command());

        let notifications = peripheral.notifications().await.map_err(fail)?;
        let sinks: Sinks = Arc::default();
        let pump = tokio::spawn(pump_notifications(notifications, layout.clone(), sinks.clone()));

        let (tx, rx) = mpsc::channel(LINK_EVENT_QUEUE);
        self.watchers.lock().insert(peripheral.id(), tx);
        self.links.insert(
            address,
            Link {
                peripheral,
                layout,
                characteristics,
                sinks,
                pump,
            },
        );
        Ok(rx)
    }

    async fn disconnect(&mut self, address: BdAddr) -> Result<(), TransportError> {
        let Some(link) = self.links.remove(&address) else {
            return Ok(());
        };
        link.pump.abort();
        self.watchers.lock().remove(&link.peripheral.id());
        if let Err(e) = link.peripheral.disconnect().await {
            debug!("Disconnecting {}: {}", address, e);
        }
        Ok(())
    }

    async fn is_encrypted(&mut self, address: BdAddr) -> bool {
        match self.links.get(&address) {
            Some(link) => link.peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn write(
        &mut self,
        address: BdAddr,
        handle: u16,
        data: Vec<u8>,
        with_response: bool,
    ) -> Result<(), TransportError> {
        let link = self.link(address)?;
        let action = link
            .layout
            .write_action(handle, data)
            .ok_or_else(|| TransportError::WriteFailed(handle, "no characteristic for handle".to_string()))?;
        match action {
            WriteAction::Write { uuid, data } => {
                let characteristic = link
                    .characteristic(uuid)
                    .ok_or_else(|| TransportError::WriteFailed(handle, format!("{} is gone", uuid)))?;
                let kind = write_type(characteristic.properties, with_response);
                link.peripheral
                    .write(characteristic, &data, kind)
                    .await
                    .map_err(|e| TransportError::WriteFailed(handle, e.to_string()))
            }
            WriteAction::Notify { source, enable } => {
                self.set_notifications(address, source, enable).await
            }
            WriteAction::Skip => Ok(()),
        }
    }

    async fn subscribe(
        &mut self,
        address: BdAddr,
        handle: u16,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), TransportError> {
        let link = self.link(address)?;
        if link.layout.sources(handle).is_empty() {
            return Err(TransportError::SubscribeFailed(
                handle,
                "no characteristic for handle".to_string(),
            ));
        }
        link.sinks.lock().insert(handle, sink);
        Ok(())
    }

    async fn unsubscribe(&mut self, address: BdAddr, handle: u16) -> Result<(), TransportError> {
        let link = self.link(address)?;
        link.sinks.lock().remove(&handle);
        self.set_notifications(address, handle, false).await
    }

    /// The OS encrypted the link while pairing with the controller; the key is not needed.
    async fn enable_encryption(&mut self, address: BdAddr, _key: LinkKey) -> Result<(), TransportError> {
        let link = self.link(address)?;
        if !link.peripheral.is_connected().await.unwrap_or(false) {
            return Err(TransportError::NotConnected(address));
        }
        let watcher = self.watchers.lock().get(&link.peripheral.id()).cloned();
        let Some(watcher) = watcher else {
            return Err(TransportError::NotConnected(address));
        };
        watcher
            .try_send(LinkEvent::EncryptionChanged { encrypted: true })
            .map_err(|e| TransportError::EncryptionFailed(e.to_string()))
    }

    fn manages_security(&self) -> bool {
        true
    }
}

fn unavailable(e: btleplug::Error) -> TransportError {
    TransportError::Unavailable(e.to_string())
}

fn to_bd_addr(address: BDAddr) -> Option<BdAddr> {
    address.to_string().parse().ok()
}

fn char_info(c: &Characteristic) -> CharInfo {
    CharInfo {
        service: c.service_uuid,
        uuid: c.uuid,
        notify: c
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
        write_without_response: c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
    }
}

fn write_type(properties: CharPropFlags, with_response: bool) -> WriteType {
    let can_ack = properties.contains(CharPropFlags::WRITE);
    let can_skip = properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE);
    if (with_response && can_ack) || !can_skip {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    }
}

/// Feeds every notification of one peripheral to the sink registered for its handle.
async fn pump_notifications<S>(mut notifications: S, layout: GattLayout, sinks: Sinks)
where
    S: Stream<Item = ValueNotification> + Unpin,
{
    while let Some(notification) = notifications.next().await {
        let Some(handle) = layout.handle_of(notification.uuid) else {
            continue;
        };
        let sink = sinks.lock().get(&handle).cloned();
        let Some(sink) = sink else {
            continue;
        };
        if let Err(TrySendError::Closed(_)) = sink.try_send(notification.value) {
            sinks.lock().remove(&handle);
        }
    }
    debug!("Notification stream ended");
}

async fn watch_disconnects<S>(mut events: S, watchers: Watchers)
where
    S: Stream<Item = CentralEvent> + Unpin,
{
    while let Some(event) = events.next().await {
        let CentralEvent::DeviceDisconnected(id) = event else {
            continue;
        };
        let watcher = watchers.lock().remove(&id);
        if let Some(watcher) = watcher {
            if watcher
                .try_send(LinkEvent::Disconnected {
                    reason: "link lost".to_string(),
                })
                .is_err()
            {
                debug!("Disconnect of {:?} had no listener", id);
            }
        }
    }
    warn!("Adapter event stream ended, disconnects will go unnoticed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_type_follows_characteristic_capabilities() {
        let both = CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE;
        assert_eq!(write_type(both, false), WriteType::WithoutResponse);
        assert_eq!(write_type(both, true), WriteType::WithResponse);
        assert_eq!(write_type(CharPropFlags::WRITE_WITHOUT_RESPONSE, true), WriteType::WithoutResponse);
        assert_eq!(write_type(CharPropFlags::WRITE, false), WriteType::WithResponse);
    }

    #[test]
    fn platform_addresses_convert_in_display_order() {
        let address = BDAddr::from([0x98, 0xB6, 0xE9, 0x11, 0x22, 0x33]);
        assert_eq!(to_bd_addr(address), Some("98:B6:E9:11:22:33".parse().unwrap()));
    }
}
