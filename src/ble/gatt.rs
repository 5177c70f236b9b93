//! Maps the controller's fixed ATT handles onto GATT characteristics.
//!
//! Platform stacks address characteristics by UUID and hide handles. The session still speaks in
//! handles, so a transport on such a stack resolves a [`GattLayout`] once per connection and asks
//! it where each handle write should go.

use super::protocol;
use crate::emulation::rumble::BLE_RUMBLE_HANDLE;
use uuid::Uuid;

/// Input report notifications.
pub const INPUT_REPORT_UUID: Uuid = Uuid::from_u128(0xab7de9be_89fe_49ad_828f_118f09df7fd2);
/// Command channel, written without response.
pub const COMMAND_WRITE_UUID: Uuid = Uuid::from_u128(0x649d4ac9_8eb7_4e6c_af44_1ea54fe5f005);

/// Services with fewer write-without-response characteristics than this are not the command
/// service.
const COMMAND_SERVICE_WRITABLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharInfo {
    pub service: Uuid,
    pub uuid: Uuid,
    pub notify: bool,
    pub write_without_response: bool,
}

/// What a handle write turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAction {
    Write { uuid: Uuid, data: Vec<u8> },
    /// Toggle notifications of the characteristics standing in for `source`.
    Notify { source: u16, enable: bool },
    /// The stack already did it.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattLayout {
    input: Uuid,
    command: Uuid,
    responses: Vec<Uuid>,
}

impl GattLayout {
    /// `chars` in discovery order, which stands in for handle order. `None` when the device does
    /// not look like a controller.
    pub fn resolve(chars: &[CharInfo]) -> Option<Self> {
        let input = chars
            .iter()
            .find(|c| c.uuid == INPUT_REPORT_UUID && c.notify)?;
        let command = chars
            .iter()
            .find(|c| c.uuid == COMMAND_WRITE_UUID)
            .or_else(|| command_by_position(chars))?;
        let responses = chars
            .iter()
            .filter(|c| c.service == command.service && c.notify && c.uuid != input.uuid)
            .map(|c| c.uuid)
            .collect();
        Some(Self {
            input: input.uuid,
            command: command.uuid,
            responses,
        })
    }

    pub fn command(&self) -> Uuid {
        self.command
    }

    /// Characteristics whose notifications stand in for `handle`.
    pub fn sources(&self, handle: u16) -> Vec<Uuid> {
        match handle {
            protocol::H_INPUT_REPORT => vec![self.input],
            protocol::H_CMD_RESPONSE => self.responses.clone(),
            _ => Vec::new(),
        }
    }

    /// Handle a notification of `uuid` is delivered under.
    pub fn handle_of(&self, uuid: Uuid) -> Option<u16> {
        if uuid == self.input {
            Some(protocol::H_INPUT_REPORT)
        } else if self.responses.contains(&uuid) {
            Some(protocol::H_CMD_RESPONSE)
        } else {
            None
        }
    }

    pub fn write_action(&self, handle: u16, data: Vec<u8>) -> Option<WriteAction> {
        let action = match handle {
            protocol::H_CMD_WRITE => WriteAction::Write {
                uuid: self.command,
                data,
            },
            // Rumble packets carry the motor state in their third byte.
            BLE_RUMBLE_HANDLE => WriteAction::Write {
                uuid: self.command,
                data: protocol::vibration(protocol::IFACE_BLE, data.get(2).is_some_and(|b| *b != 0)),
            },
            protocol::H_INPUT_CCCD => WriteAction::Notify {
                source: protocol::H_INPUT_REPORT,
                enable: data == protocol::CCCD_ENABLE,
            },
            protocol::H_CMD_RESP_CCCD => WriteAction::Notify {
                source: protocol::H_CMD_RESPONSE,
                enable: data == protocol::CCCD_ENABLE,
            },
            protocol::H_SVC1_ENABLE => WriteAction::Skip,
            _ => return None,
        };
        Some(action)
    }
}

/// Second write-without-response characteristic of the first service that has enough of them.
fn command_by_position(chars: &[CharInfo]) -> Option<&CharInfo> {
    let mut services: Vec<Uuid> = Vec::new();
    for c in chars {
        if !services.contains(&c.service) {
            services.push(c.service);
        }
    }
    services.into_iter().find_map(|service| {
        let writable: Vec<&CharInfo> = chars
            .iter()
            .filter(|c| c.service == service && c.write_without_response)
            .collect();
        (writable.len() >= COMMAND_SERVICE_WRITABLES).then(|| writable[1])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: Uuid = Uuid::from_u128(0x0000_0001_0000_1000_8000_00805f9b34fb);
    const OTHER_SERVICE: Uuid = Uuid::from_u128(0x0000_0002_0000_1000_8000_00805f9b34fb);

    fn notify(service: Uuid, uuid: Uuid) -> CharInfo {
        CharInfo {
            service,
            uuid,
            notify: true,
            write_without_response: false,
        }
    }

    fn writable(service: Uuid, uuid: u128) -> CharInfo {
        CharInfo {
            service,
            uuid: Uuid::from_u128(uuid),
            notify: false,
            write_without_response: true,
        }
    }

    #[test]
    fn known_characteristics_resolve_directly() {
        let response = Uuid::from_u128(0xc765a961_d9d8_4d36_a20a_5315b111836a);
        let layout = GattLayout::resolve(&[
            notify(SERVICE, INPUT_REPORT_UUID),
            writable(SERVICE, 0x10),
            writable(SERVICE, COMMAND_WRITE_UUID.as_u128()),
            notify(SERVICE, response),
            notify(OTHER_SERVICE, Uuid::from_u128(0x99)),
        ])
        .unwrap();
        assert_eq!(layout.command(), COMMAND_WRITE_UUID);
        assert_eq!(layout.sources(protocol::H_INPUT_REPORT), vec![INPUT_REPORT_UUID]);
        assert_eq!(layout.sources(protocol::H_CMD_RESPONSE), vec![response]);
        assert_eq!(layout.handle_of(response), Some(protocol::H_CMD_RESPONSE));
        assert_eq!(layout.handle_of(Uuid::from_u128(0x99)), None);
    }

    #[test]
    fn unknown_command_channel_is_the_second_writable_of_a_busy_service() {
        let layout = GattLayout::resolve(&[
            notify(OTHER_SERVICE, INPUT_REPORT_UUID),
            writable(OTHER_SERVICE, 0x01),
            writable(SERVICE, 0x11),
            writable(SERVICE, 0x12),
            writable(SERVICE, 0x13),
        ])
        .unwrap();
        assert_eq!(layout.command(), Uuid::from_u128(0x12));

        assert!(GattLayout::resolve(&[notify(SERVICE, INPUT_REPORT_UUID), writable(SERVICE, 0x11)]).is_none());
        assert!(GattLayout::resolve(&[writable(SERVICE, 0x11), writable(SERVICE, 0x12), writable(SERVICE, 0x13)]).is_none());
    }

    #[test]
    fn handle_writes_become_characteristic_operations() {
        let layout = GattLayout::resolve(&[
            notify(SERVICE, INPUT_REPORT_UUID),
            writable(SERVICE, COMMAND_WRITE_UUID.as_u128()),
        ])
        .unwrap();

        let led = protocol::set_led(protocol::IFACE_BLE, 0x01);
        assert_eq!(
            layout.write_action(protocol::H_CMD_WRITE, led.clone()),
            Some(WriteAction::Write {
                uuid: COMMAND_WRITE_UUID,
                data: led
            })
        );

        let mut packet = vec![0u8; 21];
        packet[1] = 0x53;
        packet[2] = 1;
        assert_eq!(
            layout.write_action(BLE_RUMBLE_HANDLE, packet),
            Some(WriteAction::Write {
                uuid: COMMAND_WRITE_UUID,
                data: protocol::vibration(protocol::IFACE_BLE, true)
            })
        );

        assert_eq!(
            layout.write_action(protocol::H_INPUT_CCCD, protocol::CCCD_ENABLE.to_vec()),
            Some(WriteAction::Notify {
                source: protocol::H_INPUT_REPORT,
                enable: true
            })
        );
        assert_eq!(
            layout.write_action(protocol::H_CMD_RESP_CCCD, protocol::CCCD_DISABLE.to_vec()),
            Some(WriteAction::Notify {
                source: protocol::H_CMD_RESPONSE,
                enable: false
            })
        );
        assert_eq!(layout.write_action(protocol::H_SVC1_ENABLE, vec![1]), Some(WriteAction::Skip));
        assert_eq!(layout.write_action(0x0042, vec![1]), None);
    }
}
