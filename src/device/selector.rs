use log::debug;
use uuid::Uuid;

use crate::device::constants::{
    BLOCKED_CHARACTERISTICS, DEVICE_INFORMATION_SERVICE, DEVICE_TO_HOST_PREFIX, FALLBACK_SERVICE,
    HOST_TO_DEVICE_PREFIX,
};
use crate::device::types::{CharacteristicInfo, Endpoint, EndpointDirection};

// Bluetooth base uuid 0000xxxx-0000-1000-8000-00805f9b34fb with the 16-bit id masked out
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const SHORT_ID_MASK: u128 = 0xffff_ffff_u128 << 96;

/// The 16-bit id of a uuid derived from the bluetooth base uuid.
pub fn short_id(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let short = value >> 96;

    if value & !SHORT_ID_MASK == BLUETOOTH_BASE_UUID && short <= u16::MAX as u128 {
        Some(short as u16)
    } else {
        None
    }
}

/// The first 32 bits of a uuid.
pub fn uuid_prefix(uuid: &Uuid) -> u32 {
    (uuid.as_u128() >> 96) as u32
}

fn is_blocked(characteristic: &CharacteristicInfo) -> bool {
    if short_id(&characteristic.service_uuid) == Some(DEVICE_INFORMATION_SERVICE) {
        return true;
    }

    match short_id(&characteristic.uuid) {
        Some(id) => BLOCKED_CHARACTERISTICS.contains(&id),
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSelection {
    pub command: Endpoint,
    pub heartbeat: Option<Endpoint>,
}

#[derive(Clone, Copy)]
enum CommandMatch {
    Fallback(Endpoint),
    Preferred(Endpoint),
}

/// Picks the command (write) endpoint and the optional heartbeat (notify) endpoint from the
/// characteristics of every service, in enumeration order.
///
/// The host -> device characteristic always wins. Without it, the first writable characteristic of
/// the fallback service is used. Any other writable characteristic is ignored. Returns `None` when
/// nothing can carry a command.
pub fn select_endpoints(characteristics: &[CharacteristicInfo]) -> Option<EndpointSelection> {
    let mut command: Option<CommandMatch> = None;
    let mut heartbeat: Option<Endpoint> = None;

    for characteristic in characteristics {
        let prefix = uuid_prefix(&characteristic.uuid);

        if heartbeat.is_none() && characteristic.supports_notify() && prefix == DEVICE_TO_HOST_PREFIX {
            debug!("Heartbeat candidate {}", characteristic.uuid);
            heartbeat = Some(Endpoint {
                uuid: characteristic.uuid,
                service_uuid: characteristic.service_uuid,
                direction: EndpointDirection::Notify,
            });
        }

        if !characteristic.supports_write() {
            continue;
        }

        if is_blocked(characteristic) {
            debug!("Skipping standard characteristic {}", characteristic.uuid);
            continue;
        }

        let endpoint = Endpoint {
            uuid: characteristic.uuid,
            service_uuid: characteristic.service_uuid,
            direction: EndpointDirection::Write,
        };

        if prefix == HOST_TO_DEVICE_PREFIX {
            if !matches!(command, Some(CommandMatch::Preferred(_))) {
                debug!("Command candidate {} (host -> device)", characteristic.uuid);
                command = Some(CommandMatch::Preferred(endpoint));
            }
        } else if command.is_none() && short_id(&characteristic.service_uuid) == Some(FALLBACK_SERVICE) {
            debug!("Command candidate {} (fallback service)", characteristic.uuid);
            command = Some(CommandMatch::Fallback(endpoint));
        }
    }

    let command = match command? {
        CommandMatch::Fallback(endpoint) | CommandMatch::Preferred(endpoint) => endpoint,
    };

    Some(EndpointSelection { command, heartbeat })
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::CharPropFlags;

    const CUSTOM_SERVICE: &str = "2d30c082-f39f-4ce6-923f-3484ea480596";
    const DEVICE_TO_HOST: &str = "2d30c082-f39f-4ce6-923f-3484ea480596";
    const HOST_TO_DEVICE: &str = "2d30c083-f39f-4ce6-923f-3484ea480596";
    const DISCONNECT: &str = "2d30c084-f39f-4ce6-923f-3484ea480596";

    fn short(id: u16) -> Uuid {
        Uuid::from_u128(BLUETOOTH_BASE_UUID | ((id as u128) << 96))
    }

    fn characteristic(service: Uuid, uuid: Uuid, properties: CharPropFlags) -> CharacteristicInfo {
        CharacteristicInfo { service_uuid: service, uuid, properties }
    }

    fn parse(uuid: &str) -> Uuid {
        Uuid::parse_str(uuid).unwrap()
    }

    fn rfduino_gatt() -> Vec<CharacteristicInfo> {
        let custom = parse(CUSTOM_SERVICE);
        vec![
            characteristic(short(0x1800), short(0x2a00), CharPropFlags::READ | CharPropFlags::WRITE),
            characteristic(short(0x1800), short(0x2a01), CharPropFlags::READ | CharPropFlags::WRITE),
            characteristic(short(0x1800), short(0x2a04), CharPropFlags::READ | CharPropFlags::WRITE),
            characteristic(short(0x180a), short(0x2a29), CharPropFlags::READ | CharPropFlags::WRITE),
            characteristic(short(0xfe84), parse(DEVICE_TO_HOST), CharPropFlags::NOTIFY),
            characteristic(short(0xfe84), parse(DISCONNECT), CharPropFlags::WRITE),
            characteristic(custom, parse(HOST_TO_DEVICE), CharPropFlags::WRITE_WITHOUT_RESPONSE),
        ]
    }

    #[test]
    fn short_ids() {
        assert_eq!(short_id(&short(0x2a00)), Some(0x2a00));
        assert_eq!(short_id(&short(0xfe84)), Some(0xfe84));
        assert_eq!(short_id(&parse(HOST_TO_DEVICE)), None);
        assert_eq!(uuid_prefix(&parse(HOST_TO_DEVICE)), HOST_TO_DEVICE_PREFIX);
    }

    #[test]
    fn prefers_host_to_device_over_earlier_fallback() {
        let selection = select_endpoints(&rfduino_gatt()).expect("no selection");

        assert_eq!(selection.command.uuid, parse(HOST_TO_DEVICE));
        assert_eq!(selection.command.direction, EndpointDirection::Write);
        let heartbeat = selection.heartbeat.expect("no heartbeat");
        assert_eq!(heartbeat.uuid, parse(DEVICE_TO_HOST));
        assert_eq!(heartbeat.direction, EndpointDirection::Notify);
    }

    #[test]
    fn falls_back_to_first_writable_of_fallback_service() {
        let characteristics: Vec<_> = rfduino_gatt()
            .into_iter()
            .filter(|c| c.uuid != parse(HOST_TO_DEVICE))
            .collect();

        let selection = select_endpoints(&characteristics).expect("no selection");
        assert_eq!(selection.command.uuid, parse(DISCONNECT));
        assert_eq!(selection.command.service_uuid, short(0xfe84));
    }

    #[test]
    fn never_selects_standard_characteristics() {
        let characteristics = vec![
            characteristic(short(0xfe84), short(0x2a00), CharPropFlags::WRITE),
            characteristic(short(0x180a), short(0x2a29), CharPropFlags::WRITE),
            characteristic(short(0xfe84), short(0x2a04), CharPropFlags::WRITE_WITHOUT_RESPONSE),
        ];
        assert_eq!(select_endpoints(&characteristics), None);
    }

    #[test]
    fn ignores_unrelated_writable_characteristics() {
        let characteristics = vec![
            characteristic(short(0x1234), short(0x5678), CharPropFlags::WRITE),
            characteristic(short(0x1234), parse(DEVICE_TO_HOST), CharPropFlags::NOTIFY),
        ];
        assert_eq!(select_endpoints(&characteristics), None);
    }

    #[test]
    fn heartbeat_requires_notify() {
        let custom = parse(CUSTOM_SERVICE);
        let characteristics = vec![
            characteristic(custom, parse(DEVICE_TO_HOST), CharPropFlags::READ),
            characteristic(custom, parse(HOST_TO_DEVICE), CharPropFlags::WRITE),
        ];

        let selection = select_endpoints(&characteristics).expect("no selection");
        assert_eq!(selection.heartbeat, None);
    }

    #[test]
    fn first_preferred_match_is_kept() {
        let first = Uuid::parse_str("2d30c083-0000-0000-0000-000000000001").unwrap();
        let second = Uuid::parse_str("2d30c083-0000-0000-0000-000000000002").unwrap();
        let characteristics = vec![
            characteristic(short(0xfe84), first, CharPropFlags::WRITE),
            characteristic(short(0xfe84), second, CharPropFlags::WRITE),
        ];

        for _ in 0..3 {
            let selection = select_endpoints(&characteristics).expect("no selection");
            assert_eq!(selection.command.uuid, first);
        }
    }
}
