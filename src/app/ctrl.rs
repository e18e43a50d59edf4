//! The CTRL service command table (spec.md §4.7), service ID `0x00`.
//!
//! Every CTRL command is sent reliably; each has a matching response
//! command ID except `CTRL_DISCONNECT`, whose TL-level ACK is the only
//! confirmation the pump gives.

use super::ServiceId;

pub const CTRL_CONNECT: u16 = 0x9055;
pub const CTRL_CONNECT_RESPONSE: u16 = 0xA055;

pub const CTRL_GET_SERVICE_VERSION: u16 = 0x9065;
pub const CTRL_SERVICE_VERSION_RESPONSE: u16 = 0xA065;

pub const CTRL_BIND: u16 = 0x9095;
pub const CTRL_BIND_RESPONSE: u16 = 0xA095;

pub const CTRL_DISCONNECT: u16 = 0x005A;

pub const CTRL_ACTIVATE_SERVICE: u16 = 0x9066;
pub const CTRL_ACTIVATE_SERVICE_RESPONSE: u16 = 0xA066;

pub const CTRL_DEACTIVATE_ALL_SERVICES: u16 = 0x906A;
pub const CTRL_ALL_SERVICES_DEACTIVATED: u16 = 0xA06A;

/// The sub-payload byte CTRL_BIND always sends; spec.md §9 notes its
/// meaning was never recovered from the reversed protocol.
const BIND_PAYLOAD_BYTE: u8 = 0x48;

pub fn connect_payload(client_software_version: u32) -> Vec<u8> {
    client_software_version.to_le_bytes().to_vec()
}

pub fn bind_payload() -> Vec<u8> {
    vec![BIND_PAYLOAD_BYTE]
}

pub fn activate_service_payload(service: ServiceId, version_major: u8, version_minor: u8) -> Vec<u8> {
    vec![service.raw(), version_major, version_minor]
}

/// Parses the 2-byte little-endian major/minor service version carried by
/// `CTRL_SERVICE_VERSION_RESPONSE`.
pub fn parse_service_version(sub_payload: &[u8]) -> Option<(u8, u8)> {
    match sub_payload {
        [major, minor, ..] => Some((*major, *minor)),
        _ => None,
    }
}
