//! Transport-layer packet codec (spec.md §4.3).
//!
//! Wire layout: `header(4) || address(1) || nonce(13) || payload(N) || mac(8)`,
//! where `header` is `version(1) | commandByte(1) | payloadLength(2, LE)` and
//! `commandByte` packs the 7-bit command ID together with the sequence bit
//! (header bit 7) and reliability bit (header bit 6). Fixed overhead around
//! the payload is therefore 18 + 8 = 26 bytes, which is what spec.md's
//! worked fixture (scenario 1) serializes to; this implementation follows
//! the fixture over the prose restatement of the same invariant.

use crate::error::Error;
use crate::nonce::{Nonce, NONCE_LEN};

pub const PROTOCOL_VERSION: u8 = 0x10;
const FIXED_OVERHEAD: usize = 4 + 1 + NONCE_LEN; // header + address + nonce
const MAC_LEN: usize = crate::cipher::MAC_LEN;

/// The enumerated transport-layer command set. Values outside this set are
/// rejected with [`Error::InvalidCommandId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    RequestPairingConnection,
    PairingConnectionRequestAccepted,
    RequestKeys,
    GetAvailableKeys,
    KeyResponse,
    RequestId,
    IdResponse,
    RequestRegularConnection,
    RegularConnectionRequestAccepted,
    AckResponse,
    ErrorResponse,
    Disconnect,
    Data,
}

impl CommandId {
    pub fn raw(self) -> u8 {
        match self {
            CommandId::RequestPairingConnection => 0x09,
            CommandId::PairingConnectionRequestAccepted => 0x0A,
            CommandId::RequestKeys => 0x0C,
            CommandId::GetAvailableKeys => 0x0D,
            CommandId::KeyResponse => 0x0E,
            CommandId::RequestId => 0x0F,
            CommandId::IdResponse => 0x11,
            CommandId::RequestRegularConnection => 0x17,
            CommandId::RegularConnectionRequestAccepted => 0x18,
            CommandId::AckResponse => 0x05,
            CommandId::ErrorResponse => 0x06,
            CommandId::Disconnect => 0x04,
            CommandId::Data => 0x03,
        }
    }

    pub fn try_from_raw(raw: u8) -> Result<Self, Error> {
        Ok(match raw {
            0x09 => CommandId::RequestPairingConnection,
            0x0A => CommandId::PairingConnectionRequestAccepted,
            0x0C => CommandId::RequestKeys,
            0x0D => CommandId::GetAvailableKeys,
            0x0E => CommandId::KeyResponse,
            0x0F => CommandId::RequestId,
            0x11 => CommandId::IdResponse,
            0x17 => CommandId::RequestRegularConnection,
            0x18 => CommandId::RegularConnectionRequestAccepted,
            0x05 => CommandId::AckResponse,
            0x06 => CommandId::ErrorResponse,
            0x04 => CommandId::Disconnect,
            0x03 => CommandId::Data,
            other => return Err(Error::InvalidCommandId(other as u16)),
        })
    }

    /// Pairing packets (REQUEST_PAIRING_CONNECTION, PAIRING_CONNECTION_REQUEST_ACCEPTED,
    /// REQUEST_KEYS, GET_AVAILABLE_KEYS) are CRC-authenticated rather than MAC-authenticated.
    pub fn is_crc_authenticated(self) -> bool {
        matches!(
            self,
            CommandId::RequestPairingConnection
                | CommandId::PairingConnectionRequestAccepted
                | CommandId::RequestKeys
                | CommandId::GetAvailableKeys
        )
    }

    /// KEY_RESPONSE is MAC-authenticated, but with the weak cipher rather than CP/PC.
    pub fn uses_weak_cipher(self) -> bool {
        matches!(self, CommandId::KeyResponse)
    }
}

/// The 1-byte address field: high nibble is the source, low nibble the
/// destination, each in `0..=15`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub source: u8,
    pub destination: u8,
}

impl Address {
    pub const PAIRING: Address = Address { source: 0xF, destination: 0x0 };

    pub fn new(source: u8, destination: u8) -> Self {
        debug_assert!(source <= 0xF && destination <= 0xF);
        Address { source, destination }
    }

    pub fn raw(self) -> u8 {
        (self.source << 4) | self.destination
    }

    pub fn from_raw(raw: u8) -> Self {
        Address { source: raw >> 4, destination: raw & 0xF }
    }

    /// Swap source/destination, used to turn a KEY_RESPONSE's address (the
    /// pump's perspective) into the client's persisted `keyResponseAddress`.
    pub fn swapped(self) -> Self {
        Address { source: self.destination, destination: self.source }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlPacket {
    pub version: u8,
    pub command: CommandId,
    pub sequence_bit: bool,
    pub reliability_bit: bool,
    pub address: Address,
    pub nonce: Nonce,
    pub payload: Vec<u8>,
    pub mac: [u8; MAC_LEN],
}

impl TlPacket {
    /// Everything except the trailing MAC: what gets authenticated and
    /// what a CRC-authenticated pairing packet's header CRC is computed
    /// over (the first 5 bytes of this: version, command byte, payload
    /// length, address).
    pub fn header_and_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_OVERHEAD + self.payload.len());

        out.push(self.version);
        out.push(self.command_byte());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.push(self.address.raw());
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(&self.payload);

        out
    }

    fn command_byte(&self) -> u8 {
        self.command.raw() & 0x7F
            | (if self.sequence_bit { 1 << 7 } else { 0 })
            | (if self.reliability_bit { 1 << 6 } else { 0 })
    }

    /// The leading `version|commandByte|payloadLength|address|nonce` range
    /// (18 bytes, matching `FIXED_OVERHEAD`) that pairing packets
    /// authenticate with a payload-embedded CRC16; unlike `header_and_body`
    /// this excludes the payload itself, since for pairing packets the
    /// payload *is* the CRC.
    pub fn pairing_crc_header(&self) -> [u8; FIXED_OVERHEAD] {
        let mut header = [0u8; FIXED_OVERHEAD];
        header[0] = self.version;
        header[1] = self.command_byte();
        header[2..4].copy_from_slice(&(self.payload.len() as u16).to_le_bytes());
        header[4] = self.address.raw();
        header[5..].copy_from_slice(self.nonce.as_bytes());
        header
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.header_and_body();
        out.extend_from_slice(&self.mac);
        out
    }

    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < FIXED_OVERHEAD + MAC_LEN {
            return Err(Error::MalformedPacket(format!(
                "packet length {} shorter than minimum {}",
                raw.len(),
                FIXED_OVERHEAD + MAC_LEN
            )));
        }

        let version = raw[0];
        let command_byte = raw[1];
        let sequence_bit = command_byte & (1 << 7) != 0;
        let reliability_bit = command_byte & (1 << 6) != 0;
        let command = CommandId::try_from_raw(command_byte & 0x7F)?;

        let payload_len = u16::from_le_bytes([raw[2], raw[3]]) as usize;
        let address = Address::from_raw(raw[4]);

        let expected_len = FIXED_OVERHEAD + payload_len + MAC_LEN;
        if raw.len() != expected_len {
            return Err(Error::MalformedPacket(format!(
                "declared payload length {} implies total size {}, got {}",
                payload_len,
                expected_len,
                raw.len()
            )));
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&raw[5..5 + NONCE_LEN]);
        let nonce = Nonce::from_bytes(nonce_bytes);

        let payload_start = 5 + NONCE_LEN;
        let payload = raw[payload_start..payload_start + payload_len].to_vec();

        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&raw[payload_start + payload_len..]);

        Ok(TlPacket {
            version,
            command,
            sequence_bit,
            reliability_bit,
            address,
            nonce,
            payload,
            mac,
        })
    }
}
