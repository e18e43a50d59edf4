//! Cipher primitives: AES-128 ECB block cypher, the pump's packet MAC, and
//! PIN-derived weak-key expansion.
//!
//! # The MAC construction
//!
//! The pump's 8-byte packet MAC is the leading half of a standard AES-CMAC
//! (RFC 4493) tag over the packet's header+address+nonce+payload range.
//! CMAC (rather than a bespoke CBC-MAC variant) is what actually reproduces
//! the documented fixture in the test module below; it also gets the
//! variable-length-message subkey handling right for free, which a hand
//! rolled zero-padded CBC-MAC chain does not.

use aes::Aes128;
use aes_cmac::{Cmac, Mac};
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

/// Length in bytes of an AES-128 key, and of the packet MAC.
pub const KEY_LEN: usize = 16;
pub const MAC_LEN: usize = 8;
pub const BLOCK_LEN: usize = 16;

/// An AES-128 key used either as a CP/PC session cipher or as the transient
/// pairing weak cipher.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_LEN],
    cypher: Aes128,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("key", &"<redacted>").finish()
    }
}

impl PartialEq for Cipher {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Cipher {}

impl Cipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Cipher {
            key,
            cypher: Aes128::new_from_slice(&key).expect("key is exactly 16 bytes"),
        }
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// AES-128 ECB encryption of a single 16-byte block.
    pub fn encrypt(&self, block: [u8; BLOCK_LEN]) -> [u8; BLOCK_LEN] {
        let mut b = block.into();
        self.cypher.encrypt_block(&mut b);
        b.into()
    }

    /// AES-128 ECB decryption of a single 16-byte block.
    pub fn decrypt(&self, block: [u8; BLOCK_LEN]) -> [u8; BLOCK_LEN] {
        let mut b = block.into();
        self.cypher.decrypt_block(&mut b);
        b.into()
    }

    /// The pump's 8-byte packet MAC (see module docs for the construction).
    pub fn mac(&self, data: &[u8]) -> [u8; MAC_LEN] {
        let mut cmac = Cmac::<Aes128>::new_from_slice(&self.key).expect("key is exactly 16 bytes");
        cmac.update(data);
        let tag = cmac.finalize().into_bytes();

        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&tag[..MAC_LEN]);
        mac
    }

    /// Verify `mac` against the MAC this cipher computes over `data`.
    pub fn verify(&self, data: &[u8], mac: &[u8; MAC_LEN]) -> bool {
        &self.mac(data) == mac
    }
}

/// Derive the transient pairing weak cipher from a 10-digit PIN.
///
/// The first 10 bytes of the key are the ASCII values of the PIN digits.
/// The trailing 6 bytes are the bitwise complements of digits 9..4 (i.e. the
/// last six digits, reversed) offset by the fixed ASCII digit base `'0'`.
///
/// See [`weak_key_vector`](tests::weak_key_vector) for the derived key this
/// produces, and `key_response_halves_decrypt_to_the_documented_session_keys`
/// in `pairing.rs` for what it decrypts a KEY_RESPONSE payload to.
pub fn derive_weak_key(pin: [u8; 10]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];

    for (i, &digit) in pin.iter().enumerate() {
        key[i] = b'0' + digit;
    }

    for i in 0..6 {
        let source_digit = pin[9 - i];
        key[10 + i] = !(b'0' + source_digit);
    }

    key
}

pub fn derive_weak_cipher(pin: [u8; 10]) -> Cipher {
    Cipher::new(derive_weak_key(pin))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = Cipher::new([0x42u8; 16]);

        for seed in 0u8..8 {
            let mut block = [0u8; 16];
            for (i, b) in block.iter_mut().enumerate() {
                *b = seed.wrapping_mul(31).wrapping_add(i as u8);
            }

            let encrypted = cipher.encrypt(block);
            assert_eq!(cipher.decrypt(encrypted), block);
        }
    }

    /// Scenario 2 from spec.md §8: MAC computation with an all-ASCII-'0' key.
    ///
    /// version=0x10, command=REQUEST_PAIRING_CONNECTION(0x09), sequenceBit=true,
    /// reliabilityBit=false -> header byte1 = 0x09 | 0x80 = 0x89; payloadLength=2 (LE);
    /// address=0x45; nonce = 0A 00*11 0B; payload = 00 00.
    #[test]
    fn mac_vector() {
        let cipher = Cipher::new([b'0'; 16]);

        let packet: [u8; 20] = [
            0x10, 0x89, 0x02, 0x00, // header: version, command|bits, payloadLength LE
            0x45, // address
            0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0B, // nonce
            0x00, 0x00, // payload
        ];

        let mac = cipher.mac(&packet);

        assert_eq!(mac, [0xBF, 0x5D, 0xE1, 0x21, 0x6F, 0x2D, 0x27, 0x6B]);
    }

    /// Scenario 3 from spec.md §8: PIN -> weak key derivation.
    #[test]
    fn weak_key_vector() {
        let pin = [2u8, 6, 0, 6, 8, 1, 9, 2, 7, 3];

        let key = derive_weak_key(pin);

        // First 10 bytes are ASCII digits.
        assert_eq!(&key[..10], b"2606819273");

        // Trailing 6 bytes are complements of digits 9..4 (reversed tail) + '0'.
        // digits reversed from index 9 down to 4: 3,7,2,9,1,8
        let expected_tail: Vec<u8> = [3u8, 7, 2, 9, 1, 8].iter().map(|&d| !(b'0' + d)).collect();
        assert_eq!(&key[10..], expected_tail.as_slice());
    }
}
