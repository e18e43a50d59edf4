//! The 13-byte little-endian per-direction monotonic counter nonce.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

pub const NONCE_LEN: usize = 13;

/// The nonce used only in pairing packets prior to REQUEST_ID.
pub const NULL_NONCE: Nonce = Nonce([0u8; NONCE_LEN]);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce([u8; NONCE_LEN]);

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({})", hex_string(&self.0))
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Nonce {
    pub const fn zero() -> Self {
        NULL_NONCE
    }

    pub const fn one() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[0] = 1;
        Nonce(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Nonce(bytes)
    }

    pub fn to_bytes(self) -> [u8; NONCE_LEN] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    /// Adds 1 to byte 0, carrying into higher bytes. Returns `true` if the
    /// full 104-bit counter wrapped (catastrophic, per spec.md §4.4: the
    /// pump's lifetime with this key material is over).
    #[must_use]
    pub fn increment(&mut self) -> bool {
        let mut carry = 1u16;

        for byte in self.0.iter_mut() {
            let sum = *byte as u16 + carry;
            *byte = sum as u8;
            carry = sum >> 8;

            if carry == 0 {
                return false;
            }
        }

        // carry survived past the most significant byte: the 104-bit counter wrapped.
        true
    }

    pub fn incremented(mut self) -> (Self, bool) {
        let wrapped = self.increment();
        (self, wrapped)
    }
}

impl PartialOrd for Nonce {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Nonce {
    fn cmp(&self, other: &Self) -> Ordering {
        // Compare as an unsigned little-endian integer: most significant byte last.
        for i in (0..NONCE_LEN).rev() {
            match self.0[i].cmp(&other.0[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_no_carry() {
        let mut n = Nonce::zero();
        assert!(!n.increment());
        assert_eq!(n, Nonce::one());
    }

    #[test]
    fn increment_carries_across_bytes() {
        let mut n = Nonce::from_bytes({
            let mut b = [0u8; NONCE_LEN];
            b[0] = 0xFF;
            b
        });

        assert!(!n.increment());

        let expected = {
            let mut b = [0u8; NONCE_LEN];
            b[1] = 1;
            b
        };

        assert_eq!(n.to_bytes(), expected);
    }

    #[test]
    fn full_wrap_is_detected() {
        let mut n = Nonce::from_bytes([0xFF; NONCE_LEN]);
        assert!(n.increment());
        assert_eq!(n, Nonce::zero());
    }

    #[test]
    fn ordering_is_little_endian_unsigned() {
        let low = Nonce::from_bytes({
            let mut b = [0u8; NONCE_LEN];
            b[0] = 0xFF;
            b
        });

        let high = Nonce::from_bytes({
            let mut b = [0u8; NONCE_LEN];
            b[1] = 1;
            b
        });

        assert!(low < high);
    }

    #[test]
    fn monotonic_sequence_matches_spec_property() {
        let mut n = Nonce::zero();
        let mut prev = n;

        for _ in 0..300 {
            let wrapped = n.increment();
            assert!(!wrapped);
            assert!(n > prev);
            prev = n;
        }
    }
}
