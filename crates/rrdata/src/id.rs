// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! 256-bit rerecord identifiers.
//!
//! Identifiers order lexicographically (big-endian), wrap modulo 2^256 on
//! increment, and subtract with saturation to `u32::MAX` so run lengths fit
//! the wire format's counters.

use voicedeck_core::{Result, VoiceError};

/// Width of one identifier in bytes.
pub const ID_BYTES: usize = 32;

/// One load-session contribution to a movie's identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RerecordId([u8; ID_BYTES]);

impl RerecordId {
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// The next identifier, wrapping from all-ones to zero.
    pub fn succ(self) -> Self {
        self.wrapping_add(1)
    }

    /// Add a small increment modulo 2^256.
    pub fn wrapping_add(self, inc: u32) -> Self {
        let mut bytes = self.0;
        let mut carry = u64::from(inc);
        for byte in bytes.iter_mut().rev() {
            if carry == 0 {
                break;
            }
            let sum = u64::from(*byte) + carry;
            #[allow(clippy::cast_possible_truncation)]
            {
                *byte = (sum & 0xFF) as u8;
            }
            carry = sum >> 8;
        }
        Self(bytes)
    }

    /// `self - other` modulo 2^256, saturated to `u32::MAX` when the true
    /// difference does not fit 32 bits.
    pub fn saturating_diff(self, other: Self) -> u32 {
        let mut diff = [0u8; ID_BYTES];
        let mut borrow = 0u16;
        for i in (0..ID_BYTES).rev() {
            let a = u16::from(self.0[i]);
            let b = u16::from(other.0[i]) + borrow;
            if a >= b {
                #[allow(clippy::cast_possible_truncation)]
                {
                    diff[i] = (a - b) as u8;
                }
                borrow = 0;
            } else {
                #[allow(clippy::cast_possible_truncation)]
                {
                    diff[i] = (a + 0x100 - b) as u8;
                }
                borrow = 1;
            }
        }
        if diff[..ID_BYTES - 4].iter().any(|&b| b != 0) {
            return u32::MAX;
        }
        u32::from_be_bytes([diff[28], diff[29], diff[30], diff[31]])
    }
}

impl std::fmt::Display for RerecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for RerecordId {
    type Err = VoiceError;

    /// Parse a hex string. Shorter strings fill the identifier from the
    /// left, so a full 64-digit string is the round-trip of `Display`.
    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > 2 * ID_BYTES || s.len() % 2 != 0 {
            return Err(VoiceError::Configuration(format!("bad rerecord id '{s}'")));
        }
        let mut bytes = [0u8; ID_BYTES];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let chunk = std::str::from_utf8(chunk)
                .map_err(|_| VoiceError::Configuration(format!("bad rerecord id '{s}'")))?;
            bytes[i] = u8::from_str_radix(chunk, 16)
                .map_err(|_| VoiceError::Configuration(format!("bad rerecord id '{s}'")))?;
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn id(tail: u32) -> RerecordId {
        RerecordId::default().wrapping_add(tail)
    }

    #[test]
    fn test_succ_minus_self_is_one() {
        let x = id(41);
        assert_eq!(x.succ().saturating_diff(x), 1);
    }

    #[test]
    fn test_negative_diff_saturates() {
        let x = id(100);
        for n in [1u32, 7, 1000] {
            assert_eq!(x.saturating_diff(x.wrapping_add(n)), u32::MAX);
        }
    }

    #[test]
    fn test_wraps_from_all_ones() {
        let max = RerecordId::from_bytes([0xFF; ID_BYTES]);
        assert_eq!(max.succ(), RerecordId::default());
    }

    #[test]
    fn test_carry_propagation() {
        let x = RerecordId::from_str(
            "00000000000000000000000000000000000000000000000000000000000000FF",
        )
        .unwrap();
        let y = x.succ();
        assert_eq!(
            y.to_string(),
            "0000000000000000000000000000000000000000000000000000000000000100"
        );
    }

    #[test]
    fn test_large_diff_exact_below_saturation() {
        let x = id(0);
        let y = x.wrapping_add(u32::MAX);
        assert_eq!(y.saturating_diff(x), u32::MAX);
        let z = x.wrapping_add(1 << 20);
        assert_eq!(z.saturating_diff(x), 1 << 20);
    }

    #[test]
    fn test_display_from_str_roundtrip() {
        let x = id(0xDEAD_BEEF);
        let parsed: RerecordId = x.to_string().parse().unwrap();
        assert_eq!(parsed, x);
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        assert!(id(5) < id(9));
        let high = RerecordId::from_bytes({
            let mut b = [0u8; ID_BYTES];
            b[0] = 1;
            b
        });
        assert!(id(u32::MAX) < high);
    }
}
