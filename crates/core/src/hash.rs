//! Content-addressed hashing using BLAKE3, plus the rolling weak checksum
//! used for delta block matching

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A content hash using BLAKE3 (256-bit)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap a raw 32-byte digest
    #[must_use]
    pub fn from_raw(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    /// Hash a file by path
    ///
    /// # Errors
    /// Returns an error if the file cannot be read
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Hash everything a reader yields
    ///
    /// # Errors
    /// Returns an error if reading fails
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut hasher = blake3::Hasher::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentHash({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", hex.get(..16).unwrap_or(&hex))
    }
}

/// Rolling weak checksum for delta block matching.
///
/// Two 16-bit components: `a` is the byte sum, `b` the sum of running prefix
/// sums, both mod 2^16. The combined value is `a | (b << 16)`. Sliding the
/// window one byte is O(1) via [`roll`](Self::roll).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RollingSum {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingSum {
    /// Compute the checksum of a full block
    #[must_use]
    pub fn from_block(block: &[u8]) -> Self {
        let mut a = 0u32;
        let mut b = 0u32;
        for &byte in block {
            a = a.wrapping_add(u32::from(byte)) & 0xffff;
            b = b.wrapping_add(a) & 0xffff;
        }
        Self {
            a,
            b,
            len: block.len() as u32,
        }
    }

    /// Slide the window one byte: drop `out`, append `inb`.
    ///
    /// The window length is fixed at whatever [`from_block`](Self::from_block)
    /// saw.
    #[inline]
    pub fn roll(&mut self, out: u8, inb: u8) {
        self.a = self
            .a
            .wrapping_sub(u32::from(out))
            .wrapping_add(u32::from(inb))
            & 0xffff;
        self.b = self
            .b
            .wrapping_sub(self.len.wrapping_mul(u32::from(out)))
            .wrapping_add(self.a)
            & 0xffff;
    }

    /// Combined 32-bit value, used as the lookup key
    #[must_use]
    pub fn value(&self) -> u32 {
        self.a | (self.b << 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_deterministic() {
        let data = b"hello world";
        let h1 = ContentHash::from_bytes(data);
        let h2 = ContentHash::from_bytes(data);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_content_hash_different_data() {
        let h1 = ContentHash::from_bytes(b"hello");
        let h2 = ContentHash::from_bytes(b"world");
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_from_reader_matches_from_bytes() {
        let data = b"reader and slice must agree".repeat(1000);
        let from_reader = ContentHash::from_reader(&data[..]).unwrap();
        assert_eq!(from_reader, ContentHash::from_bytes(&data));
    }

    #[test]
    fn test_rolling_sum_components() {
        // a = sum of bytes, b = sum of prefix sums, both mod 2^16
        let sum = RollingSum::from_block(&[1, 2, 3]);
        assert_eq!(sum.value() & 0xffff, 6);
        assert_eq!(sum.value() >> 16, 1 + 3 + 6);
    }

    #[test]
    fn test_roll_matches_recompute() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let window = 512;

        let mut rolling = RollingSum::from_block(&data[..window]);
        for start in 1..(data.len() - window) {
            rolling.roll(data[start - 1], data[start + window - 1]);
            let fresh = RollingSum::from_block(&data[start..start + window]);
            assert_eq!(rolling.value(), fresh.value(), "window at {start}");
        }
    }

    #[test]
    fn test_swapped_bytes_differ() {
        // b weights bytes by position, so swapping two distinct bytes changes it
        let x = RollingSum::from_block(b"ab");
        let y = RollingSum::from_block(b"ba");
        assert_eq!(x.value() & 0xffff, y.value() & 0xffff);
        assert_ne!(x.value(), y.value());
    }
}
