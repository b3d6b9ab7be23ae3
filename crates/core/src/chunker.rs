//! Content-defined chunking with a gear rolling hash.
//!
//! Boundaries depend only on nearby content, so an insertion in one region
//! does not shift cut points elsewhere. The gear table and mask layout are
//! part of the store format: chunk hashes produced on one machine must match
//! chunks produced from the same bytes anywhere else.

use std::io::Read;

use crate::error::Result;
use crate::hash::ContentHash;

/// Seed for the gear table. Fixed forever: changing it changes every cut
/// point and therefore every chunk hash in existing stores.
const GEAR_SEED: u64 = 0x9ae1_6a3b_2f90_404f;

const fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

const fn gear_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = GEAR_SEED;
    let mut i = 0;
    while i < 256 {
        table[i] = splitmix64(&mut state);
        i += 1;
    }
    table
}

static GEAR: [u64; 256] = gear_table();

/// Configuration for content-defined chunking
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ChunkConfig {
    /// Minimum chunk size in bytes
    pub min_size: u32,
    /// Average (expected) chunk size in bytes, must be a power of two
    pub avg_size: u32,
    /// Maximum chunk size in bytes
    pub max_size: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_size: 8 * 1024,
            avg_size: 16 * 1024,
            max_size: 64 * 1024,
        }
    }
}

impl ChunkConfig {
    /// Check the parameter invariants: `0 < min < avg <= max`, `avg` a power
    /// of two.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when a bound is violated
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.min_size >= self.avg_size || self.avg_size > self.max_size {
            return Err(crate::Error::invalid_argument(format!(
                "chunk sizes must satisfy 0 < min < avg <= max, got {}/{}/{}",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        if !self.avg_size.is_power_of_two() {
            return Err(crate::Error::invalid_argument(format!(
                "avg_size must be a power of two, got {}",
                self.avg_size
            )));
        }
        Ok(())
    }

    /// Strict mask, used before `avg_size` bytes: `log2(avg) + 1` one-bits in
    /// the high end of the word, so cuts are less likely early.
    fn mask_strict(&self) -> u64 {
        mask_with_bits(self.avg_size.trailing_zeros() + 1)
    }

    /// Lenient mask, used from `avg_size` on: one bit fewer.
    fn mask_lenient(&self) -> u64 {
        mask_with_bits(self.avg_size.trailing_zeros())
    }
}

fn mask_with_bits(bits: u32) -> u64 {
    debug_assert!(bits > 0 && bits < 64);
    (!0u64) << (64 - bits)
}

/// A content-defined chunk with its location and hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Chunk {
    /// Byte offset in the source data
    pub offset: u64,
    /// Length of this chunk in bytes
    pub length: u32,
    /// BLAKE3 hash of the chunk content
    pub hash: ContentHash,
}

/// Length of the next chunk starting at `data[0]`.
///
/// `data` must hold at most `max_size` bytes; a full buffer that yields no
/// cut is cut at `max_size`, a short buffer (end of stream) at its end.
fn next_cut(data: &[u8], config: &ChunkConfig) -> usize {
    let len = data.len();
    let min = config.min_size as usize;
    let avg = config.avg_size as usize;
    if len <= min {
        return len;
    }

    // The first min_size bytes are skipped entirely, guaranteeing the
    // minimum length without hashing them.
    let mut hash = 0u64;
    let strict = config.mask_strict();
    let lenient = config.mask_lenient();

    for (i, &byte) in data.iter().enumerate().skip(min).take(len - min) {
        hash = (hash << 1).wrapping_add(GEAR[byte as usize]);
        let mask = if i < avg { strict } else { lenient };
        if hash & mask == 0 {
            return i + 1;
        }
    }
    len
}

/// Chunk a byte slice into content-defined pieces.
///
/// Returns an iterator over chunks, allowing lazy evaluation and chaining.
pub fn chunk_data<'a>(data: &'a [u8], config: &ChunkConfig) -> impl Iterator<Item = Chunk> + 'a {
    let config = *config;
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset >= data.len() {
            return None;
        }
        let window_end = (offset + config.max_size as usize).min(data.len());
        let cut = next_cut(&data[offset..window_end], &config);
        let chunk_bytes = &data[offset..offset + cut];
        let chunk = Chunk {
            offset: offset as u64,
            length: cut as u32,
            hash: ContentHash::from_bytes(chunk_bytes),
        };
        offset += cut;
        Some(chunk)
    })
}

/// Chunk everything a reader yields, handing each chunk's bytes to `sink`
/// before moving on. The updater uses the sink to store chunk bytes without
/// reading the file twice.
///
/// # Errors
/// Returns an error if reading fails or the sink rejects a chunk
pub fn chunk_reader<R: Read>(
    mut reader: R,
    config: &ChunkConfig,
    mut sink: impl FnMut(&Chunk, &[u8]) -> Result<()>,
) -> Result<Vec<Chunk>> {
    let max = config.max_size as usize;
    let mut buffer: Vec<u8> = Vec::with_capacity(2 * max);
    let mut read_buf = [0u8; 64 * 1024];
    let mut eof = false;
    let mut offset = 0u64;
    let mut chunks = Vec::new();

    loop {
        while !eof && buffer.len() < max {
            let n = reader.read(&mut read_buf)?;
            if n == 0 {
                eof = true;
            } else {
                buffer.extend_from_slice(&read_buf[..n]);
            }
        }
        if buffer.is_empty() {
            break;
        }

        let window_end = max.min(buffer.len());
        let cut = next_cut(&buffer[..window_end], config);
        let chunk = Chunk {
            offset,
            length: cut as u32,
            hash: ContentHash::from_bytes(&buffer[..cut]),
        };
        sink(&chunk, &buffer[..cut])?;
        chunks.push(chunk);
        offset += cut as u64;
        buffer.drain(..cut);
    }

    Ok(chunks)
}
