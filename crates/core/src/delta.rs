//! Rolling-checksum delta computation.
//!
//! The receiver splits its copy of a file into fixed-size blocks and sends a
//! signature per block: a weak rolling sum for the hash-table probe and a
//! truncated BLAKE3 for confirmation. The sender scans its file byte by
//! byte with the rolling sum; a confirmed block match is emitted as a copy
//! instruction, everything between matches as literal runs. The receiver
//! rebuilds the file from its own blocks plus the literals and verifies the
//! whole-file hash.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{ContentHash, RollingSum};

/// Default signature block size
pub const BLOCK_SIZE: u32 = 2 * 1024;
/// Largest adaptive block size
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024;

/// Bytes of the per-block strong checksum kept on the wire
pub const STRONG_LEN: usize = 16;

/// Pick the signature block size for a file. Small files keep the 2 KiB
/// default; each size quadrupling doubles the block, capped at 16 KiB.
/// Sender and receiver must agree, so this is the only place that decides.
#[must_use]
pub fn block_size_for(file_size: u64) -> u32 {
    let mut block = BLOCK_SIZE;
    let mut threshold = 8 * 1024 * 1024u64;
    while file_size > threshold && block < MAX_BLOCK_SIZE {
        block *= 2;
        threshold *= 4;
    }
    block
}

/// Truncated strong checksum for one block
#[must_use]
pub fn strong_checksum(block: &[u8]) -> [u8; STRONG_LEN] {
    let mut out = [0u8; STRONG_LEN];
    out.copy_from_slice(&ContentHash::from_bytes(block).as_bytes()[..STRONG_LEN]);
    out
}

/// Signature of a single block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    /// Rolling weak checksum, the hash-table key
    pub weak: u32,
    /// Truncated BLAKE3, compared on weak-key collisions
    pub strong: [u8; STRONG_LEN],
}

/// Per-file signature computed on the receiving side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub block_size: u32,
    pub file_size: u64,
    pub blocks: Vec<BlockSignature>,
}

impl Signature {
    /// Compute the signature of the receiver's copy
    #[must_use]
    pub fn compute(data: &[u8], block_size: u32) -> Self {
        let blocks = data
            .chunks(block_size as usize)
            .map(|block| BlockSignature {
                weak: RollingSum::from_block(block).value(),
                strong: strong_checksum(block),
            })
            .collect();
        Self {
            block_size,
            file_size: data.len() as u64,
            blocks,
        }
    }
}

/// An instruction in a delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Copy block `index` of the receiver's file
    Copy { index: u32 },
    /// Insert literal bytes
    Literal { data: Bytes },
}

/// A delta between the sender's file and the receiver's signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub ops: Vec<DeltaOp>,
    /// Whole-file hash of the sender's content, verified after apply
    pub file_hash: ContentHash,
    pub file_size: u64,
}

impl Delta {
    /// Bytes that travel as literals (the cost of the delta)
    #[must_use]
    pub fn literal_bytes(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Copy { .. } => 0,
                DeltaOp::Literal { data } => data.len() as u64,
            })
            .sum()
    }

    /// Bytes satisfied from the receiver's existing blocks
    #[must_use]
    pub fn matched_bytes(&self, block_size: u32) -> u64 {
        self.ops
            .iter()
            .filter(|op| matches!(op, DeltaOp::Copy { .. }))
            .count() as u64
            * u64::from(block_size)
    }
}

/// Compute the delta of `data` against a receiver-side signature.
///
/// Scans with a one-byte rolling window: a weak hit is confirmed with the
/// strong checksum, consumes exactly one block, and restarts the window
/// after it; a miss buffers one literal byte and rolls on.
#[must_use]
pub fn compute_delta(data: &[u8], signature: &Signature) -> Delta {
    let block_size = signature.block_size as usize;
    let file_hash = ContentHash::from_bytes(data);

    // Weak checksum -> block indices, first occurrence wins ties after the
    // strong comparison.
    let mut lookup: HashMap<u32, Vec<u32>> = HashMap::new();
    for (index, block) in signature.blocks.iter().enumerate() {
        lookup.entry(block.weak).or_default().push(index as u32);
    }

    let mut ops = Vec::new();
    let mut literal_start = 0usize;
    let mut pos = 0usize;

    let flush_literal = |ops: &mut Vec<DeltaOp>, from: usize, to: usize, data: &[u8]| {
        if from < to {
            ops.push(DeltaOp::Literal {
                data: Bytes::copy_from_slice(&data[from..to]),
            });
        }
    };

    if block_size > 0 && data.len() >= block_size && !signature.blocks.is_empty() {
        let mut sum = RollingSum::from_block(&data[..block_size]);
        loop {
            let mut matched = None;
            if let Some(candidates) = lookup.get(&sum.value()) {
                let window = &data[pos..pos + block_size];
                let strong = strong_checksum(window);
                matched = candidates
                    .iter()
                    .copied()
                    .find(|&index| signature.blocks[index as usize].strong == strong);
            }

            if let Some(index) = matched {
                flush_literal(&mut ops, literal_start, pos, data);
                ops.push(DeltaOp::Copy { index });
                pos += block_size;
                literal_start = pos;
                if pos + block_size > data.len() {
                    break;
                }
                sum = RollingSum::from_block(&data[pos..pos + block_size]);
            } else {
                if pos + block_size >= data.len() {
                    break;
                }
                sum.roll(data[pos], data[pos + block_size]);
                pos += 1;
            }
        }
    }

    flush_literal(&mut ops, literal_start, data.len(), data);

    Delta {
        ops,
        file_hash,
        file_size: data.len() as u64,
    }
}

/// Rebuild the sender's file from the receiver's copy and a delta.
///
/// # Errors
/// Returns `Aborted` when the result does not hash to the expected value
/// (receiver blocks changed under us) or a copy index is out of range
pub fn apply_delta(old_data: &[u8], block_size: u32, delta: &Delta) -> Result<Vec<u8>> {
    let block_size = block_size as usize;
    let mut result = Vec::with_capacity(delta.file_size as usize);

    for op in &delta.ops {
        match op {
            DeltaOp::Copy { index } => {
                let start = *index as usize * block_size;
                let end = (start + block_size).min(old_data.len());
                let block = old_data
                    .get(start..end)
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| Error::aborted(format!("copy index {index} out of range")))?;
                result.extend_from_slice(block);
            }
            DeltaOp::Literal { data } => result.extend_from_slice(data),
        }
    }

    let actual = ContentHash::from_bytes(&result);
    if actual != delta.file_hash {
        return Err(Error::aborted(format!(
            "reconstructed file hash mismatch: expected {}, got {actual}",
            delta.file_hash
        )));
    }
    Ok(result)
}
