//! On-disk constants, geometry, and addressing shared across the engine.

use crate::error::{Error, Result};

/// Constant ASCII magic stamped into every index mesoblock this engine wrote.
pub const MAGIC: &[u8; 8] = b"SSS3v0.1";

pub const HASH_LEN: usize = 32;
pub const CIPHER_BLOCK_LEN: usize = 16;
pub const AES256_KEY_LEN: usize = 32;

// Index mesoblock header field offsets (§3 table), all within the
// plaintext, before encryption.
pub const OFF_INDEX_HASH: usize = 0x000;
pub const OFF_DATA_HASH: usize = 0x020;
pub const OFF_SEQNOS_HASH: usize = 0x040;
pub const OFF_SEQNO: usize = 0x060;
pub const OFF_NEXT_SEQNO: usize = 0x068;
pub const OFF_MAGIC: usize = 0x070;
pub const OFF_NO_MACROBLOCKS: usize = 0x078;
pub const OFF_RESERVED: usize = 0x07C;
pub const HEADER_LEN: usize = 0x080;

pub const DEFAULT_MACROBLOCK_LOG: u8 = 22; // 4 MiB
pub const DEFAULT_MESOBLOCK_LOG: u8 = 14; // 16 KiB

/// Never-written sentinel in `block_indices`.
pub const UNWRITTEN_SLOT: u32 = 0xFFFF_FFFF;

/// Macroblock/mesoblock sizing for one backing store, shared by every
/// partition on it (the split itself is not secret; only which macroblocks
/// belong to which partition is).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// log2 of the macroblock size (M).
    pub macroblock_log: u8,
    /// log2 of the mesoblock size (m).
    pub mesoblock_log: u8,
}

impl Geometry {
    pub fn new(macroblock_log: u8, mesoblock_log: u8) -> Result<Self> {
        if macroblock_log <= mesoblock_log {
            return Err(Error::config(format!(
                "macroblock_log ({macroblock_log}) must be greater than mesoblock_log ({mesoblock_log})"
            )));
        }
        if mesoblock_log < 5 {
            // a mesoblock must hold at least the 128-byte header plus one cipher block
            return Err(Error::config(format!("mesoblock_log ({mesoblock_log}) too small")));
        }
        Ok(Geometry { macroblock_log, mesoblock_log })
    }

    pub fn macroblock_size(&self) -> usize { 1usize << self.macroblock_log }

    pub fn mesoblock_size(&self) -> usize { 1usize << self.mesoblock_log }

    /// K = 2^(M-m): total mesoblocks per macroblock, including the index mesoblock.
    pub fn mesoblocks_per_macroblock(&self) -> usize { 1usize << (self.macroblock_log - self.mesoblock_log) }

    /// MMPM = K - 1: data mesoblocks per macroblock.
    pub fn mmpm(&self) -> usize { self.mesoblocks_per_macroblock() - 1 }

    /// Byte length of the packed index-entries region: `NO_INDICES` plus `MMPM` logical slots.
    pub fn index_entries_len(&self) -> usize { 4 * (self.mmpm() + 1) }

    /// Validate that a status bitmap covering `total_macroblocks` raw macroblocks (2 bits
    /// each) plus the index entries region fits inside one index mesoblock alongside the header.
    pub fn validate_capacity(&self, total_macroblocks: u32) -> Result<()> {
        let bitmap_bytes = crate::bitpacker::packed_len(total_macroblocks as usize, 2);
        let used = HEADER_LEN + bitmap_bytes + self.index_entries_len();
        if used > self.mesoblock_size() {
            return Err(Error::config(format!(
                "mesoblock_log {} too small to hold {} macroblocks' status bitmap ({used} > {} bytes available)",
                self.mesoblock_log, total_macroblocks, self.mesoblock_size()
            )));
        }
        Ok(())
    }

    pub fn bitmap_offset(&self) -> usize { HEADER_LEN }

    pub fn index_entries_offset(&self, total_macroblocks: u32) -> usize {
        HEADER_LEN + crate::bitpacker::packed_len(total_macroblocks as usize, 2)
    }
}

/// The 128-bit IV used by the wide-block cipher: a big-endian (u64, u32, u32) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iv {
    pub iv0: u64,
    pub iv1: u32,
    pub iv2: u32,
}

impl Iv {
    pub fn index(macro_id: u32) -> Self { Iv { iv0: 0, iv1: 0, iv2: macro_id } }

    pub fn data(seqno: u64, slot: u32, macro_id: u32) -> Self { Iv { iv0: seqno, iv1: slot, iv2: macro_id } }

    pub fn unique_id() -> Self { Iv { iv0: 0, iv1: 0, iv2: 0 } }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.iv0.to_be_bytes());
        out[8..12].copy_from_slice(&self.iv1.to_be_bytes());
        out[12..16].copy_from_slice(&self.iv2.to_be_bytes());
        out
    }
}

/// Per-raw-macroblock status as seen by one partition. Stored 2 bits wide
/// in the on-disk status bitmap (the second bit is reserved for forward
/// compatibility, per §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MacroblockStatus {
    Free = 0,
    Used = 1,
}

impl From<u8> for MacroblockStatus {
    fn from(v: u8) -> Self { if v & 1 != 0 { MacroblockStatus::Used } else { MacroblockStatus::Free } }
}

impl From<MacroblockStatus> for u8 {
    fn from(s: MacroblockStatus) -> Self { s as u8 }
}
