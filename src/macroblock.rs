//! On-disk macroblock format: index mesoblock encode/decode, scan,
//! per-macroblock read/write, integrity check (§4.1).

use sha2::{Digest, Sha256};

use crate::api::{
    Geometry, Iv, HASH_LEN, MAGIC, OFF_DATA_HASH, OFF_MAGIC, OFF_NEXT_SEQNO, OFF_NO_MACROBLOCKS,
    OFF_RESERVED, OFF_SEQNO, OFF_SEQNOS_HASH,
};
use crate::bitpacker::{bit_pack, bit_unpack, packed_len};
use crate::cipher::WideBlockCipher;
use crate::device::RawDevice;
use crate::error::{Error, Result};

/// The index mesoblock's header fields plus its variable-length tail,
/// decoded from plaintext (post-decryption, pre-verification is done by
/// the caller via `decode_index`/`scan`).
#[derive(Debug, Clone)]
pub struct ParsedIndex {
    pub seqno: u64,
    pub next_seqno: u64,
    pub no_macroblocks: u32,
    pub reserved: u32,
    /// One 0/1 status value per raw macroblock of this partition, local index order.
    pub statuses: Vec<u32>,
    pub no_indices: u32,
    /// Logical slot numbers of this macroblock's data mesoblocks, length `no_indices`.
    pub indices: Vec<u32>,
    pub data_hash: [u8; HASH_LEN],
    pub seqnos_hash: [u8; HASH_LEN],
}

/// Result of probing one raw macroblock with a partition's cipher (§4.1 `scan`).
pub enum ScanResult {
    Ours(ParsedIndex),
    NotOurs,
}

/// Builds the plaintext index mesoblock (everything before encryption),
/// including the just-computed `INDEX_HASH`.
#[allow(clippy::too_many_arguments)]
pub fn encode_index(
    geometry: &Geometry,
    seqno: u64,
    next_seqno: u64,
    no_macroblocks: u32,
    reserved: u32,
    statuses: &[u32],
    indices: &[u32],
    data_hash: [u8; HASH_LEN],
    seqnos_hash: [u8; HASH_LEN],
) -> Result<Vec<u8>> {
    if statuses.len() != no_macroblocks as usize {
        return Err(Error::config(format!(
            "status bitmap length {} does not match no_macroblocks {no_macroblocks}",
            statuses.len()
        )));
    }
    if indices.len() > geometry.mmpm() {
        return Err(Error::config(format!(
            "{} index entries exceeds MMPM {}",
            indices.len(),
            geometry.mmpm()
        )));
    }
    geometry.validate_capacity(no_macroblocks)?;

    let mut buf = vec![0u8; geometry.mesoblock_size()];
    buf[OFF_DATA_HASH..OFF_DATA_HASH + HASH_LEN].copy_from_slice(&data_hash);
    buf[OFF_SEQNOS_HASH..OFF_SEQNOS_HASH + HASH_LEN].copy_from_slice(&seqnos_hash);
    buf[OFF_SEQNO..OFF_SEQNO + 8].copy_from_slice(&seqno.to_be_bytes());
    buf[OFF_NEXT_SEQNO..OFF_NEXT_SEQNO + 8].copy_from_slice(&next_seqno.to_be_bytes());
    buf[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(MAGIC);
    buf[OFF_NO_MACROBLOCKS..OFF_NO_MACROBLOCKS + 4].copy_from_slice(&no_macroblocks.to_be_bytes());
    buf[OFF_RESERVED..OFF_RESERVED + 4].copy_from_slice(&reserved.to_be_bytes());

    let bitmap_off = geometry.bitmap_offset();
    let bitmap_bytes = bit_pack(statuses, 2);
    buf[bitmap_off..bitmap_off + bitmap_bytes.len()].copy_from_slice(&bitmap_bytes);

    let entries_off = geometry.index_entries_offset(no_macroblocks);
    buf[entries_off..entries_off + 4].copy_from_slice(&(indices.len() as u32).to_be_bytes());
    for (i, &slot) in indices.iter().enumerate() {
        let at = entries_off + 4 + 4 * i;
        buf[at..at + 4].copy_from_slice(&slot.to_be_bytes());
    }
    // remaining entries are left zero, matching "remaining entries zero"

    let index_hash: [u8; HASH_LEN] = Sha256::digest(&buf[HASH_LEN..]).into();
    buf[0..HASH_LEN].copy_from_slice(&index_hash);
    Ok(buf)
}

/// Verifies `MAGIC` and `INDEX_HASH`, then parses the rest of the header.
/// Returns `None` if either check fails (the caller's macroblock, decrypted
/// with the wrong key, is indistinguishable from random noise).
pub fn decode_index(geometry: &Geometry, buf: &[u8]) -> Option<ParsedIndex> {
    if buf.len() < geometry.mesoblock_size() {
        return None;
    }
    if &buf[OFF_MAGIC..OFF_MAGIC + 8] != MAGIC {
        return None;
    }
    let computed: [u8; HASH_LEN] = Sha256::digest(&buf[HASH_LEN..]).into();
    if computed != buf[0..HASH_LEN] {
        return None;
    }
    let no_macroblocks = u32::from_be_bytes(buf[OFF_NO_MACROBLOCKS..OFF_NO_MACROBLOCKS + 4].try_into().ok()?);
    let reserved = u32::from_be_bytes(buf[OFF_RESERVED..OFF_RESERVED + 4].try_into().ok()?);
    geometry.validate_capacity(no_macroblocks).ok()?;

    let bitmap_off = geometry.bitmap_offset();
    let bitmap_bytes = packed_len(no_macroblocks as usize, 2);
    let statuses = bit_unpack(&buf[bitmap_off..bitmap_off + bitmap_bytes], no_macroblocks as usize, 2);

    let entries_off = geometry.index_entries_offset(no_macroblocks);
    let no_indices = u32::from_be_bytes(buf[entries_off..entries_off + 4].try_into().ok()?);
    if no_indices as usize > geometry.mmpm() {
        return None;
    }
    let mut indices = Vec::with_capacity(no_indices as usize);
    for i in 0..no_indices as usize {
        let at = entries_off + 4 + 4 * i;
        indices.push(u32::from_be_bytes(buf[at..at + 4].try_into().ok()?));
    }

    let seqno = u64::from_be_bytes(buf[OFF_SEQNO..OFF_SEQNO + 8].try_into().ok()?);
    let next_seqno = u64::from_be_bytes(buf[OFF_NEXT_SEQNO..OFF_NEXT_SEQNO + 8].try_into().ok()?);
    let mut data_hash = [0u8; HASH_LEN];
    data_hash.copy_from_slice(&buf[OFF_DATA_HASH..OFF_DATA_HASH + HASH_LEN]);
    let mut seqnos_hash = [0u8; HASH_LEN];
    seqnos_hash.copy_from_slice(&buf[OFF_SEQNOS_HASH..OFF_SEQNOS_HASH + HASH_LEN]);

    Some(ParsedIndex { seqno, next_seqno, no_macroblocks, reserved, statuses, no_indices, indices, data_hash, seqnos_hash })
}

/// The macroblock store proper: a raw device handle plus the geometry that
/// governs every macroblock on it. One instance is held per open partition
/// (each with its own `RawDevice` handle, per §5).
pub struct MacroblockStore {
    device: RawDevice,
    geometry: Geometry,
}

impl MacroblockStore {
    pub fn new(device: RawDevice, geometry: Geometry) -> Self { MacroblockStore { device, geometry } }

    pub fn geometry(&self) -> Geometry { self.geometry }

    pub fn no_raw_macroblocks(&self) -> u32 { self.device.no_macroblocks() }

    /// Reads the first mesoblock of `macro_id`, decrypts it, and checks
    /// whether it belongs to the partition owning `cipher`.
    pub fn scan(&mut self, cipher: &dyn WideBlockCipher, macro_id: u32) -> Result<ScanResult> {
        let mut buf = vec![0u8; self.geometry.mesoblock_size()];
        self.device.read_macroblock_range(macro_id, 0, &mut buf)?;
        cipher.decrypt(&mut buf, Iv::index(macro_id));
        match decode_index(&self.geometry, &buf) {
            Some(parsed) => Ok(ScanResult::Ours(parsed)),
            None => Ok(ScanResult::NotOurs),
        }
    }

    /// Reads and decrypts data mesoblock `slot` (1-based) of `macro_id`,
    /// whose current on-disk seqno is `seqno`.
    pub fn read_meso(&mut self, cipher: &dyn WideBlockCipher, macro_id: u32, seqno: u64, slot: u32, out: &mut [u8]) -> Result<()> {
        assert_eq!(out.len(), self.geometry.mesoblock_size());
        assert!(slot >= 1 && slot as usize <= self.geometry.mmpm());
        let within = (slot as u64) * self.geometry.mesoblock_size() as u64;
        self.device.read_macroblock_range(macro_id, within, out)?;
        cipher.decrypt(out, Iv::data(seqno, slot, macro_id));
        Ok(())
    }

    /// Same as [`Self::read_meso`] but copies only `out.len()` bytes starting at `within_meso`.
    pub fn read_meso_part(
        &mut self,
        cipher: &dyn WideBlockCipher,
        macro_id: u32,
        seqno: u64,
        slot: u32,
        within_meso: usize,
        out: &mut [u8],
    ) -> Result<()> {
        let mut whole = vec![0u8; self.geometry.mesoblock_size()];
        self.read_meso(cipher, macro_id, seqno, slot, &mut whole)?;
        out.copy_from_slice(&whole[within_meso..within_meso + out.len()]);
        Ok(())
    }

    /// Finalizes and flushes the in-RAM macroblock `macro_id`: zeroes the
    /// unused data-mesoblock tail, encrypts the live ones, computes
    /// `DATA_HASH`, builds and encrypts the index mesoblock, and writes
    /// the whole cell out.
    #[allow(clippy::too_many_arguments)]
    pub fn write_current(
        &mut self,
        cipher: &dyn WideBlockCipher,
        macro_id: u32,
        seqno: u64,
        next_seqno: u64,
        no_macroblocks: u32,
        reserved: u32,
        statuses: &[u32],
        indices: &[u32],
        data: &mut [Vec<u8>],
        seqnos_hash: [u8; HASH_LEN],
    ) -> Result<()> {
        let mmpm = self.geometry.mmpm();
        assert_eq!(data.len(), mmpm, "staged data mesoblock count must equal MMPM");
        for slot in data.iter_mut().skip(indices.len()) {
            slot.iter_mut().for_each(|b| *b = 0);
        }
        for (i, meso) in data.iter_mut().enumerate() {
            cipher.encrypt(meso, Iv::data(seqno, (i + 1) as u32, macro_id));
        }
        let mut hasher = Sha256::new();
        for meso in data.iter() {
            hasher.update(&meso[..]);
        }
        let data_hash: [u8; HASH_LEN] = hasher.finalize().into();

        let mut index_plain = encode_index(
            &self.geometry, seqno, next_seqno, no_macroblocks, reserved, statuses, indices, data_hash, seqnos_hash,
        )?;
        cipher.encrypt(&mut index_plain, Iv::index(macro_id));

        let mut full = Vec::with_capacity(self.geometry.macroblock_size());
        full.extend_from_slice(&index_plain);
        for meso in data.iter() {
            full.extend_from_slice(meso);
        }
        self.device.write_macroblock(macro_id, &full)?;
        log::trace!("wrote macroblock {macro_id} seqno={seqno} live_indices={}", indices.len());
        Ok(())
    }

    /// Re-reads the K-1 data mesoblocks' ciphertext and compares its hash to `expected`.
    pub fn check_data(&mut self, macro_id: u32, expected: &[u8; HASH_LEN]) -> Result<bool> {
        let meso_len = self.geometry.mesoblock_size();
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; meso_len];
        for slot in 1..=self.geometry.mmpm() as u32 {
            self.device.read_macroblock_range(macro_id, slot as u64 * meso_len as u64, &mut buf)?;
            hasher.update(&buf);
        }
        let got: [u8; HASH_LEN] = hasher.finalize().into();
        Ok(&got == expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Geometry;
    use crate::cipher::CipherSpec;

    fn small_geometry() -> Geometry { Geometry::new(16, 12).unwrap() } // 64 KiB macro / 4 KiB meso -> K=16, MMPM=15

    #[test]
    fn index_round_trips_through_encode_decode() {
        let g = small_geometry();
        let statuses = vec![1u32, 0, 1];
        let indices = vec![5u32, 9, 100];
        let buf = encode_index(&g, 7, 42, 3, 0, &statuses, &indices, [0xAA; 32], [0xBB; 32]).unwrap();
        let parsed = decode_index(&g, &buf).unwrap();
        assert_eq!(parsed.seqno, 7);
        assert_eq!(parsed.next_seqno, 42);
        assert_eq!(parsed.no_macroblocks, 3);
        assert_eq!(parsed.statuses, statuses);
        assert_eq!(parsed.indices, indices);
        assert_eq!(parsed.data_hash, [0xAA; 32]);
        assert_eq!(parsed.seqnos_hash, [0xBB; 32]);
    }

    #[test]
    fn decode_rejects_tampered_hash() {
        let g = small_geometry();
        let mut buf = encode_index(&g, 1, 2, 2, 0, &[0, 0], &[], [0u8; 32], [0u8; 32]).unwrap();
        buf[200] ^= 0xFF;
        assert!(decode_index(&g, &buf).is_none());
    }

    #[test]
    fn scan_distinguishes_ours_from_garbage() {
        let g = small_geometry();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(2 * g.macroblock_size() as u64).unwrap();
        let device = crate::device::RawDevice::open(tmp.path(), g).unwrap();
        let mut store = MacroblockStore::new(device, g);

        let cipher = CipherSpec::parse("CBC_ESSIV(AES256)").unwrap().build(&[0x41; 32]).unwrap();
        let wrong_cipher = CipherSpec::parse("CBC_ESSIV(AES256)").unwrap().build(&[0x42; 32]).unwrap();

        let mut data: Vec<Vec<u8>> = (0..g.mmpm()).map(|_| vec![0u8; g.mesoblock_size()]).collect();
        store
            .write_current(cipher.as_ref(), 0, 1, 2, 2, 0, &[1, 0], &[3], &mut data, [0u8; 32])
            .unwrap();

        match store.scan(cipher.as_ref(), 0).unwrap() {
            ScanResult::Ours(parsed) => assert_eq!(parsed.seqno, 1),
            ScanResult::NotOurs => panic!("expected Ours"),
        }
        match store.scan(wrong_cipher.as_ref(), 0).unwrap() {
            ScanResult::Ours(_) => panic!("wrong key should not parse"),
            ScanResult::NotOurs => {}
        }
    }

    #[test]
    fn check_data_detects_tampering() {
        let g = small_geometry();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(g.macroblock_size() as u64).unwrap();
        let device = crate::device::RawDevice::open(tmp.path(), g).unwrap();
        let mut store = MacroblockStore::new(device, g);
        let cipher = CipherSpec::parse("NULL(AES256)").unwrap().build(&[0x41; 32]).unwrap();
        let mut data: Vec<Vec<u8>> = (0..g.mmpm()).map(|_| vec![0u8; g.mesoblock_size()]).collect();
        store.write_current(cipher.as_ref(), 0, 1, 2, 1, 0, &[1], &[], &mut data, [0u8; 32]).unwrap();

        let hash: [u8; 32] = {
            let mut h = Sha256::new();
            for _ in 0..g.mmpm() {
                h.update(&vec![0u8; g.mesoblock_size()]);
            }
            h.finalize().into()
        };
        assert!(store.check_data(0, &hash).unwrap());
        assert!(!store.check_data(0, &[0xFF; 32]).unwrap());
    }
}
