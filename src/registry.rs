//! Partition registry: name -> partition map, unique-id disambiguation,
//! and the backing store's unassigned-macroblock pool (§4.4).
//!
//! One `Registry` owns the single global lock mentioned in §5: callers
//! are expected to hold a `Mutex<Registry>` (or equivalent) across every
//! method here, the same way the teacher keeps one `Mutex` around its
//! basis/dictionary tables rather than fine-grained per-entry locks.

use std::collections::HashMap;
use std::path::Path;

use rand_chacha::ChaCha12Rng;
use rand_core::{RngCore, SeedableRng};

use crate::api::Geometry;
use crate::bitmap::Bitmap;
use crate::cipher::CipherSpec;
use crate::device::RawDevice;
use crate::error::{Error, Result};
use crate::keymat::KeyMaterial;
use crate::macroblock::MacroblockStore;
use crate::partition::Partition;

/// One entry of the registry's bookkeeping for an open partition, beyond
/// what `Partition` itself tracks.
struct Entry {
    partition: Partition,
    refcount: u32,
}

/// Ties named, passphrase-unlocked partitions together over one backing
/// store. Tracks which raw macroblocks are currently claimed by some open
/// partition (the "unassigned pool" is simply its complement); a
/// macroblock belonging to a partition nobody has opened this session is,
/// from the registry's point of view, indistinguishable from free space —
/// that is the whole point.
pub struct Registry {
    geometry: Geometry,
    no_raw_macroblocks: u32,
    base: RawDevice,
    /// Set bit = claimed by some entry in `partitions` right now.
    assigned: Bitmap,
    partitions: HashMap<String, Entry>,
    /// unique-id (§4.4) -> name, to reject opening the same partition twice.
    unique_ids: HashMap<[u8; 32], String>,
    rng: ChaCha12Rng,
}

impl Registry {
    /// Opens and locks the backing store at `path`, ready to create or
    /// open partitions against it. Fails under the same conditions as
    /// [`RawDevice::open`] (§4.1 `init`).
    pub fn init(path: impl AsRef<Path>, geometry: Geometry) -> Result<Self> {
        let base = RawDevice::open(path, geometry)?;
        let no_raw_macroblocks = base.no_macroblocks();
        let mut seed = [0u8; 32];
        rand_core::OsRng.fill_bytes(&mut seed);
        Ok(Registry {
            geometry,
            no_raw_macroblocks,
            base,
            assigned: Bitmap::new(no_raw_macroblocks as usize),
            partitions: HashMap::new(),
            unique_ids: HashMap::new(),
            rng: ChaCha12Rng::from_seed(seed),
        })
    }

    pub fn geometry(&self) -> Geometry { self.geometry }

    pub fn no_raw_macroblocks(&self) -> u32 { self.no_raw_macroblocks }

    pub fn unassigned_count(&self) -> usize { self.assigned.count_unset() }

    fn name_pattern_ok(name: &str) -> bool {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn validate_name(name: &str) -> Result<()> {
        if !Self::name_pattern_ok(name) {
            return Err(Error::config(format!("'{name}' does not match [A-Za-z0-9_]+")));
        }
        Ok(())
    }

    /// Draws `n` raw macroblock ids uniformly at random from the
    /// unassigned pool and marks them claimed. `OutOfSpaceError` if fewer
    /// than `n` are free (caller may retry with a smaller request).
    pub fn allocate_macroblocks(&mut self, n: u32) -> Result<Vec<u32>> {
        let mut free: Vec<u32> = self.assigned.unset_indices().map(|i| i as u32).collect();
        if (free.len() as u32) < n {
            return Err(Error::out_of_space(format!(
                "requested {n} macroblocks, only {} unassigned",
                free.len()
            )));
        }
        // partial Fisher-Yates: only the first n positions need to be fixed.
        let len = free.len();
        for i in 0..n as usize {
            let j = i + (self.rng.next_u64() % (len - i) as u64) as usize;
            free.swap(i, j);
        }
        free.truncate(n as usize);
        for &id in &free {
            self.assigned.set(id as usize);
        }
        Ok(free)
    }

    /// Explicit release: returns raw macroblocks to the unassigned pool.
    /// Called when a partition shrinks and macroblocks it used to own
    /// have fully drained, or when a partition closes.
    pub fn free_macroblocks(&mut self, ids: &[u32]) {
        for &id in ids {
            self.assigned.clear_safe(id as usize);
        }
    }

    fn open_store(&self) -> Result<MacroblockStore> {
        Ok(MacroblockStore::new(self.base.try_clone()?, self.geometry))
    }

    /// `check-available NAME`: true if `name` is not currently open.
    pub fn check_available(&self, name: &str) -> bool { !self.partitions.contains_key(name) }

    fn check_unique(&self, name: &str, unique_id: [u8; 32]) -> Result<()> {
        if let Some(existing) = self.unique_ids.get(&unique_id) {
            if existing != name {
                return Err(Error::conflict(format!(
                    "partition '{name}' has the same unique-id as already-open partition '{existing}'"
                )));
            }
        }
        Ok(())
    }

    /// Creates a brand new partition, allocating `no_macroblocks` fresh
    /// raw macroblocks from the unassigned pool (`reserved` of them held
    /// back as GC headroom, per §3/§4.3).
    pub fn create(
        &mut self,
        name: impl Into<String>,
        cipher_spec: &CipherSpec,
        key: &[u8],
        no_macroblocks: u32,
        reserved: u32,
    ) -> Result<()> {
        let name = name.into();
        Self::validate_name(&name)?;
        if self.partitions.contains_key(&name) {
            return Err(Error::conflict(format!("partition '{name}' is already open")));
        }
        let cipher = {
            let key_material = KeyMaterial::from_slice(key)?;
            cipher_spec.build_from_key_material(&key_material)?
        };
        let raw_ids = self.allocate_macroblocks(no_macroblocks)?;
        let store = self.open_store()?;
        let partition = match Partition::create(name.clone(), self.geometry, cipher, store, raw_ids.clone(), reserved)
        {
            Ok(p) => p,
            Err(e) => {
                self.free_macroblocks(&raw_ids);
                return Err(e);
            }
        };
        if let Err(e) = self.check_unique(&name, partition.unique_id) {
            self.free_macroblocks(&raw_ids);
            return Err(e);
        }
        self.unique_ids.insert(partition.unique_id, name.clone());
        self.partitions.insert(name, Entry { partition, refcount: 0 });
        Ok(())
    }

    /// Opens an existing partition by scanning the unassigned pool (every
    /// raw macroblock not currently claimed by some other open partition)
    /// for cells that decrypt under `key`. `NotFoundError` if none match;
    /// `IntegrityError` if a `SEQNOS_HASH` chain break is found among the
    /// matches (§4.1 `scan`, §4.3 replay).
    pub fn open(&mut self, name: impl Into<String>, cipher_spec: &CipherSpec, key: &[u8]) -> Result<()> {
        let name = name.into();
        Self::validate_name(&name)?;
        if self.partitions.contains_key(&name) {
            return Err(Error::conflict(format!("partition '{name}' is already open")));
        }
        let cipher = {
            let key_material = KeyMaterial::from_slice(key)?;
            cipher_spec.build_from_key_material(&key_material)?
        };
        let candidates: Vec<u32> = self.assigned.unset_indices().map(|i| i as u32).collect();
        let store = self.open_store()?;
        let partition = Partition::open(name.clone(), self.geometry, cipher, store, candidates)?;
        self.check_unique(&name, partition.unique_id)?;
        for id in partition_macro_ids(&partition) {
            self.assigned.set_safe(id as usize);
        }
        self.unique_ids.insert(partition.unique_id, name.clone());
        self.partitions.insert(name, Entry { partition, refcount: 0 });
        Ok(())
    }

    /// Increments the refcount of an open partition (one per outstanding
    /// client handle onto it, tracked by the mount/control front-ends).
    pub fn acquire(&mut self, name: &str) -> Result<()> {
        let entry = self.partitions.get_mut(name).ok_or_else(|| Error::not_found(format!("no such partition '{name}'")))?;
        entry.refcount += 1;
        Ok(())
    }

    /// Decrements the refcount; if it reaches zero and the partition was
    /// marked `close_on_release` (§4.4 added), closes it automatically.
    pub fn release(&mut self, name: &str) -> Result<()> {
        let close_on_release = {
            let entry = self.partitions.get_mut(name).ok_or_else(|| Error::not_found(format!("no such partition '{name}'")))?;
            entry.refcount = entry.refcount.saturating_sub(1);
            entry.refcount == 0 && entry.partition.close_on_release
        };
        if close_on_release {
            self.close(name)?;
        }
        Ok(())
    }

    /// `close NAME`: requires refcount zero (§4.4, §7 `BusyError`).
    pub fn close(&mut self, name: &str) -> Result<()> {
        let refcount = self.partitions.get(name).ok_or_else(|| Error::not_found(format!("no such partition '{name}'")))?.refcount;
        if refcount != 0 {
            return Err(Error::busy(format!("partition '{name}' has {refcount} outstanding handle(s)")));
        }
        let entry = self.partitions.remove(name).expect("presence just checked above");
        self.unique_ids.remove(&entry.partition.unique_id);
        self.free_macroblocks(&partition_macro_ids(&entry.partition));
        Ok(())
    }

    pub fn partition(&self, name: &str) -> Result<&Partition> {
        self.partitions.get(name).map(|e| &e.partition).ok_or_else(|| Error::not_found(format!("no such partition '{name}'")))
    }

    pub fn partition_mut(&mut self, name: &str) -> Result<&mut Partition> {
        self.partitions.get_mut(name).map(|e| &mut e.partition).ok_or_else(|| Error::not_found(format!("no such partition '{name}'")))
    }

    /// `p`: names of every currently open partition.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.keys().cloned().collect();
        names.sort();
        names
    }

    /// `resize-internal NAME BLOCKS RESERVED` (§4.3 resize). A no-op that
    /// reports success if `new_no_macroblocks` already matches (B4).
    pub fn resize(&mut self, name: &str, new_no_macroblocks: u32, reserved: u32) -> Result<()> {
        let current = self.partition(name)?.no_macroblocks();
        if new_no_macroblocks == current {
            return Ok(());
        }
        if new_no_macroblocks > current {
            let extra = self.allocate_macroblocks(new_no_macroblocks - current)?;
            match self.partition_mut(name)?.grow(extra.clone()) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.free_macroblocks(&extra);
                    Err(e)
                }
            }
        } else {
            let drained = self.partition_mut(name)?.shrink(new_no_macroblocks)?;
            self.free_macroblocks(&drained);
            let _ = reserved; // reserved only changes bookkeeping inside the partition today
            Ok(())
        }
    }

    pub fn set_close_on_release(&mut self, name: &str, value: bool) -> Result<()> {
        self.partition_mut(name)?.close_on_release = value;
        Ok(())
    }

    pub fn set_aux(&mut self, name: &str, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.partition_mut(name)?.aux.insert(key.into(), value.into());
        Ok(())
    }

    pub fn get_aux(&self, name: &str, key: &str) -> Result<Option<String>> {
        Ok(self.partition(name)?.aux.get(key).cloned())
    }
}

fn partition_macro_ids(partition: &Partition) -> Vec<u32> { partition.macro_ids() }

#[cfg(test)]
mod tests {
    use super::*;

    fn small_geometry() -> Geometry { Geometry::new(16, 12).unwrap() } // 64 KiB macro, 4 KiB meso

    fn make_store(no_raw: u64) -> tempfile::NamedTempFile {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(no_raw * small_geometry().macroblock_size() as u64).unwrap();
        tmp
    }

    #[test]
    fn create_then_open_with_same_key_succeeds() {
        let tmp = make_store(8);
        let g = small_geometry();
        let spec = CipherSpec::parse("CBC_ESSIV(AES256)").unwrap();
        {
            let mut reg = Registry::init(tmp.path(), g).unwrap();
            reg.create("p", &spec, &[0x41; 32], 4, 0).unwrap();
            reg.partition_mut("p").unwrap().do_write(0, b"hi").unwrap();
            reg.partition_mut("p").unwrap().cycle().unwrap();
        }
        let mut reg = Registry::init(tmp.path(), g).unwrap();
        reg.open("p", &spec, &[0x41; 32]).unwrap();
        let mut out = [0u8; 2];
        reg.partition_mut("p").unwrap().do_read(0, &mut out).unwrap();
        assert_eq!(&out, b"hi");
    }

    #[test]
    fn open_with_wrong_key_is_not_found() {
        let tmp = make_store(8);
        let g = small_geometry();
        let spec = CipherSpec::parse("CBC_ESSIV(AES256)").unwrap();
        {
            let mut reg = Registry::init(tmp.path(), g).unwrap();
            reg.create("p", &spec, &[0x41; 32], 4, 0).unwrap();
            reg.partition_mut("p").unwrap().cycle().unwrap();
        }
        let mut reg = Registry::init(tmp.path(), g).unwrap();
        assert!(reg.open("p", &spec, &[0x42; 32]).is_err());
    }

    #[test]
    fn close_requires_zero_refcount() {
        let tmp = make_store(4);
        let g = small_geometry();
        let spec = CipherSpec::parse("CBC_ESSIV(AES256)").unwrap();
        let mut reg = Registry::init(tmp.path(), g).unwrap();
        reg.create("p", &spec, &[0x41; 32], 4, 0).unwrap();
        reg.acquire("p").unwrap();
        assert!(reg.close("p").is_err());
        reg.release("p").unwrap();
        assert!(reg.close("p").is_ok());
    }

    #[test]
    fn two_partitions_with_distinct_keys_stay_independent() {
        let tmp = make_store(16);
        let g = small_geometry();
        let spec = CipherSpec::parse("CBC_ESSIV(AES256)").unwrap();
        let mut reg = Registry::init(tmp.path(), g).unwrap();
        reg.create("a", &spec, &[0x41; 32], 8, 0).unwrap();
        reg.create("b", &spec, &[0x42; 32], 8, 0).unwrap();
        reg.partition_mut("a").unwrap().do_write(0, b"alpha").unwrap();
        reg.partition_mut("b").unwrap().do_write(0, b"beta!").unwrap();
        let mut out_a = [0u8; 5];
        let mut out_b = [0u8; 5];
        reg.partition_mut("a").unwrap().do_read(0, &mut out_a).unwrap();
        reg.partition_mut("b").unwrap().do_read(0, &mut out_b).unwrap();
        assert_eq!(&out_a, b"alpha");
        assert_eq!(&out_b, b"beta!");
    }

    #[test]
    fn resize_to_current_size_is_a_no_op() {
        let tmp = make_store(8);
        let g = small_geometry();
        let spec = CipherSpec::parse("CBC_ESSIV(AES256)").unwrap();
        let mut reg = Registry::init(tmp.path(), g).unwrap();
        reg.create("p", &spec, &[0x41; 32], 4, 0).unwrap();
        reg.resize("p", 4, 0).unwrap();
        assert_eq!(reg.partition("p").unwrap().no_macroblocks(), 4);
    }

    #[test]
    fn set_and_get_aux_round_trips() {
        let tmp = make_store(4);
        let g = small_geometry();
        let spec = CipherSpec::parse("CBC_ESSIV(AES256)").unwrap();
        let mut reg = Registry::init(tmp.path(), g).unwrap();
        reg.create("p", &spec, &[0x41; 32], 4, 0).unwrap();
        reg.set_aux("p", "label", "vault").unwrap();
        assert_eq!(reg.get_aux("p", "label").unwrap(), Some("vault".to_string()));
        assert_eq!(reg.get_aux("p", "missing").unwrap(), None);
    }
}
