//! scubed3 indirection layer: logical-offset mapping, replay, garbage
//! collection, and the read/write path of one open partition (§4.3).

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::api::{Geometry, Iv, MacroblockStatus, UNWRITTEN_SLOT, HASH_LEN};
use crate::cipher::WideBlockCipher;
use crate::error::{Error, Result};
use crate::juggler::Juggler;
use crate::macroblock::{MacroblockStore, ScanResult};

/// Per-macroblock bookkeeping a partition keeps for every raw macroblock it
/// has claimed. `indices` mirrors what is (or will be) on disk in the
/// macroblock's index mesoblock; `no_nonobsolete` tracks how many of those
/// entries are still live, per I4.
#[derive(Debug, Clone)]
pub struct MacroblockRecord {
    pub macro_id: u32,
    pub seqno: u64,
    pub next_seqno: u64,
    pub indices: Vec<u32>,
    pub no_nonobsolete: u32,
    pub data_hash: [u8; HASH_LEN],
    pub status: MacroblockStatus,
    /// Instrumentation only (§3 added): entries relocated by tail migration.
    pub no_indices_gc: u32,
    /// Instrumentation only (§3 added): entries relocated by pre-emptive GC.
    pub no_indices_preempt: u32,
}

impl MacroblockRecord {
    fn blank(macro_id: u32) -> Self {
        MacroblockRecord {
            macro_id,
            seqno: 0,
            next_seqno: 0,
            indices: Vec::new(),
            no_nonobsolete: 0,
            data_hash: [0u8; HASH_LEN],
            status: MacroblockStatus::Free,
            no_indices_gc: 0,
            no_indices_preempt: 0,
        }
    }
}

/// The macroblock currently being staged in RAM: the write target `bi`.
struct CurrentMacroblock {
    macro_id: u32,
    /// Logical slots written so far, parallel to `data`'s leading entries.
    indices: Vec<u32>,
    /// `MMPM` plaintext mesoblock buffers; only the first `indices.len()` are live.
    data: Vec<Vec<u8>>,
    /// Writes remaining (to any macroblock of this partition) before this
    /// one comes due again, as decided by the juggler when it was selected.
    lifespan: u64,
}

impl CurrentMacroblock {
    fn blank(macro_id: u32, mmpm: usize, meso_len: usize, lifespan: u64) -> Self {
        CurrentMacroblock { macro_id, indices: Vec::new(), data: vec![vec![0u8; meso_len]; mmpm], lifespan }
    }

    fn is_full(&self, mmpm: usize) -> bool { self.indices.len() >= mmpm }
}

fn encode_word(macro_id: u32, d: u32, mesobits: u32) -> u32 { (macro_id << mesobits) | d }

fn decode_word(word: u32, mesobits: u32) -> (u32, u32) { (word >> mesobits, word & ((1 << mesobits) - 1)) }

/// An open, passphrase-unlocked logical device.
pub struct Partition {
    pub name: String,
    geometry: Geometry,
    mesobits: u32,
    cipher: Box<dyn WideBlockCipher>,
    store: MacroblockStore,
    juggler: Juggler,
    /// Raw macro_id -> bookkeeping record, for every macroblock this partition owns.
    macroblocks: HashMap<u32, MacroblockRecord>,
    /// Logical mesoblock slot -> encoded `(macro_id, d)` word, or `UNWRITTEN_SLOT`.
    block_indices: Vec<u32>,
    seqno_counter: u64,
    seqnos_chain: [u8; HASH_LEN],
    no_macroblocks: u32,
    reserved: u32,
    current: CurrentMacroblock,
    pub unique_id: [u8; HASH_LEN],
    pub close_on_release: bool,
    pub aux: HashMap<String, String>,
    /// Running stats surfaced by `info`/`verbose-ordered` (§3 added).
    pub wasted_gc: u64,
    pub wasted_empty: u64,
    pub useful: u64,
}

impl Partition {
    /// Logical size in bytes: `(NO_MACROBLOCKS - RESERVED) * MMPM * mesoblock_size`.
    pub fn logical_size(&self) -> u64 {
        self.block_indices.len() as u64 * self.geometry.mesoblock_size() as u64
    }

    fn mmpm(&self) -> usize { self.geometry.mmpm() }

    fn meso_len(&self) -> usize { self.geometry.mesoblock_size() }

    fn next_seqnos_chain(prev: [u8; HASH_LEN], seqno: u64) -> [u8; HASH_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(prev);
        hasher.update(seqno.to_be_bytes());
        hasher.finalize().into()
    }

    fn unique_id_of(cipher: &dyn WideBlockCipher, meso_len: usize) -> [u8; HASH_LEN] {
        let mut zeroed = vec![0u8; meso_len];
        cipher.encrypt(&mut zeroed, Iv::unique_id());
        Sha256::digest(&zeroed).into()
    }

    /// Creates a brand new partition over `raw_macro_ids` (freshly claimed
    /// from the unassigned pool).
    pub fn create(
        name: String,
        geometry: Geometry,
        cipher: Box<dyn WideBlockCipher>,
        mut store: MacroblockStore,
        raw_macro_ids: Vec<u32>,
        reserved: u32,
    ) -> Result<Self> {
        if (raw_macro_ids.len() as u32) <= reserved {
            return Err(Error::config(format!(
                "{} macroblocks is not enough to cover {reserved} reserved",
                raw_macro_ids.len()
            )));
        }
        let mesobits = (geometry.macroblock_log - geometry.mesoblock_log) as u32;
        let no_macroblocks = raw_macro_ids.len() as u32;
        let unique_id = Self::unique_id_of(cipher.as_ref(), geometry.mesoblock_size());

        let mut juggler = Juggler::new();
        let mut macroblocks = HashMap::new();
        for &id in &raw_macro_ids {
            juggler.add(id);
            macroblocks.insert(id, MacroblockRecord::blank(id));
        }
        let mmpm = geometry.mmpm();
        let meso_len = geometry.mesoblock_size();
        let (first, first_lifespan) = juggler.select_next_write().expect("freshly populated juggler always yields one");

        // A macroblock is claimed as soon as it is handed to this partition,
        // not only once user data lands in it: write every claimed
        // macroblock out as a blank (empty) index mesoblock right away, so
        // NO_MACROBLOCKS and the discoverable on-disk set agree from the
        // moment `create` returns, even if the partition is closed again
        // without ever being written to. `first` gets written here too and
        // then staged again in RAM as the initial write target; its next
        // real flush simply supersedes this blank with a higher SEQNO, the
        // same way any later rewrite of an already-written macroblock does.
        let mut seqno_counter = 0u64;
        let mut seqnos_chain = [0u8; HASH_LEN];
        let statuses = vec![0u32; no_macroblocks as usize];
        for &id in &raw_macro_ids {
            let seqno = seqno_counter;
            seqno_counter += 1;
            seqnos_chain = Self::next_seqnos_chain(seqnos_chain, seqno);
            let mut blank: Vec<Vec<u8>> = vec![vec![0u8; meso_len]; mmpm];
            store.write_current(
                cipher.as_ref(), id, seqno, seqno, no_macroblocks, reserved, &statuses, &[], &mut blank, seqnos_chain,
            )?;
            let rec = macroblocks.get_mut(&id).expect("claimed macroblock has a blank record");
            rec.seqno = seqno;
            rec.next_seqno = seqno;
            rec.status = MacroblockStatus::Free;
        }

        let part = Partition {
            name,
            geometry,
            mesobits,
            cipher,
            store,
            juggler,
            macroblocks,
            block_indices: vec![UNWRITTEN_SLOT; (no_macroblocks - reserved) as usize * mmpm],
            seqno_counter,
            seqnos_chain,
            no_macroblocks,
            reserved,
            current: CurrentMacroblock::blank(first, mmpm, meso_len, first_lifespan),
            unique_id,
            close_on_release: false,
            aux: HashMap::new(),
            wasted_gc: 0,
            wasted_empty: 0,
            useful: 0,
        };
        Ok(part)
    }

    /// Reassembles an existing partition from the backing store: scans
    /// every raw macroblock with `cipher`, keeps the ones that are `Ours`,
    /// and replays them in ascending `SEQNO` order to rebuild `block_indices`.
    /// Refuses to open (`IntegrityError`) on any `SEQNOS_HASH` break in the chain.
    pub fn open(
        name: String,
        geometry: Geometry,
        cipher: Box<dyn WideBlockCipher>,
        mut store: MacroblockStore,
        candidate_raw_ids: Vec<u32>,
    ) -> Result<Self> {
        let mesobits = (geometry.macroblock_log - geometry.mesoblock_log) as u32;
        let mut found = Vec::new();
        for id in candidate_raw_ids {
            if let ScanResult::Ours(parsed) = store.scan(cipher.as_ref(), id)? {
                found.push((id, parsed));
            }
        }
        if found.is_empty() {
            return Err(Error::not_found(format!("no macroblocks for partition '{name}' found")));
        }
        found.sort_by_key(|(_, p)| p.seqno);

        let tip = &found.last().unwrap().1;
        let no_macroblocks = tip.no_macroblocks;
        let reserved = tip.reserved;
        let mmpm = geometry.mmpm();
        let meso_len = geometry.mesoblock_size();

        let mut seen_ids = std::collections::HashSet::new();
        for (id, _) in &found {
            if !seen_ids.insert(*id) {
                return Err(Error::conflict(format!("macroblock {id} scanned twice for partition '{name}'")));
            }
        }

        let mut chain = [0u8; HASH_LEN];
        let mut seqnos = std::collections::HashSet::new();
        for (id, parsed) in &found {
            if !seqnos.insert(parsed.seqno) {
                // data safety forbids guessing which of two same-seqno macroblocks is authoritative.
                return Err(Error::integrity(format!(
                    "duplicate SEQNO {} across macroblocks of partition '{name}' (macroblock {id})",
                    parsed.seqno
                )));
            }
            chain = Self::next_seqnos_chain(chain, parsed.seqno);
            if chain != parsed.seqnos_hash {
                return Err(Error::integrity(format!(
                    "SEQNOS_HASH chain broken at macroblock {id} (seqno {}) of partition '{name}'",
                    parsed.seqno
                )));
            }
        }

        let mut macroblocks = HashMap::new();
        let mut juggler = Juggler::new();
        let mut block_indices = vec![UNWRITTEN_SLOT; (no_macroblocks - reserved) as usize * mmpm];

        for (id, parsed) in &found {
            let mut record = MacroblockRecord::blank(*id);
            record.seqno = parsed.seqno;
            record.next_seqno = parsed.next_seqno;
            record.indices = parsed.indices.clone();
            record.data_hash = parsed.data_hash;
            record.no_nonobsolete = parsed.indices.len() as u32;
            macroblocks.insert(*id, record);
        }
        // Replay in ascending SEQNO order: later writers of a logical slot obsolete earlier ones.
        for (id, parsed) in &found {
            for (d, &slot) in parsed.indices.iter().enumerate() {
                if (slot as usize) >= block_indices.len() {
                    continue;
                }
                let prev = block_indices[slot as usize];
                if prev != UNWRITTEN_SLOT {
                    let (prev_id, _prev_d) = decode_word(prev, mesobits);
                    if let Some(prev_rec) = macroblocks.get_mut(&prev_id) {
                        prev_rec.no_nonobsolete = prev_rec.no_nonobsolete.saturating_sub(1);
                    }
                }
                block_indices[slot as usize] = encode_word(*id, d as u32, mesobits);
            }
        }
        for rec in macroblocks.values_mut() {
            rec.status = if rec.no_nonobsolete > 0 { MacroblockStatus::Used } else { MacroblockStatus::Free };
        }

        let seqno_counter = tip.seqno + 1;
        for id in macroblocks.keys() {
            juggler.add(*id);
        }

        // `close()` flushes any dirty target before this partition was last
        // shut down, so there is no in-flight write to resurrect here: a
        // reopen simply draws a fresh write target the same way the next
        // `do_write` after `create()` would, migrating that target's own
        // still-live data forward first if the juggler happens to hand back
        // a macroblock that already carries some (§4.2 tail migration).
        let placeholder_id = found[0].0;
        let unique_id = Self::unique_id_of(cipher.as_ref(), meso_len);
        let mut part = Partition {
            name,
            geometry,
            mesobits,
            cipher,
            store,
            juggler,
            macroblocks,
            block_indices,
            seqno_counter,
            seqnos_chain: chain,
            no_macroblocks,
            reserved,
            current: CurrentMacroblock::blank(placeholder_id, mmpm, meso_len, 0),
            unique_id,
            close_on_release: false,
            aux: HashMap::new(),
            wasted_gc: 0,
            wasted_empty: 0,
            useful: 0,
        };
        part.rotate_into_fresh_target()?;
        Ok(part)
    }

    fn validate_range(&self, offset: u64, size: usize) -> Result<()> {
        let end = offset.checked_add(size as u64).ok_or_else(|| Error::config("offset overflow"))?;
        if end > self.logical_size() {
            return Err(Error::config(format!(
                "range {offset}..{end} exceeds logical size {}",
                self.logical_size()
            )));
        }
        Ok(())
    }

    fn status_snapshot(&self) -> Vec<u32> {
        // local index order must be stable across writes of the *same* partition
        // generation; we derive it from a sorted key list so replay can reconstruct
        // the same order deterministically from the raw macro ids alone.
        let mut ids: Vec<u32> = self.macroblocks.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .map(|id| match self.macroblocks[id].status {
                MacroblockStatus::Free => 0,
                MacroblockStatus::Used => 1,
            })
            .collect()
    }

    /// Flushes the in-RAM current macroblock to disk and records its result.
    fn flush_current(&mut self) -> Result<()> {
        let seqno = self.seqno_counter;
        self.seqno_counter += 1;
        self.seqnos_chain = Self::next_seqnos_chain(self.seqnos_chain, seqno);

        // the juggler decided, at the moment this target was selected, how
        // many writes would pass before it comes due again.
        let next_seqno = seqno + self.current.lifespan;

        let statuses = self.status_snapshot();
        let no_nonobsolete = self.current.indices.len() as u32;
        self.store.write_current(
            self.cipher.as_ref(),
            self.current.macro_id,
            seqno,
            next_seqno,
            self.no_macroblocks,
            self.reserved,
            &statuses,
            &self.current.indices,
            &mut self.current.data,
            self.seqnos_chain,
        )?;

        let record = self.macroblocks.entry(self.current.macro_id).or_insert_with(|| MacroblockRecord::blank(self.current.macro_id));
        record.seqno = seqno;
        record.next_seqno = next_seqno;
        record.indices = self.current.indices.clone();
        record.no_nonobsolete = no_nonobsolete;
        record.status = if no_nonobsolete > 0 { MacroblockStatus::Used } else { MacroblockStatus::Free };
        Ok(())
    }

    /// Relocates every still-live logical slot of `old_id` into `self.current`,
    /// obsoleting the originals (tail migration, §4.2/§4.3).
    fn migrate_live_slots(&mut self, old_id: u32) -> Result<()> {
        let (seqno, indices) = match self.macroblocks.get(&old_id) {
            Some(rec) => (rec.seqno, rec.indices.clone()),
            None => return Ok(()),
        };
        for (d, &slot) in indices.iter().enumerate() {
            if (slot as usize) >= self.block_indices.len() {
                continue;
            }
            let (mapped_id, mapped_d) = decode_word(self.block_indices[slot as usize], self.mesobits);
            if mapped_id != old_id || mapped_d != d as u32 {
                continue; // already obsoleted by a newer write
            }
            if self.current.is_full(self.mmpm()) {
                break;
            }
            let mut buf = vec![0u8; self.meso_len()];
            self.store.read_meso(self.cipher.as_ref(), old_id, seqno, d as u32 + 1, &mut buf)?;
            let new_d = self.current.indices.len() as u32;
            self.current.data[new_d as usize] = buf;
            self.current.indices.push(slot);
            self.block_indices[slot as usize] = encode_word(self.current.macro_id, new_d, self.mesobits);
            if let Some(rec) = self.macroblocks.get_mut(&old_id) {
                rec.no_nonobsolete = rec.no_nonobsolete.saturating_sub(1);
                rec.no_indices_gc += 1;
                if rec.no_nonobsolete == 0 {
                    rec.status = MacroblockStatus::Free;
                }
            }
            self.wasted_gc += 1;
        }
        Ok(())
    }

    /// Leaves at least this many index slots free in `self.current` so the
    /// write that triggered this rotation always has somewhere to land.
    fn has_room_for_pending_write(&self) -> bool { self.current.indices.len() + 1 < self.mmpm() }

    /// Opportunistically relocates still-live mesoblocks from other used
    /// macroblocks into `self.current`, always leaving at least one index
    /// slot free for the write that triggered this rotation — filling
    /// `current` to literal capacity here would starve that write and make
    /// every subsequently drawn target look full before it is ever used.
    fn preemptive_gc(&mut self) -> Result<()> {
        let order: Vec<u32> = self
            .juggler
            .scheduled_order()
            .chain(self.juggler.unscheduled_order())
            .filter(|id| *id != self.current.macro_id)
            .collect();
        'outer: for candidate in order {
            if !self.has_room_for_pending_write() {
                break;
            }
            let (seqno, indices) = match self.macroblocks.get(&candidate) {
                Some(rec) if rec.no_nonobsolete > 0 => (rec.seqno, rec.indices.clone()),
                _ => continue,
            };
            for (d, &slot) in indices.iter().enumerate() {
                if !self.has_room_for_pending_write() {
                    break 'outer;
                }
                if (slot as usize) >= self.block_indices.len() {
                    continue;
                }
                let (mapped_id, mapped_d) = decode_word(self.block_indices[slot as usize], self.mesobits);
                if mapped_id != candidate || mapped_d != d as u32 {
                    continue;
                }
                let mut buf = vec![0u8; self.meso_len()];
                self.store.read_meso(self.cipher.as_ref(), candidate, seqno, d as u32 + 1, &mut buf)?;
                let new_d = self.current.indices.len() as u32;
                self.current.data[new_d as usize] = buf;
                self.current.indices.push(slot);
                self.block_indices[slot as usize] = encode_word(self.current.macro_id, new_d, self.mesobits);
                if let Some(rec) = self.macroblocks.get_mut(&candidate) {
                    rec.no_nonobsolete = rec.no_nonobsolete.saturating_sub(1);
                    rec.no_indices_preempt += 1;
                    if rec.no_nonobsolete == 0 {
                        rec.status = MacroblockStatus::Free;
                    }
                }
            }
        }
        Ok(())
    }

    /// Draws a fresh write target from the juggler, migrating its own
    /// still-live content forward first if it already carried any, and
    /// topping it up with pre-emptive GC (which always leaves at least one
    /// slot free). So `current` can only come back full here if the
    /// target's own migrated data alone filled it — in which case there is
    /// nowhere left for the pending write and a different target is drawn.
    fn rotate_into_fresh_target(&mut self) -> Result<()> {
        loop {
            let (next_id, lifespan) = self.juggler.select_next_write().ok_or_else(|| {
                Error::out_of_space(format!("partition '{}' has no macroblocks left to rotate into", self.name))
            })?;
            self.current = CurrentMacroblock::blank(next_id, self.mmpm(), self.meso_len(), lifespan);
            self.migrate_live_slots(next_id)?;
            self.preemptive_gc()?;
            if !self.current.is_full(self.mmpm()) {
                break;
            }
        }
        Ok(())
    }

    /// Flushes the current target and selects a fresh one (§4.3 "select next macroblock").
    fn rotate_target(&mut self) -> Result<()> {
        self.flush_current()?;
        self.rotate_into_fresh_target()
    }

    /// Writes `buf` at logical byte `offset` (§4.3 `do_write`).
    pub fn do_write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.validate_range(offset, buf.len())?;
        let meso_len = self.meso_len() as u64;
        let mut remaining = buf;
        let mut pos = offset;
        while !remaining.is_empty() {
            let mesoff = (pos / meso_len) as usize;
            let inmeso = (pos % meso_len) as usize;
            let chunk_len = remaining.len().min(meso_len as usize - inmeso);
            let chunk = &remaining[..chunk_len];

            let existing_word = self.block_indices[mesoff];
            let (mapped_id, mapped_d) = if existing_word != UNWRITTEN_SLOT {
                decode_word(existing_word, self.mesobits)
            } else {
                (0, 0)
            };

            if existing_word != UNWRITTEN_SLOT && mapped_id == self.current.macro_id {
                self.current.data[mapped_d as usize][inmeso..inmeso + chunk_len].copy_from_slice(chunk);
                self.useful += 1;
            } else {
                if self.current.is_full(self.mmpm()) {
                    self.rotate_target()?;
                    continue; // re-evaluate this mesoblock against the fresh target.
                }
                let mut staged = vec![0u8; meso_len as usize];
                if existing_word != UNWRITTEN_SLOT {
                    self.store.read_meso(self.cipher.as_ref(), mapped_id, self.macroblocks[&mapped_id].seqno, mapped_d + 1, &mut staged)?;
                } else {
                    self.wasted_empty += 1;
                }
                staged[inmeso..inmeso + chunk_len].copy_from_slice(chunk);
                let new_d = self.current.indices.len() as u32;
                self.current.data[new_d as usize] = staged;
                self.current.indices.push(mesoff as u32);
                self.block_indices[mesoff] = encode_word(self.current.macro_id, new_d, self.mesobits);
                if existing_word != UNWRITTEN_SLOT {
                    if let Some(rec) = self.macroblocks.get_mut(&mapped_id) {
                        rec.no_nonobsolete = rec.no_nonobsolete.saturating_sub(1);
                        if rec.no_nonobsolete == 0 {
                            rec.status = MacroblockStatus::Free;
                        }
                    }
                }
                self.useful += 1;
            }
            remaining = &remaining[chunk_len..];
            pos += chunk_len as u64;
        }
        Ok(())
    }

    /// Reads `out.len()` logical bytes starting at `offset` (§4.3 `do_read`).
    pub fn do_read(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        self.validate_range(offset, out.len())?;
        let meso_len = self.meso_len() as u64;
        let mut pos = offset;
        let mut written = 0usize;
        while written < out.len() {
            let mesoff = (pos / meso_len) as usize;
            let inmeso = (pos % meso_len) as usize;
            let chunk_len = (out.len() - written).min(meso_len as usize - inmeso);

            let word = self.block_indices[mesoff];
            if word == UNWRITTEN_SLOT {
                out[written..written + chunk_len].fill(0);
            } else {
                let (macro_id, d) = decode_word(word, self.mesobits);
                if macro_id == self.current.macro_id {
                    out[written..written + chunk_len]
                        .copy_from_slice(&self.current.data[d as usize][inmeso..inmeso + chunk_len]);
                } else {
                    let seqno = self.macroblocks[&macro_id].seqno;
                    self.store.read_meso_part(
                        self.cipher.as_ref(),
                        macro_id,
                        seqno,
                        d + 1,
                        inmeso,
                        &mut out[written..written + chunk_len],
                    )?;
                }
            }
            written += chunk_len;
            pos += chunk_len as u64;
        }
        Ok(())
    }

    /// Writes out the current target (with pre-emptive GC) and immediately
    /// starts a new one. Repeated calls drive idle rewriting forward.
    pub fn cycle(&mut self) -> Result<()> {
        self.rotate_target()
    }

    /// Re-reads every used macroblock's data-mesoblock ciphertext and
    /// compares it against the stored `DATA_HASH`.
    pub fn check_data_integrity(&mut self) -> Result<bool> {
        let mut ids: Vec<u32> = self.macroblocks.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if id == self.current.macro_id {
                continue; // not yet flushed; nothing on disk to compare against.
            }
            let expected = self.macroblocks[&id].data_hash;
            if !self.store.check_data(id, &expected)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Grows the partition by claiming `extra_raw_ids` from the unassigned pool.
    pub fn grow(&mut self, extra_raw_ids: Vec<u32>) -> Result<()> {
        for id in &extra_raw_ids {
            self.macroblocks.insert(*id, MacroblockRecord::blank(*id));
            self.juggler.add(*id);
        }
        self.no_macroblocks += extra_raw_ids.len() as u32;
        self.block_indices.resize((self.no_macroblocks - self.reserved) as usize * self.mmpm(), UNWRITTEN_SLOT);
        Ok(())
    }

    /// Shrinks the partition to `new_no_macroblocks`, obsoleting mappings
    /// at or above the new logical capacity. Returns raw macro_ids that
    /// have since drained (no live data) and can be released to the
    /// unassigned pool by the caller (the registry holds that pool).
    pub fn shrink(&mut self, new_no_macroblocks: u32) -> Result<Vec<u32>> {
        if new_no_macroblocks == self.no_macroblocks {
            return Ok(Vec::new());
        }
        let new_len = (new_no_macroblocks - self.reserved) as usize * self.mmpm();
        for word in self.block_indices.iter_mut().skip(new_len) {
            if *word != UNWRITTEN_SLOT {
                let (macro_id, _d) = decode_word(*word, self.mesobits);
                if let Some(rec) = self.macroblocks.get_mut(&macro_id) {
                    rec.no_nonobsolete = rec.no_nonobsolete.saturating_sub(1);
                    if rec.no_nonobsolete == 0 {
                        rec.status = MacroblockStatus::Free;
                    }
                }
                *word = UNWRITTEN_SLOT;
            }
        }
        self.block_indices.truncate(new_len);
        self.no_macroblocks = new_no_macroblocks;

        let mut drained = Vec::new();
        let ids: Vec<u32> = self.macroblocks.keys().copied().collect();
        for id in ids {
            let fully_free = self.macroblocks[&id].no_nonobsolete == 0 && id != self.current.macro_id;
            if fully_free && self.macroblocks.len() as u32 > new_no_macroblocks {
                self.macroblocks.remove(&id);
                drained.push(id);
            }
        }
        Ok(drained)
    }

    pub fn no_macroblocks(&self) -> u32 { self.no_macroblocks }
    pub fn reserved(&self) -> u32 { self.reserved }
    pub fn geometry(&self) -> Geometry { self.geometry }

    pub fn used_macroblock_count(&self) -> usize {
        self.macroblocks.values().filter(|r| matches!(r.status, MacroblockStatus::Used)).count()
    }

    /// Every raw macroblock id currently claimed by this partition,
    /// including the one staged in RAM (§4.4, for the registry's pool bookkeeping).
    pub fn macro_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.macroblocks.keys().copied().collect();
        if !ids.contains(&self.current.macro_id) {
            ids.push(self.current.macro_id);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherSpec;
    use crate::device::RawDevice;

    fn small_geometry() -> Geometry { Geometry::new(16, 12).unwrap() } // 64 KiB macro, 4 KiB meso, MMPM=15

    fn open_store(path: &std::path::Path, g: Geometry, no_raw: u64) -> MacroblockStore {
        let f = std::fs::OpenOptions::new().create(true).write(true).open(path).unwrap();
        f.set_len(no_raw * g.macroblock_size() as u64).unwrap();
        drop(f);
        let device = RawDevice::open(path, g).unwrap();
        MacroblockStore::new(device, g)
    }

    fn new_partition(tmp: &std::path::Path, no_raw: u32) -> Partition {
        let g = small_geometry();
        let store = open_store(tmp, g, no_raw as u64);
        let cipher = CipherSpec::parse("CBC_ESSIV(AES256)").unwrap().build(&[0x41; 32]).unwrap();
        Partition::create("p".into(), g, cipher, store, (0..no_raw).collect(), 0).unwrap()
    }

    #[test]
    fn write_then_read_back_round_trips() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut p = new_partition(tmp.path(), 4);
        let payload = b"hello, world\n";
        p.do_write(0, payload).unwrap();
        let mut out = vec![0u8; payload.len()];
        p.do_read(0, &mut out).unwrap();
        assert_eq!(&out, payload);
    }

    #[test]
    fn unwritten_slots_read_as_zero() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut p = new_partition(tmp.path(), 4);
        let mut out = vec![0xFFu8; 16];
        p.do_read(4096, &mut out).unwrap();
        assert_eq!(out, vec![0u8; 16]);
    }

    #[test]
    fn overwrite_same_slot_is_reflected_on_read() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut p = new_partition(tmp.path(), 4);
        p.do_write(0, &[0xAA; 4096]).unwrap();
        p.do_write(0, &[0xBB; 4096]).unwrap();
        let mut out = vec![0u8; 4096];
        p.do_read(0, &mut out).unwrap();
        assert_eq!(out, vec![0xBBu8; 4096]);
    }

    #[test]
    fn read_past_logical_end_fails() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut p = new_partition(tmp.path(), 4);
        let size = p.logical_size();
        let mut out = vec![0u8; 1];
        assert!(p.do_read(size, &mut out).is_err());
        assert!(p.do_read(size - 1, &mut out).is_ok());
    }

    #[test]
    fn filling_a_macroblock_triggers_rotation() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut p = new_partition(tmp.path(), 8);
        let meso = p.meso_len();
        let mmpm = p.mmpm();
        // fill the current target completely: exactly one rotation should occur.
        for i in 0..mmpm {
            p.do_write((i * meso) as u64, &vec![0x11u8; meso]).unwrap();
        }
        let first_macro = p.current.macro_id;
        p.do_write((mmpm * meso) as u64, &vec![0x22u8; meso]).unwrap();
        assert_ne!(p.current.macro_id, first_macro, "the target macroblock must rotate once full");
    }

    #[test]
    fn close_then_reopen_with_same_key_is_identical() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let g = small_geometry();
        {
            let mut p = new_partition(tmp.path(), 4);
            p.do_write(0, b"remember me").unwrap();
            p.cycle().unwrap();
        }
        let store = open_store(tmp.path(), g, 4);
        let cipher = CipherSpec::parse("CBC_ESSIV(AES256)").unwrap().build(&[0x41; 32]).unwrap();
        let mut reopened = Partition::open("p".into(), g, cipher, store, (0..4).collect()).unwrap();
        let mut out = vec![0u8; b"remember me".len()];
        reopened.do_read(0, &mut out).unwrap();
        assert_eq!(&out, b"remember me");
    }

    #[test]
    fn reopen_with_wrong_key_finds_nothing() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let g = small_geometry();
        {
            let mut p = new_partition(tmp.path(), 4);
            p.do_write(0, b"secret").unwrap();
            p.cycle().unwrap();
        }
        let store = open_store(tmp.path(), g, 4);
        let wrong_cipher = CipherSpec::parse("CBC_ESSIV(AES256)").unwrap().build(&[0x42; 32]).unwrap();
        assert!(Partition::open("p".into(), g, wrong_cipher, store, (0..4).collect()).is_err());
    }
}
