//! Juggler: the per-partition randomized rewrite schedule (§4.2).
//!
//! Keeps an unscheduled set (macroblocks never seen yet, or seen too long
//! ago to still be decryptable) and a scheduled list sorted by ascending
//! remaining lifespan. `select_next_write` pops one macroblock per call and
//! re-inserts it at a freshly drawn future lifespan.

use rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha12Rng;

/// One entry of the scheduled list: the number of writes until this
/// macroblock is due to be popped and rewritten.
#[derive(Debug, Clone, Copy)]
struct ScheduledEntry {
    macro_id: u32,
    lifespan: u64,
}

pub struct Juggler {
    unscheduled: Vec<u32>,
    /// Kept sorted by ascending `lifespan`; `scheduled[0]` is the tail.
    scheduled: Vec<ScheduledEntry>,
    rng: ChaCha12Rng,
}

impl Juggler {
    /// A juggler with its own CSPRNG stream, seeded from the OS — one per
    /// partition, per `original_source`'s "one `random_t` per dev, to avoid
    /// locking issues".
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        rand_core::OsRng.fill_bytes(&mut seed);
        Juggler { unscheduled: Vec::new(), scheduled: Vec::new(), rng: ChaCha12Rng::from_seed(seed) }
    }

    #[cfg(test)]
    fn with_seed(seed: u64) -> Self {
        Juggler { unscheduled: Vec::new(), scheduled: Vec::new(), rng: ChaCha12Rng::seed_from_u64(seed) }
    }

    /// Adds a macroblock to the unscheduled set, e.g. on partition mount
    /// for every macroblock reassembled by replay.
    pub fn add(&mut self, macro_id: u32) {
        debug_assert!(!self.contains(macro_id), "macroblock {macro_id} already tracked by the juggler");
        self.unscheduled.push(macro_id);
    }

    fn contains(&self, macro_id: u32) -> bool {
        self.unscheduled.contains(&macro_id) || self.scheduled.iter().any(|e| e.macro_id == macro_id)
    }

    /// Total macroblocks this juggler is responsible for: `U + |S|`.
    pub fn len(&self) -> usize { self.unscheduled.len() + self.scheduled.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// The macroblock scheduled to be overwritten next (lowest remaining
    /// lifespan), i.e. the one whose live mappings must be relocated first.
    pub fn tail(&self) -> Option<u32> { self.scheduled.first().map(|e| e.macro_id) }

    /// Scheduled macroblocks in the order the juggler will next rewrite
    /// them (ascending remaining lifespan), for pre-emptive GC scanning.
    pub fn scheduled_order(&self) -> impl Iterator<Item = u32> + '_ { self.scheduled.iter().map(|e| e.macro_id) }

    /// Unscheduled macroblocks, in no particular order (none has a defined
    /// next-rewrite time yet).
    pub fn unscheduled_order(&self) -> impl Iterator<Item = u32> + '_ { self.unscheduled.iter().copied() }

    fn uniform_below(&mut self, bound: usize) -> usize {
        if bound <= 1 {
            return 0;
        }
        let bound64 = bound as u64;
        let zone = u64::MAX - (u64::MAX % bound64);
        loop {
            let v = self.rng.next_u64();
            if v < zone {
                return (v % bound64) as usize;
            }
        }
    }

    /// Picks the next macroblock to rewrite and reschedules it at a fresh,
    /// uniformly-drawn future lifespan, per the algorithm in §4.2. Returns
    /// the macroblock along with the number of future writes (to any
    /// macroblock of this partition) before it comes due again — the
    /// caller stamps this into `NEXT_SEQNO` as `seqno + lifespan`.
    pub fn select_next_write(&mut self) -> Option<(u32, u64)> {
        if self.is_empty() {
            return None;
        }

        let emitted = if self.scheduled.first().map(|e| e.lifespan) == Some(1) {
            self.scheduled.remove(0).macro_id
        } else if !self.unscheduled.is_empty() {
            let idx = self.uniform_below(self.unscheduled.len());
            self.unscheduled.remove(idx)
        } else {
            // everything tracked is already scheduled but none is due yet;
            // can only happen transiently right after construction.
            self.scheduled.remove(0).macro_id
        };

        for entry in self.scheduled.iter_mut() {
            entry.lifespan -= 1;
        }

        let mut time: u64 = 1;
        let mut passed_over: usize = 0;
        loop {
            if self.scheduled.iter().any(|e| e.lifespan == time) {
                passed_over += 1;
                time += 1;
                continue;
            }
            let a = self.unscheduled.len() + 1 + passed_over;
            let r = self.uniform_below(a);
            if r == 0 {
                let pos = self.scheduled.partition_point(|e| e.lifespan < time);
                self.scheduled.insert(pos, ScheduledEntry { macro_id: emitted, lifespan: time });
                return Some((emitted, time));
            }
            time += 1;
        }
    }
}

impl Default for Juggler {
    fn default() -> Self { Juggler::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_added_block_is_eventually_emitted() {
        let mut j = Juggler::with_seed(1);
        for id in 0..50u32 {
            j.add(id);
        }
        let mut seen: HashSet<u32> = HashSet::new();
        for _ in 0..2000 {
            if let Some((id, _lifespan)) = j.select_next_write() {
                seen.insert(id);
            }
            if seen.len() == 50 {
                break;
            }
        }
        assert_eq!(seen.len(), 50, "every macroblock must eventually be emitted");
    }

    #[test]
    fn emission_preserves_the_tracked_population() {
        let mut j = Juggler::with_seed(2);
        for id in 0..20u32 {
            j.add(id);
        }
        for _ in 0..500 {
            j.select_next_write();
            assert_eq!(j.len(), 20, "the juggler must neither gain nor lose macroblocks");
        }
    }

    #[test]
    fn tail_is_always_the_lowest_remaining_lifespan() {
        let mut j = Juggler::with_seed(3);
        for id in 0..10u32 {
            j.add(id);
        }
        for _ in 0..200 {
            j.select_next_write();
            if let Some(tail) = j.tail() {
                assert!(j.scheduled.iter().all(|e| e.lifespan >= j.scheduled[0].lifespan));
                let _ = tail;
            }
        }
    }

    #[test]
    fn empty_juggler_yields_nothing() {
        let mut j = Juggler::new();
        assert_eq!(j.select_next_write(), None);
    }
}
