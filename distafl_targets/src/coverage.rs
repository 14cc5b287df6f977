//! The edge coverage map and the previous location of each thread.

use core::{
    cell::Cell,
    sync::atomic::{AtomicU8, Ordering},
};

pub use distafl_cc::MAP_SIZE;

/// The shared edge map.
///
/// Instrumented code bumps counters with a plain load followed by a plain store, not an
/// atomic read-modify-write, so concurrent hits on one key can be lost. Counters wrap.
#[derive(Debug)]
pub struct CoverageMap {
    bytes: Box<[AtomicU8]>,
}

impl Default for CoverageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageMap {
    /// A zeroed map of [`MAP_SIZE`] bytes
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes: (0..MAP_SIZE).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// The number of counters
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always `false`, the map has a fixed size
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The counter at `key`, `None` if out of range
    #[must_use]
    pub fn get(&self, key: usize) -> Option<u8> {
        self.bytes.get(key).map(|b| b.load(Ordering::Relaxed))
    }

    /// Overwrites the counter at `key`. Returns `false` if out of range.
    pub fn set(&self, key: usize, value: u8) -> bool {
        let Some(b) = self.bytes.get(key) else {
            return false;
        };
        b.store(value, Ordering::Relaxed);
        true
    }

    /// `map[key]++`, unsynchronized and wrapping. Keys are masked into the map.
    #[inline]
    pub fn hit(&self, key: u32) {
        let counter = &self.bytes[key as usize & (MAP_SIZE - 1)];
        let val = counter.load(Ordering::Relaxed).wrapping_add(1);
        counter.store(val, Ordering::Relaxed);
    }

    /// Zeroes every counter
    pub fn reset(&self) {
        for b in &*self.bytes {
            b.store(0, Ordering::Relaxed);
        }
    }

    /// How many counters are non-zero
    #[must_use]
    pub fn count_nonzero(&self) -> usize {
        self.bytes
            .iter()
            .filter(|b| b.load(Ordering::Relaxed) != 0)
            .count()
    }

    /// The keys of all non-zero counters, ascending
    #[must_use]
    pub fn nonzero_keys(&self) -> Vec<usize> {
        self.bytes
            .iter()
            .enumerate()
            .filter(|(_, b)| b.load(Ordering::Relaxed) != 0)
            .map(|(key, _)| key)
            .collect()
    }

    /// A copy of all counters
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }
}

thread_local! {
    static PREV_LOC: Cell<u32> = const { Cell::new(0) };
}

/// This thread's `__afl_prev_loc`. Zero when the thread starts.
#[must_use]
pub fn prev_loc() -> u32 {
    PREV_LOC.with(Cell::get)
}

/// Overwrites this thread's `__afl_prev_loc`
pub fn set_prev_loc(loc: u32) {
    PREV_LOC.with(|p| p.set(loc));
}

/// Resets this thread's `__afl_prev_loc`, e.g. between two executions
pub fn reset_prev_loc() {
    set_prev_loc(0);
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::{prev_loc, reset_prev_loc, set_prev_loc, CoverageMap, MAP_SIZE};

    #[test]
    fn test_hits_wrap() {
        let map = CoverageMap::new();
        assert_eq!(map.len(), MAP_SIZE);
        for _ in 0..256 {
            map.hit(7);
        }
        assert_eq!(map.get(7), Some(0));
        map.hit(7);
        map.hit(MAP_SIZE as u32 + 9);
        assert_eq!(map.nonzero_keys(), vec![7, 9]);
        map.reset();
        assert_eq!(map.count_nonzero(), 0);
        assert_eq!(map.get(MAP_SIZE), None);
        assert!(!map.set(MAP_SIZE, 1));
    }

    #[test]
    fn test_prev_loc_is_per_thread() {
        set_prev_loc(0x1234);
        let other = thread::spawn(|| {
            let seen = prev_loc();
            set_prev_loc(5);
            seen
        })
        .join()
        .unwrap();
        assert_eq!(other, 0);
        assert_eq!(prev_loc(), 0x1234);
        reset_prev_loc();
        assert_eq!(prev_loc(), 0);
    }
}
