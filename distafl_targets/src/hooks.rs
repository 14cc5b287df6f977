//! Receivers for the `insert_block` and `insert_distance` calls of instrumented code.

use std::sync::{Mutex, MutexGuard};

use distafl_cc::distance::DEFAULT_LABEL;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// What instrumented code reports besides edge coverage.
pub trait DistanceHooks {
    /// `insert_block(id)`: the join point `id` was entered
    fn insert_block(&self, id: u32);

    /// `insert_distance(id, label, distance)`: at join point `id`, the outcome `label`
    /// is `distance` away from being taken. Zero means it is taken.
    fn insert_distance(&self, id: u32, label: u32, distance: u32);
}

/// One hook call
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Report {
    /// `insert_block`
    Block {
        /// The join point
        id: u32,
    },
    /// `insert_distance`
    Distance {
        /// The join point
        id: u32,
        /// The outcome, [`DEFAULT_LABEL`] for comparisons and default arms
        label: u32,
        /// How far away it is
        distance: u32,
    },
}

/// Records every hook call, in order. Shareable between threads.
#[derive(Debug, Default)]
pub struct DistanceLog {
    reports: Mutex<Vec<Report>>,
}

impl DistanceLog {
    /// Creates an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Report>> {
        self.reports
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A copy of all reports so far
    #[must_use]
    pub fn reports(&self) -> Vec<Report> {
        self.lock().clone()
    }

    /// Removes and returns all reports so far
    pub fn take(&self) -> Vec<Report> {
        core::mem::take(&mut *self.lock())
    }

    /// The join points entered, in order
    #[must_use]
    pub fn blocks(&self) -> Vec<u32> {
        self.lock()
            .iter()
            .filter_map(|r| match r {
                Report::Block { id } => Some(*id),
                Report::Distance { .. } => None,
            })
            .collect()
    }

    /// The `(label, distance)` pairs reported for join point `id`, in order
    #[must_use]
    pub fn distances_of(&self, id: u32) -> Vec<(u32, u32)> {
        self.lock()
            .iter()
            .filter_map(|r| match *r {
                Report::Distance {
                    id: at,
                    label,
                    distance,
                } if at == id => Some((label, distance)),
                _ => None,
            })
            .collect()
    }
}

impl DistanceHooks for DistanceLog {
    fn insert_block(&self, id: u32) {
        self.lock().push(Report::Block { id });
    }

    fn insert_distance(&self, id: u32, label: u32, distance: u32) {
        self.lock().push(Report::Distance {
            id,
            label,
            distance,
        });
    }
}

/// The smallest distance ever seen per `(join point, label)`, which is what a
/// distance-guided scheduler compares inputs by.
#[derive(Debug, Default)]
pub struct MinDistanceMap {
    min: Mutex<HashMap<(u32, u32), u32>>,
}

impl MinDistanceMap {
    /// Creates an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(u32, u32), u32>> {
        self.min
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The best distance for `label` at join point `id`, if it was ever reached
    #[must_use]
    pub fn get(&self, id: u32, label: u32) -> Option<u32> {
        self.lock().get(&(id, label)).copied()
    }

    /// Whether the comparison or default arm at `id` was ever satisfied
    #[must_use]
    pub fn is_solved(&self, id: u32) -> bool {
        self.get(id, DEFAULT_LABEL) == Some(0)
    }

    /// The number of `(join point, label)` pairs seen
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// `true` if nothing was reported yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl DistanceHooks for MinDistanceMap {
    fn insert_block(&self, _id: u32) {}

    fn insert_distance(&self, id: u32, label: u32, distance: u32) {
        self.lock()
            .entry((id, label))
            .and_modify(|best| *best = (*best).min(distance))
            .or_insert(distance);
    }
}

#[cfg(test)]
mod tests {
    use super::{DistanceHooks, DistanceLog, MinDistanceMap, Report};

    #[test]
    fn test_log_keeps_order() {
        let log = DistanceLog::new();
        log.insert_block(3);
        log.insert_distance(3, 0, 17);
        log.insert_block(4);
        log.insert_distance(3, 0, 1);

        assert_eq!(log.blocks(), vec![3, 4]);
        assert_eq!(log.distances_of(3), vec![(0, 17), (0, 1)]);
        assert!(log.distances_of(4).is_empty());
        assert_eq!(log.take()[1], Report::Distance {
            id: 3,
            label: 0,
            distance: 17
        });
        assert!(log.reports().is_empty());
    }

    #[test]
    fn test_min_distance() {
        let min = MinDistanceMap::new();
        assert!(min.is_empty());
        min.insert_distance(1, 0, 8);
        min.insert_distance(1, 0, 3);
        min.insert_distance(1, 0, 5);
        min.insert_distance(1, 2, 0);
        assert_eq!(min.get(1, 0), Some(3));
        assert_eq!(min.len(), 2);
        assert!(!min.is_solved(1));
        min.insert_distance(1, 0, 0);
        assert!(min.is_solved(1));
    }
}
