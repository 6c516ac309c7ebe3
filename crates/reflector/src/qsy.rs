//! Random QSY allocation.
//!
//! When a node requests a QSY to talkgroup 0, the reflector picks an
//! unoccupied talkgroup from a configured pool. The cursor rotates
//! monotonically through the pool so successive allocations spread over
//! the range instead of reusing the first free entry.

use crate::config::QsyRange;

/// Rotating allocator over the configured random-QSY pool.
///
/// Disabled permanently when the range is absent or illegal; every
/// request then fails.
#[derive(Debug, Clone)]
pub struct QsyAllocator {
    lo: u32,
    hi: u32,
    cursor: u32,
}

impl QsyAllocator {
    /// An allocator that refuses every request.
    pub fn disabled() -> Self {
        Self {
            lo: 0,
            hi: 0,
            cursor: 0,
        }
    }

    /// Builds the allocator from the configured range, if any.
    ///
    /// An illegal range (`lo < 1`, zero size, or numeric overflow) logs
    /// a warning and yields a disabled allocator, matching the
    /// "ignore bad configuration" behavior of the config contract.
    pub fn from_config(range: Option<QsyRange>) -> Self {
        let Some(range) = range else {
            return Self::disabled();
        };
        let hi = match range.size.checked_sub(1).and_then(|n| range.lo.checked_add(n)) {
            Some(hi) if range.lo >= 1 => hi,
            _ => {
                tracing::warn!(
                    lo = range.lo,
                    size = range.size,
                    "illegal random_qsy_range, random QSY disabled"
                );
                return Self::disabled();
            }
        };
        Self {
            lo: range.lo,
            hi,
            // First allocation advances past `hi` and wraps to `lo`.
            cursor: hi,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lo != 0
    }

    /// Picks the next unoccupied talkgroup, advancing the cursor.
    ///
    /// `occupied` reports whether a candidate talkgroup has members.
    /// Returns `None` when the allocator is disabled or a full rotation
    /// finds no free talkgroup.
    pub fn allocate(&mut self, mut occupied: impl FnMut(u32) -> bool) -> Option<u32> {
        if !self.is_enabled() {
            return None;
        }
        let size = self.hi - self.lo + 1;
        for _ in 0..size {
            self.cursor = if self.cursor < self.hi {
                self.cursor + 1
            } else {
                self.lo
            };
            if !occupied(self.cursor) {
                return Some(self.cursor);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(lo: u32, size: u32) -> Option<QsyRange> {
        Some(QsyRange { lo, size })
    }

    #[test]
    fn test_unconfigured_allocator_always_fails() {
        let mut qsy = QsyAllocator::from_config(None);
        assert!(!qsy.is_enabled());
        assert_eq!(qsy.allocate(|_| false), None);
    }

    #[test]
    fn test_illegal_range_disables_allocator() {
        assert!(!QsyAllocator::from_config(range(0, 5)).is_enabled());
        assert!(!QsyAllocator::from_config(range(100, 0)).is_enabled());
        assert!(!QsyAllocator::from_config(range(u32::MAX, 2)).is_enabled());
    }

    #[test]
    fn test_allocate_skips_occupied_tgs() {
        // Pool 100..=102; 100 and 102 occupied, 101 free.
        let mut qsy = QsyAllocator::from_config(range(100, 3));

        let tg = qsy.allocate(|tg| tg == 100 || tg == 102);

        assert_eq!(tg, Some(101));
    }

    #[test]
    fn test_allocate_returns_same_tg_while_still_free() {
        let mut qsy = QsyAllocator::from_config(range(100, 3));
        assert_eq!(qsy.allocate(|tg| tg != 101), Some(101));
        // 101 is still the only free one: a full further rotation lands
        // on it again.
        assert_eq!(qsy.allocate(|tg| tg != 101), Some(101));
    }

    #[test]
    fn test_allocate_rotates_over_free_pool() {
        let mut qsy = QsyAllocator::from_config(range(100, 3));

        // Nothing occupied: successive allocations walk the pool.
        assert_eq!(qsy.allocate(|_| false), Some(100));
        assert_eq!(qsy.allocate(|_| false), Some(101));
        assert_eq!(qsy.allocate(|_| false), Some(102));
        assert_eq!(qsy.allocate(|_| false), Some(100));
    }

    #[test]
    fn test_allocate_fails_when_pool_is_full() {
        let mut qsy = QsyAllocator::from_config(range(100, 3));
        assert_eq!(qsy.allocate(|_| true), None);
        // Failure does not wedge the allocator: the full rotation left
        // the cursor back at the top, so the next pick wraps to 100.
        assert_eq!(qsy.allocate(|_| false), Some(100));
    }

    #[test]
    fn test_allocate_never_returns_occupied_tg() {
        let mut qsy = QsyAllocator::from_config(range(1, 16));
        let occupied = |tg: u32| tg % 2 == 0;
        for _ in 0..64 {
            if let Some(tg) = qsy.allocate(occupied) {
                assert!(!occupied(tg), "allocated occupied TG {tg}");
                assert!((1..=16).contains(&tg), "TG {tg} outside pool");
            }
        }
    }
}
