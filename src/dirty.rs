//! Dirty tracking for cached rendering state.
//!
//! Two shapes of the same idea:
//!
//! - [`DirtySet`]: graph elements (summing junctions, node outputs) whose
//!   rendering snapshot must be rebuilt before the next quantum. Mutated and
//!   drained only under the graph lock.
//! - [`DirtyFlags`] + [`Memo`]: a bitset of stale caches plus the cached
//!   values themselves, recomputed lazily on read. Used by positional nodes,
//!   guarded by their own narrow lock.

use core::hash::Hash;

use hashbrown::HashSet;

/// Set of elements whose cached state is stale.
#[derive(Debug)]
pub struct DirtySet<K> {
    keys: HashSet<K>,
}

impl<K: Eq + Hash + Copy> Default for DirtySet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Copy> DirtySet<K> {
    pub fn new() -> Self {
        Self { keys: HashSet::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: HashSet::with_capacity(capacity),
        }
    }

    /// Mark `key` dirty. Returns `false` if it already was.
    pub fn mark(&mut self, key: K) -> bool {
        self.keys.insert(key)
    }

    pub fn is_dirty(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Forget every key matching `pred`. Used before the element is freed so
    /// nothing is left pointing at it.
    pub fn purge(&mut self, mut pred: impl FnMut(&K) -> bool) {
        self.keys.retain(|k| !pred(k));
    }

    /// Take every dirty key, keeping the allocation for the next quantum.
    pub fn drain(&mut self) -> impl Iterator<Item = K> + '_ {
        self.keys.drain()
    }

    /// Grow the backing table ahead of time, on the control thread.
    pub fn reserve(&mut self, additional: usize) {
        self.keys.reserve(additional);
    }
}

/// Bitset of stale caches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirtyFlags(u8);

impl DirtyFlags {
    pub const fn all() -> Self {
        Self(u8::MAX)
    }

    pub fn set(&mut self, bits: u8) {
        self.0 |= bits;
    }

    pub fn is_set(&self, bits: u8) -> bool {
        self.0 & bits != 0
    }

    /// Clear `bits`, returning whether any of them were set.
    pub fn take(&mut self, bits: u8) -> bool {
        let was = self.is_set(bits);
        self.0 &= !bits;
        was
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// A cached value tied to one bit of a [`DirtyFlags`].
#[derive(Clone, Debug)]
pub struct Memo<T> {
    bit: u8,
    value: T,
    recomputations: u64,
}

impl<T: Copy> Memo<T> {
    pub fn new(bit: u8, initial: T) -> Self {
        Self {
            bit,
            value: initial,
            recomputations: 0,
        }
    }

    /// Return the cached value, recomputing it first if its bit is set.
    ///
    /// `recompute` reads whatever inputs are current when it runs, so several
    /// setter calls between two reads cost a single recomputation.
    pub fn get(&mut self, flags: &mut DirtyFlags, recompute: impl FnOnce() -> T) -> T {
        if flags.take(self.bit) {
            self.value = recompute();
            self.recomputations += 1;
        }
        self.value
    }

    /// The cached value, stale or not.
    pub fn peek(&self) -> T {
        self.value
    }

    pub fn bit(&self) -> u8 {
        self.bit
    }

    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_set_marks_once_and_drains() {
        let mut set = DirtySet::new();
        assert!(set.mark(3u32));
        assert!(!set.mark(3));
        set.mark(5);
        assert_eq!(set.len(), 2);

        let mut drained: Vec<_> = set.drain().collect();
        drained.sort();
        assert_eq!(drained, vec![3, 5]);
        assert!(set.is_empty());
    }

    #[test]
    fn purge_removes_matching_keys() {
        let mut set = DirtySet::new();
        for k in [(1u32, 0usize), (1, 1), (2, 0)] {
            set.mark(k);
        }
        set.purge(|(node, _)| *node == 1);
        assert!(set.is_dirty(&(2, 0)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn memo_recomputes_only_when_dirty() {
        let mut flags = DirtyFlags::all();
        let mut memo = Memo::new(0b10, 0.0f32);
        let mut input = 2.0f32;

        assert_eq!(memo.get(&mut flags, || input * 2.0), 4.0);
        assert_eq!(memo.get(&mut flags, || input * 2.0), 4.0);
        assert_eq!(memo.recomputations(), 1);

        input = 3.0;
        // Not marked: stale value is returned.
        assert_eq!(memo.get(&mut flags, || input * 2.0), 4.0);

        flags.set(0b10);
        flags.set(0b10);
        assert_eq!(memo.get(&mut flags, || input * 2.0), 6.0);
        assert_eq!(memo.recomputations(), 2);
    }

    #[test]
    fn flags_are_independent() {
        let mut flags = DirtyFlags::default();
        flags.set(0b001 | 0b100);
        assert!(flags.take(0b001));
        assert!(!flags.take(0b001));
        assert!(flags.is_set(0b100));
        assert!(!flags.is_set(0b010));
    }
}
