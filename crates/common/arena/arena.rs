//! Typed slab pools.
//!
//! A [`Pool`] hands out stable ids into grow-only slab storage. Freed slots
//! are threaded onto a LIFO free list and recycled before any slab grows, so
//! hot allocate/free cycles touch the same memory. `clear` drops every live
//! value but keeps the slabs, letting a caller recycle the pool between
//! traversal roots without returning memory to the allocator.

use std::fmt;

/// Stable handle to a slot in a [`Pool`].
///
/// Ids are plain indexes; they are only meaningful for the pool that issued
/// them and remain valid until that slot is freed or the pool is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Vacant { next: Option<u32> },
    Occupied(T),
}

/// Size in bytes the first slab of a pool aims for.
const FIRST_SLAB_BYTES: usize = 4096;

/// A typed slab pool with a LIFO free list.
#[derive(Debug)]
pub struct Pool<T> {
    slabs: Vec<Box<[Slot<T>]>>,
    /// Global index of the first slot in each slab.
    slab_base: Vec<u32>,
    free_head: Option<u32>,
    live: usize,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self {
            slabs: Vec::new(),
            slab_base: Vec::new(),
            free_head: None,
            live: 0,
        }
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Total slots across all slabs, free or not.
    pub fn capacity(&self) -> usize {
        self.slabs.iter().map(|s| s.len()).sum()
    }

    /// Store `value`, reusing the most recently freed slot if one exists.
    pub fn alloc(&mut self, value: T) -> SlotId {
        if self.free_head.is_none() {
            self.grow();
        }
        let id = self.free_head.expect("grow populates the free list");
        let next = match self.slot_mut(id) {
            Slot::Vacant { next } => *next,
            Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
        };
        self.free_head = next;
        *self.slot_mut(id) = Slot::Occupied(value);
        self.live += 1;
        SlotId(id)
    }

    /// Release a slot, returning its value. The slot becomes the next one
    /// `alloc` hands out.
    pub fn free(&mut self, id: SlotId) -> T {
        let head = self.free_head;
        let slot = self.slot_mut(id.0);
        let value = match std::mem::replace(slot, Slot::Vacant { next: head }) {
            Slot::Occupied(value) => value,
            Slot::Vacant { .. } => panic!("double free of pool slot {id}"),
        };
        self.free_head = Some(id.0);
        self.live -= 1;
        value
    }

    pub fn get(&self, id: SlotId) -> &T {
        match self.slot(id.0) {
            Slot::Occupied(value) => value,
            Slot::Vacant { .. } => panic!("access to freed pool slot {id}"),
        }
    }

    pub fn get_mut(&mut self, id: SlotId) -> &mut T {
        match self.slot_mut(id.0) {
            Slot::Occupied(value) => value,
            Slot::Vacant { .. } => panic!("access to freed pool slot {id}"),
        }
    }

    /// Drop every live value but keep all slabs. The rebuilt free list hands
    /// slots back in ascending order starting from the first slab.
    pub fn clear(&mut self) {
        let mut next: Option<u32> = None;
        for (slab_index, slab) in self.slabs.iter_mut().enumerate().rev() {
            let base = self.slab_base[slab_index];
            for (offset, slot) in slab.iter_mut().enumerate().rev() {
                *slot = Slot::Vacant { next };
                next = Some(base + offset as u32);
            }
        }
        self.free_head = next;
        self.live = 0;
    }

    fn grow(&mut self) {
        let first = (FIRST_SLAB_BYTES / size_of::<Slot<T>>().max(1)).max(1);
        let len = match self.slabs.last() {
            Some(last) => last.len() * 2,
            None => first,
        };
        let base = self.capacity() as u32;
        // Chain the fresh slots so that the lowest index pops first.
        let slab: Box<[Slot<T>]> = (0..len)
            .map(|offset| Slot::Vacant {
                next: if offset + 1 < len {
                    Some(base + offset as u32 + 1)
                } else {
                    self.free_head
                },
            })
            .collect();
        self.slabs.push(slab);
        self.slab_base.push(base);
        self.free_head = Some(base);
    }

    fn locate(&self, index: u32) -> (usize, usize) {
        let slab = match self.slab_base.binary_search(&index) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        (slab, (index - self.slab_base[slab]) as usize)
    }

    fn slot(&self, index: u32) -> &Slot<T> {
        let (slab, offset) = self.locate(index);
        &self.slabs[slab][offset]
    }

    fn slot_mut(&mut self, index: u32) -> &mut Slot<T> {
        let (slab, offset) = self.locate(index);
        &mut self.slabs[slab][offset]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::collections::HashMap;

    #[test]
    fn alloc_returns_distinct_ids() {
        let mut pool = Pool::new();
        let a = pool.alloc(1u64);
        let b = pool.alloc(2u64);
        let c = pool.alloc(3u64);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(*pool.get(a), 1);
        assert_eq!(*pool.get(b), 2);
        assert_eq!(*pool.get(c), 3);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn free_then_alloc_is_lifo() {
        let mut pool = Pool::new();
        let a = pool.alloc("a");
        let b = pool.alloc("b");
        let _c = pool.alloc("c");
        assert_eq!(pool.free(b), "b");
        assert_eq!(pool.free(a), "a");
        // Most recently freed first.
        assert_eq!(pool.alloc("a2"), a);
        assert_eq!(pool.alloc("b2"), b);
    }

    #[test]
    fn clear_reuses_existing_slabs() {
        let mut pool = Pool::new();
        for i in 0..1000u32 {
            pool.alloc(i);
        }
        let cap = pool.capacity();
        pool.clear();
        assert!(pool.is_empty());
        for i in 0..1000u32 {
            let id = pool.alloc(i);
            assert!(id.index() < cap);
        }
        assert_eq!(pool.capacity(), cap);
    }

    #[test]
    fn clear_hands_out_ascending_ids() {
        let mut pool = Pool::new();
        for i in 0..10u32 {
            pool.alloc(i);
        }
        pool.clear();
        let first = pool.alloc(0u32);
        let second = pool.alloc(1u32);
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
    }

    #[test]
    fn randomized_against_model() {
        let mut rng = StdRng::seed_from_u64(0x9e3779b9);
        let mut pool = Pool::new();
        let mut model: HashMap<SlotId, u64> = HashMap::new();
        for round in 0..10_000u64 {
            if model.is_empty() || rng.gen_bool(0.6) {
                let id = pool.alloc(round);
                assert!(model.insert(id, round).is_none(), "id reused while live");
            } else {
                let victim = *model.keys().nth(rng.gen_range(0..model.len())).unwrap();
                let expected = model.remove(&victim).unwrap();
                assert_eq!(pool.free(victim), expected);
            }
            assert_eq!(pool.len(), model.len());
        }
        for (id, expected) in &model {
            assert_eq!(pool.get(*id), expected);
        }
    }
}
