//! Fixed-capacity object pools
//!
//! All descriptor, device, and timer records live in pools whose capacity is
//! chosen at compile time. Records are addressed through generational handles
//! so a handle kept across a release/re-acquire of the same slot is detected
//! as stale instead of silently aliasing the new occupant.

use core::marker::PhantomData;
use core::mem::MaybeUninit;

/// Generational handle into a [`Slab`]
///
/// A handle is valid only while the slot it names holds the same generation
/// it was issued with. Released slots bump their generation, invalidating
/// every outstanding handle to the old occupant.
pub struct Handle<T> {
    index: u16,
    generation: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Slot index for array access
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// Generation this handle was issued with
    #[inline(always)]
    pub const fn generation(self) -> u16 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> core::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Handle({}.{})", self.index, self.generation)
    }
}

#[cfg(feature = "defmt")]
impl<T> defmt::Format for Handle<T> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Handle({}.{})", self.index, self.generation);
    }
}

/// Pool utilization statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlabStats {
    /// Slots currently acquired
    pub in_use: usize,
    /// Total slot count
    pub capacity: usize,
    /// Most slots ever acquired at once
    pub high_water: usize,
}

/// Fixed-capacity slab allocator
///
/// Storage is a flat array of `N` slots plus a free-index stack; acquire and
/// release are O(1) and never move live records, so hardware descriptors
/// embedded in pooled records keep a stable address for their whole lifetime.
pub struct Slab<T, const N: usize> {
    slots: [MaybeUninit<T>; N],
    generations: [u16; N],
    free: [u16; N],
    free_len: usize,
    high_water: usize,
}

impl<T, const N: usize> Slab<T, N> {
    /// Create an empty slab
    pub const fn new() -> Self {
        assert!(N > 0 && N <= u16::MAX as usize);

        let mut free = [0u16; N];
        let mut i = 0;
        while i < N {
            // Pop order is descending so slot 0 is handed out first.
            free[i] = (N - 1 - i) as u16;
            i += 1;
        }

        Self {
            slots: [const { MaybeUninit::uninit() }; N],
            generations: [0; N],
            free,
            free_len: N,
            high_water: 0,
        }
    }

    /// Acquire a slot and move `value` into it
    ///
    /// Returns `None` when the pool is exhausted. Exhaustion is recoverable:
    /// the caller declines the operation and may retry after releases.
    pub fn acquire(&mut self, value: T) -> Option<Handle<T>> {
        if self.free_len == 0 {
            return None;
        }
        self.free_len -= 1;
        let index = self.free[self.free_len] as usize;

        self.slots[index].write(value);

        let in_use = N - self.free_len;
        if in_use > self.high_water {
            self.high_water = in_use;
        }

        Some(Handle {
            index: index as u16,
            generation: self.generations[index],
            _marker: PhantomData,
        })
    }

    /// Release the slot named by `handle`, returning its value
    ///
    /// Stale or already-released handles return `None` and leave the slab
    /// untouched.
    pub fn release(&mut self, handle: Handle<T>) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        let index = handle.index();

        self.generations[index] = self.generations[index].wrapping_add(1);
        self.free[self.free_len] = handle.index;
        self.free_len += 1;

        // Slot was live (checked by contains) and is now marked free, so
        // nothing else will read it before the next write.
        Some(unsafe { self.slots[index].assume_init_read() })
    }

    /// Borrow the record named by `handle`
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        if !self.contains(handle) {
            return None;
        }
        Some(unsafe { self.slots[handle.index()].assume_init_ref() })
    }

    /// Mutably borrow the record named by `handle`
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        if !self.contains(handle) {
            return None;
        }
        Some(unsafe { self.slots[handle.index()].assume_init_mut() })
    }

    /// Whether `handle` still names a live record
    ///
    /// Generations bump on release, so a matching generation implies the
    /// slot has not been released since the handle was issued.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        let index = handle.index();
        index < N && self.generations[index] == handle.generation
    }

    /// Slots currently acquired
    pub fn in_use(&self) -> usize {
        N - self.free_len
    }

    /// Total slot count
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Whether no further acquire can succeed
    pub fn is_full(&self) -> bool {
        self.free_len == 0
    }

    /// Utilization snapshot
    pub fn stats(&self) -> SlabStats {
        SlabStats {
            in_use: self.in_use(),
            capacity: N,
            high_water: self.high_water,
        }
    }
}

impl<T, const N: usize> Drop for Slab<T, N> {
    fn drop(&mut self) {
        if !core::mem::needs_drop::<T>() {
            return;
        }
        for index in 0..N {
            let mut free = false;
            for i in 0..self.free_len {
                if self.free[i] as usize == index {
                    free = true;
                    break;
                }
            }
            if !free {
                unsafe { self.slots[index].assume_init_drop() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_roundtrip() {
        let mut slab: Slab<u32, 4> = Slab::new();

        let h = slab.acquire(42).unwrap();
        assert_eq!(slab.get(h), Some(&42));
        assert_eq!(slab.in_use(), 1);

        assert_eq!(slab.release(h), Some(42));
        assert_eq!(slab.in_use(), 0);
        assert_eq!(slab.get(h), None);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut slab: Slab<u8, 2> = Slab::new();

        let a = slab.acquire(1).unwrap();
        let _b = slab.acquire(2).unwrap();
        assert!(slab.is_full());
        assert!(slab.acquire(3).is_none());

        // Recoverable: release makes room again
        slab.release(a);
        assert!(slab.acquire(4).is_some());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut slab: Slab<u32, 2> = Slab::new();

        let h = slab.acquire(7).unwrap();
        slab.release(h);

        // Same slot, new generation
        let h2 = slab.acquire(9).unwrap();
        assert_eq!(h2.index(), h.index());
        assert_ne!(h2.generation(), h.generation());

        assert_eq!(slab.get(h), None);
        assert_eq!(slab.get_mut(h), None);
        assert_eq!(slab.release(h), None);
        assert_eq!(slab.get(h2), Some(&9));
    }

    #[test]
    fn test_double_release_rejected() {
        let mut slab: Slab<u32, 2> = Slab::new();

        let h = slab.acquire(1).unwrap();
        assert_eq!(slab.release(h), Some(1));
        assert_eq!(slab.release(h), None);
        assert_eq!(slab.in_use(), 0);
    }

    #[test]
    fn test_records_do_not_move() {
        let mut slab: Slab<u64, 4> = Slab::new();

        let h = slab.acquire(0xAA).unwrap();
        let addr_before = slab.get(h).unwrap() as *const u64 as usize;

        // Churn the other slots
        let x = slab.acquire(1).unwrap();
        let y = slab.acquire(2).unwrap();
        slab.release(x);
        let _z = slab.acquire(3).unwrap();
        slab.release(y);

        let addr_after = slab.get(h).unwrap() as *const u64 as usize;
        assert_eq!(addr_before, addr_after);
    }

    #[test]
    fn test_stats_high_water() {
        let mut slab: Slab<u8, 4> = Slab::new();

        let a = slab.acquire(0).unwrap();
        let b = slab.acquire(0).unwrap();
        let c = slab.acquire(0).unwrap();
        slab.release(b);
        slab.release(c);
        let _ = a;

        let stats = slab.stats();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.high_water, 3);
    }

    #[test]
    fn test_every_slot_usable() {
        let mut slab: Slab<usize, 8> = Slab::new();
        let mut handles = [None; 8];

        for (i, slot) in handles.iter_mut().enumerate() {
            *slot = Some(slab.acquire(i).unwrap());
        }
        assert!(slab.is_full());

        for (i, slot) in handles.iter().enumerate() {
            assert_eq!(slab.get(slot.unwrap()), Some(&i));
        }
        for slot in handles.iter() {
            assert!(slab.release(slot.unwrap()).is_some());
        }
        assert_eq!(slab.in_use(), 0);
    }
}
