//! Bounded MPMC slot ring.
//!
//! Each slot carries a sequence number that tags its state: `seq == ticket`
//! means free for the producer holding that ticket, `seq == ticket + 1` means
//! full for the consumer holding it. Producers and consumers claim tickets
//! with a CAS on the monotonic tail/head counters and publish with a release
//! store on the slot's sequence, so a claimed slot is touched by exactly one
//! thread at a time.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct Ring<T> {
    slots: Box<[Slot<T>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl<T: Send> Sync for Ring<T> {}
unsafe impl<T: Send> Send for Ring<T> {}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be nonzero");
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Enqueue without blocking; hands the value back when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let cap = self.slots.len();
        let mut ticket = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[ticket % cap];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq == ticket {
                match self.tail.compare_exchange_weak(
                    ticket,
                    ticket + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(ticket + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => ticket = current,
                }
            } else if seq < ticket {
                // The slot still holds a value from one lap ago.
                return Err(value);
            } else {
                ticket = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue without blocking.
    pub fn pop(&self) -> Option<T> {
        let cap = self.slots.len();
        let mut ticket = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[ticket % cap];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq == ticket + 1 {
                match self.head.compare_exchange_weak(
                    ticket,
                    ticket + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq.store(ticket + cap, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => ticket = current,
                }
            } else if seq <= ticket {
                return None;
            } else {
                ticket = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_when_single_threaded() {
        let ring = Ring::new(4);
        assert!(ring.push(1).is_ok());
        assert!(ring.push(2).is_ok());
        assert_eq!(ring.pop(), Some(1));
        assert!(ring.push(3).is_ok());
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn rejects_when_full() {
        let ring = Ring::new(2);
        assert!(ring.push(1).is_ok());
        assert!(ring.push(2).is_ok());
        assert_eq!(ring.push(3), Err(3));
        assert_eq!(ring.pop(), Some(1));
        assert!(ring.push(3).is_ok());
    }

    #[test]
    fn wraps_many_laps() {
        let ring = Ring::new(3);
        for i in 0..100 {
            assert!(ring.push(i).is_ok());
            assert_eq!(ring.pop(), Some(i));
        }
    }

    #[test]
    fn concurrent_producers_and_consumers_conserve_items() {
        const PER_THREAD: usize = 10_000;
        let ring = Arc::new(Ring::new(64));
        let mut handles = Vec::new();
        for t in 0..4usize {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let mut value = t * PER_THREAD + i;
                    loop {
                        match ring.push(value) {
                            Ok(()) => break,
                            Err(v) => {
                                value = v;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }
        let popped = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut collectors = Vec::new();
        for _ in 0..2 {
            let ring = Arc::clone(&ring);
            let popped = Arc::clone(&popped);
            collectors.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while popped.load(Ordering::Relaxed) < 4 * PER_THREAD {
                    match ring.pop() {
                        Some(v) => {
                            popped.fetch_add(1, Ordering::Relaxed);
                            seen.push(v);
                        }
                        None => thread::yield_now(),
                    }
                }
                seen
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut all = BTreeSet::new();
        for c in collectors {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "value {v} delivered twice");
            }
        }
        assert_eq!(all.len(), 4 * PER_THREAD);
    }
}
