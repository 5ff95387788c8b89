//! The lock-free FIFO (LFQ): a Michael–Scott queue over a singly linked list with a sentinel
//! head, built on [`Tap`] for ABA-safe `head`/`tail`/`next` updates and on [`Reclaimer`] for
//! safe reclamation of the nodes `take` unlinks.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;

use crate::reclaim::{Reclaimer, DEFAULT_GUARD_CAPACITY};
use crate::tap::{Tagged, Tap};

struct Node<T> {
    /// Holds a live, not-yet-taken value for every node except the current sentinel, whose
    /// slot is either never initialized (the original sentinel) or already vacated by a
    /// previous `take` (a node promoted to sentinel). `MaybeUninit` makes both states inert
    /// under `Drop`: nothing here ever double-drops or reads uninitialized memory.
    value: UnsafeCell<MaybeUninit<T>>,
    next: Tap<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            next: Tap::null(),
        }))
    }

    fn holding(value: T) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value: UnsafeCell::new(MaybeUninit::new(value)),
            next: Tap::null(),
        }))
    }
}

/// A lock-free, multi-producer/multi-consumer FIFO queue.
///
/// `push` never blocks and never fails short of allocator exhaustion. `take` never blocks;
/// it returns `None` the moment the queue is observed empty. Both are lock-free: at least one
/// caller always makes progress, though any individual caller may be overtaken indefinitely by
/// others.
///
/// Memory is reclaimed through a hazard-pointer-style guard table sized at construction (see
/// [`Queue::with_guard_capacity`]); a concurrency level that exceeds the table's capacity is a
/// fatal configuration error (`take` panics from [`Reclaimer::hire_guard`] rather than corrupt
/// the list).
pub struct Queue<T> {
    head: Tap<Node<T>>,
    tail: Tap<Node<T>>,
    reclaim: Reclaimer<Node<T>>,
}

// The queue moves `T` values between threads but never inspects or aliases them outside of a
// single owner at a time (the CAS winner in `take`), so `Send` is all a payload type needs for
// the queue itself to be `Send`/`Sync`, matching the teacher's `unsafe impl<T: Send> Sync for
// MsQueue<T>` shape.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T> Queue<T> {
    /// Create a new, empty queue with the default guard-table capacity
    /// ([`DEFAULT_GUARD_CAPACITY`]).
    pub fn new() -> Self {
        Self::with_guard_capacity(DEFAULT_GUARD_CAPACITY)
    }

    /// Create a new, empty queue whose guard table holds up to `guard_capacity` concurrent
    /// callers. Size this to at least twice the peak number of threads that will call `take`
    /// concurrently; exceeding it turns a later `take` into a panic (see
    /// [`Reclaimer::hire_guard`]).
    pub fn with_guard_capacity(guard_capacity: usize) -> Self {
        let sentinel = Node::sentinel();
        Queue {
            head: Tap::new(sentinel, 0),
            tail: Tap::new(sentinel, 0),
            reclaim: Reclaimer::new(guard_capacity),
        }
    }

    /// The guard table's configured capacity (`MG`).
    pub fn guard_capacity(&self) -> usize {
        self.reclaim.capacity()
    }

    /// The highest number of concurrent `take` callers this queue has ever observed at once
    /// (the guard table's high-water mark, `MAXG`).
    pub fn peak_concurrent_takers(&self) -> usize {
        self.reclaim.high_water_mark() + 1
    }

    /// Enqueue `value` at the back of the queue. Never blocks; never fails short of the
    /// allocator itself failing.
    pub fn push(&self, value: T) {
        let node = Node::holding(value);
        loop {
            let tail = self.tail.load();
            let next = unsafe { (*tail.ptr).next.load() };

            if self.tail.load() != tail {
                continue;
            }

            if next.is_null() {
                let desired = Tagged::new(node, next.tag.wrapping_add(1));
                if unsafe { (*tail.ptr).next.compare_exchange(next, desired) }.is_ok() {
                    let _ = self
                        .tail
                        .compare_exchange(tail, Tagged::new(node, tail.tag.wrapping_add(1)));
                    return;
                }
            } else {
                let _ = self
                    .tail
                    .compare_exchange(tail, Tagged::new(next.ptr, tail.tag.wrapping_add(1)));
            }
        }
    }

    /// Attempt to dequeue from the front. Returns `None` if the queue was observed empty at
    /// some point during the call.
    pub fn take(&self) -> Option<T> {
        let guard = self.reclaim.hire_guard();

        let (value, retired) = loop {
            let head = self.head.load();
            let tail = self.tail.load();
            let next = unsafe { (*head.ptr).next.load() };

            // Publish before the re-check below: the hazard protocol requires this guard to
            // be visible to any concurrent `liberate` before we rely on `head` being stable.
            self.reclaim.post_guard(guard, head.ptr);

            if self.head.load() != head {
                continue;
            }

            if head.ptr == tail.ptr {
                if next.is_null() {
                    self.reclaim.fire_guard(guard);
                    return None;
                }
                // Tail is lagging behind a push that has linked but not yet swung Tail.
                let _ = self
                    .tail
                    .compare_exchange(tail, Tagged::new(next.ptr, tail.tag.wrapping_add(1)));
                continue;
            }

            // Read the value out before attempting the Head CAS. The guard on `head.ptr`
            // (whose `next` field is exactly `next.ptr`) is what keeps `next.ptr` from being
            // freed out from under this read. Reading into a `MaybeUninit<T>` rather than a
            // `T` makes the speculative read harmless if we lose the race below: dropping a
            // `MaybeUninit` never runs `T`'s destructor, so a CAS loser's copy simply
            // evaporates without touching the node, which still solely owns the value.
            let candidate: MaybeUninit<T> = unsafe { ptr::read((*next.ptr).value.get()) };

            let desired = Tagged::new(next.ptr, head.tag.wrapping_add(1));
            match self.head.compare_exchange(head, desired) {
                Ok(()) => break (unsafe { candidate.assume_init() }, head.ptr),
                Err(_) => continue, // `candidate` drops here without dropping `T` — see above.
            }
        };

        self.reclaim.fire_guard(guard);
        let survivors = self.reclaim.liberate(vec![retired]);
        for node in survivors {
            unsafe {
                drop(Box::from_raw(node));
            }
        }

        Some(value)
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Walk the list from Head. The node Head currently points to (the sentinel) never
        // holds a live value — drop every node after it properly, since those are still-queued
        // payloads nobody has taken.
        let mut cur = self.head.load().ptr;
        let mut is_sentinel = true;
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load() }.ptr;
            if !is_sentinel {
                unsafe {
                    ptr::drop_in_place((*cur).value.get() as *mut T);
                }
            }
            unsafe {
                drop(Box::from_raw(cur));
            }
            cur = next;
            is_sentinel = false;
        }

        // Any node still parked in a hand-off slot is, by construction, a node that was once a
        // sentinel (see the loop above) and so never holds a live value either.
        for parked in self.reclaim.drain_handoff() {
            unsafe {
                drop(Box::from_raw(parked));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_take_single_threaded_fifo() {
        // single-threaded push/take preserves FIFO order
        let q: Queue<i32> = Queue::new();
        for i in 1..=5 {
            q.push(i);
        }
        for i in 1..=5 {
            assert_eq!(q.take(), Some(i));
        }
        assert_eq!(q.take(), None);
    }

    #[test]
    fn take_on_empty_queue_returns_none() {
        let q: Queue<i32> = Queue::new();
        assert_eq!(q.take(), None);
        assert_eq!(q.take(), None);
    }

    #[test]
    fn four_consumers_racing_an_empty_queue_never_panic() {
        // multiple consumers racing an empty queue
        let q = Arc::new(Queue::<i32>::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || q.take())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), None);
        }
    }

    #[test]
    fn interleaved_producers_preserve_per_producer_order() {
        // two producers interleaving pushes, one consumer draining
        let q = Arc::new(Queue::<i32>::new());
        let qa = q.clone();
        let qb = q.clone();

        let a = thread::spawn(move || {
            for v in [10, 11, 12] {
                qa.push(v);
            }
        });
        let b = thread::spawn(move || {
            for v in [20, 21, 22] {
                qb.push(v);
            }
        });
        a.join().unwrap();
        b.join().unwrap();

        let mut taken = Vec::new();
        while let Some(v) = q.take() {
            taken.push(v);
        }
        assert_eq!(taken.len(), 6);

        let from_a: Vec<_> = taken.iter().copied().filter(|v| *v < 20).collect();
        let from_b: Vec<_> = taken.iter().copied().filter(|v| *v >= 20).collect();
        assert_eq!(from_a, vec![10, 11, 12]);
        assert_eq!(from_b, vec![20, 21, 22]);

        let mut as_multiset = taken;
        as_multiset.sort_unstable();
        assert_eq!(as_multiset, vec![10, 11, 12, 20, 21, 22]);
    }

    #[test]
    fn drain_after_many_producers_join_yields_exact_multiset() {
        // many producers join before draining (scaled down from 50x10_000 for test-suite wall-clock)
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: i32 = 2_000;

        let q = Arc::new(Queue::<i32>::new());
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    let base = p as i32 * PER_PRODUCER;
                    for i in 0..PER_PRODUCER {
                        q.push(base + i);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let mut taken = Vec::with_capacity(PRODUCERS * PER_PRODUCER as usize);
        while let Some(v) = q.take() {
            taken.push(v);
        }
        taken.sort_unstable();

        let expected: Vec<i32> = (0..(PRODUCERS as i32 * PER_PRODUCER)).collect();
        assert_eq!(taken, expected);
        assert_eq!(q.take(), None);
    }

    #[test]
    fn heavy_contention_preserves_the_pushed_multiset() {
        // heavy concurrent producer/consumer contention (scaled down from 50+50/500_000 for test-suite wall-clock)
        const PRODUCERS: usize = 8;
        const CONSUMERS: usize = 8;
        const PER_PRODUCER: usize = 5_000;
        const TOTAL: usize = PRODUCERS * PER_PRODUCER;

        let q = Arc::new(Queue::<usize>::new());
        let taken_count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(std::sync::Mutex::new(vec![false; TOTAL]));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    let base = p * PER_PRODUCER;
                    for i in 0..PER_PRODUCER {
                        q.push(base + i);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let q = q.clone();
                let taken_count = taken_count.clone();
                let seen = seen.clone();
                thread::spawn(move || {
                    while taken_count.load(Ordering::Acquire) < TOTAL {
                        if let Some(v) = q.take() {
                            let mut seen = seen.lock().unwrap();
                            assert!(!seen[v], "value {v} taken twice");
                            seen[v] = true;
                            drop(seen);
                            taken_count.fetch_add(1, Ordering::AcqRel);
                        }
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        for c in consumers {
            c.join().unwrap();
        }

        assert!(seen.lock().unwrap().iter().all(|&v| v));
        assert_eq!(q.take(), None);
    }

    #[test]
    fn drop_frees_a_queue_still_holding_unpopped_values() {
        use std::sync::atomic::AtomicUsize as Counter;
        static DROPS: Counter = Counter::new(0);
        struct Loud;
        impl Drop for Loud {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let q: Queue<Loud> = Queue::new();
            q.push(Loud);
            q.push(Loud);
            q.push(Loud);
            assert_eq!(q.take().is_some(), true); // one value taken and dropped here
        }
        assert_eq!(DROPS.load(Ordering::Relaxed), 3, "taken value plus two still-queued values");
    }

    #[test]
    fn guard_capacity_reports_the_configured_size() {
        let q: Queue<i32> = Queue::with_guard_capacity(16);
        assert_eq!(q.guard_capacity(), 16);
    }

    #[test]
    fn peak_concurrent_takers_tracks_the_most_slots_hired_at_once() {
        let q = Arc::new(Queue::<i32>::with_guard_capacity(8));
        assert_eq!(q.peak_concurrent_takers(), 1); // no taker has hired a slot yet

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || {
                    q.take();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(q.peak_concurrent_takers() >= 1);
        assert!(q.peak_concurrent_takers() <= 8);
    }

    #[test]
    fn a_lagging_guard_forces_liberate_to_hand_off_then_release() {
        // a guard capacity of 2 guarantees the two takers below contend for the same
        // slot pair repeatedly, so across enough iterations `liberate` is forced to park at
        // least one retired node in HNDOFF before a later call frees it.
        let q = Arc::new(Queue::<usize>::with_guard_capacity(2));
        for i in 0..2_000 {
            q.push(i);
        }

        let qa = q.clone();
        let qb = q.clone();
        let a = thread::spawn(move || {
            let mut taken = Vec::new();
            while let Some(v) = qa.take() {
                taken.push(v);
            }
            taken
        });
        let b = thread::spawn(move || {
            let mut taken = Vec::new();
            while let Some(v) = qb.take() {
                taken.push(v);
            }
            taken
        });

        let mut all = a.join().unwrap();
        all.extend(b.join().unwrap());
        all.sort_unstable();
        assert_eq!(all, (0..2_000).collect::<Vec<_>>());
        assert_eq!(q.take(), None);
    }
}
