//! Guarded reclamation (GRC): the hazard-pointer-style hand-off scheme that lets [`take`]
//! free the node it unlinks without risking a use-after-free by some other thread still
//! reading it.
//!
//! Each concurrent caller hires a guard slot, publishes the node it's currently observing into
//! that slot's `POST` entry, and fires the slot when it moves on. A thread that wants to free a
//! node it has unlinked instead calls [`Reclaimer::liberate`], which scans every hired slot: a
//! node still posted in some slot can't be freed yet, so it's parked in that slot's hand-off
//! cell (`HNDOFF`) for a later caller to inherit the burden of freeing.
//!
//! [`take`]: crate::queue::Queue::take

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::tap::{Tagged, Tap};

/// Default guard-table capacity (`MG` in the design notes) used by [`Queue::new`].
///
/// [`Queue::new`]: crate::queue::Queue::new
pub const DEFAULT_GUARD_CAPACITY: usize = 1000;

/// Bounded retry count for a hazard-hit hand-off CAS in [`Reclaimer::liberate`]. Taken verbatim
/// from the reference implementation; treated as tunable, not re-derived (see DESIGN.md).
const LIBERATE_MAX_ATTEMPTS: usize = 3;

/// Per-[`Queue`](crate::queue::Queue) guard table: `GUARDS`, `POST`, `HNDOFF`, and `MAXG` from
/// the design notes, plus the `liberate` arbitration routine.
pub(crate) struct Reclaimer<T> {
    /// `true` = slot is owned by some caller.
    guards: Box<[AtomicBool]>,
    /// The node the slot's owner currently has posted, or null.
    post: Box<[AtomicPtr<T>]>,
    /// Deferred-retirement cell for the slot.
    handoff: Box<[Tap<T>]>,
    /// High-water mark of hired slots; only `0..=maxg` need scanning.
    maxg: AtomicUsize,
}

impl<T> Reclaimer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "guard table capacity must be non-zero");
        let guards = (0..capacity).map(|_| AtomicBool::new(false)).collect();
        let post = (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        let handoff = (0..capacity).map(|_| Tap::null()).collect();
        Reclaimer {
            guards,
            post,
            handoff,
            maxg: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.guards.len()
    }

    /// Highest guard slot index ever hired (`MAXG`). Exposed as a plain diagnostic accessor,
    /// the way the teacher exposes `Participant::garbage_size`/`garbage_bytes`.
    pub fn high_water_mark(&self) -> usize {
        self.maxg.load(Ordering::Relaxed)
    }

    /// Linear scan for a free slot, CAS `false -> true` to claim it. Fatal (panics) if every
    /// slot is occupied — per the error-handling design, this is a configuration error, not a
    /// transient condition to retry.
    pub fn hire_guard(&self) -> usize {
        for (i, slot) in self.guards.iter().enumerate() {
            if slot
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let mut max = self.maxg.load(Ordering::Relaxed);
                while max < i {
                    match self
                        .maxg
                        .compare_exchange_weak(max, i, Ordering::Relaxed, Ordering::Relaxed)
                    {
                        Ok(_) => break,
                        Err(observed) => max = observed,
                    }
                }
                return i;
            }
        }
        panic!(
            "guard table exhausted: all {} slots are occupied; construct the queue with a \
             larger guard capacity to accommodate more concurrent callers",
            self.guards.len()
        );
    }

    /// Publish the node this slot's owner is about to read. Plain store: slot exclusivity
    /// (G1) means only the owner ever writes it.
    pub fn post_guard(&self, i: usize, node: *mut T) {
        self.post[i].store(node, Ordering::Release);
    }

    /// Release the slot. `POST[i]` is left as-is; `liberate` only trusts it when the slot is
    /// also found to be occupied by data the caller is retiring.
    pub fn fire_guard(&self, i: usize) {
        self.guards[i].store(false, Ordering::Release);
    }

    /// Arbitrate whether `candidates` may be freed now. Every node still observed by some
    /// guard is parked into that guard's hand-off cell instead, and is returned from the
    /// survivor set; a node that was previously parked but is no longer observed by anyone is
    /// promoted back into the survivor set.
    pub fn liberate(&self, mut candidates: Vec<*mut T>) -> Vec<*mut T> {
        let maxg = self.maxg.load(Ordering::Relaxed);
        for i in 0..=maxg {
            let mut h: Tagged<T> = self.handoff[i].load();
            let v = self.post[i].load(Ordering::Acquire);

            if !v.is_null() && candidates.contains(&v) {
                let mut attempts = 0usize;
                loop {
                    let desired = Tagged::new(v, h.tag.wrapping_add(1));
                    match self.handoff[i].compare_exchange(h, desired) {
                        Ok(()) => {
                            candidates.retain(|&c| c != v);
                            if !h.is_null() && !candidates.contains(&h.ptr) {
                                candidates.push(h.ptr);
                            }
                            break;
                        }
                        Err(observed) => {
                            attempts += 1;
                            if attempts == LIBERATE_MAX_ATTEMPTS {
                                break;
                            }
                            h = observed;
                            if attempts == LIBERATE_MAX_ATTEMPTS - 1 && !h.is_null() {
                                break;
                            }
                            if self.post[i].load(Ordering::Acquire) != v {
                                break;
                            }
                        }
                    }
                }
            } else if !h.is_null() && h.ptr != v {
                let desired = Tagged::new(ptr::null_mut(), h.tag.wrapping_add(1));
                if self.handoff[i].compare_exchange(h, desired).is_ok() && !candidates.contains(&h.ptr) {
                    candidates.push(h.ptr);
                }
            }
        }
        candidates
    }

    /// Every node currently parked in a hand-off cell. Used only by `Queue::drop`, which owns
    /// the reclaimer exclusively by that point, to free hand-off residues along with the rest
    /// of the list.
    pub fn drain_handoff(&self) -> impl Iterator<Item = *mut T> + '_ {
        self.handoff.iter().filter_map(|slot| {
            let t = slot.load();
            if t.is_null() {
                None
            } else {
                Some(t.ptr)
            }
        })
    }
}
