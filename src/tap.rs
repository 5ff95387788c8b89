//! Tagged atomic pointers.
//!
//! A `Tap<T>` packs a raw pointer together with a version counter ("tag") into a single
//! machine word of double pointer width and updates both halves atomically with one
//! compare-and-swap. The tag defeats the ABA problem on the fields that the queue and the
//! reclamation table mutate: `Head`, `Tail`, every node's `next`, and every hand-off slot.
//!
//! On a 64-bit target the packed word is 128 bits (a 64-bit pointer plus a 64-bit tag); on a
//! 32-bit target it is 64 bits. Neither width has a native atomic in `core` on all targets, so
//! the double-width CAS itself is provided by `portable_atomic`, which lowers to `lock
//! cmpxchg16b` (or the narrower equivalent) where the target supports it and to a seqlock-style
//! fallback elsewhere.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::Ordering;

#[cfg(target_pointer_width = "64")]
mod width {
    pub type Raw = u64;
    pub type Tag = u64;
    pub type Word = u128;
    pub type AtomicWord = portable_atomic::AtomicU128;
}

#[cfg(target_pointer_width = "32")]
mod width {
    pub type Raw = u32;
    pub type Tag = u32;
    pub type Word = u64;
    pub type AtomicWord = portable_atomic::AtomicU64;
}

#[cfg(not(any(target_pointer_width = "64", target_pointer_width = "32")))]
compile_error!(
    "hazard-msqueue requires a 32- or 64-bit target: its tagged pointers need a native or \
     portable_atomic-backed double-width compare-and-swap, which is only defined for those widths"
);

use width::{AtomicWord, Raw, Tag, Word};

/// The tag type for this target's pointer width (`u64` on 64-bit, `u32` on 32-bit).
pub type TagValue = Tag;

/// A `(pointer, tag)` pair, read out of or about to be installed into a [`Tap`].
///
/// Two `Tagged` values are equal only when both halves match bit-for-bit, per the TAP
/// contract in the design notes: equality of two TAP values means bitwise equality of both
/// halves, not just pointer identity.
pub(crate) struct Tagged<T> {
    pub ptr: *mut T,
    pub tag: Tag,
}

impl<T> Tagged<T> {
    pub fn new(ptr: *mut T, tag: Tag) -> Self {
        Tagged { ptr, tag }
    }

    pub fn null() -> Self {
        Tagged::new(ptr::null_mut(), 0)
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }
}

impl<T> Clone for Tagged<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Tagged<T> {}

impl<T> PartialEq for Tagged<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.tag == other.tag
    }
}
impl<T> Eq for Tagged<T> {}

impl<T> fmt::Debug for Tagged<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tagged")
            .field("ptr", &self.ptr)
            .field("tag", &self.tag)
            .finish()
    }
}

fn pack<T>(t: Tagged<T>) -> Word {
    let raw = t.ptr as usize as Raw;
    (raw as Word) | ((t.tag as Word) << Raw::BITS)
}

fn unpack<T>(word: Word) -> Tagged<T> {
    let raw = word as Raw;
    let tag = (word >> Raw::BITS) as Tag;
    Tagged::new(raw as usize as *mut T, tag)
}

/// An atomically-updated `(pointer, tag)` pair: the TAP primitive from the design notes.
///
/// `load` and `compare_exchange` are the only two operations — every field the queue and the
/// reclamation table mutate (`Head`, `Tail`, a node's `next`, a hand-off slot) is a `Tap<T>`.
pub(crate) struct Tap<T> {
    inner: AtomicWord,
    _marker: PhantomData<*mut T>,
}

// `Tap<T>` only ever moves `*mut T` values between threads as opaque bit patterns; the
// queue's own `Send`/`Sync` impls govern when that's sound for a given `T`.
unsafe impl<T> Send for Tap<T> {}
unsafe impl<T> Sync for Tap<T> {}

impl<T> Tap<T> {
    pub fn new(ptr: *mut T, tag: Tag) -> Self {
        Tap {
            inner: AtomicWord::new(pack(Tagged::new(ptr, tag))),
            _marker: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self::new(ptr::null_mut(), 0)
    }

    /// Atomic double-width load.
    pub fn load(&self) -> Tagged<T> {
        unpack(self.inner.load(Ordering::SeqCst))
    }

    /// Atomic double-width compare-and-swap. Succeeds iff the field bit-equals `current`,
    /// in which case it's replaced with `new` and `Ok(())` is returned. On failure, returns
    /// the value actually observed (invariant T1 only binds the *successful* case — a failed
    /// CAS installs nothing and so owes no tag bump).
    pub fn compare_exchange(&self, current: Tagged<T>, new: Tagged<T>) -> Result<(), Tagged<T>> {
        match self
            .inner
            .compare_exchange(pack(current), pack(new), Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(actual) => Err(unpack(actual)),
        }
    }
}
