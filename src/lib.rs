//! A lock-free, multi-producer/multi-consumer FIFO queue.
//!
//! The queue is a Michael–Scott linked list: `push` and `take` make progress by racing
//! compare-and-swaps against `Head`/`Tail`/a node's `next`, never by holding a lock. ABA safety
//! on those fields comes from [`tap::Tap`], a tagged atomic pointer that pairs every pointer
//! update with a monotonically increasing counter. Safe reclamation of the nodes `take` unlinks
//! comes from [`reclaim::Reclaimer`], a hazard-pointer-style guard table with a hand-off list for
//! nodes that are still observed when a caller would otherwise free them.
//!
//! ```
//! use hazard_msqueue::Queue;
//!
//! let q = Queue::new();
//! q.push(1);
//! q.push(2);
//! assert_eq!(q.take(), Some(1));
//! assert_eq!(q.take(), Some(2));
//! assert_eq!(q.take(), None);
//! ```

mod queue;
mod reclaim;
mod tap;

pub use queue::Queue;
