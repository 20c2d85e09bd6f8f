//! Pre-allocated object pool for `ClipCommand`/`TimerCommand`.
//!
//! The original engine tracks slot ownership (free / held-by-producer /
//! in-flight / held-by-sampler / pending-reclaim) with an explicit state tag on
//! each arena slot, because in C++ the arena hands out raw pointers that nothing
//! stops two threads from touching. In Rust the same discipline falls out of
//! ownership for free: a value sitting in `available` is free, a value a caller
//! has acquired is "held" for as long as they own it (the type system prevents
//! anyone else from touching it), and a value pushed to `pending_reclaim` is
//! "reclaiming" until the next `reclaim()` sweep folds it back into `available`
//! with its fields reset. No separate tag is needed.

use crate::mutex_util::non_blocking_lock;
use std::sync::Mutex;

/// Implemented by pooled command types so the pool can return a used slot to a
/// pristine state instead of reallocating it.
pub trait Poolable: Default {
    fn reset(&mut self);
}

pub struct CommandPool<T> {
    available: Mutex<Vec<T>>,
    pending_reclaim: Mutex<Vec<T>>,
}

impl<T: Poolable> CommandPool<T> {
    pub fn new(capacity: usize) -> Self {
        let available = (0..capacity).map(|_| T::default()).collect();
        Self {
            available: Mutex::new(available),
            pending_reclaim: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Draw a pre-allocated value from the pool. Never allocates. Returns
    /// `None` if the pool is exhausted (all slots are out or pending reclaim);
    /// callers on the real-time path must treat this the same as any other
    /// real-time-safe failure: drop the event and log it, never block.
    pub fn acquire(&self) -> Option<T> {
        non_blocking_lock(&self.available, "command pool").pop()
    }

    /// Queue a used value for reclamation. Callable from the real-time thread.
    pub fn release(&self, value: T) {
        non_blocking_lock(&self.pending_reclaim, "command pool reclaim queue").push(value);
    }

    /// Run periodically off the real-time path (the "garbage-reclaim timer"):
    /// reset every pending value and fold it back into `available`.
    pub fn reclaim(&self) {
        let mut pending = non_blocking_lock(&self.pending_reclaim, "command pool reclaim queue");
        if pending.is_empty() {
            return;
        }
        let mut available = non_blocking_lock(&self.available, "command pool");
        for mut value in pending.drain(..) {
            value.reset();
            available.push(value);
        }
    }

    #[cfg(test)]
    pub fn available_len(&self) -> usize {
        self.available.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug, PartialEq)]
    struct Dummy {
        value: u32,
    }

    impl Poolable for Dummy {
        fn reset(&mut self) {
            self.value = 0;
        }
    }

    #[test]
    fn acquire_drains_and_reclaim_refills() {
        let pool = CommandPool::<Dummy>::new(2);
        assert_eq!(pool.available_len(), 2);

        let mut a = pool.acquire().unwrap();
        a.value = 7;
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available_len(), 0);

        pool.release(a);
        assert_eq!(pool.available_len(), 0, "release queues, doesn't refill directly");

        pool.reclaim();
        assert_eq!(pool.available_len(), 1);
        let reclaimed = pool.acquire().unwrap();
        assert_eq!(reclaimed.value, 0, "reclaim must reset fields");
    }
}
