//! Synchronization primitives (spec.md §4.1, §4.9).

pub mod condvar;
pub mod semaphore;
pub mod spinlock;
