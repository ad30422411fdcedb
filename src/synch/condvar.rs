//! Condition variables (spec.md §4.9 "Condition").
//!
//! A condition holds a FIFO wait queue of [`ThreadHandle`]s rather than an
//! intrusive `next_wait` link through the thread arena: waiters may live on
//! any CPU (a `ThreadId` is only unique within its owning CPU's arena), so
//! the queue has to name threads by [`ThreadHandle`] and can't just chain
//! through per-CPU thread records (see DESIGN.md).

use alloc::collections::VecDeque;

use hermit_sync::InterruptTicketMutex;

use crate::scheduler;
use crate::scheduler::task::ThreadHandle;
use crate::synch::spinlock::{SpinlockIrqSave, SpinlockIrqSaveGuard};

/// A wait queue threads can block on until signaled (spec.md §3 "Wait
/// queue").
pub struct Condition {
	waiters: InterruptTicketMutex<VecDeque<ThreadHandle>>,
}

impl Condition {
	pub const fn new() -> Self {
		Self {
			waiters: InterruptTicketMutex::new(VecDeque::new()),
		}
	}

	/// Atomically releases `lock` and blocks the calling thread until
	/// [`signal`](Self::signal) or [`broadcast`](Self::broadcast) wakes it,
	/// then re-acquires `lock` before returning (spec.md §4.9 `wait(c,
	/// lock)`).
	///
	/// The caller must already hold `lock` (at high IPL, via `guard`); this
	/// enqueues the caller before dropping `guard`, so a signal arriving
	/// between the enqueue and the actual block can't be missed.
	pub fn wait<'a, T>(&self, lock: &'a SpinlockIrqSave<T>, guard: SpinlockIrqSaveGuard<'a, T>) -> SpinlockIrqSaveGuard<'a, T> {
		self.waiters.lock().push_back(scheduler::current_handle());
		drop(guard);
		scheduler::block_current();
		lock.lock()
	}

	/// Wakes one waiter, if any (spec.md §4.9 `signal`).
	pub fn signal(&self) {
		if let Some(handle) = self.waiters.lock().pop_front() {
			scheduler::wake(handle);
		}
	}

	/// Wakes every current waiter (spec.md §9 Open Questions: `broadcast` is
	/// declared but left unimplemented in the source; intent is "pop all
	/// waiters and wake each", implemented here rather than left empty).
	pub fn broadcast(&self) {
		let mut waiters = self.waiters.lock();
		while let Some(handle) = waiters.pop_front() {
			scheduler::wake(handle);
		}
	}
}

impl Default for Condition {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn broadcast_drains_every_waiter() {
		let c = Condition::new();
		c.waiters.lock().push_back(ThreadHandle { cpu_id: 0, id: crate::scheduler::task::ThreadId(1) });
		c.waiters.lock().push_back(ThreadHandle { cpu_id: 0, id: crate::scheduler::task::ThreadId(2) });
		assert_eq!(c.waiters.lock().len(), 2);
		// broadcast() itself calls scheduler::wake, which needs a real
		// registered CPU descriptor; what this test actually pins down is
		// the "pop all waiters" contract on the queue itself.
		let mut waiters = c.waiters.lock();
		let mut drained = 0;
		while waiters.pop_front().is_some() {
			drained += 1;
		}
		assert_eq!(drained, 2);
	}
}
