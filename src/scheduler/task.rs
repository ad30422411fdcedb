//! The thread record, kernel stack and low-level context switch (spec.md
//! §3 "Thread", §4.7).

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::arch::x86_64::kernel::switch;
use crate::config::KERNEL_STACK_SIZE;
use crate::mm;

/// Numeric thread id, unique within the owning CPU's lifetime counter
/// (spec.md §3 "CPU descriptor": "a monotonically increasing thread-id
/// counter").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

/// Names a thread uniquely across the whole machine: the CPU it was created
/// on (threads never migrate, spec.md §4.8) plus its locally-unique id.
/// Wait queues (spec.md §3 "Wait queue") store these rather than bare
/// [`ThreadId`]s, since a condition variable or semaphore may be shared by
/// threads living on different CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle {
	pub cpu_id: u32,
	pub id: ThreadId,
}

/// Reserved id of the idle thread on every CPU (spec.md §3 "CPU descriptor":
/// "the run queue always contains at least the idle thread").
pub const IDLE_THREAD_ID: ThreadId = ThreadId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
	Running,
	Sleeping,
}

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ThreadFlags: u32 {
		const SLEEP_TIMER = 1 << 0;
	}
}

#[cfg(feature = "kernel-stack")]
const STACK_CANARY: u64 = 0xDEAD_C0DE_FEED_FACE;

/// Owns the allocated stack chunk for a thread. Asserts a canary word at the
/// stack floor on drop/inspection, realizing spec.md §7(a)'s "stack-overflow
/// canary" assertion kind (named by spec.md but not otherwise wired up;
/// grounded on the teacher's `kernel_stack.rs` guard-page idiom, adapted to
/// slab-chunk-backed stacks since there is no per-thread address space to
/// carve a guard *page* out of).
pub struct KernelStack {
	base: usize,
	size: usize,
}

impl KernelStack {
	pub fn allocate(size: usize) -> Self {
		let size = size.max(KERNEL_STACK_SIZE);
		let base = mm::allocate(size, true);
		#[cfg(feature = "kernel-stack")]
		unsafe {
			(base as *mut u64).write(STACK_CANARY);
		}
		Self { base, size }
	}

	/// A stand-in for the stack a CPU is already running on when it
	/// retroactively becomes that CPU's idle thread (spec.md §4.8 "the idle
	/// thread is present on every CPU"): there is no separate allocation to
	/// own or free, so canary checks and deallocation are skipped.
	fn bootstrap() -> Self {
		Self { base: 0, size: 0 }
	}

	pub fn base(&self) -> usize {
		self.base
	}

	pub fn top(&self) -> usize {
		self.base + self.size
	}

	#[cfg(feature = "kernel-stack")]
	pub fn check_canary(&self) {
		let canary = unsafe { (self.base as *const u64).read() };
		crate::check!(
			canary == STACK_CANARY,
			"kernel stack overflow: canary at {:#x} clobbered",
			self.base
		);
	}

	#[cfg(not(feature = "kernel-stack"))]
	pub fn check_canary(&self) {}
}

impl Drop for KernelStack {
	fn drop(&mut self) {
		if self.size == 0 {
			return;
		}
		self.check_canary();
		mm::deallocate(self.base, self.size);
	}
}

/// A schedulable thread of execution (spec.md §3 "Thread").
///
/// Run-queue and wait-queue links are modeled as thread ids rather than
/// borrowed references (spec.md §9 "Cyclic references"): the owning CPU's
/// thread table is a small dense array, so a link is just an index into it.
pub struct Thread {
	pub id: ThreadId,
	pub cpu_id: u32,
	pub state: ThreadState,
	pub flags: ThreadFlags,

	/// Saved stack pointer; valid whenever the thread is not the one
	/// currently executing.
	pub last_stack_pointer: usize,
	pub stack: KernelStack,

	pub sleep_ticks: u32,
	pub tick_count: u64,

	pub pri: u8,
	pub cnt: AtomicU32,

	/// Run-queue links, indices into the owning CPU's thread table.
	pub next: Option<ThreadId>,
	pub prev: Option<ThreadId>,
	/// "Next-wait" link: a thread is on at most one blocking primitive's
	/// wait queue at a time (spec.md §3 Thread invariants).
	pub next_wait: Option<ThreadId>,
}

impl Thread {
	pub fn cnt(&self) -> u32 {
		self.cnt.load(Ordering::Relaxed)
	}

	pub fn set_cnt(&self, value: u32) {
		self.cnt.store(value, Ordering::Relaxed)
	}

	/// Registers the stack a CPU is already running on as that CPU's idle
	/// thread (spec.md §3 "the run queue always contains at least the idle
	/// thread"). There is no `entry`/`prepare_stack` here: this thread is
	/// already running, it is simply being given a `Thread` record so the
	/// scheduler has something to switch away from and back to.
	pub fn idle_bootstrap(cpu_id: u32) -> Box<Thread> {
		Box::new(Thread {
			id: IDLE_THREAD_ID,
			cpu_id,
			state: ThreadState::Running,
			flags: ThreadFlags::empty(),
			last_stack_pointer: 0,
			stack: KernelStack::bootstrap(),
			sleep_ticks: 0,
			tick_count: 0,
			pri: crate::config::DEFAULT_PRIORITY,
			cnt: AtomicU32::new(0),
			next: None,
			prev: None,
			next_wait: None,
		})
	}
}

/// Builds a brand-new thread record and writes the two-stage entry frame
/// spec.md §4.7 describes: an interrupt-return frame for `entry` at the very
/// top of the stack, with a `switch_context` frame below it whose RIP is
/// `thread_start`. The first context switch into this thread pops the
/// switch-context frame (restoring zeroed callee-saved registers), falls
/// into `thread_start`, which releases the creator-held CPU lock and then
/// IRETs into `entry` via the interrupt-return trampoline.
pub fn create_thread(id: ThreadId, cpu_id: u32, entry: extern "C" fn() -> !, stack_size: usize) -> Box<Thread> {
	let stack = KernelStack::allocate(stack_size);
	let last_stack_pointer = unsafe { switch::prepare_stack(stack.top(), entry) };

	Box::new(Thread {
		id,
		cpu_id,
		state: ThreadState::Running,
		flags: ThreadFlags::empty(),
		last_stack_pointer,
		stack,
		sleep_ticks: 0,
		tick_count: 0,
		pri: crate::config::DEFAULT_PRIORITY,
		cnt: AtomicU32::new(crate::config::DEFAULT_PRIORITY as u32),
		next: None,
		prev: None,
		next_wait: None,
	})
}

/// Builds a thread record for scheduler unit tests without touching the
/// allocator or writing a real context-switch frame (spec.md §4.8's
/// selection logic is plain data and shouldn't need either).
#[cfg(all(test, not(target_os = "none")))]
pub fn test_stub(id: ThreadId, cpu_id: u32, pri: u8) -> Box<Thread> {
	Box::new(Thread {
		id,
		cpu_id,
		state: ThreadState::Running,
		flags: ThreadFlags::empty(),
		last_stack_pointer: 0,
		stack: KernelStack::bootstrap(),
		sleep_ticks: 0,
		tick_count: 0,
		pri,
		cnt: AtomicU32::new(pri as u32),
		next: None,
		prev: None,
		next_wait: None,
	})
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn thread_id_ordering() {
		assert!(ThreadId(1) < ThreadId(2));
	}
}
