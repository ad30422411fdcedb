//! Per-CPU circular run queue with a "counter with decay" credit scheduler
//! (spec.md §4.8), plus the thread-lifecycle glue (§4.7) and the per-CPU
//! descriptor table (§3 "CPU descriptor").
//!
//! Each CPU owns a small dense arena of [`task::Thread`]s indexed by
//! [`task::ThreadId`] (spec.md §9 "Cyclic references": an arena + indices
//! rather than borrowed references), linked into one circular doubly-linked
//! run queue anchored at slot 0, the idle thread. The credit/decay selection
//! logic lives in [`select_next`] as a function over plain data so it can
//! run host-side without any of the arch/asm machinery around it.

pub mod task;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use hermit_sync::OnceCell;

use crate::arch::x86_64::kernel::percore;
use crate::arch::x86_64::kernel::switch;
use crate::panic::check;
use crate::synch::spinlock::{irq_restore, IrqFlags, SpinlockIrqSave};
use task::{Thread, ThreadFlags, ThreadHandle, ThreadId, ThreadState};

/// Upper bound on describable CPUs; also sizes [`crate::arch::x86_64::kernel::gdt`]'s
/// per-core GDT table.
pub const MAX_CPUS: usize = 32;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct CpuFlags: u32 {
		const ACTIVE = 1 << 0;
		const BSP = 1 << 1;
	}
}

/// Holds the [`IrqFlags`] a context switch leaked from the CPU descriptor's
/// lock guard, for the resuming side of the switch to pick back up (spec.md
/// §9 "Cooperative suspension"). Only the code physically executing on the
/// owning CPU ever touches its own descriptor's cell, so this is safe despite
/// the raw `UnsafeCell`.
struct PendingIrq(UnsafeCell<Option<IrqFlags>>);

unsafe impl Sync for PendingIrq {}

impl PendingIrq {
	const fn new() -> Self {
		Self(UnsafeCell::new(None))
	}

	unsafe fn set(&self, flags: IrqFlags) {
		unsafe {
			*self.0.get() = Some(flags);
		}
	}

	unsafe fn take(&self) -> IrqFlags {
		unsafe { (*self.0.get()).take() }.expect("no pending irq flags to resume with")
	}
}

/// Per-CPU thread arena plus run-queue state (spec.md §3 "CPU descriptor").
/// Protected by the owning [`CpuDescriptor`]'s lock, taken at high IPL.
pub struct CpuState {
	threads: Vec<Option<Box<Thread>>>,
	current: ThreadId,
}

impl CpuState {
	fn new(mut idle: Box<Thread>) -> Self {
		idle.next = Some(task::IDLE_THREAD_ID);
		idle.prev = Some(task::IDLE_THREAD_ID);
		Self {
			threads: vec![Some(idle)],
			current: task::IDLE_THREAD_ID,
		}
	}

	fn thread(&self, id: ThreadId) -> &Thread {
		self.threads[id.0 as usize]
			.as_ref()
			.expect("thread arena slot empty")
	}

	fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
		self.threads[id.0 as usize]
			.as_mut()
			.expect("thread arena slot empty")
	}

	/// Links `thread` in just before the anchor (idle thread), i.e. at the
	/// tail of the circular run queue.
	fn append(&mut self, mut thread: Box<Thread>) {
		let anchor = task::IDLE_THREAD_ID;
		let new_id = thread.id;
		let tail_id = self.thread(anchor).prev.expect("idle thread not linked");
		thread.next = Some(anchor);
		thread.prev = Some(tail_id);
		self.thread_mut(tail_id).next = Some(new_id);
		self.thread_mut(anchor).prev = Some(new_id);
		self.threads.push(Some(thread));
	}
}

/// Per-CPU, keyed by a dense registration index (spec.md §9's portable
/// replacement for "keyed by local-APIC id": the APIC id is kept alongside
/// for bring-up/IPI bookkeeping, but the array itself is indexed by
/// registration order, matching [`percore::core_id`]).
pub struct CpuDescriptor {
	apic_id: u32,
	flags: AtomicU32,
	lock: SpinlockIrqSave<CpuState>,
	pending: PendingIrq,
}

impl CpuDescriptor {
	pub fn apic_id(&self) -> u32 {
		self.apic_id
	}

	pub fn is_active(&self) -> bool {
		CpuFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(CpuFlags::ACTIVE)
	}

	pub fn is_bsp(&self) -> bool {
		CpuFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(CpuFlags::BSP)
	}
}

const NO_CPU: OnceCell<CpuDescriptor> = OnceCell::new();
static CPUS: [OnceCell<CpuDescriptor>; MAX_CPUS] = [NO_CPU; MAX_CPUS];

static NEXT_CPU_INDEX: AtomicU32 = AtomicU32::new(0);
static NUM_CPUS: AtomicU32 = AtomicU32::new(0);

fn cpu_by_index(index: u32) -> &'static CpuDescriptor {
	CPUS[index as usize].get().expect("cpu not registered")
}

fn current_cpu() -> &'static CpuDescriptor {
	cpu_by_index(percore::core_id())
}

/// Registers the calling CPU's descriptor, attaching an idle thread built
/// from the stack it is already running on (spec.md §3 "the run queue always
/// contains at least the idle thread"). Returns the dense index assigned to
/// this CPU; callers key [`crate::arch::x86_64::kernel::core_local::CoreLocal`]
/// and the GDT/TSS table by the same index.
pub fn register_cpu(apic_id: u32, is_bsp: bool) -> u32 {
	let index = NEXT_CPU_INDEX.fetch_add(1, Ordering::SeqCst);
	check((index as usize) < MAX_CPUS, "scheduler: MAX_CPUS exceeded");

	let idle = Thread::idle_bootstrap(index);
	let mut flags = CpuFlags::ACTIVE;
	if is_bsp {
		flags |= CpuFlags::BSP;
	}
	let descriptor = CpuDescriptor {
		apic_id,
		flags: AtomicU32::new(flags.bits()),
		lock: SpinlockIrqSave::new(CpuState::new(idle)),
		pending: PendingIrq::new(),
	};
	CPUS[index as usize]
		.set(descriptor)
		.unwrap_or_else(|_| crate::panic::fatal(format_args!("scheduler: cpu {index} registered twice")));
	NUM_CPUS.fetch_add(1, Ordering::SeqCst);
	index
}

/// Number of CPUs that have called [`register_cpu`] so far (spec.md §4.6
/// step 5's `num_cpus` census counter).
pub fn num_cpus() -> u32 {
	NUM_CPUS.load(Ordering::SeqCst)
}

pub fn cpu_is_active(index: u32) -> bool {
	CPUS[index as usize].get().is_some_and(CpuDescriptor::is_active)
}

pub fn cpu_apic_id(index: u32) -> u32 {
	cpu_by_index(index).apic_id()
}

/// Creates a thread on `target_cpu` and appends it to that CPU's run queue.
/// Does not switch to it; it becomes eligible the next time that CPU
/// reschedules (spec.md §4.7 "appended to the run queue").
pub fn spawn(entry: extern "C" fn() -> !, stack_size: usize, target_cpu: u32) -> ThreadHandle {
	let cpu = cpu_by_index(target_cpu);
	let mut guard = cpu.lock.lock();
	let id = ThreadId(guard.threads.len() as u32);
	let thread = task::create_thread(id, target_cpu, entry, stack_size);
	guard.append(thread);
	ThreadHandle { cpu_id: target_cpu, id }
}

/// The thread currently running on the calling CPU.
pub fn current_handle() -> ThreadHandle {
	let cpu = current_cpu();
	let cpu_id = percore::core_id();
	let guard = cpu.lock.lock();
	ThreadHandle { cpu_id, id: guard.current }
}

/// Finds the RUNNING thread with the highest `cnt`, decaying every non-idle
/// thread's credit and rescanning when the winner has none left to spend
/// (spec.md §4.8 "Select-next"). Candidates are walked in queue order
/// starting right after the anchor (idle thread) and ending at the anchor
/// itself, so among ties the first one encountered after the anchor keeps
/// the win — the anchor is evaluated last and only wins outright when
/// nothing else is RUNNING. Decay only repeats while a *non-idle* thread is
/// the (exhausted) winner; if idle itself is the only runnable candidate,
/// it is returned immediately rather than decaying forever.
fn select_next(state: &CpuState) -> ThreadId {
	let anchor = task::IDLE_THREAD_ID;
	loop {
		let mut winner: Option<ThreadId> = None;
		let mut winner_cnt = 0u32;
		let mut id = anchor;
		loop {
			id = state.thread(id).next.expect("run queue thread unlinked");
			let t = state.thread(id);
			if t.state == ThreadState::Running {
				let c = t.cnt();
				if winner.is_none() || c > winner_cnt {
					winner = Some(id);
					winner_cnt = c;
				}
			}
			if id == anchor {
				break;
			}
		}
		let winner = winner.expect("idle thread must always be a running candidate");

		if winner != anchor && winner_cnt == 0 {
			for slot in state.threads.iter().flatten() {
				if slot.id != anchor {
					let decayed = (slot.cnt() >> 1) + u32::from(slot.pri);
					slot.set_cnt(decayed);
				}
			}
			continue;
		}
		return winner;
	}
}

/// Runs `decide` under the CPU's lock; if it returns a winner different from
/// the current thread, hands the (still-held) lock across the switch via
/// [`PendingIrq`] and performs the low-level register exchange. `decide`
/// returning `None` means "nothing to do", e.g. the current thread's
/// quantum hasn't expired yet (spec.md §4.8 tick handler: "if still
/// positive, return").
fn reschedule(cpu: &'static CpuDescriptor, decide: impl FnOnce(&mut CpuState) -> Option<ThreadId>) {
	let mut guard = cpu.lock.lock();
	let Some(winner) = decide(&mut guard) else {
		return;
	};
	let current = guard.current;
	if winner == current {
		return;
	}

	let old_sp_ptr: *mut usize = &mut guard.thread_mut(current).last_stack_pointer;
	let new_sp = guard.thread(winner).last_stack_pointer;
	guard.current = winner;
	guard.thread_mut(winner).state = ThreadState::Running;

	let flags = guard.leak();
	unsafe {
		cpu.pending.set(flags);
	}
	unsafe {
		switch::switch_to(old_sp_ptr, new_sp);
	}
	finish_switch(cpu);
}

/// Releases the CPU lock a switch handed across (via [`PendingIrq`]) and
/// lowers IPL back to whatever it was before the switch started. Shared by
/// the normal post-`switch_to` resumption path and by
/// [`release_after_first_switch`], which is the equivalent step for a
/// thread's very first run (spec.md §9 "Cooperative suspension": "the
/// implementer must preserve this two-stage entry").
fn finish_switch(cpu: &'static CpuDescriptor) {
	let flags = unsafe { cpu.pending.take() };
	unsafe {
		cpu.lock.force_unlock();
	}
	irq_restore(flags);
}

/// Called once by [`crate::arch::x86_64::kernel::switch::thread_trampoline`]
/// the first time a newly created thread runs, in place of returning from
/// `switch_to` the way an already-running thread does.
pub fn release_after_first_switch() {
	finish_switch(current_cpu());
}

/// Timer-tick entry point (spec.md §4.8 "Tick handler"): wakes expired
/// sleepers, charges the current thread one tick, and reschedules only once
/// its quantum is actually exhausted.
pub fn tick() {
	reschedule(current_cpu(), |state| {
		for slot in state.threads.iter_mut().flatten() {
			if slot.flags.contains(ThreadFlags::SLEEP_TIMER) {
				if slot.sleep_ticks > 0 {
					slot.sleep_ticks -= 1;
				}
				if slot.sleep_ticks == 0 {
					slot.flags.remove(ThreadFlags::SLEEP_TIMER);
					slot.state = ThreadState::Running;
					slot.set_cnt(u32::from(slot.pri));
				}
			}
		}

		let current = state.current;
		if current != task::IDLE_THREAD_ID {
			let t = state.thread_mut(current);
			t.tick_count += 1;
			let c = t.cnt();
			if c > 0 {
				t.set_cnt(c - 1);
			}
			if t.cnt() > 0 {
				return None;
			}
		}
		Some(select_next(state))
	});
}

/// Voluntarily gives up the remainder of the current quantum (spec.md §4.8
/// `yield`). A literal "mark SLEEPING, wait for an external wakeup" reading
/// would deadlock E3's wakeup-free round-robin scenario, so instead this
/// forces `cnt = 0` (as if the quantum had been exhausted) while the thread
/// stays RUNNING and so remains schedulable without needing anyone to wake
/// it (see DESIGN.md).
pub fn yield_now() {
	reschedule(current_cpu(), |state| {
		let current = state.current;
		state.thread_mut(current).set_cnt(0);
		Some(select_next(state))
	});
}

/// Puts the current thread to sleep for `ms` timer ticks (spec.md §4.8
/// `sleep(ms)`). The idle thread is exempt and must never call this.
pub fn sleep_ms(ms: u32) {
	reschedule(current_cpu(), |state| {
		let current = state.current;
		check(current != task::IDLE_THREAD_ID, "scheduler: idle thread cannot sleep");
		let t = state.thread_mut(current);
		t.state = ThreadState::Sleeping;
		t.sleep_ticks = ms;
		t.flags.insert(ThreadFlags::SLEEP_TIMER);
		Some(select_next(state))
	});
}

/// Puts the current thread to sleep with no timer; only an explicit
/// [`wake`] call (from a condition variable or semaphore) restores it to
/// RUNNING (spec.md §4.9).
pub fn block_current() {
	reschedule(current_cpu(), |state| {
		let current = state.current;
		check(current != task::IDLE_THREAD_ID, "scheduler: idle thread cannot block");
		state.thread_mut(current).state = ThreadState::Sleeping;
		Some(select_next(state))
	});
}

/// Wakes `handle`, lock-hopping to its owning CPU's descriptor if it differs
/// from the caller's (spec.md §4.9 "Cross-CPU wake": "no IPI is required for
/// correctness; the remote CPU will notice the change on its next tick").
pub fn wake(handle: ThreadHandle) {
	let cpu = cpu_by_index(handle.cpu_id);
	let mut guard = cpu.lock.lock();
	let t = guard.thread_mut(handle.id);
	t.flags.remove(ThreadFlags::SLEEP_TIMER);
	t.state = ThreadState::Running;
	t.set_cnt(u32::from(t.pri));
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	fn single_cpu_state(n: u32, pri: u8) -> CpuState {
		let mut state = CpuState::new(Thread::idle_bootstrap(0));
		for i in 1..=n {
			state.append(task::test_stub(ThreadId(i), 0, pri));
		}
		state
	}

	#[test]
	fn select_next_picks_idle_when_nothing_else_runnable() {
		let state = CpuState::new(Thread::idle_bootstrap(0));
		assert_eq!(select_next(&state), task::IDLE_THREAD_ID);
	}

	#[test]
	fn select_next_prefers_highest_cnt() {
		let state = single_cpu_state(3, 8);
		state.thread(ThreadId(2)).set_cnt(20);
		assert_eq!(select_next(&state), ThreadId(2));
	}

	#[test]
	fn select_next_decays_when_winner_exhausted() {
		let state = single_cpu_state(3, 8);
		for id in 1..=3u32 {
			state.thread(ThreadId(id)).set_cnt(0);
		}
		// Every non-idle candidate is exhausted: a decay pass must run,
		// giving everyone `pri` credit back, and the scan must terminate
		// rather than looping forever.
		let winner = select_next(&state);
		assert_ne!(winner, task::IDLE_THREAD_ID);
		assert_eq!(state.thread(winner).cnt(), 8);
	}

	#[test]
	fn round_robin_after_repeated_yields() {
		// Mirrors E3: three equal-priority threads, twelve `yield`s total,
		// each should have run (tick_count) at least four times.
		let mut state = single_cpu_state(3, 8);
		state.current = ThreadId(1);
		for _ in 0..12 {
			let current = state.current;
			{
				let t = state.thread_mut(current);
				t.tick_count += 1;
				t.set_cnt(0);
			}
			state.current = select_next(&state);
		}
		for id in 1..=3u32 {
			assert!(state.thread(ThreadId(id)).tick_count >= 4);
		}
	}

	#[test]
	fn exhausted_thread_does_not_win_without_decay() {
		let state = single_cpu_state(2, 8);
		state.thread(ThreadId(1)).set_cnt(0);
		// Thread 2 still has credit: it must win outright, no decay needed.
		assert_eq!(select_next(&state), ThreadId(2));
	}

	#[test]
	fn sleeping_thread_is_never_selected() {
		let mut state = single_cpu_state(2, 8);
		state.thread_mut(ThreadId(1)).state = ThreadState::Sleeping;
		state.thread(ThreadId(1)).set_cnt(100);
		assert_eq!(select_next(&state), ThreadId(2));
	}
}
