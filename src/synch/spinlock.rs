//! Atomics and the CAS spinlock (spec.md §4.1).
//!
//! The lock word is a single 32-bit atomic. `lock` busy-retries
//! `cas32(w, 0, 1)` until it observes 0; `unlock` stores 0. The RAII
//! guard/Deref/Drop ergonomics are borrowed from the teacher's
//! `Spinlock`/`SpinlockGuard`, but the locking algorithm itself is the
//! plain CAS spin spec.md specifies, not the teacher's own ticket lock
//! (see DESIGN.md).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::Backoff;
#[cfg(not(all(test, not(target_os = "none"))))]
use x86_64::instructions::interrupts;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// `cas32`: compare-and-swap on a 32-bit word. Returns the previous value.
#[inline]
pub fn cas32(addr: &AtomicU32, expected: u32, new: u32) -> u32 {
	match addr.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire) {
		Ok(prev) | Err(prev) => prev,
	}
}

/// `faa32`: fetch-and-add on a 32-bit word. Returns the previous value.
#[inline]
pub fn faa32(addr: &AtomicU32, delta: i32) -> u32 {
	if delta >= 0 {
		addr.fetch_add(delta as u32, Ordering::AcqRel)
	} else {
		addr.fetch_sub((-delta) as u32, Ordering::AcqRel)
	}
}

/// Saved interrupt-enable state, returned by [`irq_save`] and consumed by
/// [`irq_restore`].
#[derive(Debug, Clone, Copy)]
pub struct IrqFlags {
	were_enabled: bool,
}

/// Raises IPL: disables external interrupts on the current CPU, returning
/// the prior enabled/disabled state.
///
/// Host test builds (`cfg(test)` off-target) run as ordinary userspace
/// processes, where `cli`/`sti` fault; there, this just hands back a dummy
/// flag so the pure scheduling/locking logic under test can still exercise
/// the lock word without touching real interrupt state (see DESIGN.md).
#[inline]
#[cfg(not(all(test, not(target_os = "none"))))]
pub fn irq_save() -> IrqFlags {
	let were_enabled = interrupts::are_enabled();
	interrupts::disable();
	IrqFlags { were_enabled }
}

#[inline]
#[cfg(all(test, not(target_os = "none")))]
pub fn irq_save() -> IrqFlags {
	IrqFlags { were_enabled: false }
}

/// Lowers IPL back to whatever `irq_save` observed.
#[inline]
#[cfg(not(all(test, not(target_os = "none"))))]
pub fn irq_restore(flags: IrqFlags) {
	if flags.were_enabled {
		interrupts::enable();
	}
}

#[inline]
#[cfg(all(test, not(target_os = "none")))]
pub fn irq_restore(flags: IrqFlags) {
	let _ = flags;
}

/// A spinlock built directly on the 32-bit CAS word.
///
/// Plain `lock`/`unlock` is safe to use from low-IPL code only; any lock
/// that might also be taken from an interrupt handler on the same CPU must
/// use [`SpinlockIrqSave`] instead, per spec.md §4.1's "review must reject"
/// clause.
pub struct Spinlock<T: ?Sized> {
	word: AtomicU32,
	data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
	pub const fn new(data: T) -> Self {
		Self {
			word: AtomicU32::new(UNLOCKED),
			data: UnsafeCell::new(data),
		}
	}
}

impl<T: ?Sized> Spinlock<T> {
	fn acquire(&self) {
		let backoff = Backoff::new();
		while cas32(&self.word, UNLOCKED, LOCKED) != UNLOCKED {
			backoff.snooze();
		}
	}

	fn release(&self) {
		self.word.store(UNLOCKED, Ordering::Release);
	}

	pub fn lock(&self) -> SpinlockGuard<'_, T> {
		self.acquire();
		SpinlockGuard { lock: self }
	}

	/// # Safety
	/// The caller must guarantee that the lock is not already held and that
	/// no other thread observes the data through a second guard concurrently.
	pub unsafe fn make_guard_unchecked(&self) -> SpinlockGuard<'_, T> {
		SpinlockGuard { lock: self }
	}

	/// Stores the word back to UNLOCKED directly, without going through a
	/// guard's `Drop`. Used to hand a lock held on one CPU off to code
	/// running on another (or on a thread stack that hasn't started
	/// running yet); see [`SpinlockIrqSaveGuard::leak`].
	///
	/// # Safety
	/// The caller must guarantee the lock is actually held and that nothing
	/// still holds a live reference to the data through the guard that was
	/// leaked to reach this point.
	pub unsafe fn force_unlock(&self) {
		self.release();
	}
}

pub struct SpinlockGuard<'a, T: ?Sized> {
	lock: &'a Spinlock<T>,
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		unsafe { &*self.lock.data.get() }
	}
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.release();
	}
}

/// The `lock_high_ipl`/`unlock_restore` pair: raises IPL before acquiring,
/// restores it after releasing, in the mandatory order spec.md §4.1 spells
/// out. Every lock shared with an interrupt handler must be one of these.
pub struct SpinlockIrqSave<T: ?Sized> {
	inner: Spinlock<T>,
}

impl<T> SpinlockIrqSave<T> {
	pub const fn new(data: T) -> Self {
		Self {
			inner: Spinlock::new(data),
		}
	}
}

impl<T: ?Sized> SpinlockIrqSave<T> {
	pub fn lock(&self) -> SpinlockIrqSaveGuard<'_, T> {
		let flags = irq_save();
		let guard = self.inner.lock();
		SpinlockIrqSaveGuard {
			guard,
			flags: Some(flags),
		}
	}

	/// # Safety
	/// See [`Spinlock::force_unlock`].
	pub unsafe fn force_unlock(&self) {
		unsafe { self.inner.force_unlock() };
	}
}

pub struct SpinlockIrqSaveGuard<'a, T: ?Sized> {
	guard: SpinlockGuard<'a, T>,
	flags: Option<IrqFlags>,
}

impl<T: ?Sized> Deref for SpinlockIrqSaveGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		&self.guard
	}
}

impl<T: ?Sized> DerefMut for SpinlockIrqSaveGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut self.guard
	}
}

impl<T: ?Sized> Drop for SpinlockIrqSaveGuard<'_, T> {
	fn drop(&mut self) {
		// Guard's own Drop releases the CAS word first, then we lower IPL,
		// mirroring spec.md's "release reverses the order".
		if let Some(flags) = self.flags.take() {
			irq_restore(flags);
		}
	}
}

impl<T: ?Sized> SpinlockIrqSaveGuard<'_, T> {
	/// Consumes the guard without releasing the lock or restoring IRQ
	/// state, returning the saved flags instead. Used when a newly created
	/// thread is handed the scheduler lock it was created under: the lock
	/// stays held across the context switch and the new thread's first
	/// instructions call [`Spinlock::force_unlock`]/[`irq_restore`]
	/// themselves once they're actually running on their own stack.
	pub fn leak(self) -> IrqFlags {
		let mut this = core::mem::ManuallyDrop::new(self);
		this.flags.take().expect("guard already leaked")
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;
	use core::sync::atomic::AtomicU32;

	#[test]
	fn cas_basics() {
		let word = AtomicU32::new(0);
		assert_eq!(cas32(&word, 0, 1), 0);
		assert_eq!(word.load(Ordering::SeqCst), 1);
		assert_eq!(cas32(&word, 0, 2), 1);
		assert_eq!(word.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn faa_basics() {
		let word = AtomicU32::new(5);
		assert_eq!(faa32(&word, 3), 5);
		assert_eq!(word.load(Ordering::SeqCst), 8);
	}

	#[test]
	fn spinlock_mutual_exclusion() {
		let lock = Spinlock::new(0u32);
		{
			let mut guard = lock.lock();
			*guard += 1;
		}
		let guard = lock.lock();
		assert_eq!(*guard, 1);
	}
}
