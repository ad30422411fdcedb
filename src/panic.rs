//! Fatal-assertion handling (§13, spec.md §7/§9).
//!
//! `check` is the systems-language realization of the source's `check(x)`
//! contract: "if x is false, print and halt". There is no recovery path and
//! it must never be represented as something callers can catch.

use core::fmt;
use core::panic::PanicInfo;

use crate::arch::x86_64::kernel::irq;

/// Disables interrupts on the current CPU, writes `msg` to the console sink
/// and halts. Never returns.
///
/// With the `qemu-exit` feature, halting is replaced by a write to the
/// `isa-debug-exit` port reporting failure, so a host-side test runner sees
/// a non-success QEMU exit code instead of having to notice the kernel went
/// quiet.
pub(crate) fn fatal(args: fmt::Arguments<'_>) -> ! {
	irq::disable();
	crate::console::emergency_write(b"\n[fatal] ");
	crate::console::_print(args);
	crate::console::emergency_write(b"\n");

	#[cfg(feature = "qemu-exit")]
	crate::arch::x86_64::kernel::qemu_exit::exit(crate::arch::x86_64::kernel::qemu_exit::ExitCode::Failed);

	#[cfg(not(feature = "qemu-exit"))]
	loop {
		irq::halt();
	}
}

/// The source's `check(x, msg)` contract: invariant violations are not
/// recoverable and must halt the offending CPU immediately.
#[track_caller]
pub fn check(cond: bool, msg: fmt::Arguments<'_>) {
	if !cond {
		let loc = core::panic::Location::caller();
		fatal(format_args!("assertion failed at {loc}: {msg}"));
	}
}

#[macro_export]
macro_rules! check {
	($cond:expr, $($arg:tt)+) => {
		$crate::panic::check($cond, format_args!($($arg)+))
	};
	($cond:expr) => {
		$crate::panic::check($cond, format_args!(stringify!($cond)))
	};
}

#[panic_handler]
fn panic_handler(info: &PanicInfo<'_>) -> ! {
	fatal(format_args!("{info}"))
}
