//! `isa-debug-exit` shutdown path used by the test harness under QEMU
//! (SPEC_FULL.md §1 "Config/feature surface": the `qemu-exit` Cargo feature).
//!
//! QEMU's `isa-debug-exit` device maps a single I/O port (0xf4 by default,
//! the port this kernel's `.cargo/config.toml`-equivalent QEMU invocation is
//! expected to configure with `-device isa-debug-exit,iobase=0xf4,iosize=4`)
//! to `(value << 1) | 1` as the emulator's own exit code. A host-side test
//! runner can then tell a passing run from a failing one without scraping
//! console output.

use x86_64::instructions::port::Port;

const ISA_DEBUG_EXIT_PORT: u16 = 0xf4;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
	Success = 0x10,
	Failed = 0x11,
}

/// Writes `code` to the `isa-debug-exit` port and halts, for the case QEMU
/// is configured without the device (or isn't QEMU at all) and the write
/// has no effect.
pub fn exit(code: ExitCode) -> ! {
	unsafe {
		let mut port: Port<u32> = Port::new(ISA_DEBUG_EXIT_PORT);
		port.write(code as u32);
	}
	loop {
		super::irq::halt();
	}
}
