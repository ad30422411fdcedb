//! The console-sink contract (§12 of SPEC_FULL.md).
//!
//! spec.md treats "there exists a console sink that accepts bytes" as an
//! out-of-scope external collaborator; this module pins down that contract
//! and supplies the one concrete sink needed to observe kernel output: a
//! COM1 16550 UART.

use core::fmt;

use hermit_sync::{InterruptTicketMutex, Lazy};

use crate::arch::x86_64::kernel::serial::SerialPort;

const BUFFER_SIZE: usize = 256;

/// Anything that can accept a stream of bytes for human consumption.
///
/// The VGA console, the boot framebuffer console and the `printf`-style
/// formatter are named out of scope by spec.md; this trait is the minimal
/// surface through which the logging stack (§1) reaches whatever sink is
/// actually wired up.
pub trait ConsoleSink: Send {
	fn write_bytes(&mut self, bytes: &[u8]);
}

impl ConsoleSink for SerialPort {
	fn write_bytes(&mut self, bytes: &[u8]) {
		self.write_bytes(bytes);
	}
}

struct BufferedConsole {
	sink: SerialPort,
	buffer: [u8; BUFFER_SIZE],
	len: usize,
}

impl BufferedConsole {
	fn new(sink: SerialPort) -> Self {
		Self {
			sink,
			buffer: [0; BUFFER_SIZE],
			len: 0,
		}
	}

	fn write(&mut self, bytes: &[u8]) {
		if bytes.len() >= BUFFER_SIZE {
			self.flush();
			self.sink.write_bytes(bytes);
			return;
		}

		if self.len + bytes.len() > BUFFER_SIZE {
			self.flush();
		}
		self.buffer[self.len..self.len + bytes.len()].copy_from_slice(bytes);
		self.len += bytes.len();

		if bytes.contains(&b'\n') {
			self.flush();
		}
	}

	fn flush(&mut self) {
		if self.len > 0 {
			self.sink.write_bytes(&self.buffer[..self.len]);
			self.len = 0;
		}
	}
}

impl fmt::Write for BufferedConsole {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		if !s.is_empty() {
			self.write(s.as_bytes());
		}
		Ok(())
	}
}

static CONSOLE: Lazy<InterruptTicketMutex<BufferedConsole>> =
	Lazy::new(|| InterruptTicketMutex::new(BufferedConsole::new(SerialPort::com1())));

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
	use fmt::Write;
	CONSOLE.lock().write_fmt(args).ok();
}

/// Writes straight to the sink, bypassing the line buffer and any lock
/// fairness. Used only by the panic handler (§13), which may run with the
/// console already held by the panicking CPU.
pub fn emergency_write(bytes: &[u8]) {
	unsafe {
		let mut console = CONSOLE.make_guard_unchecked();
		console.flush();
		console.sink.write_bytes(bytes);
	}
}

#[macro_export]
macro_rules! print {
	($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
	() => ($crate::print!("\n"));
	($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
