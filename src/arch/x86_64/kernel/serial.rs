//! COM1 16550 UART, the one concrete console sink (§12 of SPEC_FULL.md).

const COM1_BASE: u16 = 0x3F8;

pub struct SerialPort {
	inner: uart_16550::SerialPort,
}

impl SerialPort {
	pub fn com1() -> Self {
		let mut inner = unsafe { uart_16550::SerialPort::new(COM1_BASE) };
		inner.init();
		Self { inner }
	}

	pub fn write_bytes(&mut self, bytes: &[u8]) {
		for &byte in bytes {
			if byte == b'\n' {
				self.inner.send(b'\r');
			}
			self.inner.send(byte);
		}
	}
}
