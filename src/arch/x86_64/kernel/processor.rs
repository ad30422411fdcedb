//! CPU feature detection and low-level timing helpers.

use core::sync::atomic::{AtomicU64, Ordering};

use raw_cpuid::CpuId;

static CYCLES_PER_US: AtomicU64 = AtomicU64::new(0);

pub fn supports_x2apic() -> bool {
	CpuId::new()
		.get_feature_info()
		.is_some_and(|f| f.has_x2apic())
}

#[inline]
pub fn get_timestamp() -> u64 {
	unsafe { core::arch::x86_64::_rdtsc() }
}

/// Calibrates the TSC against the already-running APIC timer so `udelay`
/// has a cycles/µs figure to busy-wait against.
pub fn calibrate_tsc(cycles_per_us: u64) {
	CYCLES_PER_US.store(cycles_per_us, Ordering::Relaxed);
}

/// Calibrates the TSC against the legacy PIT, the same clock source
/// `apic::calibrate_and_start_timer` uses for the local APIC timer, so
/// `udelay` has a cycles/µs figure before the APIC timer is armed.
pub fn calibrate_tsc_via_pit() {
	use x86_64::instructions::port::Port;

	const PIT_FREQUENCY_HZ: u64 = 1_193_182;
	const CALIBRATION_MS: u64 = 10;
	let reload = (PIT_FREQUENCY_HZ * CALIBRATION_MS) / 1000;

	unsafe {
		let mut command: Port<u8> = Port::new(0x43);
		let mut channel0: Port<u8> = Port::new(0x40);
		command.write(0b0011_0000u8);
		channel0.write((reload & 0xFF) as u8);
		channel0.write(((reload >> 8) & 0xFF) as u8);

		let start = get_timestamp();
		loop {
			command.write(0b1110_0010u8);
			let status: u8 = channel0.read();
			if status & 0x80 != 0 {
				break;
			}
		}
		let elapsed = get_timestamp().wrapping_sub(start);
		calibrate_tsc((elapsed / (CALIBRATION_MS * 1000)).max(1));
	}
}

pub fn udelay(microseconds: u64) {
	let cycles_per_us = CYCLES_PER_US.load(Ordering::Relaxed);
	if cycles_per_us == 0 {
		// Before calibration, fall back to a crude busy loop.
		for _ in 0..microseconds * 1000 {
			core::hint::spin_loop();
		}
		return;
	}
	let start = get_timestamp();
	let target = microseconds * cycles_per_us;
	while get_timestamp().wrapping_sub(start) < target {
		core::hint::spin_loop();
	}
}
