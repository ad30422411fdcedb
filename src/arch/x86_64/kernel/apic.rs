//! Local APIC and I/O APIC programming (spec.md §4.6 steps 3-6).
//!
//! MMIO (xAPIC) register access is used throughout; x2APIC detection via
//! `raw-cpuid` is left as a follow-up (see DESIGN.md) since QEMU's default
//! `-M q35`/`-M pc` machines expose the xAPIC MMIO window.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use hermit_sync::OnceCell;
use x86_64::instructions::port::Port;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::arch::x86_64::kernel::interrupts::{LAPIC_ERROR_IRQ, LOCAL_IRQ_BASE, TIMER_IRQ};

const APIC_REG_ID: usize = 0x20;
const APIC_REG_EOI: usize = 0xB0;
const APIC_REG_SPURIOUS: usize = 0xF0;
const APIC_REG_ICR_LOW: usize = 0x300;
const APIC_REG_ICR_HIGH: usize = 0x310;
const APIC_REG_LVT_TIMER: usize = 0x320;
const APIC_REG_LVT_ERROR: usize = 0x370;
const APIC_REG_TIMER_INIT_COUNT: usize = 0x380;
const APIC_REG_TIMER_DIVIDE: usize = 0x3E0;

const IOAPIC_REG_SELECT: usize = 0x00;
const IOAPIC_REG_WINDOW: usize = 0x10;
const IOAPIC_REDTBL_BASE: u32 = 0x10;

struct LocalApic {
	base: *mut u32,
}

unsafe impl Send for LocalApic {}
unsafe impl Sync for LocalApic {}

impl LocalApic {
	unsafe fn read(&self, reg: usize) -> u32 {
		unsafe { self.base.byte_add(reg).read_volatile() }
	}

	unsafe fn write(&self, reg: usize, value: u32) {
		unsafe { self.base.byte_add(reg).write_volatile(value) }
	}
}

struct IoApic {
	base: *mut u32,
	gsi_base: u32,
}

unsafe impl Send for IoApic {}
unsafe impl Sync for IoApic {}

impl IoApic {
	unsafe fn read(&self, reg: u32) -> u32 {
		unsafe {
			self.base.byte_add(IOAPIC_REG_SELECT).write_volatile(reg);
			self.base.byte_add(IOAPIC_REG_WINDOW).read_volatile()
		}
	}

	unsafe fn write(&self, reg: u32, value: u32) {
		unsafe {
			self.base.byte_add(IOAPIC_REG_SELECT).write_volatile(reg);
			self.base.byte_add(IOAPIC_REG_WINDOW).write_volatile(value);
		}
	}
}

static LOCAL_APIC: OnceCell<LocalApic> = OnceCell::new();
static IO_APIC: OnceCell<IoApic> = OnceCell::new();
static TIMER_TICKS_PER_MS: AtomicU64 = AtomicU64::new(0);
static BSP_APIC_ID: AtomicU32 = AtomicU32::new(0);

/// Masks the legacy 8259 PIC so it cannot compete with the I/O APIC
/// (spec.md §4.6 step 3).
pub fn disable_legacy_pic() {
	unsafe {
		let mut cmd_master: Port<u8> = Port::new(0x20);
		let mut data_master: Port<u8> = Port::new(0x21);
		let mut cmd_slave: Port<u8> = Port::new(0xA0);
		let mut data_slave: Port<u8> = Port::new(0xA1);

		cmd_master.write(0x11u8);
		cmd_slave.write(0x11u8);
		data_master.write(0x20u8);
		data_slave.write(0x28u8);
		data_master.write(0x04u8);
		data_slave.write(0x02u8);
		data_master.write(0x01u8);
		data_slave.write(0x01u8);
		data_master.write(0xFFu8);
		data_slave.write(0xFFu8);
	}
}

/// Maps the local APIC's MMIO base (from MADT) into the identity region and
/// records it for use by every core.
pub fn register_local_apic(phys_base: u64) {
	identity_map_one_frame(phys_base);
	LOCAL_APIC.get_or_init(|| LocalApic {
		base: phys_base as *mut u32,
	});
}

/// Maps the I/O APIC's MMIO base and records its GSI base (from MADT).
pub fn register_io_apic(phys_base: u64, gsi_base: u32) {
	identity_map_one_frame(phys_base);
	IO_APIC.get_or_init(|| IoApic {
		base: phys_base as *mut u32,
		gsi_base,
	});

	// Bring the I/O APIC up with every redirection entry masked
	// (spec.md §4.6 step 3).
	let io_apic = IO_APIC.get().unwrap();
	unsafe {
		let entries = (io_apic.read(0x01) >> 16) & 0xFF;
		for i in 0..=entries {
			io_apic.write(IOAPIC_REDTBL_BASE + i * 2, 1 << 16); // masked
			io_apic.write(IOAPIC_REDTBL_BASE + i * 2 + 1, 0);
		}
	}
}

fn identity_map_one_frame(phys_base: u64) {
	let frame = PhysFrame::containing_address(PhysAddr::new(phys_base));
	let base = frame.start_address().as_u64() as usize;
	crate::arch::x86_64::mm::paging::map_range(base, base, crate::config::BIG_PAGE_SIZE);
}

pub fn local_apic_id() -> u32 {
	unsafe { LOCAL_APIC.get().expect("local apic not registered").read(APIC_REG_ID) >> 24 }
}

/// Per-core local APIC bring-up (spec.md §4.6 step 4 for the BSP, step 5 for
/// each AP): enable, spurious vector, timer + error LVT entries.
pub fn init_local_apic(is_bsp: bool) {
	let apic = LOCAL_APIC.get().expect("local apic not registered");
	unsafe {
		apic.write(APIC_REG_SPURIOUS, 0x100 | 0xFF); // software-enable, vector 0xFF
		apic.write(APIC_REG_LVT_TIMER, u32::from(LOCAL_IRQ_BASE + TIMER_IRQ));
		apic.write(
			APIC_REG_LVT_ERROR,
			u32::from(LOCAL_IRQ_BASE + LAPIC_ERROR_IRQ),
		);
		apic.write(APIC_REG_TIMER_DIVIDE, 0x3); // divide by 16
	}
	if is_bsp {
		BSP_APIC_ID.store(local_apic_id(), Ordering::Relaxed);
	}
}

/// Sends end-of-interrupt to this core's local APIC.
pub fn eoi() {
	if let Some(apic) = LOCAL_APIC.get() {
		unsafe { apic.write(APIC_REG_EOI, 0) };
	}
}

/// Calibrates the APIC timer against the PIT and arms a periodic interrupt
/// at `hz`.
pub fn calibrate_and_start_timer(hz: u32) {
	let apic = LOCAL_APIC.get().expect("local apic not registered");
	let ticks_per_sec = crate::arch::x86_64::kernel::pit::calibrate_apic_timer(apic.base);
	TIMER_TICKS_PER_MS.store(ticks_per_sec / 1000, Ordering::Relaxed);
	unsafe {
		apic.write(APIC_REG_TIMER_INIT_COUNT, (ticks_per_sec / u64::from(hz)) as u32);
	}
}

/// Programs the I/O APIC to route `irq` (a legacy-numbered external line)
/// to the CPUs in `cpu_mask`, or masks it if `enable` is false.
pub fn ioapic_set_destination(irq: u8, cpu_mask: u64, enable: bool) {
	let Some(io_apic) = IO_APIC.get() else {
		return;
	};
	let gsi = u32::from(irq).saturating_sub(io_apic.gsi_base);
	let vector = u32::from(crate::arch::x86_64::kernel::interrupts::EXTERNAL_IRQ_BASE + irq);
	let low = if enable { vector } else { vector | (1 << 16) };
	let dest = (cpu_mask as u32) << 24;
	unsafe {
		io_apic.write(IOAPIC_REDTBL_BASE + gsi * 2, low);
		io_apic.write(IOAPIC_REDTBL_BASE + gsi * 2 + 1, dest);
	}
}

/// Issues the INIT IPI to `apic_id` (spec.md §4.6 step 5).
pub fn send_init_ipi(apic_id: u32) {
	send_ipi(apic_id, 0x500, 0);
}

/// Issues the STARTUP IPI to `apic_id`, where `vector` is the page index of
/// the real-mode AP trampoline.
pub fn send_startup_ipi(apic_id: u32, vector: u8) {
	send_ipi(apic_id, 0x600, vector);
}

fn send_ipi(apic_id: u32, delivery: u32, vector: u8) {
	let apic = LOCAL_APIC.get().expect("local apic not registered");
	unsafe {
		apic.write(APIC_REG_ICR_HIGH, apic_id << 24);
		apic.write(APIC_REG_ICR_LOW, delivery | u32::from(vector));
		while apic.read(APIC_REG_ICR_LOW) & (1 << 12) != 0 {
			core::hint::spin_loop();
		}
	}
}
