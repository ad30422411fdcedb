//! BSP and AP bring-up (spec.md §4.6): GDT/IDT installation, ACPI/MADT
//! discovery, local/IO-APIC programming, and the INIT+STARTUP IPI sequence
//! that starts the application processors.

#[cfg(feature = "acpi")]
pub mod acpi;
pub mod apic;
pub mod core_local;
pub mod gdt;
pub mod interrupts;
pub mod irq;
#[cfg(target_os = "none")]
pub mod multiboot_header;
pub mod percore;
pub mod pit;
pub mod processor;
#[cfg(feature = "qemu-exit")]
pub mod qemu_exit;
pub mod serial;
#[cfg(target_os = "none")]
pub mod start;
pub mod switch;

use crate::config::AP_BRINGUP_POLL_ITERATIONS;
use crate::scheduler;

/// Fallback local APIC MMIO base used when ACPI/MADT discovery fails
/// (spec.md §4.6 "hardware/firmware errors": continue BSP-only).
const DEFAULT_LOCAL_APIC_BASE: u64 = 0xFEE0_0000;

/// Rate the local APIC timer is armed for; drives [`scheduler::tick`].
const TIMER_HZ: u32 = 100;

/// Brings the boot processor up: GDT/TSS, IDT, legacy PIC masking, ACPI/MADT
/// discovery, local/IO-APIC bring-up, the periodic timer, and (with the
/// `smp` feature) the application processors (spec.md §4.6 steps 1-6).
/// Called once from [`crate::boot`].
pub fn boot_processor_init() {
	apic::disable_legacy_pic();

	#[cfg(feature = "acpi")]
	let madt = acpi::discover();
	#[cfg(not(feature = "acpi"))]
	let madt: Option<()> = None;

	#[cfg(feature = "acpi")]
	let local_apic_base = madt
		.as_ref()
		.map_or(DEFAULT_LOCAL_APIC_BASE, |m| u64::from(m.local_apic_address));
	#[cfg(not(feature = "acpi"))]
	let local_apic_base = DEFAULT_LOCAL_APIC_BASE;

	apic::register_local_apic(local_apic_base);

	#[cfg(feature = "acpi")]
	if let Some(madt) = madt.as_ref() {
		for io_apic in &madt.io_apics {
			apic::register_io_apic(u64::from(io_apic.base), io_apic.gsi_base);
		}
	}

	apic::init_local_apic(true);
	let bsp_apic_id = apic::local_apic_id();

	let index = scheduler::register_cpu(bsp_apic_id, true);
	core_local::install(index);
	gdt::init(index, current_stack_top());
	irq::init();

	processor::calibrate_tsc_via_pit();
	apic::calibrate_and_start_timer(TIMER_HZ);
	interrupts::register_local_handler(interrupts::TIMER_IRQ, timer_tick);
	interrupts::register_local_handler(interrupts::LAPIC_ERROR_IRQ, lapic_error);

	#[cfg(feature = "smp")]
	if let Some(madt) = madt.as_ref() {
		if madt.cpu_apic_ids.len() > 1 {
			crate::boot_info::get().enable_application_processors();
			boot_application_processors(madt);
		} else {
			log::info!("smp: MADT lists a single usable CPU, staying uniprocessor");
		}
	} else {
		log::warn!("smp: no MADT, staying uniprocessor");
	}

	irq::enable();
}

/// Brings an application processor online once the real-mode trampoline has
/// handed control to 64-bit Rust code (spec.md §4.6 step 6): local APIC,
/// per-core GDT/TSS/IDT, then join the timer-driven scheduler.
pub fn application_processor_main() -> ! {
	while !crate::boot_info::get().application_processors_enabled() {
		core::hint::spin_loop();
	}

	apic::init_local_apic(false);
	let apic_id = apic::local_apic_id();

	let index = scheduler::register_cpu(apic_id, false);
	core_local::install(index);
	gdt::init(index, current_stack_top());
	irq::init();

	log::info!("smp: cpu {index} (apic id {apic_id}) online");
	irq::enable();

	loop {
		irq::halt();
	}
}

/// Reads the current stack pointer, rounded down to the enclosing page, for
/// use as the GDT/TSS's ring-0 privilege stack. The kernel never actually
/// takes a ring transition, so this stack is never used; it only has to be a
/// valid, mapped address.
fn current_stack_top() -> u64 {
	let rsp: u64;
	unsafe {
		core::arch::asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags));
	}
	rsp & !0xFFF
}

fn timer_tick() {
	scheduler::tick();
}

fn lapic_error() {
	log::warn!("apic: local APIC error interrupt");
}

/// Sends the INIT+STARTUP IPI sequence to every MADT-listed CPU other than
/// the BSP, giving each its own stack and the shared identity-mapped page
/// tables, then waits for them to check in via [`scheduler::register_cpu`]
/// (spec.md §4.6 step 5).
#[cfg(feature = "smp")]
fn boot_application_processors(madt: &acpi::MadtInfo) {
	let bsp_apic_id = apic::local_apic_id();
	let pml4_phys = crate::arch::x86_64::mm::paging::root_pml4_phys();
	let expected = madt.cpu_apic_ids.len() as u32;

	for &apic_id in &madt.cpu_apic_ids {
		if apic_id == bsp_apic_id {
			continue;
		}

		let stack_top =
			(crate::mm::allocate(crate::config::KERNEL_STACK_SIZE, true) + crate::config::KERNEL_STACK_SIZE) as u64;
		#[cfg(target_os = "none")]
		unsafe {
			start::install(pml4_phys, stack_top)
		};
		#[cfg(target_os = "none")]
		{
			apic::send_init_ipi(apic_id);
			processor::udelay(10_000);
			apic::send_startup_ipi(apic_id, start::TRAMPOLINE_VECTOR);
			processor::udelay(1_000);
			apic::send_startup_ipi(apic_id, start::TRAMPOLINE_VECTOR);
		}
		#[cfg(not(target_os = "none"))]
		let _ = (stack_top, pml4_phys);
	}

	let mut waited = 0;
	while scheduler::num_cpus() < expected && waited < AP_BRINGUP_POLL_ITERATIONS {
		core::hint::spin_loop();
		waited += 1;
	}

	if scheduler::num_cpus() < expected {
		log::warn!(
			"smp: only {}/{expected} cpus checked in before the bring-up deadline",
			scheduler::num_cpus()
		);
	}
}
