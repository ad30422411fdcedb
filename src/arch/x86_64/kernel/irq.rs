//! Exception vectors and the IRQ-mask save/restore discipline (spec.md
//! §4.1, §4.5).
//!
//! Vectors 0-31 are installed as trap gates pointing at a per-vector stub
//! via the `x86_64` crate's `InterruptDescriptorTable`, matching the
//! teacher's modern `irq.rs`. Unhandled exceptions print the frame and
//! halt; page faults also report the faulting address from CR2; the
//! breakpoint exception just returns.

use hermit_sync::OnceCell;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::arch::x86_64::kernel::gdt::{IST_DOUBLE_FAULT, IST_NMI};
use crate::arch::x86_64::kernel::interrupts;

static IDT: OnceCell<InterruptDescriptorTable> = OnceCell::new();

/// Disables interrupts on the current CPU. Thin wrapper kept so call sites
/// read `irq::disable()` the way the rest of the kernel's vocabulary does.
#[inline]
pub fn disable() {
	x86_64::instructions::interrupts::disable();
}

#[inline]
pub fn enable() {
	x86_64::instructions::interrupts::enable();
}

#[inline]
pub fn enabled() -> bool {
	x86_64::instructions::interrupts::are_enabled()
}

#[inline]
pub fn halt() {
	x86_64::instructions::hlt();
}

/// Builds the IDT (once, shared by all cores) and loads it on the calling
/// core. Must run after `gdt::init` so the IST indices it references exist.
pub fn init() {
	let idt = IDT.get_or_init(|| {
		let mut idt = InterruptDescriptorTable::new();
		idt.divide_error.set_handler_fn(unhandled_divide_error);
		idt.debug.set_handler_fn(unhandled_debug);
		unsafe {
			idt.non_maskable_interrupt
				.set_handler_fn(unhandled_nmi)
				.set_stack_index(IST_NMI);
		}
		idt.breakpoint.set_handler_fn(breakpoint);
		idt.overflow.set_handler_fn(unhandled_overflow);
		idt.bound_range_exceeded
			.set_handler_fn(unhandled_bound_range);
		idt.invalid_opcode.set_handler_fn(unhandled_invalid_opcode);
		idt.device_not_available
			.set_handler_fn(unhandled_device_not_available);
		unsafe {
			idt.double_fault
				.set_handler_fn(double_fault)
				.set_stack_index(IST_DOUBLE_FAULT);
		}
		idt.invalid_tss.set_handler_fn(unhandled_invalid_tss);
		idt.segment_not_present
			.set_handler_fn(unhandled_segment_not_present);
		idt.stack_segment_fault
			.set_handler_fn(unhandled_stack_segment_fault);
		idt.general_protection_fault
			.set_handler_fn(unhandled_general_protection_fault);
		idt.page_fault.set_handler_fn(page_fault);
		idt.x87_floating_point
			.set_handler_fn(unhandled_x87_floating_point);
		idt.alignment_check.set_handler_fn(unhandled_alignment_check);
		unsafe {
			idt.machine_check
				.set_handler_fn(unhandled_machine_check)
				.set_stack_index(IST_NMI);
		}
		idt.simd_floating_point
			.set_handler_fn(unhandled_simd_floating_point);

		interrupts::install_external_stubs(&mut idt);
		idt
	});

	idt.load();
}

macro_rules! unhandled {
	($name:ident, $text:literal) => {
		extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
			crate::panic::check(false, format_args!("unhandled exception {}: {frame:#?}", $text));
		}
	};
}

unhandled!(unhandled_divide_error, "divide-error");
unhandled!(unhandled_debug, "debug");
unhandled!(unhandled_nmi, "non-maskable-interrupt");
unhandled!(unhandled_overflow, "overflow");
unhandled!(unhandled_bound_range, "bound-range-exceeded");
unhandled!(unhandled_invalid_opcode, "invalid-opcode");
unhandled!(unhandled_device_not_available, "device-not-available");
unhandled!(unhandled_x87_floating_point, "x87-floating-point");
unhandled!(unhandled_alignment_check, "alignment-check");
unhandled!(unhandled_simd_floating_point, "simd-floating-point");

extern "x86-interrupt" fn unhandled_invalid_tss(frame: InterruptStackFrame, code: u64) {
	crate::panic::check(false, format_args!("invalid-tss ({code:#x}): {frame:#?}"));
}

extern "x86-interrupt" fn unhandled_segment_not_present(frame: InterruptStackFrame, code: u64) {
	crate::panic::check(
		false,
		format_args!("segment-not-present ({code:#x}): {frame:#?}"),
	);
}

extern "x86-interrupt" fn unhandled_stack_segment_fault(frame: InterruptStackFrame, code: u64) {
	crate::panic::check(
		false,
		format_args!("stack-segment-fault ({code:#x}): {frame:#?}"),
	);
}

extern "x86-interrupt" fn unhandled_general_protection_fault(frame: InterruptStackFrame, code: u64) {
	crate::panic::check(
		false,
		format_args!("general-protection-fault ({code:#x}): {frame:#?}"),
	);
}

extern "x86-interrupt" fn unhandled_machine_check(frame: InterruptStackFrame) -> ! {
	crate::panic::check(false, format_args!("machine-check: {frame:#?}"));
	unreachable!()
}

extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, code: u64) -> ! {
	crate::panic::check(false, format_args!("double-fault ({code:#x}): {frame:#?}"));
	unreachable!()
}

extern "x86-interrupt" fn breakpoint(_frame: InterruptStackFrame) {
	// spec.md §4.5: "Breakpoint returns."
}

extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, code: PageFaultErrorCode) {
	let addr = Cr2::read().unwrap_or_default();
	crate::panic::check(
		false,
		format_args!("page-fault at {addr:?} ({code:?}): {frame:#?}"),
	);
}
