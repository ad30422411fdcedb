//! External-IRQ and local-interrupt dispatch (spec.md §4.5).
//!
//! The dispatch table has the fixed size spec.md calls out: 16 external
//! lines mapped through the I/O APIC, 8 local lines (timer, LAPIC error,
//! ...) delivered directly to the local APIC's LVT. Each stub pushes a
//! standard trap frame (the CPU already does this for us via the
//! `x86-interrupt` ABI), calls the generic dispatcher, which sends EOI to
//! the local APIC, looks up the handler, and invokes it.
//!
//! Only two of the eight local slots are wired up (timer, LAPIC error);
//! cross-CPU wakeup goes through the lock-hop in `scheduler::wake`, not an
//! IPI (spec.md: "No IPI is required for correctness"), so there is no
//! wakeup vector to register here.

use hermit_sync::InterruptTicketMutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

use crate::arch::x86_64::kernel::apic;

pub const EXTERNAL_IRQ_COUNT: usize = 16;
pub const LOCAL_IRQ_COUNT: usize = 8;
pub const EXTERNAL_IRQ_BASE: u8 = 32;
pub const LOCAL_IRQ_BASE: u8 = EXTERNAL_IRQ_BASE + EXTERNAL_IRQ_COUNT as u8;

pub const TIMER_IRQ: u8 = 0;
pub const LAPIC_ERROR_IRQ: u8 = 1;

type Handler = fn();

static EXTERNAL_HANDLERS: InterruptTicketMutex<[Option<Handler>; EXTERNAL_IRQ_COUNT]> =
	InterruptTicketMutex::new([None; EXTERNAL_IRQ_COUNT]);
static LOCAL_HANDLERS: InterruptTicketMutex<[Option<Handler>; LOCAL_IRQ_COUNT]> =
	InterruptTicketMutex::new([None; LOCAL_IRQ_COUNT]);

/// Registers the handler for an external (I/O-APIC-routed) IRQ line.
pub fn register_external_handler(irq: u8, handler: Handler) {
	EXTERNAL_HANDLERS.lock()[irq as usize] = Some(handler);
}

/// Registers the handler for a local-APIC interrupt (LVT entry or self-IPI
/// vector).
pub fn register_local_handler(irq: u8, handler: Handler) {
	LOCAL_HANDLERS.lock()[irq as usize] = Some(handler);
}

/// Enables an external IRQ line, routing it to the CPUs named in `cpu_mask`
/// (bit N set => CPU N is a valid destination).
pub fn enable_irq(irq: u8, cpu_mask: u64) {
	apic::ioapic_set_destination(irq, cpu_mask, true);
}

pub fn disable_irq(irq: u8) {
	apic::ioapic_set_destination(irq, 0, false);
}

fn dispatch_external(irq: u8) {
	if let Some(handler) = EXTERNAL_HANDLERS.lock()[irq as usize] {
		handler();
	}
	apic::eoi();
}

fn dispatch_local(irq: u8) {
	if let Some(handler) = LOCAL_HANDLERS.lock()[irq as usize] {
		handler();
	}
	apic::eoi();
}

macro_rules! external_stub {
	($name:ident, $irq:expr) => {
		extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
			dispatch_external($irq);
		}
	};
}

macro_rules! local_stub {
	($name:ident, $irq:expr) => {
		extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
			dispatch_local($irq);
		}
	};
}

external_stub!(external_0, 0);
external_stub!(external_1, 1);
external_stub!(external_2, 2);
external_stub!(external_3, 3);
external_stub!(external_4, 4);
external_stub!(external_5, 5);
external_stub!(external_6, 6);
external_stub!(external_7, 7);
external_stub!(external_8, 8);
external_stub!(external_9, 9);
external_stub!(external_10, 10);
external_stub!(external_11, 11);
external_stub!(external_12, 12);
external_stub!(external_13, 13);
external_stub!(external_14, 14);
external_stub!(external_15, 15);

local_stub!(local_0, 0);
local_stub!(local_1, 1);
local_stub!(local_2, 2);
local_stub!(local_3, 3);
local_stub!(local_4, 4);
local_stub!(local_5, 5);
local_stub!(local_6, 6);
local_stub!(local_7, 7);

/// Wires the fixed-size dispatch table's numbered stubs into `idt`. Called
/// once from `irq::init` while the shared IDT is being built.
pub fn install_external_stubs(idt: &mut InterruptDescriptorTable) {
	let externals: [extern "x86-interrupt" fn(InterruptStackFrame); EXTERNAL_IRQ_COUNT] = [
		external_0, external_1, external_2, external_3, external_4, external_5, external_6,
		external_7, external_8, external_9, external_10, external_11, external_12, external_13,
		external_14, external_15,
	];
	for (i, stub) in externals.into_iter().enumerate() {
		idt[EXTERNAL_IRQ_BASE + i as u8].set_handler_fn(stub);
	}

	let locals: [extern "x86-interrupt" fn(InterruptStackFrame); LOCAL_IRQ_COUNT] = [
		local_0, local_1, local_2, local_3, local_4, local_5, local_6, local_7,
	];
	for (i, stub) in locals.into_iter().enumerate() {
		idt[LOCAL_IRQ_BASE + i as u8].set_handler_fn(stub);
	}
}
