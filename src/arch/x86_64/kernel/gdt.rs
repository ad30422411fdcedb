//! GDT/TSS setup (spec.md §4.5 ambient requirement; SPEC_FULL.md §6:
//! IST2/IST3 for double-fault/NMI).

use alloc::boxed::Box;

use hermit_sync::{InterruptTicketMutex, OnceCell};
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::config::{IST_ENTRIES, KERNEL_STACK_SIZE};

pub const IST_DOUBLE_FAULT: u16 = 0;
pub const IST_NMI: u16 = 1;

struct Selectors {
	code: SegmentSelector,
	data: SegmentSelector,
}

static SELECTORS: OnceCell<Selectors> = OnceCell::new();

/// One GDT + TSS per CPU, built lazily the first time each core calls
/// [`init`]. `Box::leak` keeps the memory alive for the kernel's lifetime,
/// matching the teacher's one-shot-per-core GDT/TSS allocation.
static GDTS: InterruptTicketMutex<[Option<&'static GlobalDescriptorTable>; crate::scheduler::MAX_CPUS]> =
	InterruptTicketMutex::new([None; crate::scheduler::MAX_CPUS]);

pub fn kernel_code_selector() -> SegmentSelector {
	SELECTORS.get().expect("gdt not initialized").code
}

pub fn kernel_data_selector() -> SegmentSelector {
	SELECTORS.get().expect("gdt not initialized").data
}

/// Builds and loads this core's GDT/TSS, installing dedicated IST stacks for
/// double fault and NMI.
pub fn init(cpu_id: u32, boot_stack_top: u64) {
	let mut tss = TaskStateSegment::new();
	tss.privilege_stack_table[0] = VirtAddr::new(boot_stack_top);
	for i in 0..IST_ENTRIES {
		let ist_top = crate::mm::allocate(KERNEL_STACK_SIZE, true) + KERNEL_STACK_SIZE;
		tss.interrupt_stack_table[i] = VirtAddr::new(ist_top as u64);
	}
	let tss: &'static TaskStateSegment = Box::leak(Box::new(tss));

	let mut gdt = GlobalDescriptorTable::new();
	let code = gdt.append(Descriptor::kernel_code_segment());
	let data = gdt.append(Descriptor::kernel_data_segment());
	let tss_sel = gdt.append(Descriptor::tss_segment(tss));
	let gdt: &'static GlobalDescriptorTable = Box::leak(Box::new(gdt));

	GDTS.lock()[cpu_id as usize] = Some(gdt);
	SELECTORS.get_or_init(|| Selectors { code, data });

	unsafe {
		gdt.load();
		CS::set_reg(code);
		DS::set_reg(data);
		ES::set_reg(data);
		SS::set_reg(data);
		load_tss(tss_sel);
	}
}
