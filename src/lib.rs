/*
 * First version is derived and adapted for HermitCore from
 * Philipp Oppermann's excellent series of blog posts (http://blog.phil-opp.com/)
 * and Eric Kidd's toy OS (https://github.com/emk/toyos-rs).
 */

//! A small multi-processor x86_64 kernel: per-CPU scheduling, spinlocks,
//! condition variables and semaphores, thread lifecycle and context
//! switching, ACPI/MADT-driven SMP bring-up, and a two-tier physical-page
//! allocator with a slab-backed general allocator on top.
//!
//! [`boot`] is the single entry point a pre-Rust bootstrap (outside this
//! crate's scope) calls once it has reached 64-bit long mode with the
//! Multiboot2 magic value and info-structure pointer in hand.

#![no_std]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

pub mod arch;
pub mod boot_info;
pub mod config;
pub mod console;
pub mod logging;
pub mod mm;
pub mod panic;
pub mod scheduler;
pub mod synch;

use core::alloc::Layout;

#[global_allocator]
static ALLOCATOR: mm::allocator::KernelAllocator = mm::allocator::KernelAllocator;

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
	panic::fatal(format_args!(
		"out of memory: failed to allocate {} bytes (align {})",
		layout.size(),
		layout.align()
	));
}

/// The kernel's single entry point (spec.md §6 External Interfaces).
///
/// Brings up logging, parses the Multiboot2 info block into [`boot_info`],
/// brings the physical-memory subsystem online, then hands off to the
/// architecture layer for GDT/IDT/APIC bring-up and (with the `smp` feature)
/// application-processor startup. Never returns: the boot processor ends up
/// idling in the interrupt-driven scheduler just like every other core.
pub fn boot(multiboot_magic: u32, multiboot_addr: u64) -> ! {
	logging::init();
	log::info!(
		"smp-kernel {} booting (multiboot info at {multiboot_addr:#x})",
		env!("CARGO_PKG_VERSION")
	);

	boot_info::init(boot_info::from_multiboot2(multiboot_magic, multiboot_addr));

	mm::init();
	arch::x86_64::kernel::boot_processor_init();

	log::info!(
		"boot processor up, {} cpu(s) registered",
		scheduler::num_cpus()
	);

	loop {
		arch::x86_64::kernel::irq::halt();
	}
}
