// Copyright (c) 2017 Colin Finck, RWTH Aachen University
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Physical memory bring-up: the big/small page databases, the slab
//! allocator on top of them, and the boot-time sequencing that ties them
//! together with the Multiboot2 memory map (spec.md §4.2, §4.4).

pub mod allocator;
pub mod page_db;
pub mod slab;

use crate::arch::x86_64::mm::paging;
use crate::boot_info::{self, MemoryRegionKind};
use crate::config::BIG_PAGE_SIZE;

/// Physical memory bring-up (spec.md §4.2 "At init"): builds the big-page
/// database over the full Multiboot2-reported extent, reserves every region
/// the memory map doesn't mark available (this also covers the kernel image
/// and boot page tables, already reserved via [`paging::sync`]), then
/// bootstraps the size-classed general allocator on top.
///
/// Must run after [`boot_info::init`] and before anything allocates through
/// `alloc`.
pub fn init() {
	let info = boot_info::get();

	let top = info
		.mmap()
		.map(|e| e.base + e.length)
		.max()
		.unwrap_or(info.mem_size);
	let total = (top as usize).div_ceil(BIG_PAGE_SIZE) as u32;
	let reserved = (info.kernel_end as usize).div_ceil(BIG_PAGE_SIZE) as u32;

	page_db::big().init(total, reserved);

	for entry in info.mmap() {
		if entry.kind != MemoryRegionKind::Available {
			page_db::big().reserve_region(entry.base as usize, entry.length as usize);
		}
	}

	// Reserves whatever the boot page-table editor already identity-mapped
	// during early bring-up (the kernel image, this database itself, ACPI
	// tables read so far), on top of the memory-map-driven reservations
	// above (spec.md §4.3 "After the page DB is initialized"). Must run
	// before the whole-extent convenience map below: `sync` reserves every
	// PD entry it finds PRESENT, so mapping the rest of the extent first
	// would make `sync` reserve the entire database instead of just the
	// frames early boot actually consumed (spec.md §8 E1).
	paging::sync();

	// Identity-maps the whole extent the big-page database just described
	// (spec.md §1 Non-goals: "a single kernel address space with
	// identity-mapped physical pages"). Every index the database hands out
	// from here on — slab backing chunks, big-object allocations, thread
	// stacks — is already present in the boot page tables; nothing
	// downstream has to call back into the boot page-table editor itself.
	// `map_range`'s own idempotence (spec.md §4.3 "Policy") means this never
	// disturbs the reservations `sync` just made above.
	paging::map_range(0, 0, total as usize * BIG_PAGE_SIZE);

	allocator::bootstrap();

	log::info!(
		"mm: {} big pages total, {} reserved, {} free",
		page_db::big().total(),
		page_db::big().reserved_count(),
		page_db::big().free_count(),
	);
}

/// Allocates `size` bytes of identity-mapped physical memory for a
/// general-purpose kernel object too large for the slab allocator, such as a
/// kernel or IST stack (spec.md §4.4: "Larger allocations ... go straight to
/// big pages"). `execute_disable` is accepted for API symmetry with the
/// slab-classed path; the boot page-table editor only installs 2 MiB
/// present+writable mappings, so there is no NX bit to set yet. The
/// `map_range` call below is idempotent with [`init`]'s upfront identity
/// map and exists only so this function stays correct if ever called
/// against an index outside that initial extent (e.g. hot-added memory).
pub fn allocate(size: usize, _execute_disable: bool) -> usize {
	let big_pages = size.div_ceil(BIG_PAGE_SIZE).max(1);
	crate::check!(
		big_pages == 1,
		"mm::allocate: {size} bytes spans more than one big page"
	);

	let index = page_db::big().alloc();
	crate::check!(index != 0, "mm::allocate: big-page database exhausted");

	let addr = page_db::big_index_to_addr(index);
	paging::map_range(addr, addr, BIG_PAGE_SIZE);
	addr
}

/// Releases memory obtained from [`allocate`]. `size` is accepted for API
/// symmetry but unused: the big-page database's `free` only needs the index.
pub fn deallocate(addr: usize, _size: usize) {
	page_db::big().free(page_db::big_addr_to_index(addr));
}
