//! Boot page-table editor (spec.md §4.3).
//!
//! The kernel runs a single identity-mapped address space (spec.md §1
//! Non-goals: "only a single kernel address space with identity-mapped
//! physical pages"), so every mapping this module installs has `va == pa`
//! rounded to a 2 MiB boundary. The hierarchy is fixed at a statically
//! allocated PML4; missing PDPT/PD pages are supplied by a small bump
//! allocator carved out of a reserved boot-page pool and zeroed on
//! allocation, exactly as the source describes. A single spinlock
//! serializes every edit, since APs may call in during bring-up.

use core::sync::atomic::{AtomicUsize, Ordering};

use x86_64::instructions::tlb;
use x86_64::structures::paging::{PageTable, PageTableEntry, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

use crate::config::BIG_PAGE_SIZE;
use crate::panic::check;
use crate::synch::spinlock::SpinlockIrqSave;

/// Number of 4 KiB pages set aside for intermediate PDPT/PD tables. Each PD
/// covers 1 GiB, so 64 pages is generous headroom for a teaching kernel's
/// identity map.
const BOOT_POOL_PAGES: usize = 64;

#[repr(align(4096))]
struct RawPage([u8; 0x1000]);

static mut BOOT_POOL: [RawPage; BOOT_POOL_PAGES] = [const { RawPage([0; 0x1000]) }; BOOT_POOL_PAGES];
static BUMP_CURSOR: AtomicUsize = AtomicUsize::new(0);

static mut ROOT_PML4: PageTable = PageTable::new();

static LOCK: SpinlockIrqSave<()> = SpinlockIrqSave::new(());

/// Hands out a zeroed page for use as a PDPT or PD, bump-style. There is no
/// free path: intermediate page-directory pages are never reclaimed once the
/// boot editor has installed them (spec.md §4.3).
fn alloc_table_page() -> *mut PageTable {
	let index = BUMP_CURSOR.fetch_add(1, Ordering::Relaxed);
	check(
		index < BOOT_POOL_PAGES,
		"boot page-table editor: intermediate page pool exhausted",
	);
	unsafe {
		let raw = core::ptr::addr_of_mut!(BOOT_POOL[index]) as *mut u8;
		raw.write_bytes(0, 0x1000);
		raw as *mut PageTable
	}
}

fn pml4_index(va: usize) -> usize {
	(va >> 39) & 0x1FF
}

fn pdpt_index(va: usize) -> usize {
	(va >> 30) & 0x1FF
}

fn pd_index(va: usize) -> usize {
	(va >> 21) & 0x1FF
}

/// Returns the subtable an entry points at, allocating and linking a fresh
/// one (present + writable) if the entry is not yet present.
fn subtable_or_create(entry: &mut PageTableEntry) -> &'static mut PageTable {
	if !entry.flags().contains(PageTableFlags::PRESENT) {
		let table = alloc_table_page();
		entry.set_addr(
			PhysAddr::new(table as u64),
			PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
		);
	}
	unsafe { &mut *(entry.addr().as_u64() as *mut PageTable) }
}

/// Returns a present subtable, or `None` if the entry is not mapped. Used by
/// `unmap_range` and `sync`, which must not allocate.
fn subtable_if_present(entry: &PageTableEntry) -> Option<&'static mut PageTable> {
	if entry.flags().contains(PageTableFlags::PRESENT) {
		Some(unsafe { &mut *(entry.addr().as_u64() as *mut PageTable) })
	} else {
		None
	}
}

fn map_one_locked(va: usize, pa: usize) {
	let pml4 = unsafe { &mut *core::ptr::addr_of_mut!(ROOT_PML4) };
	let pdpt = subtable_or_create(&mut pml4[pml4_index(va)]);
	let pd = subtable_or_create(&mut pdpt[pdpt_index(va)]);

	let entry = &mut pd[pd_index(va)];
	let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::HUGE_PAGE;
	let changed = !entry.flags().contains(PageTableFlags::PRESENT) || entry.addr().as_u64() != pa as u64;
	entry.set_addr(PhysAddr::new(pa as u64), flags);

	if changed {
		tlb::flush(VirtAddr::new(va as u64));
	}
}

fn unmap_one_locked(va: usize) {
	let pml4 = unsafe { &mut *core::ptr::addr_of_mut!(ROOT_PML4) };
	let Some(pdpt) = subtable_if_present(&pml4[pml4_index(va)]) else {
		return;
	};
	let Some(pd) = subtable_if_present(&pdpt[pdpt_index(va)]) else {
		return;
	};

	let entry = &mut pd[pd_index(va)];
	if entry.flags().contains(PageTableFlags::PRESENT) {
		entry.set_unused();
		tlb::flush(VirtAddr::new(va as u64));
	}
}

/// Maps `[va, va + size)` to `[pa, pa + size)` in 2 MiB steps, rounding the
/// range outward to 2 MiB boundaries. Idempotent: remapping an already
/// mapped range to the same physical address is a no-op; remapping it to a
/// different address flushes the stale TLB entry (spec.md §4.3 "Policy").
pub fn map_range(va: usize, pa: usize, size: usize) {
	let _guard = LOCK.lock();
	let start = va & !(BIG_PAGE_SIZE - 1);
	let end = (va + size).next_multiple_of(BIG_PAGE_SIZE);
	let mut offset = 0;
	while start + offset < end {
		map_one_locked(start + offset, (pa & !(BIG_PAGE_SIZE - 1)) + offset);
		offset += BIG_PAGE_SIZE;
	}
}

/// Unmaps `[va, va + size)`, rounded outward to 2 MiB boundaries.
pub fn unmap_range(va: usize, size: usize) {
	let _guard = LOCK.lock();
	let start = va & !(BIG_PAGE_SIZE - 1);
	let end = (va + size).next_multiple_of(BIG_PAGE_SIZE);
	let mut cursor = start;
	while cursor < end {
		unmap_one_locked(cursor);
		cursor += BIG_PAGE_SIZE;
	}
}

/// Physical address of the fixed root PML4, handed to application processors
/// so their trampoline can load the same identity map into CR3 (spec.md §4.6
/// step 5: APs reuse the BSP's page tables).
pub fn root_pml4_phys() -> u64 {
	core::ptr::addr_of!(ROOT_PML4) as u64
}

/// Walks the live hierarchy and reserves every 2 MiB frame it finds mapped,
/// so the page database's free list excludes memory already consumed by
/// early boot (spec.md §4.3 "After the page DB is initialized").
///
/// Must run after `crate::mm::page_db::big().init(..)` and before any
/// caller relies on the free list being accurate.
pub fn sync() {
	let _guard = LOCK.lock();
	let pml4 = unsafe { &*core::ptr::addr_of!(ROOT_PML4) };

	for pml4_entry in pml4.iter() {
		let Some(pdpt) = subtable_if_present(pml4_entry) else {
			continue;
		};
		for pdpt_entry in pdpt.iter() {
			let Some(pd) = subtable_if_present(pdpt_entry) else {
				continue;
			};
			for pd_entry in pd.iter() {
				if pd_entry.flags().contains(PageTableFlags::PRESENT) {
					let addr = pd_entry.addr().as_u64() as usize;
					crate::mm::page_db::big().reserve_page(crate::mm::page_db::big_addr_to_index(addr));
				}
			}
		}
	}
}
