//! The fixed boot-info block handed off by the boot stubs (spec §3, §6).
//!
//! The block lives at a fixed physical/virtual address chosen by the linker
//! script and is populated before `kernel::boot()` runs. Everything here is
//! read-only from the kernel's perspective except `ap_enable`, which the BSP
//! flips once it is ready for the application processors to proceed.

use core::sync::atomic::{AtomicBool, Ordering};

use hermit_sync::OnceCell;

/// One physical memory map entry, as handed off by the Multiboot2 `mmap` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
	pub base: u64,
	pub length: u64,
	pub kind: MemoryRegionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
	Available,
	Reserved,
	Acpi,
	Nvs,
}

/// Framebuffer description from the Multiboot2 `framebuffer` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
	pub addr: u64,
	pub pitch: u32,
	pub width: u32,
	pub height: u32,
	pub bpp: u8,
	pub kind: u8,
}

/// Process-wide boot state, fixed at load time.
///
/// The memory map is capped at a small fixed count rather than backed by an
/// allocator: at the point this struct is populated, no allocator exists yet.
pub struct BootInfo {
	pub multiboot_magic: u32,
	pub multiboot_addr: u64,
	pub kernel_end: u64,
	pub kernel_top: u64,
	/// Bump cursor into the slack region below the boot page table (§9 "Slack").
	pub kernel_slack: u64,
	pub mmap: [Option<MemoryMapEntry>; Self::MAX_MMAP_ENTRIES],
	pub mmap_count: usize,
	pub mem_size: u64,
	pub framebuffer: Option<FramebufferInfo>,
	pub cmdline: Option<&'static str>,
	ap_enable: AtomicBool,
}

impl BootInfo {
	pub const MAX_MMAP_ENTRIES: usize = 32;

	const fn empty() -> Self {
		Self {
			multiboot_magic: 0,
			multiboot_addr: 0,
			kernel_end: 0,
			kernel_top: 0,
			kernel_slack: 0,
			mmap: [None; Self::MAX_MMAP_ENTRIES],
			mmap_count: 0,
			mem_size: 0,
			framebuffer: None,
			cmdline: None,
			ap_enable: AtomicBool::new(false),
		}
	}

	pub fn push_mmap_entry(&mut self, entry: MemoryMapEntry) {
		if self.mmap_count < Self::MAX_MMAP_ENTRIES {
			self.mmap[self.mmap_count] = Some(entry);
			self.mmap_count += 1;
		} else {
			log::warn!("boot_info: mmap entry dropped, MAX_MMAP_ENTRIES exceeded");
		}
	}

	pub fn mmap(&self) -> impl Iterator<Item = &MemoryMapEntry> {
		self.mmap[..self.mmap_count].iter().filter_map(|e| e.as_ref())
	}

	/// Set by the BSP once APs are cleared to begin their trampoline (§4.6 step 5).
	pub fn enable_application_processors(&self) {
		self.ap_enable.store(true, Ordering::Release);
	}

	pub fn application_processors_enabled(&self) -> bool {
		self.ap_enable.load(Ordering::Acquire)
	}
}

unsafe extern "C" {
	/// Linker-provided end of the kernel image, used to reserve its physical
	/// frames in the page database (spec.md §4.2 "At init").
	static kernel_end: u8;
}

/// Builds the boot-info block from the Multiboot2 tag stream `kernel::boot`
/// receives from its loader (spec.md §6 External Interfaces).
///
/// The tag pointer is only trusted once the magic value matches; on a
/// mismatch or a parse failure the kernel continues with an empty memory map
/// rather than refuse to boot; in practice nothing will be available to
/// allocate and `mm::init` degrades to "no usable RAM found".
pub fn from_multiboot2(magic: u32, addr: u64) -> BootInfo {
	const EXPECTED_MAGIC: u32 = 0x36D7_6289;

	let mut info = BootInfo::empty();
	info.multiboot_magic = magic;
	info.multiboot_addr = addr;
	info.kernel_end = unsafe { core::ptr::addr_of!(kernel_end) as u64 };
	info.kernel_top = info.kernel_end;
	info.kernel_slack = info.kernel_end;

	if magic != EXPECTED_MAGIC {
		log::error!("boot_info: unexpected multiboot2 magic {magic:#x}");
		return info;
	}

	let boot_info = unsafe { multiboot2::BootInformation::load(addr as *const multiboot2::BootInformationHeader) };
	let Ok(boot_info) = boot_info else {
		log::error!("boot_info: failed to parse multiboot2 tags at {addr:#x}");
		return info;
	};

	if let Some(Ok(cmdline)) = boot_info.command_line_tag().map(|t| t.cmdline()) {
		// The tag data lives in memory the loader handed off and that the
		// kernel never reclaims, so treating it as 'static is sound.
		info.cmdline = Some(unsafe { core::mem::transmute::<&str, &'static str>(cmdline) });
	}

	if let Some(mmap) = boot_info.memory_map_tag() {
		for area in mmap.memory_areas() {
			let kind = match area.typ() {
				multiboot2::MemoryAreaType::Available => MemoryRegionKind::Available,
				multiboot2::MemoryAreaType::AcpiAvailable => MemoryRegionKind::Acpi,
				multiboot2::MemoryAreaType::ReservedHibernate => MemoryRegionKind::Nvs,
				_ => MemoryRegionKind::Reserved,
			};
			let entry = MemoryMapEntry {
				base: area.start_address(),
				length: area.size(),
				kind,
			};
			if kind == MemoryRegionKind::Available {
				info.mem_size = info.mem_size.max(entry.base + entry.length);
			}
			info.push_mmap_entry(entry);
		}
	}

	if let Some(Ok(fb)) = boot_info.framebuffer_tag() {
		info.framebuffer = Some(FramebufferInfo {
			addr: fb.address(),
			pitch: fb.pitch(),
			width: fb.width(),
			height: fb.height(),
			bpp: fb.bpp(),
			kind: 0,
		});
	}

	info
}

static BOOT_INFO: OnceCell<BootInfo> = OnceCell::new();

/// Installs the boot-info block. Must be called exactly once, before any
/// other subsystem reads it.
pub fn init(info: BootInfo) {
	BOOT_INFO
		.set(info)
		.unwrap_or_else(|_| panic!("boot_info::init called twice"));
}

pub fn get() -> &'static BootInfo {
	BOOT_INFO
		.get()
		.expect("boot_info::get called before boot_info::init")
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn mmap_push_and_iterate() {
		let mut info = BootInfo::empty();
		info.push_mmap_entry(MemoryMapEntry {
			base: 0,
			length: 0x9FC00,
			kind: MemoryRegionKind::Available,
		});
		info.push_mmap_entry(MemoryMapEntry {
			base: 0x10_0000,
			length: 0x7FE_0000,
			kind: MemoryRegionKind::Available,
		});
		assert_eq!(info.mmap_count, 2);
		assert_eq!(info.mmap().count(), 2);
	}

	#[test]
	fn ap_enable_flag() {
		let info = BootInfo::empty();
		assert!(!info.application_processors_enabled());
		info.enable_application_processors();
		assert!(info.application_processors_enabled());
	}
}
