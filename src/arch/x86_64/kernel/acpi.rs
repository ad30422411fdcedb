//! RSDP discovery and MADT parsing (spec.md §4.6 steps 1-2).
//!
//! Firmware tables are read by raw pointer after mapping the page that
//! backs them into the boot page tables (spec.md §4.3: "Map the table
//! physical address into boot page tables before dereferencing"). Only the
//! fields the bring-up sequence needs are kept: CPU APIC ids, I/O-APIC base
//! and GSI base, and legacy IRQ → GSI overrides. ACPI power management
//! (`_S5_`, PM1A_CNT_BLK) is out of scope — nothing in spec.md names it.

use alloc::vec::Vec;

use crate::arch::x86_64::mm::paging;
use crate::config::BIG_PAGE_SIZE;

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const MADT_SIGNATURE: &[u8; 4] = b"APIC";

const BIOS_SCAN_START: usize = 0xE0000;
const BIOS_SCAN_END: usize = 0xFFFFF;

#[derive(Debug, Clone, Copy)]
pub struct IoApicInfo {
	pub base: u32,
	pub gsi_base: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct InterruptOverride {
	pub bus: u8,
	pub source_irq: u8,
	pub gsi: u32,
}

/// Everything the bring-up sequence needs out of the MADT.
#[derive(Debug, Default)]
pub struct MadtInfo {
	pub local_apic_address: u32,
	pub cpu_apic_ids: Vec<u32>,
	pub io_apics: Vec<IoApicInfo>,
	pub overrides: Vec<InterruptOverride>,
}

fn map_for_read(phys: usize, len: usize) {
	paging::map_range(phys, phys, len.max(1));
}

unsafe fn read_bytes(addr: usize, len: usize) -> &'static [u8] {
	map_for_read(addr, len);
	unsafe { core::slice::from_raw_parts(addr as *const u8, len) }
}

fn checksum_ok(bytes: &[u8]) -> bool {
	bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
}

/// Scans the legacy BIOS region on 16-byte boundaries for the RSDP
/// signature and verifies its checksum (spec.md §4.6 step 1).
fn find_rsdp() -> Option<usize> {
	map_for_read(BIOS_SCAN_START, BIOS_SCAN_END - BIOS_SCAN_START);
	let mut addr = BIOS_SCAN_START;
	while addr + 20 <= BIOS_SCAN_END {
		let header = unsafe { read_bytes(addr, 8) };
		if header == RSDP_SIGNATURE {
			let v1 = unsafe { read_bytes(addr, 20) };
			if checksum_ok(v1) {
				return Some(addr);
			}
		}
		addr += 16;
	}
	None
}

/// Returns the physical address of the root SDT (RSDT or XSDT) and its
/// entry width in bytes (4 for RSDT, 8 for XSDT), preferring XSDT on
/// ACPI >= 2.0 once its extended checksum verifies.
fn root_sdt(rsdp_addr: usize) -> Option<(usize, usize)> {
	let revision = unsafe { read_bytes(rsdp_addr, 20) }[15];
	if revision >= 2 {
		let v2 = unsafe { read_bytes(rsdp_addr, 36) };
		if checksum_ok(v2) {
			let xsdt_address = u64::from_le_bytes(v2[24..32].try_into().unwrap());
			return Some((xsdt_address as usize, 8));
		}
		log::warn!("acpi: extended checksum failed, falling back to RSDT");
	}
	let v1 = unsafe { read_bytes(rsdp_addr, 20) };
	let rsdt_address = u32::from_le_bytes(v1[16..20].try_into().unwrap());
	Some((rsdt_address as usize, 4))
}

struct SdtHeader {
	signature: [u8; 4],
	length: u32,
}

fn read_sdt_header(addr: usize) -> SdtHeader {
	let bytes = unsafe { read_bytes(addr, 36) };
	SdtHeader {
		signature: bytes[0..4].try_into().unwrap(),
		length: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
	}
}

/// Iterates the root SDT's entries looking for the MADT ("APIC" signature),
/// then its variable-length sub-entries (spec.md §4.6 step 2).
fn parse_madt(root_addr: usize, entry_width: usize) -> Option<MadtInfo> {
	let root_header = read_sdt_header(root_addr);
	let root_bytes = unsafe { read_bytes(root_addr, root_header.length as usize) };
	let entries = &root_bytes[36..];

	for chunk in entries.chunks_exact(entry_width) {
		let sdt_addr = if entry_width == 8 {
			u64::from_le_bytes(chunk.try_into().unwrap()) as usize
		} else {
			u32::from_le_bytes(chunk.try_into().unwrap()) as usize
		};

		let header = read_sdt_header(sdt_addr);
		if header.signature != *MADT_SIGNATURE {
			continue;
		}

		let body = unsafe { read_bytes(sdt_addr, header.length as usize) };
		let local_apic_address = u32::from_le_bytes(body[36..40].try_into().unwrap());

		let mut info = MadtInfo {
			local_apic_address,
			..MadtInfo::default()
		};

		let mut cursor = 44; // past header(36) + local_apic_address(4) + flags(4)
		while cursor + 2 <= body.len() {
			let entry_type = body[cursor];
			let entry_len = body[cursor + 1] as usize;
			if entry_len < 2 || cursor + entry_len > body.len() {
				break;
			}
			let entry = &body[cursor..cursor + entry_len];

			match entry_type {
				0 if entry.len() >= 8 => {
					// Processor Local APIC: [type, len, acpi_id, apic_id, flags(4)]
					let flags = u32::from_le_bytes(entry[4..8].try_into().unwrap());
					let enabled = flags & 0x1 != 0;
					if enabled {
						info.cpu_apic_ids.push(u32::from(entry[3]));
					}
				}
				1 if entry.len() >= 12 => {
					// I/O APIC: [type, len, io_apic_id, reserved, address(4), gsi_base(4)]
					let base = u32::from_le_bytes(entry[4..8].try_into().unwrap());
					let gsi_base = u32::from_le_bytes(entry[8..12].try_into().unwrap());
					info.io_apics.push(IoApicInfo { base, gsi_base });
				}
				2 if entry.len() >= 10 => {
					// Interrupt Source Override: [type, len, bus, source, gsi(4), flags(2)]
					info.overrides.push(InterruptOverride {
						bus: entry[2],
						source_irq: entry[3],
						gsi: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
					});
				}
				_ => {}
			}

			cursor += entry_len;
		}

		return Some(info);
	}

	None
}

/// Finds the RSDP, locates the MADT and returns its contents, or `None` if
/// any firmware table is missing or fails its checksum (spec.md §4.6
/// "hardware/firmware errors": "the kernel continues with degraded
/// functionality (e.g., no SMP, only BSP active)").
pub fn discover() -> Option<MadtInfo> {
	map_for_read(0, BIG_PAGE_SIZE);
	let rsdp_addr = find_rsdp()?;
	let (root_addr, entry_width) = root_sdt(rsdp_addr)?;
	parse_madt(root_addr, entry_width)
}
