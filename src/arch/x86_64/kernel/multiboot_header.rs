//! The Multiboot2 header GRUB (or any Multiboot2-compliant loader) scans for
//! in the first 32 KiB of the image (spec.md §6 "Firmware tables consumed":
//! "Multiboot2 tag stream"). Placed in its own linker-script section so
//! `linker.ld` can put it immediately after the 1 MiB load address, well
//! inside that window; `_start` (spec.md §4.6: the boot stubs that "map
//! high-half kernel") receives the magic/info-pointer handoff this header's
//! presence is what causes the loader to perform in the first place.
//!
//! No optional tags are requested: the kernel reads the info struct's
//! `memory_map`/`framebuffer`/`cmdline` tags (see `boot_info.rs`) if the
//! loader includes them unasked, rather than demanding any of them.

use core::arch::global_asm;

global_asm!(
	r#"
.section .multiboot_header, "a"
.align 8
multiboot_header_start:
	.long 0xe85250d6            // magic
	.long 0                      // architecture: i386/protected-mode
	.long multiboot_header_end - multiboot_header_start
	.long -(0xe85250d6 + 0 + (multiboot_header_end - multiboot_header_start))

	// end tag
	.align 8
	.word 0
	.word 0
	.long 8
multiboot_header_end:
"#
);
