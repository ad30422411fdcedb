//! Compile-time constants shared across the kernel.

/// Granularity of the big-page allocator (§4.2).
pub const BIG_PAGE_SIZE: usize = 0x20_0000;
pub const BIG_PAGE_SHIFT: u32 = 21;

/// Granularity of a small page inside a re-described big page.
pub const SMALL_PAGE_SIZE: usize = 0x1000;
pub const SMALL_PAGE_SHIFT: u32 = 12;

/// Number of 4 KiB slots in one re-described 2 MiB frame.
pub const SMALL_PAGES_PER_BIG_PAGE: usize = BIG_PAGE_SIZE / SMALL_PAGE_SIZE;

/// Default stack size handed to `scheduler::spawn` when the caller doesn't
/// need anything unusual; rounded up to the slab chunk size at creation time.
pub const KERNEL_STACK_SIZE: usize = 0x8000;

/// Backing-slab size used by the size-classed general allocator (§4.4).
pub const ALLOCATOR_SLAB_SIZE: usize = 0x4000;

/// Chunk sizes served by the size-classed general allocator.
pub const ALLOCATOR_SIZE_CLASSES: [usize; 6] = [16, 32, 64, 128, 256, 512];

/// Default static thread priority (§4.8).
pub const DEFAULT_PRIORITY: u8 = 8;

/// Number of IST stacks reserved in the GDT/TSS (double fault, NMI, + 2 spare).
pub const IST_ENTRIES: usize = 4;

/// How many times the bring-up sequence polls `num_cpus` before giving up on
/// an AP that never checked in. spec.md leaves this retry bound unspecified.
pub const AP_BRINGUP_POLL_ITERATIONS: usize = 200_000;
