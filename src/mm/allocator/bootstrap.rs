//! Static slack memory that lets the general allocator serve its first
//! requests before the page database exists (spec.md §4.4 "Reserve-on-
//! slack").

use core::mem::MaybeUninit;

use hermit_sync::ExclusiveCell;

/// One 2 MiB arena, aligned so it can stand in for a big page. The root
/// slab list carves its very first backing slab out of this instead of
/// calling into a page database that doesn't exist yet.
#[repr(align(0x200000))]
struct SlackArena([MaybeUninit<u8>; 0x20_0000]);

static SLACK: ExclusiveCell<SlackArena> =
	ExclusiveCell::new(SlackArena([MaybeUninit::uninit(); 0x20_0000]));

/// Hands out the slack arena's base address. Can only be called once; a
/// second call means something tried to bootstrap the allocator twice.
pub fn take_slack_base() -> usize {
	let arena: &'static mut SlackArena = SLACK.take().expect("slack arena already taken");
	arena as *mut SlackArena as usize
}
