//! Low-level context switch (spec.md §4.7, §9 "Cooperative suspension").
//!
//! A context switch is a single callee-saved-register-exchange plus RIP
//! swap; no stack unwinding is involved. `prepare_stack` writes the
//! two-stage entry frame a freshly created thread needs: an interrupt-return
//! frame for the entry function at the very top of the stack, and below it a
//! switch frame whose saved RIP is `thread_trampoline`. The first switch
//! into the thread pops the switch frame like any other, falls into the
//! trampoline, which releases the creator's CPU lock and then `iretq`s into
//! the entry function.

use core::arch::naked_asm;

use crate::arch::x86_64::kernel::gdt;

const CALLEE_SAVED_REGS: usize = 6;
const IRET_FRAME_QWORDS: usize = 5;

/// Builds the initial stack for a new thread and returns the stack pointer
/// the first context switch should load.
///
/// # Safety
/// `stack_top` must point one-past-the-end of a stack allocation at least
/// `(CALLEE_SAVED_REGS + 1 + IRET_FRAME_QWORDS) * 8` bytes long.
pub unsafe fn prepare_stack(stack_top: usize, entry: extern "C" fn() -> !) -> usize {
	unsafe {
		let iret_frame_base = stack_top - IRET_FRAME_QWORDS * 8;
		let iret: *mut u64 = iret_frame_base as *mut u64;
		// Order matches what `iretq` pops: RIP, CS, RFLAGS, RSP, SS.
		iret.add(0).write(entry as usize as u64);
		iret.add(1).write(u64::from(gdt::kernel_code_selector().0));
		iret.add(2).write(0x202); // IF set, reserved bit 1 set
		iret.add(3).write(stack_top as u64);
		iret.add(4).write(u64::from(gdt::kernel_data_selector().0));

		let switch_frame_base = iret_frame_base - (CALLEE_SAVED_REGS + 1) * 8;
		let frame: *mut u64 = switch_frame_base as *mut u64;
		// Order matches the pop sequence in `switch_to`: r15, r14, r13, r12, rbx, rbp.
		frame.add(0).write(0); // r15
		frame.add(1).write(0); // r14
		frame.add(2).write(0); // r13
		frame.add(3).write(0); // r12
		frame.add(4).write(0); // rbx
		frame.add(5).write(0); // rbp
		frame.add(6).write(thread_trampoline as usize as u64);

		switch_frame_base
	}
}

/// Saves the current thread's callee-saved registers and RSP into
/// `*old_sp`, then restores `new_sp`'s registers and resumes there.
///
/// The caller must hold the owning CPU's descriptor lock and be at high IPL
/// (spec.md §4.7): the switch itself does not touch interrupt state.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_to(old_sp: *mut usize, new_sp: usize) {
	naked_asm!(
		"push rbp",
		"push rbx",
		"push r12",
		"push r13",
		"push r14",
		"push r15",
		"mov [rdi], rsp",
		"mov rsp, rsi",
		"pop r15",
		"pop r14",
		"pop r13",
		"pop r12",
		"pop rbx",
		"pop rbp",
		"ret",
	);
}

/// Entry gate for every thread's first run (spec.md §4.7 "thread_start").
/// Releases the target-CPU lock the creator held while inserting this
/// thread into the run queue, then falls into the interrupt-return
/// trampoline baked into the stack by `prepare_stack`.
#[unsafe(naked)]
extern "C" fn thread_trampoline() -> ! {
	naked_asm!("call {start}", "iretq", start = sym thread_start_prologue);
}

extern "C" fn thread_start_prologue() {
	crate::scheduler::release_after_first_switch();
}
