//! Binary entry point.
//!
//! The real entry symbol is `_start`, a naked function defined in
//! `kernel::arch::x86_64::kernel::start` and pulled into the final link by
//! the linker script's `ENTRY(_start)`. This crate only needs to exist so
//! Cargo has a binary target to produce the kernel image from; all logic
//! lives in the `kernel` library crate, including the panic handler and
//! global allocator.

#![no_std]
#![no_main]
