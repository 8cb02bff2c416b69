/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Low-level CPU primitives consumed by the synchronization and scheduling
//! layers.
//!
//! Everything below this module treats interrupt control and context
//! switching as opaque operations provided by the platform; boot, the
//! interrupt descriptor table and the page allocator live outside this
//! crate's scope and are not modelled here.
//!
//! None of the privileged instructions below may run under `#[cfg(test)]`:
//! unit tests execute as an ordinary host process, where `cli`/`sti` would
//! fault and a raw stack swap would corrupt the test harness. Every
//! primitive here therefore has a safe, inert fallback used both on
//! architectures it isn't implemented for and under `cfg(test)`.

use core::arch::asm;

/// Disables maskable interrupts on the current CPU.
#[inline(always)]
pub fn cli() {
	#[cfg(all(target_arch = "x86_64", not(test)))]
	unsafe {
		asm!("cli", options(nomem, nostack, preserves_flags));
	}
}

/// Enables maskable interrupts on the current CPU.
#[inline(always)]
pub fn sti() {
	#[cfg(all(target_arch = "x86_64", not(test)))]
	unsafe {
		asm!("sti", options(nomem, nostack, preserves_flags));
	}
}

/// Tells whether maskable interrupts are currently enabled on the current CPU.
#[inline(always)]
pub fn is_interrupt_enabled() -> bool {
	#[cfg(all(target_arch = "x86_64", not(test)))]
	{
		let flags: u64;
		unsafe {
			asm!("pushfq", "pop {}", out(reg) flags, options(nomem, preserves_flags));
		}
		flags & (1 << 9) != 0
	}
	#[cfg(not(all(target_arch = "x86_64", not(test))))]
	{
		true
	}
}

/// Halts the CPU until the next interrupt.
///
/// Used by the scheduler's idle path when no thread is runnable.
#[inline(always)]
pub fn hlt() {
	#[cfg(all(target_arch = "x86_64", not(test)))]
	unsafe {
		asm!("hlt", options(nomem, nostack, preserves_flags));
	}
}

/// Opaque handle to a thread's saved machine context.
///
/// The scheduler stores one of these per thread; the boot/memory subsystem
/// is responsible for allocating the kernel stack it points into.
pub type Context = usize;

/// Performs a raw context switch from `prev` to `next`, saving the current
/// stack pointer into `*prev` and loading `next`.
///
/// This is the one part of scheduling that genuinely needs architecture
/// support and cannot be exercised from host unit tests; callers only
/// invoke it from the real interrupt-tick path. Under `cfg(test)` this is a
/// no-op so the surrounding queue-manipulation logic can still be driven
/// end to end without ever landing on an invalid stack.
///
/// # Safety
///
/// `prev` and `next` must point to valid, live kernel stacks.
#[inline(always)]
pub unsafe fn switch_context(prev: *mut Context, next: Context) {
	#[cfg(all(target_arch = "x86_64", not(test)))]
	unsafe {
		asm!(
			"push rbp",
			"mov [{prev}], rsp",
			"mov rsp, {next}",
			"pop rbp",
			prev = in(reg) prev,
			next = in(reg) next,
		);
	}
	#[cfg(not(all(target_arch = "x86_64", not(test))))]
	{
		let _ = (prev, next);
	}
}

/// Points the TSS's kernel-mode stack pointer (`esp0`/`rsp0`) at `top`, so
/// that the next ring 3 -> ring 0 transition lands on the given thread's
/// kernel stack.
///
/// Stubbed: descriptor-table setup lives in the boot subsystem, out of
/// scope here.
pub fn set_tss_kernel_stack(_top: usize) {}

/// Invalidates the TLB entry for `_addr`.
///
/// Stubbed: paging lives in the out-of-scope memory subsystem.
pub fn invalidate_tlb(_addr: usize) {}
