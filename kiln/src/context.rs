/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! Stack-swap context switching.
//!
//! A `Registers` block captures the callee-saved register file, the stack
//! pointer, the resume address, and the floating-point control state. One
//! assembly primitive saves the live context into one block and resumes
//! another; it serves cooperative switches, first entries through a
//! trampoline-prepared stack, and the preemptive switch out of the SIGALRM
//! handler (it performs no allocation and takes no locks, so it is safe to
//! run there).
//!
//! The convention mirrors a plain function call: the switch saves only what
//! the ABI requires a callee to preserve. A context resumed after preemption
//! continues inside the signal handler whose frame is still parked on the
//! sandbox stack; returning from the handler restores the caller-saved half
//! of the register file.

use std::alloc::{alloc, dealloc, Layout};
use std::arch::global_asm;

/// Saved execution state for one stack. The layout is part of the contract
/// with the assembly below; the `offset_of!` assertions pin it.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Registers {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
    mxcsr: u32,
    fcw: u16,
    _pad: u16,
}

#[cfg(target_arch = "x86_64")]
const _: () = {
    assert!(std::mem::offset_of!(Registers, rsp) == 0x00);
    assert!(std::mem::offset_of!(Registers, rbp) == 0x08);
    assert!(std::mem::offset_of!(Registers, rbx) == 0x10);
    assert!(std::mem::offset_of!(Registers, r12) == 0x18);
    assert!(std::mem::offset_of!(Registers, r13) == 0x20);
    assert!(std::mem::offset_of!(Registers, r14) == 0x28);
    assert!(std::mem::offset_of!(Registers, r15) == 0x30);
    assert!(std::mem::offset_of!(Registers, rip) == 0x38);
    assert!(std::mem::offset_of!(Registers, mxcsr) == 0x40);
    assert!(std::mem::offset_of!(Registers, fcw) == 0x44);
};

// Saves the callee-saved file plus stack pointer, resume address, and FP
// control words into the first argument, then resumes the second. The `pop`
// leaves the saved rsp pointing at the caller's frame, so a later resume
// lands exactly after the original call.
#[cfg(target_arch = "x86_64")]
global_asm!(
    r#"
    .globl kiln_context_switch
    kiln_context_switch:
        pop rax
        mov [rdi + 0x38], rax
        mov [rdi + 0x00], rsp
        mov [rdi + 0x08], rbp
        mov [rdi + 0x10], rbx
        mov [rdi + 0x18], r12
        mov [rdi + 0x20], r13
        mov [rdi + 0x28], r14
        mov [rdi + 0x30], r15
        stmxcsr [rdi + 0x40]
        fnstcw [rdi + 0x44]
        mov rsp, [rsi + 0x00]
        mov rbp, [rsi + 0x08]
        mov rbx, [rsi + 0x10]
        mov r12, [rsi + 0x18]
        mov r13, [rsi + 0x20]
        mov r14, [rsi + 0x28]
        mov r15, [rsi + 0x30]
        ldmxcsr [rsi + 0x40]
        fldcw [rsi + 0x44]
        mov rax, [rsi + 0x38]
        jmp rax
"#
);

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Registers {
    sp: u64,
    pc: u64,
    x: [u64; 10], // x19..x28
    fp: u64,      // x29
    d: [u64; 8],  // d8..d15
}

#[cfg(target_arch = "aarch64")]
const _: () = {
    assert!(std::mem::offset_of!(Registers, sp) == 0);
    assert!(std::mem::offset_of!(Registers, pc) == 8);
    assert!(std::mem::offset_of!(Registers, x) == 16);
    assert!(std::mem::offset_of!(Registers, fp) == 96);
    assert!(std::mem::offset_of!(Registers, d) == 104);
};

#[cfg(target_arch = "aarch64")]
global_asm!(
    r#"
    .globl kiln_context_switch
    kiln_context_switch:
        mov x9, sp
        str x9,  [x0, #0]
        str x30, [x0, #8]
        stp x19, x20, [x0, #16]
        stp x21, x22, [x0, #32]
        stp x23, x24, [x0, #48]
        stp x25, x26, [x0, #64]
        stp x27, x28, [x0, #80]
        str x29, [x0, #96]
        stp d8,  d9,  [x0, #104]
        stp d10, d11, [x0, #120]
        stp d12, d13, [x0, #136]
        stp d14, d15, [x0, #152]
        ldp d14, d15, [x1, #152]
        ldp d12, d13, [x1, #136]
        ldp d10, d11, [x1, #120]
        ldp d8,  d9,  [x1, #104]
        ldr x29, [x1, #96]
        ldp x27, x28, [x1, #80]
        ldp x25, x26, [x1, #64]
        ldp x23, x24, [x1, #48]
        ldp x21, x22, [x1, #32]
        ldp x19, x20, [x1, #16]
        ldr x9,  [x1, #0]
        mov sp, x9
        ldr x30, [x1, #8]
        ret
"#
);

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("context switching is implemented for x86_64 and aarch64 only");

extern "C" {
    fn kiln_context_switch(save: *mut Registers, load: *const Registers);
}

/// Saves the live context into `save` and resumes `load`.
///
/// Control comes back when some other context resumes `save`; by then `load`
/// may have been overwritten, which is why it is taken by raw pointer.
///
/// # Safety
///
/// `load` must hold a context prepared by [`Registers::with_entry`] or saved
/// by a previous switch, and its stack must still be alive. Both pointers
/// must stay valid for the duration of the switch.
#[inline]
pub unsafe fn switch(save: *mut Registers, load: *const Registers) {
    kiln_context_switch(save, load);
}

#[cfg(target_arch = "x86_64")]
const MXCSR_INIT: u32 = 0x1F80;
#[cfg(target_arch = "x86_64")]
const FCW_INIT: u16 = 0x037F;

impl Registers {
    /// Prepares a context that begins execution at `entry` on `stack`.
    ///
    /// `entry` must never return; first-entry frames have nothing to return
    /// into. Sandboxes route through a trampoline that switches away instead.
    #[cfg(target_arch = "x86_64")]
    pub fn with_entry(stack: &Stack, entry: extern "C" fn()) -> Registers {
        // The ABI expects rsp % 16 == 8 at function entry, as if a return
        // address had just been pushed. Plant a null one for backtraces.
        let top = stack.top();
        let rsp = unsafe {
            let slot = top.sub(8) as *mut u64;
            slot.write(0);
            slot as u64
        };
        Registers {
            rsp,
            rip: entry as usize as u64,
            mxcsr: MXCSR_INIT,
            fcw: FCW_INIT,
            ..Registers::default()
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn with_entry(stack: &Stack, entry: extern "C" fn()) -> Registers {
        Registers {
            sp: stack.top() as u64,
            pc: entry as usize as u64,
            ..Registers::default()
        }
    }
}

/// Smallest stack handed to a sandbox, regardless of module configuration.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

const STACK_ALIGN: usize = 16;

/// A heap-allocated execution stack, 16-byte aligned at both ends.
pub struct Stack {
    base: *mut u8,
    layout: Layout,
}

impl Stack {
    /// Allocates a stack of roughly `size` bytes (rounded to alignment,
    /// clamped to [`MIN_STACK_SIZE`]).
    ///
    /// # Return
    ///
    /// `None` when the allocator refuses, which the caller surfaces as a
    /// sandbox allocation fault rather than a crash.
    pub fn new(size: usize) -> Option<Stack> {
        let size = size.max(MIN_STACK_SIZE) & !(STACK_ALIGN - 1);
        let layout = Layout::from_size_align(size, STACK_ALIGN).ok()?;
        // TODO: mmap a PROT_NONE guard page below the stack.
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            return None;
        }
        Some(Stack { base, layout })
    }

    /// The highest address of the stack; stacks grow down from here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.layout.size()) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

// The stack is owned by exactly one sandbox, which is owned by exactly one
// worker; the raw base pointer does not make it any less movable between
// threads before first use.
unsafe impl Send for Stack {}
