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

//! The runtime side of the guest interface.
//!
//! `GuestContext` is what a guest entry function sees as `&mut dyn
//! GuestApi`. Everything here executes on the sandbox's own stack; the
//! cooperative suspension points (blocking read, yield) disable interrupts,
//! update the sandbox state, and stack-switch back to the worker loop.
//!
//! `sandbox_start` is the first-entry trampoline planted in every fresh
//! sandbox context.

use std::io;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};

use ember::GuestApi;

use crate::context;
use crate::error::SandboxFault;
use crate::interrupt;
use crate::sandbox::{Sandbox, SandboxState};
use crate::worker;

pub struct GuestContext<'a> {
    sandbox: &'a mut Sandbox,
}

impl<'a> GuestContext<'a> {
    pub(crate) fn new(sandbox: &'a mut Sandbox) -> GuestContext<'a> {
        GuestContext { sandbox }
    }

    /// Parks the sandbox on `fd` and hands the processor back to the worker
    /// loop. Returns once the descriptor signalled readiness and the worker
    /// dispatched this sandbox again.
    fn block_on(&mut self, fd: RawFd) {
        interrupt::disable();
        self.sandbox.blocked_fd = Some(fd);
        self.sandbox
            .transition(SandboxState::Running, SandboxState::Blocked);
        unsafe {
            context::switch(&mut self.sandbox.context, worker::scheduler_context());
        }
        // Back in RUNNING with interrupts enabled; retry the descriptor.
    }
}

impl GuestApi for GuestContext<'_> {
    fn payload(&self) -> &[u8] {
        &self.sandbox.request.payload
    }

    fn memory(&mut self) -> &mut [u8] {
        &mut self.sandbox.memory
    }

    fn respond(&mut self, data: &[u8]) {
        self.sandbox.response.extend_from_slice(data);
    }

    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => self.block_on(fd),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }

    fn yield_now(&mut self) {
        interrupt::disable();
        self.sandbox
            .transition(SandboxState::Running, SandboxState::Runnable);
        unsafe {
            context::switch(&mut self.sandbox.context, worker::scheduler_context());
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "guest panicked".to_string()
}

/// First-entry point of every sandbox context.
///
/// Runs the module's guest entry on the sandbox stack, then transitions the
/// sandbox to its terminal state and switches back to the worker loop. A
/// guest unwind is caught here and becomes a trap fault; it must not cross
/// the context-switch boundary.
pub extern "C" fn sandbox_start() {
    let sandbox_ptr = worker::current_sandbox();
    assert!(!sandbox_ptr.is_null(), "sandbox trampoline without a current sandbox");

    let result = {
        let sandbox = unsafe { &mut *sandbox_ptr };
        let entry = sandbox.request.module.entry();
        catch_unwind(AssertUnwindSafe(|| {
            let mut guest = GuestContext::new(sandbox);
            entry(&mut guest);
        }))
    };

    let sandbox = unsafe { &mut *sandbox_ptr };
    interrupt::disable();
    match result {
        Ok(()) => {
            sandbox.transition(SandboxState::Running, SandboxState::Returned);
        }
        Err(payload) => {
            sandbox.fail(SandboxFault::GuestTrap(panic_message(payload)));
        }
    }
    unsafe {
        context::switch(&mut sandbox.context, worker::scheduler_context());
    }
    unreachable!("terminated sandbox was resumed");
}
