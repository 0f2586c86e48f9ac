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

//! Sandboxes and their lifecycle.
//!
//! A sandbox is one isolated execution of a guest program: private linear
//! memory, its own stack, a saved register context, and timing accounting.
//! Its state tag is atomic because one transition — running back to runnable
//! — is performed by the SIGALRM handler under a compare-and-swap; every
//! other transition happens on the owning worker thread.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use ember::cycles;

use crate::admission::SandboxRequest;
use crate::context::{Registers, Stack};
use crate::error::SandboxFault;

/// Lifecycle states as the scheduler sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SandboxState {
    /// Memory and stack exist; context does not yet.
    Allocated = 0,
    /// Context prepared, not yet on a run-queue.
    Initialized = 1,
    /// Waiting on its worker's run-queue.
    Runnable = 2,
    /// Live on its worker's processor.
    Running = 3,
    /// Parked on an I/O descriptor.
    Blocked = 4,
    /// Guest entry returned; terminal.
    Returned = 5,
    /// Faulted; terminal. The cause is in `fault`.
    Error = 6,
}

impl SandboxState {
    fn from_u8(raw: u8) -> SandboxState {
        match raw {
            0 => SandboxState::Allocated,
            1 => SandboxState::Initialized,
            2 => SandboxState::Runnable,
            3 => SandboxState::Running,
            4 => SandboxState::Blocked,
            5 => SandboxState::Returned,
            6 => SandboxState::Error,
            _ => unreachable!("corrupt sandbox state {}", raw),
        }
    }

    /// Terminal states never transition again.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxState::Returned | SandboxState::Error)
    }
}

/// Cycle stamps over a sandbox's life.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timing {
    pub allocated: u64,
    pub first_run: u64,
    pub last_resume: u64,
    pub total_run: u64,
    pub completed: u64,
}

/// Identifies a sandbox within its worker's table. Queues and epoll carry
/// this id; the table owns the sandbox itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxId(pub u32);

pub struct Sandbox {
    pub id: SandboxId,
    pub request: Box<SandboxRequest>,
    state: AtomicU8,
    /// Private linear memory region.
    pub memory: Vec<u8>,
    pub stack: Stack,
    /// Saved register context; live only while not RUNNING.
    pub context: Registers,
    pub timing: Timing,
    /// Preemptive switches taken away from this sandbox.
    pub preemptions: AtomicU32,
    pub fault: Option<SandboxFault>,
    /// Accumulated by the guest through `respond()`.
    pub response: Vec<u8>,
    /// Descriptor the sandbox is blocked on, if any.
    pub blocked_fd: Option<RawFd>,
    /// Descriptor currently known to the worker's multiplexer.
    pub registered_fd: Option<RawFd>,
}

impl Sandbox {
    /// Allocates the memory and stack for one invocation.
    ///
    /// # Return
    ///
    /// The sandbox in the ALLOCATED state, or the request handed back with
    /// an out-of-memory fault so the caller can answer the requester.
    pub fn allocate(
        request: Box<SandboxRequest>,
    ) -> Result<Box<Sandbox>, (SandboxFault, Box<SandboxRequest>)> {
        let spec = &request.module.spec;

        let mut memory = Vec::new();
        if memory.try_reserve_exact(spec.memory_limit_bytes).is_err() {
            return Err((SandboxFault::OutOfMemory, request));
        }
        memory.resize(spec.memory_limit_bytes, 0);

        let Some(stack) = Stack::new(spec.stack_size_bytes) else {
            return Err((SandboxFault::OutOfMemory, request));
        };

        Ok(Box::new(Sandbox {
            id: SandboxId(u32::MAX),
            request,
            state: AtomicU8::new(SandboxState::Allocated as u8),
            memory,
            stack,
            context: Registers::default(),
            timing: Timing {
                allocated: cycles::now(),
                ..Timing::default()
            },
            preemptions: AtomicU32::new(0),
            fault: None,
            response: Vec::new(),
            blocked_fd: None,
            registered_fd: None,
        }))
    }

    /// Prepares the first-entry context. ALLOCATED → INITIALIZED.
    pub fn initialize(&mut self, entry: extern "C" fn()) {
        self.context = Registers::with_entry(&self.stack, entry);
        self.transition(SandboxState::Allocated, SandboxState::Initialized);
    }

    #[inline]
    pub fn state(&self) -> SandboxState {
        SandboxState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `from` → `to`, halting on a mismatch. For the worker-side
    /// transitions, where anything else is a scheduler bug.
    pub fn transition(&self, from: SandboxState, to: SandboxState) {
        if !self.try_transition(from, to) {
            panic!(
                "invalid sandbox state transition {:?} -> {:?} (currently {:?})",
                from,
                to,
                self.state()
            );
        }
    }

    /// Compare-and-swap transition. The signal handler uses this for
    /// RUNNING → RUNNABLE and simply stands down when it loses the race.
    #[inline]
    pub fn try_transition(&self, from: SandboxState, to: SandboxState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records a fault and forces the terminal ERROR state, from any state.
    pub fn fail(&mut self, fault: SandboxFault) {
        self.fault = Some(fault);
        self.state.store(SandboxState::Error as u8, Ordering::Release);
    }

    #[inline]
    pub fn preemption_count(&self) -> u32 {
        self.preemptions.load(Ordering::Relaxed)
    }
}

/// Per-worker arena owning every live sandbox of that worker. Slots are
/// reused through a free list; ids index into the slot vector.
#[derive(Default)]
pub struct SandboxTable {
    slots: Vec<Option<Box<Sandbox>>>,
    free: Vec<usize>,
    live: usize,
}

impl SandboxTable {
    pub fn new() -> SandboxTable {
        SandboxTable::default()
    }

    /// Takes ownership of `sandbox`, assigns its id, and returns it.
    pub fn insert(&mut self, mut sandbox: Box<Sandbox>) -> SandboxId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let id = SandboxId(slot as u32);
        sandbox.id = id;
        self.slots[slot] = Some(sandbox);
        self.live += 1;
        id
    }

    pub fn get(&self, id: SandboxId) -> Option<&Sandbox> {
        self.slots.get(id.0 as usize)?.as_deref()
    }

    pub fn get_mut(&mut self, id: SandboxId) -> Option<&mut Sandbox> {
        match self.slots.get_mut(id.0 as usize) {
            Some(slot) => slot.as_deref_mut(),
            None => None,
        }
    }

    /// Raw pointer to a sandbox, for the window where it is published to the
    /// signal handler. The box never moves while it is in the table.
    pub fn ptr(&mut self, id: SandboxId) -> Option<*mut Sandbox> {
        self.get_mut(id).map(|sandbox| sandbox as *mut Sandbox)
    }

    /// Removes and returns a sandbox; its slot becomes reusable.
    pub fn remove(&mut self, id: SandboxId) -> Option<Box<Sandbox>> {
        let slot = id.0 as usize;
        let sandbox = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        self.live -= 1;
        Some(sandbox)
    }

    /// Live sandboxes in the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Empties the table, returning whatever was still alive.
    pub fn drain(&mut self) -> Vec<Box<Sandbox>> {
        self.free.clear();
        self.live = 0;
        self.slots.drain(..).flatten().collect()
    }
}
