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

//! Worker threads.
//!
//! Each worker is an independent user-mode scheduler pinned to its own core.
//! It owns a run-queue of runnable sandboxes, an arena with every live
//! sandbox it admitted, and an epoll multiplexer for the descriptors its
//! blocked sandboxes wait on. The loop pulls admissions when idle, dispatches
//! through a stack switch, and services preemptive returns driven by the
//! per-thread timer signal.
//!
//! Interrupt-flag convention: the scheduler side of every context switch
//! runs with interrupts disabled. `dispatch` enables immediately before
//! switching into a sandbox; every path back (block, yield, exit trampoline,
//! preemption handler) disables before switching out. Idle iterations open
//! an explicit enable/yield/disable window so deferred signals drain.

use std::cell::Cell;
use std::os::fd::BorrowedFd;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, trace, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::Signal;

use ember::cycles::{self, CycleCounter};

use crate::admission::{SandboxRequest, SandboxResponse};
use crate::context::{self, Registers};
use crate::error::SandboxFault;
use crate::guest;
use crate::interrupt;
use crate::priority_queue::PriorityQueue;
use crate::runtime::Runtime;
use crate::sandbox::{Sandbox, SandboxId, SandboxState, SandboxTable};

/// Cap on sandboxes a single worker keeps alive at once; also sizes the
/// run-queue, so reinsertion can never fail.
const MAX_LIVE_SANDBOXES: usize = 1_024;

const MAX_IO_EVENTS: usize = 32;

thread_local! {
    /// The sandbox whose context is live on this thread, or null while the
    /// worker loop itself runs. Read by the SIGALRM handler.
    static CURRENT_SANDBOX: Cell<*mut Sandbox> = const { Cell::new(ptr::null_mut()) };

    /// Where suspending sandboxes and the preemption handler switch back to.
    static SCHEDULER_CONTEXT: Cell<*mut Registers> = const { Cell::new(ptr::null_mut()) };
}

/// The sandbox currently executing on this thread, if any.
#[inline]
pub(crate) fn current_sandbox() -> *mut Sandbox {
    CURRENT_SANDBOX.get()
}

/// The worker-loop context of this thread. Valid whenever a sandbox runs.
#[inline]
pub(crate) fn scheduler_context() -> *const Registers {
    SCHEDULER_CONTEXT.get()
}

/// Preemptive switch attempted by the SIGALRM handler.
///
/// Stands down unless a sandbox is RUNNING right now and has consumed at
/// least one full quantum since its last resume. The quantum check also
/// closes the dispatch race: a signal landing between interrupt-enable and
/// the switch into the sandbox sees a just-stamped resume time and declines.
///
/// Signal-safe: touches only thread-locals, the sandbox's atomics, and its
/// saved-context area.
pub(crate) fn preempt_current(quantum_cycles: u64) {
    if quantum_cycles == 0 {
        return;
    }
    let sandbox_ptr = CURRENT_SANDBOX.get();
    if sandbox_ptr.is_null() {
        return;
    }
    let sandbox = unsafe { &mut *sandbox_ptr };
    if cycles::now().saturating_sub(sandbox.timing.last_resume) < quantum_cycles {
        return;
    }
    if !sandbox.try_transition(SandboxState::Running, SandboxState::Runnable) {
        return;
    }
    sandbox.preemptions.fetch_add(1, Ordering::Relaxed);
    interrupt::disable();
    unsafe {
        context::switch(&mut sandbox.context, SCHEDULER_CONTEXT.get());
    }
    // Resumed by a later dispatch: fall out of the handler and sigreturn
    // into the interrupted guest code.
}

/// An entry on a worker's run-queue: the policy key plus the id of a
/// RUNNABLE sandbox in that worker's table.
struct RunQueueEntry {
    key: u64,
    id: SandboxId,
}

fn run_queue_key(entry: &RunQueueEntry) -> u64 {
    entry.key
}

pub struct WorkerThread {
    idx: usize,
    runtime: Arc<Runtime>,
    table: SandboxTable,
    run_queue: PriorityQueue<RunQueueEntry>,
    epoll: Epoll,
    scheduler_context: Registers,
    dispatch_cycles: CycleCounter,
}

/// Body of every worker thread. Spawned by the runtime with SIGALRM and
/// SIGUSR1 masked; unmasks them only once its own state is ready.
pub fn worker_main(runtime: Arc<Runtime>, idx: usize) {
    if runtime.config().pin_threads {
        crate::runtime::pin_current_thread(1 + idx);
    }
    interrupt::set_worker_identity(idx, runtime.config().quantum_cycles);
    runtime.register_worker_thread(idx, nix::sys::pthread::pthread_self());

    let epoll = Epoll::new(EpollCreateFlags::empty()).expect("creating worker epoll instance");
    let mut worker = Box::new(WorkerThread {
        idx,
        runtime: runtime.clone(),
        table: SandboxTable::new(),
        run_queue: PriorityQueue::new(MAX_LIVE_SANDBOXES, run_queue_key),
        epoll,
        scheduler_context: Registers::default(),
        dispatch_cycles: CycleCounter::new("worker dispatch", 100_000),
    });
    SCHEDULER_CONTEXT.set(&mut worker.scheduler_context);

    // Scheduler protected mode: from here until shutdown the loop runs with
    // interrupts disabled except inside dispatch and the idle window.
    interrupt::disable();
    interrupt::arm_timer(runtime.config().interval_usec);
    interrupt::unmask(Signal::SIGALRM);
    interrupt::unmask(Signal::SIGUSR1);
    debug!("worker {}: entering scheduler loop", idx);

    worker.run();

    interrupt::disarm_timer();
    interrupt::mask(Signal::SIGALRM);
    interrupt::mask(Signal::SIGUSR1);
    interrupt::enable();
    SCHEDULER_CONTEXT.set(ptr::null_mut());
    debug!("worker {}: stopped", idx);
}

impl WorkerThread {
    fn run(&mut self) {
        while !self.runtime.is_shutdown() {
            self.process_io();
            match self.next_sandbox() {
                Some(id) => self.dispatch(id),
                None => {
                    // Nothing runnable. Open the interrupt window so any
                    // deferred ticks drain, and give the core away briefly.
                    interrupt::enable();
                    std::thread::yield_now();
                    interrupt::disable();
                }
            }
        }
        self.drain_on_shutdown();
    }

    /// Polls the multiplexer without blocking and returns every ready
    /// sandbox to the run-queue (or evicts it if its deadline passed while
    /// it was parked).
    fn process_io(&mut self) {
        interrupt::take_wake_pending();
        let mut events = [EpollEvent::empty(); MAX_IO_EVENTS];
        let ready = match self.epoll.wait(&mut events, EpollTimeout::from(0u16)) {
            Ok(count) => count,
            Err(nix::errno::Errno::EINTR) => return,
            Err(err) => {
                warn!("worker {}: epoll wait: {}", self.idx, err);
                return;
            }
        };
        for event in &events[..ready] {
            let id = SandboxId(event.data() as u32);
            let Some(sandbox) = self.table.get_mut(id) else {
                continue;
            };
            if sandbox.state() != SandboxState::Blocked {
                continue;
            }
            sandbox.transition(SandboxState::Blocked, SandboxState::Runnable);
            sandbox.blocked_fd = None;
            let expired = cycles::now() > sandbox.request.absolute_deadline;
            let key = self.runtime.admission().key_for(&sandbox.request);
            if expired {
                self.evict(id);
            } else {
                self.run_queue
                    .enqueue(RunQueueEntry { key, id })
                    .unwrap_or_else(|_| panic!("run queue sized below the sandbox table"));
            }
        }
    }

    /// Picks the next sandbox to run: best of the local run-queue, else one
    /// admission pulled from the global scheduler.
    fn next_sandbox(&mut self) -> Option<SandboxId> {
        if let Some(entry) = self.run_queue.dequeue() {
            return Some(entry.id);
        }
        if self.table.len() >= MAX_LIVE_SANDBOXES {
            return None;
        }
        let request = self.runtime.admission().remove()?;
        self.admit(request)
    }

    /// Turns an admitted request into a RUNNABLE sandbox on the run-queue.
    fn admit(&mut self, request: Box<SandboxRequest>) -> Option<SandboxId> {
        let key = self.runtime.admission().key_for(&request);
        match Sandbox::allocate(request) {
            Ok(mut sandbox) => {
                sandbox.initialize(guest::sandbox_start);
                let id = self.table.insert(sandbox);
                let sandbox = self.table.get_mut(id).expect("freshly inserted sandbox");
                sandbox.transition(SandboxState::Initialized, SandboxState::Runnable);
                trace!(
                    "worker {}: admitted request {} as sandbox {:?}",
                    self.idx,
                    sandbox.request.id,
                    id
                );
                self.run_queue
                    .enqueue(RunQueueEntry { key, id })
                    .unwrap_or_else(|_| panic!("run queue sized below the sandbox table"));
                Some(id)
            }
            Err((fault, request)) => {
                warn!(
                    "worker {}: request {} failed allocation",
                    self.idx, request.id
                );
                respond_without_sandbox(request, fault);
                None
            }
        }
    }

    /// Runs one sandbox until it comes back: cooperatively (block, yield,
    /// exit) or preemptively (timer signal).
    fn dispatch(&mut self, id: SandboxId) {
        let now = cycles::now();
        let Some(sandbox_ptr) = self.table.ptr(id) else {
            return;
        };
        unsafe {
            let sandbox = &mut *sandbox_ptr;
            if now > sandbox.request.absolute_deadline {
                self.evict(id);
                return;
            }
            sandbox.transition(SandboxState::Runnable, SandboxState::Running);
            if sandbox.timing.first_run == 0 {
                sandbox.timing.first_run = now;
            }
            sandbox.timing.last_resume = now;
            CURRENT_SANDBOX.set(sandbox_ptr);

            self.dispatch_cycles.start();
            interrupt::enable();
            context::switch(&mut self.scheduler_context, &sandbox.context);
            // Back on the scheduler stack; whoever switched here disabled
            // interrupts first.
            CURRENT_SANDBOX.set(ptr::null_mut());
            self.dispatch_cycles.stop();

            let sandbox = &mut *sandbox_ptr;
            sandbox.timing.total_run += cycles::now().saturating_sub(sandbox.timing.last_resume);
            match sandbox.state() {
                SandboxState::Runnable => {
                    // Preempted or yielded; back of the line by policy key.
                    let key = self.runtime.admission().key_for(&sandbox.request);
                    self.run_queue
                        .enqueue(RunQueueEntry { key, id })
                        .unwrap_or_else(|_| panic!("run queue sized below the sandbox table"));
                }
                SandboxState::Blocked => self.park_blocked(id),
                SandboxState::Returned | SandboxState::Error => self.finish(id),
                state => panic!(
                    "sandbox {:?} returned to the scheduler in state {:?}",
                    id, state
                ),
            }
        }
    }

    /// Registers a freshly blocked sandbox's descriptor with the
    /// multiplexer. The sandbox stays out of the run-queue until readiness.
    fn park_blocked(&mut self, id: SandboxId) {
        let sandbox = self.table.get_mut(id).expect("blocked sandbox in table");
        let fd = sandbox.blocked_fd.expect("blocked sandbox without a descriptor");
        let mut event = EpollEvent::new(
            EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT,
            u64::from(id.0),
        );
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let outcome = match sandbox.registered_fd {
            // EPOLLONESHOT leaves the registration in place after a wakeup;
            // re-arm instead of re-adding.
            Some(known) if known == fd => self.epoll.modify(borrowed, &mut event),
            Some(stale) => {
                let _ = self
                    .epoll
                    .delete(unsafe { BorrowedFd::borrow_raw(stale) });
                self.epoll.add(borrowed, event)
            }
            None => self.epoll.add(borrowed, event),
        };
        match outcome {
            Ok(()) => {
                sandbox.registered_fd = Some(fd);
                trace!("worker {}: sandbox {:?} blocked on fd {}", self.idx, id, fd);
            }
            Err(err) => {
                sandbox.fail(SandboxFault::GuestTrap(format!(
                    "registering descriptor {}: {}",
                    fd, err
                )));
                self.finish(id);
            }
        }
    }

    /// Deadline passed while the sandbox was RUNNABLE: out of the schedule,
    /// terminal error, requester notified.
    fn evict(&mut self, id: SandboxId) {
        if let Some(sandbox) = self.table.get_mut(id) {
            debug!(
                "worker {}: sandbox {:?} missed its deadline, evicting",
                self.idx, id
            );
            sandbox.fail(SandboxFault::DeadlineMissed);
            self.finish(id);
        }
    }

    /// Terminal cleanup: deliver the response, then free memory, stack, and
    /// request by dropping the sandbox.
    fn finish(&mut self, id: SandboxId) {
        let Some(boxed) = self.table.remove(id) else {
            return;
        };
        let mut sandbox = *boxed;
        if let Some(fd) = sandbox.registered_fd.take() {
            let _ = self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) });
        }
        sandbox.timing.completed = cycles::now();

        let status = match sandbox.state() {
            SandboxState::Returned => Ok(()),
            SandboxState::Error => Err(sandbox
                .fault
                .take()
                .unwrap_or_else(|| SandboxFault::GuestTrap("unrecorded fault".to_string()))),
            state => panic!("finishing sandbox {:?} in live state {:?}", id, state),
        };
        trace!(
            "worker {}: sandbox {:?} finished after {} cycles ({} preemptions)",
            self.idx,
            id,
            sandbox.timing.total_run,
            sandbox.preemption_count()
        );

        let total_run_cycles = sandbox.timing.total_run;
        let preemptions = sandbox.preemption_count();
        let body = sandbox.response;
        let request = *sandbox.request;
        let response = SandboxResponse {
            request_id: request.id,
            module: request.module.name().to_string(),
            status,
            body,
            total_run_cycles,
            preemptions,
        };
        request.sink.deliver(response);
    }

    fn drain_on_shutdown(&mut self) {
        let leftover = self.table.drain();
        if !leftover.is_empty() {
            debug!(
                "worker {}: dropping {} in-flight sandboxes on shutdown",
                self.idx,
                leftover.len()
            );
        }
    }
}

/// Answers a request that never became a sandbox.
fn respond_without_sandbox(request: Box<SandboxRequest>, fault: SandboxFault) {
    let request = *request;
    let response = SandboxResponse {
        request_id: request.id,
        module: request.module.name().to_string(),
        status: Err(fault),
        body: Vec::new(),
        total_run_cycles: 0,
        preemptions: 0,
    };
    request.sink.deliver(response);
}
