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

//! The software-interrupt controller.
//!
//! Each worker thread owns an interval timer that fires SIGALRM at it (and
//! only at it) once per quantum. The handler either preempts the running
//! sandbox or, while a critical section holds interrupts disabled, counts
//! the signal as deferred. SIGUSR1 is the cross-thread wake: its handler
//! raises a flag the worker loop folds into its next I/O poll.
//!
//! All state here is thread-local except the `deferred_max` observability
//! array, which is indexed by worker and read by anyone. Disable/enable are
//! strict 0→1/1→0 transitions; re-entry is a programmer bug and halts the
//! process.

use std::cell::Cell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Once;

use log::{debug, info};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

use crate::worker;

/// Preemption interval. Fixed at build time; converted to a cycle quantum at
/// startup using the detected processor frequency.
pub const SOFTWARE_INTERRUPT_INTERVAL_USEC: u64 = 5_000;

/// Upper bound on workers, and the size of the `deferred_max` array.
pub const MAX_WORKER_COUNT: usize = 32;

thread_local! {
    /// Set while the owning thread is inside a critical section. The handler
    /// reads it; only the owning thread writes it, through a CAS so that a
    /// signal landing mid-update still observes a consistent value.
    static DISABLED: AtomicBool = const { AtomicBool::new(false) };

    /// Timer signals swallowed while `DISABLED` was set. Incremented in the
    /// handler, drained by `enable()` on the same thread.
    static DEFERRED: AtomicU32 = const { AtomicU32::new(0) };

    /// Raised by the SIGUSR1 handler, drained by the worker loop.
    static WAKE_PENDING: AtomicBool = const { AtomicBool::new(false) };

    /// This thread's slot in `DEFERRED_MAX`, or `usize::MAX` off-worker.
    static WORKER_IDX: Cell<usize> = const { Cell::new(usize::MAX) };

    /// Cycle quantum the handler compares run time against.
    static QUANTUM_CYCLES: Cell<u64> = const { Cell::new(0) };

    /// The armed POSIX timer, if any.
    static TIMER: Cell<libc::timer_t> = const { Cell::new(ptr::null_mut()) };
}

/// Largest deferred burst each worker has observed. Written by the owning
/// worker on enable, read by anyone for reporting.
static DEFERRED_MAX: [AtomicU32; MAX_WORKER_COUNT] =
    [const { AtomicU32::new(0) }; MAX_WORKER_COUNT];

/// Records which worker this thread is and the quantum its handler uses.
/// Must run before the timer is armed.
pub fn set_worker_identity(worker_idx: usize, quantum_cycles: u64) {
    assert!(worker_idx < MAX_WORKER_COUNT);
    WORKER_IDX.set(worker_idx);
    QUANTUM_CYCLES.set(quantum_cycles);
}

/// Enters a critical section: timer signals arriving until the matching
/// `enable()` are counted, not acted on. Halts the process when the section
/// is already open.
pub fn disable() {
    DISABLED.with(|flag| {
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("recursive call to software interrupt disable");
        }
    });
}

/// Leaves a critical section. Any deferred signals are folded into this
/// worker's `deferred_max` slot and cleared; the preemption they wanted is
/// recorded, not replayed. Halts the process when no section is open.
pub fn enable() {
    DISABLED.with(|flag| {
        if flag
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("recursive call to software interrupt enable");
        }
    });
    let deferred = DEFERRED.with(|count| count.swap(0, Ordering::AcqRel));
    if deferred > 0 {
        let worker_idx = WORKER_IDX.get();
        if worker_idx < MAX_WORKER_COUNT {
            DEFERRED_MAX[worker_idx].fetch_max(deferred, Ordering::Relaxed);
        }
    }
}

#[inline]
pub fn is_enabled() -> bool {
    DISABLED.with(|flag| !flag.load(Ordering::Acquire))
}

/// Deferred signals accumulated in the currently open critical section.
pub fn deferred_count() -> u32 {
    DEFERRED.with(|count| count.load(Ordering::Acquire))
}

/// Largest deferred burst worker `worker_idx` has seen so far.
pub fn deferred_max(worker_idx: usize) -> u32 {
    DEFERRED_MAX[worker_idx].load(Ordering::Relaxed)
}

/// Drains the SIGUSR1 wake flag for this thread.
pub fn take_wake_pending() -> bool {
    WAKE_PENDING.with(|flag| flag.swap(false, Ordering::AcqRel))
}

/// Logs every worker slot that ever deferred a signal.
pub fn report_deferred_max() {
    for (worker_idx, slot) in DEFERRED_MAX.iter().enumerate() {
        let max = slot.load(Ordering::Relaxed);
        if max > 0 {
            info!("worker {}: deferred sigalrm max {}", worker_idx, max);
        }
    }
}

extern "C" fn handle_sigalrm(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    let disabled = DISABLED.with(|flag| flag.load(Ordering::Acquire));
    if disabled {
        DEFERRED.with(|count| count.fetch_add(1, Ordering::AcqRel));
        return;
    }
    // Outside a critical section a fired quantum means preemption. The
    // switch parks this handler frame on the sandbox stack; a later resume
    // returns through it into the interrupted guest code.
    worker::preempt_current(QUANTUM_CYCLES.get());
}

extern "C" fn handle_sigusr1(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    WAKE_PENDING.with(|flag| flag.store(true, Ordering::Release));
}

static INSTALL: Once = Once::new();

/// Installs the process-wide SIGALRM/SIGUSR1 dispositions. Idempotent.
///
/// SA_NODEFER keeps SIGALRM unblocked across the handler: a preempted
/// sandbox switches out mid-handler without running the kernel's normal
/// mask restore, and the thread must keep taking timer interrupts while the
/// worker loop runs other sandboxes.
pub fn install_handlers() {
    INSTALL.call_once(|| {
        let flags = SaFlags::SA_SIGINFO | SaFlags::SA_RESTART | SaFlags::SA_NODEFER;
        let alarm = SigAction::new(SigHandler::SigAction(handle_sigalrm), flags, SigSet::empty());
        let wake = SigAction::new(SigHandler::SigAction(handle_sigusr1), flags, SigSet::empty());
        unsafe {
            signal::sigaction(Signal::SIGALRM, &alarm).expect("installing SIGALRM handler");
            signal::sigaction(Signal::SIGUSR1, &wake).expect("installing SIGUSR1 handler");
        }
        debug!("software interrupt handlers installed");
    });
}

/// Blocks delivery of `signal` on the calling thread. Only the two signals
/// the controller owns are accepted; a mask syscall failure halts the
/// process.
pub fn mask(signal: Signal) {
    adjust_mask(signal, SigmaskHow::SIG_BLOCK);
}

/// Unblocks delivery of `signal` on the calling thread.
pub fn unmask(signal: Signal) {
    adjust_mask(signal, SigmaskHow::SIG_UNBLOCK);
}

fn adjust_mask(signal: Signal, how: SigmaskHow) {
    assert!(
        signal == Signal::SIGALRM || signal == Signal::SIGUSR1,
        "only SIGALRM and SIGUSR1 are managed by the interrupt controller"
    );
    let mut set = SigSet::empty();
    set.add(signal);
    if let Err(err) = signal::pthread_sigmask(how, Some(&set), None) {
        panic!("pthread_sigmask: {}", err);
    }
}

/// Arms this thread's preemption timer: SIGALRM, thread-directed, every
/// `interval_usec` microseconds.
pub fn arm_timer(interval_usec: u64) {
    unsafe {
        let mut event: libc::sigevent = mem::zeroed();
        event.sigev_notify = libc::SIGEV_THREAD_ID;
        event.sigev_signo = libc::SIGALRM;
        event.sigev_notify_thread_id = libc::gettid();

        let mut timer: libc::timer_t = ptr::null_mut();
        if libc::timer_create(libc::CLOCK_MONOTONIC, &mut event, &mut timer) != 0 {
            panic!("timer_create: {}", std::io::Error::last_os_error());
        }

        let tick = libc::timespec {
            tv_sec: (interval_usec / 1_000_000) as libc::time_t,
            tv_nsec: ((interval_usec % 1_000_000) * 1_000) as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: tick,
            it_value: tick,
        };
        if libc::timer_settime(timer, 0, &spec, ptr::null_mut()) != 0 {
            panic!("timer_settime: {}", std::io::Error::last_os_error());
        }
        TIMER.set(timer);
    }
}

/// Disarms and deletes this thread's preemption timer, if armed.
pub fn disarm_timer() {
    let timer = TIMER.replace(ptr::null_mut());
    if !timer.is_null() {
        unsafe { libc::timer_delete(timer) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::pthread::{pthread_kill, pthread_self};
    use std::time::{Duration, Instant};

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if condition() {
                return true;
            }
            std::thread::yield_now();
        }
        condition()
    }

    #[test]
    fn disable_enable_balance() {
        assert!(is_enabled());
        disable();
        assert!(!is_enabled());
        enable();
        assert!(is_enabled());
    }

    #[test]
    #[should_panic(expected = "recursive call to software interrupt disable")]
    fn recursive_disable_halts() {
        disable();
        disable();
    }

    #[test]
    #[should_panic(expected = "recursive call to software interrupt enable")]
    fn unbalanced_enable_halts() {
        enable();
    }

    #[test]
    #[should_panic(expected = "managed by the interrupt controller")]
    fn masking_other_signals_is_rejected() {
        mask(Signal::SIGTERM);
    }

    // Spec scenario: disable, inject SIGALRMs by hand, enable; they coalesce
    // into the deferred count and the per-worker max, and nothing preempts.
    #[test]
    fn injected_signals_defer_while_disabled() {
        install_handlers();
        set_worker_identity(MAX_WORKER_COUNT - 1, u64::MAX);
        unmask(Signal::SIGALRM);

        disable();
        for _ in 0..3 {
            pthread_kill(pthread_self(), Signal::SIGALRM).unwrap();
        }
        assert!(
            wait_for(|| deferred_count() >= 3),
            "deferred count stuck at {}",
            deferred_count()
        );
        enable();

        assert_eq!(deferred_count(), 0);
        assert!(deferred_max(MAX_WORKER_COUNT - 1) >= 3);
        mask(Signal::SIGALRM);
    }

    // A real timer on this thread while interrupts are disabled: ticks are
    // deferred, never delivered as preemptions.
    #[test]
    fn armed_timer_defers_under_disable() {
        install_handlers();
        set_worker_identity(MAX_WORKER_COUNT - 2, u64::MAX);
        unmask(Signal::SIGALRM);

        disable();
        arm_timer(1_000);
        let deferred_some = wait_for(|| deferred_count() >= 2);
        disarm_timer();
        let seen = deferred_count();
        enable();

        assert!(deferred_some, "timer never fired, saw {}", seen);
        assert!(deferred_max(MAX_WORKER_COUNT - 2) >= 2);
        mask(Signal::SIGALRM);
    }

    #[test]
    fn wake_flag_is_drained_once() {
        install_handlers();
        unmask(Signal::SIGUSR1);
        pthread_kill(pthread_self(), Signal::SIGUSR1).unwrap();
        assert!(wait_for(take_wake_pending));
        assert!(!take_wake_pending());
        mask(Signal::SIGUSR1);
    }
}
