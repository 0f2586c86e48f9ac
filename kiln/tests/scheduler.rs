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

//! End-to-end scheduler scenarios: admission ordering under both policies,
//! preemption of a busy guest, blocking I/O and wakeup, capacity rejection,
//! and deadline eviction.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use ember::{cycles, GuestApi};
use kiln::{
    AdmissionError, ModuleSpec, ResponseSink, Runtime, SandboxFault, SandboxResponse,
    SchedulerPolicy,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(20);

fn spec(name: &str, port: u16, relative_deadline_us: u64) -> ModuleSpec {
    ModuleSpec {
        name: name.to_string(),
        path: None,
        port,
        relative_deadline_us,
        memory_limit_bytes: 16 * 1024,
        stack_size_bytes: 128 * 1024,
        max_payload_bytes: 1_024,
    }
}

fn echo(api: &mut dyn GuestApi) {
    let payload = api.payload().to_vec();
    api.respond(&payload);
}

/// Busy-loops for the number of microseconds named in the payload, then
/// responds. The loop never yields, so only preemption interrupts it.
fn spin(api: &mut dyn GuestApi) {
    let bytes: [u8; 8] = api.payload()[..8].try_into().unwrap();
    let usec = u64::from_le_bytes(bytes);
    let target = cycles::usec_to_cycles(usec);
    let start = cycles::now();
    while cycles::now().wrapping_sub(start) < target {
        std::hint::spin_loop();
    }
    api.respond(b"spun");
}

/// Reads whatever shows up on the descriptor named in the payload.
fn pipe_reader(api: &mut dyn GuestApi) {
    let bytes: [u8; 4] = api.payload()[..4].try_into().unwrap();
    let fd = i32::from_le_bytes(bytes);
    let mut buf = [0u8; 32];
    let n = api.read(fd, &mut buf).expect("guest read failed");
    api.respond(&buf[..n]);
}

/// Gives the processor away a few times before answering.
fn polite(api: &mut dyn GuestApi) {
    for _ in 0..3 {
        api.yield_now();
    }
    api.respond(b"done");
}

fn recv(receiver: &mpsc::Receiver<SandboxResponse>) -> SandboxResponse {
    receiver.recv_timeout(RECV_TIMEOUT).expect("no response")
}

// Scenario: requests admitted at t, t+1, t+2 on a single-worker FIFO system
// dispatch in admission order, and every request produces exactly one
// sandbox response.
#[test]
fn fifo_dispatches_in_admission_order() {
    let runtime = Runtime::builder()
        .policy(SchedulerPolicy::Fifo)
        .workers(1)
        .native_module(spec("echo", 1, 30_000_000), echo)
        .build()
        .unwrap();

    let (sender, receiver) = mpsc::channel();
    let mut submitted = Vec::new();
    for body in [&b"first"[..], &b"second"[..], &b"third"[..]] {
        let id = runtime
            .submit("echo", body.to_vec(), ResponseSink::Channel(sender.clone()))
            .unwrap();
        submitted.push(id);
    }
    runtime.start_workers().unwrap();

    let mut seen = Vec::new();
    for expected in [&b"first"[..], &b"second"[..], &b"third"[..]] {
        let response = recv(&receiver);
        assert_eq!(response.status, Ok(()));
        assert_eq!(response.body, expected);
        seen.push(response.request_id);
    }
    assert_eq!(seen, submitted);
    runtime.stop();
}

// Scenario: under EDF the soonest absolute deadline wins, regardless of
// admission order.
#[test]
fn edf_dispatches_earliest_deadline_first() {
    let runtime = Runtime::builder()
        .policy(SchedulerPolicy::Edf)
        .workers(1)
        .native_module(spec("slow", 1, 30_000_000), echo)
        .native_module(spec("fast", 2, 2_000_000), echo)
        .native_module(spec("middle", 3, 10_000_000), echo)
        .build()
        .unwrap();

    let (sender, receiver) = mpsc::channel();
    for module in ["slow", "fast", "middle"] {
        runtime
            .submit(module, b"x".to_vec(), ResponseSink::Channel(sender.clone()))
            .unwrap();
    }
    runtime.start_workers().unwrap();

    let order: Vec<String> = (0..3).map(|_| recv(&receiver).module).collect();
    assert_eq!(order, ["fast", "middle", "slow"]);
    runtime.stop();
}

// Scenario: a busy loop spanning many quanta is preempted repeatedly and
// still completes.
#[test]
fn busy_guest_is_preempted_and_completes() {
    let runtime = Runtime::builder()
        .policy(SchedulerPolicy::Fifo)
        .workers(1)
        .interval_usec(1_000)
        .native_module(spec("spin", 1, 30_000_000), spin)
        .build()
        .unwrap();

    let (sender, receiver) = mpsc::channel();
    let spin_usec: u64 = 50_000; // fifty quanta
    runtime
        .submit(
            "spin",
            spin_usec.to_le_bytes().to_vec(),
            ResponseSink::Channel(sender),
        )
        .unwrap();
    runtime.start_workers().unwrap();

    let response = recv(&receiver);
    assert_eq!(response.status, Ok(()));
    assert_eq!(response.body, b"spun");
    assert!(
        (5..=500).contains(&response.preemptions),
        "expected a preempted busy loop, saw {} preemptions",
        response.preemptions
    );
    assert!(response.total_run_cycles >= cycles::usec_to_cycles(spin_usec));
    runtime.stop();
}

// Scenario: a sandbox reading an empty pipe blocks without holding the
// worker, wakes when the pipe fills, and completes.
#[test]
fn blocked_sandbox_wakes_on_io() {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
    let [read_fd, write_fd] = fds;

    let runtime = Runtime::builder()
        .policy(SchedulerPolicy::Fifo)
        .workers(1)
        .native_module(spec("pipe", 1, 30_000_000), pipe_reader)
        .native_module(spec("echo", 2, 30_000_000), echo)
        .build()
        .unwrap();

    let (sender, receiver) = mpsc::channel();
    runtime
        .submit(
            "pipe",
            read_fd.to_le_bytes().to_vec(),
            ResponseSink::Channel(sender.clone()),
        )
        .unwrap();
    // A second invocation proves the worker kept scheduling while the first
    // sandbox sat blocked.
    runtime
        .submit("echo", b"meanwhile".to_vec(), ResponseSink::Channel(sender))
        .unwrap();
    runtime.start_workers().unwrap();

    let while_blocked = recv(&receiver);
    assert_eq!(while_blocked.module, "echo");
    assert_eq!(while_blocked.body, b"meanwhile");

    std::thread::sleep(Duration::from_millis(100));
    let written = unsafe { libc::write(write_fd, b"wake".as_ptr() as *const libc::c_void, 4) };
    assert_eq!(written, 4);

    let woken = recv(&receiver);
    assert_eq!(woken.module, "pipe");
    assert_eq!(woken.status, Ok(()));
    assert_eq!(woken.body, b"wake");

    runtime.stop();
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

// Scenario: filling the admission queue to capacity rejects the next
// submission and leaves the queued order intact.
#[test]
fn full_admission_queue_rejects_and_keeps_order() {
    let runtime = Runtime::builder()
        .policy(SchedulerPolicy::Fifo)
        .admission_capacity(2)
        .native_module(spec("echo", 1, 30_000_000), echo)
        .build()
        .unwrap();

    let first = runtime
        .submit("echo", b"a".to_vec(), ResponseSink::Discard)
        .unwrap();
    runtime
        .submit("echo", b"b".to_vec(), ResponseSink::Discard)
        .unwrap();
    assert_eq!(
        runtime.submit("echo", b"c".to_vec(), ResponseSink::Discard),
        Err(AdmissionError::QueueFull)
    );
    assert_eq!(runtime.admission().remove().unwrap().id, first);
}

// Scenario: a request whose deadline expires while it waits behind a long
// run is evicted at dispatch with a deadline fault; the long run itself
// completes normally.
#[test]
fn stale_runnable_sandbox_is_evicted_at_dispatch() {
    let runtime = Runtime::builder()
        .policy(SchedulerPolicy::Fifo)
        .workers(1)
        .native_module(spec("spin", 1, 30_000_000), spin)
        .native_module(spec("tight", 2, 20_000), echo)
        .build()
        .unwrap();

    let (sender, receiver) = mpsc::channel();
    let spin_usec: u64 = 100_000;
    runtime
        .submit(
            "spin",
            spin_usec.to_le_bytes().to_vec(),
            ResponseSink::Channel(sender.clone()),
        )
        .unwrap();
    runtime
        .submit("tight", b"late".to_vec(), ResponseSink::Channel(sender))
        .unwrap();
    runtime.start_workers().unwrap();

    let mut statuses = std::collections::HashMap::new();
    for _ in 0..2 {
        let response = recv(&receiver);
        statuses.insert(response.module.clone(), response.status.clone());
    }
    assert_eq!(statuses["spin"], Ok(()));
    assert_eq!(statuses["tight"], Err(SandboxFault::DeadlineMissed));
    runtime.stop();
}

// Cooperative yields bounce through the run-queue and come back.
#[test]
fn yielding_guest_completes() {
    let runtime = Runtime::builder()
        .policy(SchedulerPolicy::Fifo)
        .workers(1)
        .native_module(spec("polite", 1, 30_000_000), polite)
        .build()
        .unwrap();

    let (sender, receiver) = mpsc::channel();
    runtime
        .submit("polite", Vec::new(), ResponseSink::Channel(sender))
        .unwrap();
    runtime.start_workers().unwrap();

    let response = recv(&receiver);
    assert_eq!(response.status, Ok(()));
    assert_eq!(response.body, b"done");
    runtime.stop();
}

// The cross-thread wake signal reaches a registered worker without
// disturbing it.
#[test]
fn wake_worker_signals_a_registered_worker() {
    let runtime = Runtime::builder()
        .policy(SchedulerPolicy::Fifo)
        .workers(1)
        .native_module(spec("echo", 1, 30_000_000), echo)
        .build()
        .unwrap();
    runtime.start_workers().unwrap();

    let start = Instant::now();
    while !runtime.wake_worker(0) {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "worker never registered"
        );
        std::thread::yield_now();
    }

    // The worker keeps working after the wake.
    let (sender, receiver) = mpsc::channel();
    runtime
        .submit("echo", b"still alive".to_vec(), ResponseSink::Channel(sender))
        .unwrap();
    assert_eq!(recv(&receiver).body, b"still alive");
    runtime.stop();
}

// Several workers drain the same admission queue; every request gets
// exactly one response.
#[test]
fn multiple_workers_share_the_admission_queue() {
    let runtime = Runtime::builder()
        .policy(SchedulerPolicy::Fifo)
        .workers(2)
        .native_module(spec("echo", 1, 30_000_000), echo)
        .build()
        .unwrap();

    let (sender, receiver) = mpsc::channel();
    let total = 32;
    for i in 0..total {
        runtime
            .submit(
                "echo",
                vec![i as u8],
                ResponseSink::Channel(sender.clone()),
            )
            .unwrap();
    }
    runtime.start_workers().unwrap();

    let mut bodies: Vec<u8> = (0..total).map(|_| recv(&receiver).body[0]).collect();
    bodies.sort_unstable();
    let expected: Vec<u8> = (0..total as u8).collect();
    assert_eq!(bodies, expected);
    runtime.stop();
}
