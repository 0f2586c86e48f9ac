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

//! The global admission scheduler.
//!
//! One process-wide queue of pending sandbox requests, produced by the
//! listener and drained by every worker. The ordering key is fixed at
//! startup: insertion order under FIFO, absolute deadline under EDF.

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use log::debug;

use ember::cycles;

use crate::config::SchedulerPolicy;
use crate::error::{AdmissionError, SandboxFault};
use crate::module::Module;
use crate::priority_queue::PriorityQueue;

/// An admitted invocation waiting to become a sandbox. Immutable after
/// enqueue; destroyed together with the sandbox it produced.
pub struct SandboxRequest {
    /// Monotonic across the process; doubles as the FIFO ordering key.
    pub id: u64,
    pub module: Arc<Module>,
    pub payload: Vec<u8>,
    /// Where the eventual response goes.
    pub sink: ResponseSink,
    /// Cycle stamp taken at creation.
    pub enqueue_time: u64,
    /// The module's deadline budget, in cycles.
    pub relative_deadline: u64,
    /// `enqueue_time + relative_deadline`; the EDF ordering key.
    pub absolute_deadline: u64,
}

impl std::fmt::Debug for SandboxRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRequest")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("enqueue_time", &self.enqueue_time)
            .field("relative_deadline", &self.relative_deadline)
            .field("absolute_deadline", &self.absolute_deadline)
            .finish()
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl SandboxRequest {
    /// Stamps a fresh request for one invocation of `module`.
    pub fn new(module: Arc<Module>, payload: Vec<u8>, sink: ResponseSink) -> Box<SandboxRequest> {
        let enqueue_time = cycles::now();
        let relative_deadline = cycles::usec_to_cycles(module.spec.relative_deadline_us);
        Box::new(SandboxRequest {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            module,
            payload,
            sink,
            enqueue_time,
            relative_deadline,
            absolute_deadline: enqueue_time + relative_deadline,
        })
    }
}

/// The result of one invocation, routed back to whoever asked for it.
#[derive(Debug)]
pub struct SandboxResponse {
    pub request_id: u64,
    pub module: String,
    pub status: Result<(), SandboxFault>,
    pub body: Vec<u8>,
    pub total_run_cycles: u64,
    pub preemptions: u32,
}

/// Transport for a response. Connections write the body back to the peer;
/// embedders and tests collect the full response on a channel.
#[derive(Debug)]
pub enum ResponseSink {
    Tcp(TcpStream),
    Channel(mpsc::Sender<SandboxResponse>),
    Discard,
}

impl ResponseSink {
    /// Delivers the response and consumes the sink. Transport errors are
    /// logged and swallowed; the requester may already be gone.
    pub fn deliver(self, response: SandboxResponse) {
        match self {
            ResponseSink::Tcp(mut stream) => {
                if response.status.is_ok() {
                    if let Err(err) = stream.write_all(&response.body) {
                        debug!("request {}: writing response: {}", response.request_id, err);
                    }
                }
                // An empty close tells the peer the invocation failed.
                let _ = stream.shutdown(Shutdown::Both);
            }
            ResponseSink::Channel(sender) => {
                let _ = sender.send(response);
            }
            ResponseSink::Discard => {}
        }
    }
}

fn fifo_key(request: &Box<SandboxRequest>) -> u64 {
    request.id
}

fn edf_key(request: &Box<SandboxRequest>) -> u64 {
    request.absolute_deadline
}

/// The shared admission queue. All operations are serialized by one mutex,
/// which is held only for the heap operation itself.
pub struct AdmissionQueue {
    policy: SchedulerPolicy,
    queue: spin::Mutex<PriorityQueue<Box<SandboxRequest>>>,
}

impl AdmissionQueue {
    pub fn new(policy: SchedulerPolicy, capacity: usize) -> AdmissionQueue {
        let key = match policy {
            SchedulerPolicy::Fifo => fifo_key as fn(&Box<SandboxRequest>) -> u64,
            SchedulerPolicy::Edf => edf_key,
        };
        AdmissionQueue {
            policy,
            queue: spin::Mutex::new(PriorityQueue::new(capacity, key)),
        }
    }

    #[inline]
    pub fn policy(&self) -> SchedulerPolicy {
        self.policy
    }

    /// The ordering key the configured policy assigns to `request`. Workers
    /// reuse it for their local run-queues so both levels agree.
    #[inline]
    pub fn key_for(&self, request: &SandboxRequest) -> u64 {
        match self.policy {
            SchedulerPolicy::Fifo => request.id,
            SchedulerPolicy::Edf => request.absolute_deadline,
        }
    }

    /// Admits a request.
    ///
    /// # Return
    ///
    /// The request id on success. On failure the request comes back with the
    /// reason so the caller can reject it upstream: the queue was full, or
    /// under EDF the deadline had already passed (checked here, before any
    /// sandbox resources are committed).
    pub fn add(
        &self,
        request: Box<SandboxRequest>,
    ) -> Result<u64, (AdmissionError, Box<SandboxRequest>)> {
        if self.policy == SchedulerPolicy::Edf && request.absolute_deadline < cycles::now() {
            return Err((AdmissionError::DeadlineExpired, request));
        }
        let id = request.id;
        match self.queue.lock().enqueue(request) {
            Ok(()) => Ok(id),
            Err(request) => Err((AdmissionError::QueueFull, request)),
        }
    }

    /// Removes the highest-priority pending request, or `None` when the
    /// queue is empty (callers poll or yield).
    pub fn remove(&self) -> Option<Box<SandboxRequest>> {
        self.queue.lock().dequeue()
    }

    /// Deletes a specific pending request, e.g. when its invocation is
    /// cancelled before a worker picked it up.
    pub fn cancel(&self, request_id: u64) -> Option<Box<SandboxRequest>> {
        self.queue.lock().remove_where(|request| request.id == request_id)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleSpec;
    use ember::GuestApi;

    fn test_module(name: &str, deadline_us: u64) -> Arc<Module> {
        fn noop(_api: &mut dyn GuestApi) {}
        Arc::new(Module::native(
            ModuleSpec {
                name: name.to_string(),
                path: None,
                port: 0,
                relative_deadline_us: deadline_us,
                memory_limit_bytes: 4_096,
                stack_size_bytes: 16 * 1024,
                max_payload_bytes: 1_024,
            },
            noop,
        ))
    }

    fn request(module: &Arc<Module>) -> Box<SandboxRequest> {
        SandboxRequest::new(module.clone(), Vec::new(), ResponseSink::Discard)
    }

    #[test]
    fn fifo_admits_oldest_first() {
        cycles::ensure();
        let queue = AdmissionQueue::new(SchedulerPolicy::Fifo, 8);
        let module = test_module("m", 1_000_000);
        let first = queue.add(request(&module)).unwrap();
        let second = queue.add(request(&module)).unwrap();
        let third = queue.add(request(&module)).unwrap();
        assert!(first < second && second < third);
        assert_eq!(queue.remove().unwrap().id, first);
        assert_eq!(queue.remove().unwrap().id, second);
        assert_eq!(queue.remove().unwrap().id, third);
        assert!(queue.remove().is_none());
    }

    #[test]
    fn edf_admits_earliest_deadline_first() {
        cycles::ensure();
        let queue = AdmissionQueue::new(SchedulerPolicy::Edf, 8);
        let slow = test_module("slow", 30_000_000);
        let fast = test_module("fast", 1_000_000);
        let middle = test_module("middle", 10_000_000);
        queue.add(request(&slow)).unwrap();
        queue.add(request(&fast)).unwrap();
        queue.add(request(&middle)).unwrap();
        assert_eq!(queue.remove().unwrap().module.name(), "fast");
        assert_eq!(queue.remove().unwrap().module.name(), "middle");
        assert_eq!(queue.remove().unwrap().module.name(), "slow");
    }

    #[test]
    fn full_queue_rejects_and_preserves_order() {
        cycles::ensure();
        let queue = AdmissionQueue::new(SchedulerPolicy::Fifo, 2);
        let module = test_module("m", 1_000_000);
        let first = queue.add(request(&module)).unwrap();
        queue.add(request(&module)).unwrap();
        let (err, rejected) = queue.add(request(&module)).unwrap_err();
        assert_eq!(err, AdmissionError::QueueFull);
        drop(rejected);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.remove().unwrap().id, first);
    }

    #[test]
    fn edf_rejects_expired_deadlines_at_admission() {
        cycles::ensure();
        let queue = AdmissionQueue::new(SchedulerPolicy::Edf, 8);
        let module = test_module("m", 1_000_000);
        let mut expired = request(&module);
        expired.absolute_deadline = cycles::now().saturating_sub(1);
        let (err, _request) = queue.add(expired).unwrap_err();
        assert_eq!(err, AdmissionError::DeadlineExpired);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_removes_a_specific_request() {
        cycles::ensure();
        let queue = AdmissionQueue::new(SchedulerPolicy::Fifo, 8);
        let module = test_module("m", 1_000_000);
        let first = queue.add(request(&module)).unwrap();
        let second = queue.add(request(&module)).unwrap();
        assert_eq!(queue.cancel(first).unwrap().id, first);
        assert!(queue.cancel(first).is_none());
        assert_eq!(queue.remove().unwrap().id, second);
    }
}
