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

//! The runtime handle.
//!
//! One `Runtime` per process in practice, but modelled as an explicit handle
//! created at startup and threaded into the listener and every worker, so
//! embedders and the test suites can run several side by side. Holds the
//! admission scheduler, the module registry, and the worker table.

use std::cmp;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::sys::pthread::{pthread_kill, Pthread};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use ember::cycles;

use crate::admission::{AdmissionQueue, ResponseSink, SandboxRequest};
use crate::config::{self, ModuleSpec, SchedulerPolicy, DEFAULT_ADMISSION_CAPACITY};
use crate::error::{AdmissionError, FatalError};
use crate::interrupt::{self, MAX_WORKER_COUNT, SOFTWARE_INTERRUPT_INTERVAL_USEC};
use crate::listener;
use crate::module::{Module, ModuleRegistry};
use crate::worker;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub policy: SchedulerPolicy,
    pub worker_count: usize,
    pub admission_capacity: usize,
    /// Preemption interval in microseconds.
    pub interval_usec: u64,
    /// The same interval, converted to cycles at startup.
    pub quantum_cycles: u64,
    /// Pin the listener to core 0 and worker i to core 1+i. Disabled by the
    /// test suites, which run many runtimes on whatever cores they get.
    pub pin_threads: bool,
}

pub struct Runtime {
    config: RuntimeConfig,
    admission: AdmissionQueue,
    modules: ModuleRegistry,
    worker_pthreads: spin::Mutex<Vec<Option<Pthread>>>,
    threads: spin::Mutex<Vec<std::thread::JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Full production bootstrap from a module specification document.
    ///
    /// Performs the startup sequence in order: processor-speed detection,
    /// resource limits, core allocation, policy from the environment, module
    /// loading. Every failure here is fatal.
    pub fn boot(modules_path: &Path) -> Result<Arc<Runtime>, FatalError> {
        let frequency = cycles::init().ok_or(FatalError::ProcessorSpeed)?;
        info!(
            "detected processor speed of {:.0} MHz",
            frequency as f64 / 1e6
        );

        raise_resource_limits()?;

        let online = online_processors();
        if online < 2 {
            return Err(FatalError::TooFewProcessors(online));
        }
        let worker_count = cmp::min(online - 1, MAX_WORKER_COUNT);
        info!(
            "{} processors online, listener on core 0, {} workers on cores 1..={}",
            online, worker_count, worker_count
        );

        let policy = SchedulerPolicy::from_env()?;

        let mut builder = Runtime::builder()
            .policy(policy)
            .workers(worker_count)
            .pin_threads(true);
        for spec in config::load_module_specs(modules_path)? {
            builder = builder.module(Module::from_spec(spec)?);
        }
        builder.build()
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn admission(&self) -> &AdmissionQueue {
        &self.admission
    }

    #[inline]
    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Builds, stamps, and admits a request for `module_name`.
    ///
    /// # Return
    ///
    /// The request id, or the admission error that the caller reports
    /// upstream. The sink is dropped with the rejected request.
    pub fn submit(
        &self,
        module_name: &str,
        payload: Vec<u8>,
        sink: ResponseSink,
    ) -> Result<u64, AdmissionError> {
        let Some(module) = self.modules.by_name(module_name) else {
            return Err(AdmissionError::UnknownModule);
        };
        if payload.len() > module.spec.max_payload_bytes {
            return Err(AdmissionError::PayloadTooLarge);
        }
        let request = SandboxRequest::new(module, payload, sink);
        self.admission.add(request).map_err(|(err, request)| {
            drop(request);
            err
        })
    }

    /// Spawns the worker pool. Signal handlers are installed and both
    /// managed signals are masked on the calling thread first, so every
    /// spawned thread inherits the blocked state; workers unmask for
    /// themselves once ready.
    pub fn start_workers(self: &Arc<Self>) -> Result<(), FatalError> {
        interrupt::install_handlers();
        interrupt::mask(Signal::SIGALRM);
        interrupt::mask(Signal::SIGUSR1);
        let mut threads = self.threads.lock();
        for idx in 0..self.config.worker_count {
            let runtime = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("kiln-worker-{}", idx))
                .spawn(move || worker::worker_main(runtime, idx))
                .map_err(|err| FatalError::Spawn("worker", err))?;
            threads.push(handle);
        }
        Ok(())
    }

    /// Binds every module's listener socket and spawns the listener thread.
    pub fn start_listener(self: &Arc<Self>) -> Result<(), FatalError> {
        interrupt::install_handlers();
        interrupt::mask(Signal::SIGALRM);
        interrupt::mask(Signal::SIGUSR1);
        let bound = listener::bind_module_listeners(self)?;
        let runtime = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("kiln-listener".to_string())
            .spawn(move || listener::listener_main(runtime, bound))
            .map_err(|err| FatalError::Spawn("listener", err))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Production entry: listener plus workers, then wait forever (the
    /// process runs until signaled).
    pub fn serve(self: &Arc<Self>) -> Result<(), FatalError> {
        info!("scheduler policy: {}", self.config.policy);
        self.start_listener()?;
        info!("starting {} worker threads", self.config.worker_count);
        self.start_workers()?;
        info!("sandboxing environment ready");
        self.join_all();
        Ok(())
    }

    /// Requests shutdown and joins every runtime thread. Used by embedders
    /// and tests; the production binary runs until killed.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.join_all();
        interrupt::report_deferred_max();
    }

    fn join_all(&self) {
        loop {
            let handle = self.threads.lock().pop();
            match handle {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }
    }

    pub(crate) fn register_worker_thread(&self, idx: usize, thread: Pthread) {
        let mut table = self.worker_pthreads.lock();
        if table.len() <= idx {
            table.resize(idx + 1, None);
        }
        table[idx] = Some(thread);
    }

    /// Sends the cross-thread wake signal to worker `idx`.
    ///
    /// # Return
    ///
    /// Whether a registered worker thread existed to signal.
    pub fn wake_worker(&self, idx: usize) -> bool {
        let thread = match self.worker_pthreads.lock().get(idx) {
            Some(Some(thread)) => *thread,
            _ => return false,
        };
        match pthread_kill(thread, Signal::SIGUSR1) {
            Ok(()) => true,
            Err(err) => {
                warn!("waking worker {}: {}", idx, err);
                false
            }
        }
    }
}

#[derive(Default)]
pub struct RuntimeBuilder {
    policy: Option<SchedulerPolicy>,
    worker_count: Option<usize>,
    admission_capacity: Option<usize>,
    interval_usec: Option<u64>,
    pin_threads: bool,
    modules: Vec<Module>,
}

impl RuntimeBuilder {
    pub fn policy(mut self, policy: SchedulerPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn admission_capacity(mut self, capacity: usize) -> Self {
        self.admission_capacity = Some(capacity);
        self
    }

    pub fn interval_usec(mut self, interval: u64) -> Self {
        self.interval_usec = Some(interval);
        self
    }

    pub fn pin_threads(mut self, pin: bool) -> Self {
        self.pin_threads = pin;
        self
    }

    pub fn module(mut self, module: Module) -> Self {
        self.modules.push(module);
        self
    }

    pub fn native_module(self, spec: ModuleSpec, entry: ember::GuestEntry) -> Self {
        self.module(Module::native(spec, entry))
    }

    pub fn build(self) -> Result<Arc<Runtime>, FatalError> {
        // Embedders may not have run the production bootstrap; make sure a
        // cycle frequency exists before deriving the quantum.
        cycles::ensure();

        let policy = self.policy.unwrap_or(SchedulerPolicy::Fifo);
        let worker_count = self
            .worker_count
            .unwrap_or(1)
            .clamp(1, MAX_WORKER_COUNT);
        let admission_capacity = self
            .admission_capacity
            .unwrap_or(DEFAULT_ADMISSION_CAPACITY);
        let interval_usec = self
            .interval_usec
            .unwrap_or(SOFTWARE_INTERRUPT_INTERVAL_USEC);

        let mut registry = ModuleRegistry::new();
        for module in self.modules {
            registry.register(module)?;
        }

        let config = RuntimeConfig {
            policy,
            worker_count,
            admission_capacity,
            interval_usec,
            quantum_cycles: cycles::usec_to_cycles(interval_usec),
            pin_threads: self.pin_threads,
        };
        Ok(Arc::new(Runtime {
            admission: AdmissionQueue::new(policy, admission_capacity),
            modules: registry,
            worker_pthreads: spin::Mutex::new(Vec::new()),
            threads: spin::Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            config,
        }))
    }
}

/// Pins the calling thread to one processor.
pub(crate) fn pin_current_thread(core: usize) {
    let mut set = CpuSet::new();
    if let Err(err) = set.set(core) {
        warn!("core {} outside the affinity set: {}", core, err);
        return;
    }
    if let Err(err) = sched_setaffinity(Pid::from_raw(0), &set) {
        warn!("pinning to core {}: {}", core, err);
    }
}

fn online_processors() -> usize {
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if count < 0 {
        return 0;
    }
    count as usize
}

/// Raises the data-segment and descriptor soft limits to their hard limits.
fn raise_resource_limits() -> Result<(), FatalError> {
    for resource in [Resource::RLIMIT_DATA, Resource::RLIMIT_NOFILE] {
        let (_soft, hard) = getrlimit(resource).map_err(FatalError::ResourceLimits)?;
        setrlimit(resource, hard, hard).map_err(FatalError::ResourceLimits)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxFault;
    use ember::GuestApi;
    use std::sync::mpsc;
    use std::time::Duration;

    fn echo(api: &mut dyn GuestApi) {
        let payload = api.payload().to_vec();
        api.respond(&payload);
    }

    fn spec(name: &str, port: u16) -> ModuleSpec {
        ModuleSpec {
            name: name.to_string(),
            path: None,
            port,
            relative_deadline_us: 2_000_000,
            memory_limit_bytes: 4_096,
            stack_size_bytes: 64 * 1024,
            max_payload_bytes: 256,
        }
    }

    #[test]
    fn submit_rejects_unknown_modules_and_oversized_payloads() {
        let runtime = Runtime::builder()
            .native_module(spec("echo", 1), echo)
            .build()
            .unwrap();
        assert_eq!(
            runtime.submit("missing", Vec::new(), ResponseSink::Discard),
            Err(AdmissionError::UnknownModule)
        );
        assert_eq!(
            runtime.submit("echo", vec![0; 4_096], ResponseSink::Discard),
            Err(AdmissionError::PayloadTooLarge)
        );
        assert!(runtime.admission().is_empty());
    }

    #[test]
    fn single_worker_round_trip() {
        let runtime = Runtime::builder()
            .native_module(spec("echo", 1), echo)
            .workers(1)
            .build()
            .unwrap();
        let (sender, receiver) = mpsc::channel();
        runtime
            .submit("echo", b"ping".to_vec(), ResponseSink::Channel(sender))
            .unwrap();
        runtime.start_workers().unwrap();
        let response = receiver.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(response.status, Ok(()));
        assert_eq!(response.body, b"ping");
        runtime.stop();
    }

    #[test]
    fn guest_panic_becomes_a_trap_fault() {
        fn trap(_api: &mut dyn GuestApi) {
            panic!("boom");
        }
        let runtime = Runtime::builder()
            .native_module(spec("trap", 1), trap)
            .workers(1)
            .build()
            .unwrap();
        let (sender, receiver) = mpsc::channel();
        runtime
            .submit("trap", Vec::new(), ResponseSink::Channel(sender))
            .unwrap();
        runtime.start_workers().unwrap();
        let response = receiver.recv_timeout(Duration::from_secs(10)).unwrap();
        match response.status {
            Err(SandboxFault::GuestTrap(message)) => assert!(message.contains("boom")),
            other => panic!("expected a trap fault, got {:?}", other),
        }
        runtime.stop();
    }
}
