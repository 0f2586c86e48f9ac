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

//! The listener thread.
//!
//! One thread, pinned to core 0, with the scheduler signals masked. It is
//! the sole producer for the admission queue: it accepts one TCP connection
//! per invocation on the module's port, reads a bounded payload, stamps the
//! deadline, and admits. Rejections (full queue, expired deadline) are
//! logged and the connection is closed without a body; accepted invocations
//! keep their connection, and the worker that finishes the sandbox writes
//! the response back over it.

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use ember::cycles::CycleCounter;

use crate::admission::{ResponseSink, SandboxRequest};
use crate::error::FatalError;
use crate::module::Module;
use crate::runtime::Runtime;

const MAX_LISTENER_EVENTS: usize = 32;

/// How long the listener waits in epoll before re-checking for shutdown.
const WAIT_TIMEOUT_MSEC: u16 = 100;

/// Per-connection guard against a requester that trickles its payload.
const PAYLOAD_READ_TIMEOUT: Duration = Duration::from_millis(500);

pub struct BoundListeners {
    sockets: Vec<(TcpListener, Arc<Module>)>,
}

/// Binds one accept socket per module. Runs on the caller so a bind failure
/// is still a startup error, before any thread exists.
pub fn bind_module_listeners(runtime: &Arc<Runtime>) -> Result<BoundListeners, FatalError> {
    let mut sockets = Vec::new();
    for module in runtime.modules().iter() {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, module.spec.port));
        let listener = TcpListener::bind(addr).map_err(|source| FatalError::Bind {
            name: module.spec.name.clone(),
            port: module.spec.port,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| FatalError::Bind {
                name: module.spec.name.clone(),
                port: module.spec.port,
                source,
            })?;
        info!(
            "module {:?} listening on port {}",
            module.spec.name, module.spec.port
        );
        sockets.push((listener, module.clone()));
    }
    Ok(BoundListeners { sockets })
}

/// Body of the listener thread.
pub fn listener_main(runtime: Arc<Runtime>, bound: BoundListeners) {
    if runtime.config().pin_threads {
        crate::runtime::pin_current_thread(0);
    }

    let epoll = match Epoll::new(EpollCreateFlags::empty()) {
        Ok(epoll) => epoll,
        Err(err) => {
            warn!("listener: creating epoll instance: {}", err);
            return;
        }
    };
    for (slot, (listener, module)) in bound.sockets.iter().enumerate() {
        let event = EpollEvent::new(EpollFlags::EPOLLIN, slot as u64);
        if let Err(err) = epoll.add(listener, event) {
            warn!(
                "listener: registering module {:?}: {}",
                module.spec.name, err
            );
            return;
        }
    }
    debug!("listener: accepting on {} modules", bound.sockets.len());

    let mut admit_cycles = CycleCounter::new("listener admission", 1_000_000);
    let mut events = [EpollEvent::empty(); MAX_LISTENER_EVENTS];
    while !runtime.is_shutdown() {
        let ready = match epoll.wait(&mut events, EpollTimeout::from(WAIT_TIMEOUT_MSEC)) {
            Ok(count) => count,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                warn!("listener: epoll wait: {}", err);
                break;
            }
        };
        for event in &events[..ready] {
            let (listener, module) = &bound.sockets[event.data() as usize];
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        admit_cycles.start();
                        accept_invocation(&runtime, module, stream, peer);
                        admit_cycles.stop();
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        debug!("listener: accept on {:?}: {}", module.spec.name, err);
                        break;
                    }
                }
            }
        }
    }
    debug!("listener: stopped");
}

/// Reads one invocation payload off a fresh connection and admits it.
fn accept_invocation(
    runtime: &Arc<Runtime>,
    module: &Arc<Module>,
    mut stream: TcpStream,
    peer: SocketAddr,
) {
    if let Err(err) = stream.set_read_timeout(Some(PAYLOAD_READ_TIMEOUT)) {
        debug!("listener: configuring connection from {}: {}", peer, err);
        return;
    }

    // The requester signals end-of-payload by shutting down its write half;
    // anything past the module limit is treated as malformed.
    let limit = module.spec.max_payload_bytes as u64;
    let mut payload = Vec::new();
    match (&stream).take(limit + 1).read_to_end(&mut payload) {
        Ok(_) => {}
        Err(err) => {
            warn!("listener: reading payload from {}: {}", peer, err);
            return;
        }
    }
    if payload.len() as u64 > limit {
        warn!(
            "listener: rejecting oversized payload from {} for module {:?}",
            peer, module.spec.name
        );
        return;
    }

    let request = SandboxRequest::new(module.clone(), payload, ResponseSink::Tcp(stream));
    match runtime.admission().add(request) {
        Ok(id) => {
            trace!("listener: admitted request {} from {}", id, peer);
        }
        Err((err, request)) => {
            warn!(
                "listener: rejecting request from {} for module {:?}: {}",
                peer, module.spec.name, err
            );
            // Dropping the request closes the connection, which is the
            // rejection the requester observes.
            drop(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleSpec;
    use ember::{cycles, GuestApi};
    use std::io::Write;
    use std::net::Shutdown;

    fn echo(api: &mut dyn GuestApi) {
        let payload = api.payload().to_vec();
        api.respond(&payload);
    }

    // End-to-end over loopback: bind an ephemeral port, run listener plus
    // one worker, write a payload, read the echoed response.
    #[test]
    fn tcp_invocation_round_trip() {
        cycles::ensure();
        let runtime = Runtime::builder()
            .native_module(
                ModuleSpec {
                    name: "echo".to_string(),
                    path: None,
                    port: 0, // ephemeral; resolved below
                    relative_deadline_us: 2_000_000,
                    memory_limit_bytes: 4_096,
                    stack_size_bytes: 64 * 1024,
                    max_payload_bytes: 256,
                },
                echo,
            )
            .workers(1)
            .build()
            .unwrap();

        let bound = bind_module_listeners(&runtime).unwrap();
        let port = bound.sockets[0].0.local_addr().unwrap().port();

        runtime.start_workers().unwrap();
        let listener_runtime = runtime.clone();
        let listener_thread =
            std::thread::spawn(move || listener_main(listener_runtime, bound));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"over the wire").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"over the wire");

        runtime.stop();
        listener_thread.join().unwrap();
    }
}
