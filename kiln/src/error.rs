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

//! Error taxonomy.
//!
//! Three tiers: fatal startup errors abort the process with exit code -1,
//! admission errors are reported to the requester and life goes on, and
//! sandbox faults are confined to the affected sandbox. Invariant violations
//! (recursive interrupt disable, signal-mask failures) are programmer bugs
//! and panic instead of flowing through here.

use std::path::PathBuf;

use thiserror::Error;

/// Startup failures. None of these are recoverable; the binary maps them to
/// exit code -1.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("runtime requires at least two online processors, found {0}")]
    TooFewProcessors(usize),

    #[error("unable to detect the processor speed")]
    ProcessorSpeed,

    #[error("invalid scheduler policy {0:?}, must be FIFO or EDF")]
    InvalidPolicy(String),

    #[error("raising resource limits: {0}")]
    ResourceLimits(#[source] nix::Error),

    #[error("reading module specification {path:?}: {source}")]
    ModuleSpecIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing module specification {path:?}: {source}")]
    ModuleSpecParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("module {name:?}: loading guest code: {source}")]
    ModuleLoad {
        name: String,
        source: libloading::Error,
    },

    #[error("module {0:?} declares no guest code path")]
    ModuleWithoutCode(String),

    #[error("module {0:?} is declared twice")]
    DuplicateModule(String),

    #[error("binding listener for module {name:?} on port {port}: {source}")]
    Bind {
        name: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("listener event multiplexer: {0}")]
    ListenerEpoll(#[source] nix::Error),

    #[error("spawning {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
}

/// Reasons a request never became a sandbox. Reported upstream to the
/// requester; the runtime keeps serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("admission queue is full")]
    QueueFull,

    #[error("request deadline expired before admission")]
    DeadlineExpired,

    #[error("unknown module")]
    UnknownModule,

    #[error("payload exceeds the module limit")]
    PayloadTooLarge,
}

/// Terminal causes recorded on a sandbox that entered the error state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxFault {
    #[error("linear memory or stack allocation failed")]
    OutOfMemory,

    #[error("absolute deadline missed")]
    DeadlineMissed,

    #[error("guest trapped: {0}")]
    GuestTrap(String),
}
