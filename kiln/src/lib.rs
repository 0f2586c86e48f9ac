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

//! Kiln: the scheduling and preemption core of a serverless function
//! runtime.
//!
//! A listener thread admits invocation requests into a global, policy-
//! ordered queue; a pool of core-pinned worker threads turns them into
//! sandboxes and schedules those cooperatively and preemptively on user-mode
//! stacks, driven by per-thread timer interrupts.

pub mod admission;
pub mod config;
pub mod context;
pub mod error;
pub mod guest;
pub mod interrupt;
pub mod listener;
pub mod module;
pub mod priority_queue;
pub mod runtime;
pub mod sandbox;
pub mod worker;

pub use admission::{AdmissionQueue, ResponseSink, SandboxRequest, SandboxResponse};
pub use config::{ModuleSpec, SchedulerPolicy};
pub use error::{AdmissionError, FatalError, SandboxFault};
pub use module::Module;
pub use runtime::{Runtime, RuntimeBuilder};
pub use sandbox::{Sandbox, SandboxState};
