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

use std::io;
use std::os::unix::io::RawFd;

/// The runtime surface exposed to guest code.
///
/// The runtime hands an implementation of this trait to the guest entry
/// function. All methods run on the sandbox's own stack; the blocking ones
/// suspend only the calling sandbox, never the worker thread carrying it.
pub trait GuestApi {
    /// The invocation payload that accompanied the request.
    fn payload(&self) -> &[u8];

    /// The sandbox's private linear memory region.
    fn memory(&mut self) -> &mut [u8];

    /// Appends `data` to the response returned to the requester once the
    /// sandbox completes.
    fn respond(&mut self, data: &[u8]);

    /// Reads from a file descriptor, blocking the sandbox until data is
    /// available.
    ///
    /// # Arguments
    ///
    /// * `fd`:  A descriptor in non-blocking mode.
    /// * `buf`: The buffer to read into.
    ///
    /// # Return
    ///
    /// The number of bytes read. If the descriptor is not ready the sandbox
    /// transitions to the blocked state and the worker schedules other work
    /// until the descriptor wakes it.
    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    /// Voluntarily gives up the processor until the scheduler picks this
    /// sandbox again.
    fn yield_now(&mut self);
}

/// A guest entry function. Shared-object modules export one of these under
/// the symbol `guest_main`.
pub type GuestEntry = fn(&mut dyn GuestApi);
