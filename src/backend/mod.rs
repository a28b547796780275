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

//! The backend primitives every platform implementation provides, as a
//! `Backend` trait: the core contains no platform `ifdef` logic outside of
//! these.
//!
//! All four concrete backends are unified behind one readiness-style
//! contract — register a socket for edge-triggered notification, wait for
//! a batch of notifications, interrupt a blocked wait. This matches how
//! `mio` actually implements its IOCP and io_uring backends: IOCP via AFD
//! polling, io_uring via repeated `IORING_OP_POLL_ADD`, both producing the
//! same readable/writable edges as epoll/kqueue. `IoTaskInner`'s
//! completion-style fields (`operation_count`, `to_submit_events`,
//! `cancel_event`) stay part of the data model for parity with the task
//! state machine but aren't exercised by any backend in this crate; see
//! DESIGN.md.

use runtime_support::error::Result;

use crate::iotask::RawSocket;

pub mod epoll;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub mod kqueue;

#[cfg(target_os = "linux")]
pub mod iouring;

#[cfg(windows)]
pub mod iocp;

/// One readiness edge reported by `Backend::wait`.
#[derive(Debug, Clone, Copy)]
pub struct Notification {
    /// The `IoTask::id()` this edge belongs to, set at `register_socket`
    /// time and handed back unchanged by the kernel as user data.
    pub task_id: u64,
    pub readable: bool,
    pub writable: bool,
    /// The kernel reported an error condition on this socket (e.g.
    /// `EPOLLERR`/`EV_ERROR`); surfaced to the subscriber as a fatal event.
    pub error: bool,
}

/// The primitive set every platform backend must provide.
pub trait Backend: Send + Sync + Sized + 'static {
    /// `create_event_source()`.
    fn create() -> Result<Self>;

    /// `register_socket(task, socket)`: edge-triggered, readable+writable.
    fn register_socket(&self, task_id: u64, socket: RawSocket) -> Result<()>;

    /// `deregister_socket(task)`.
    fn deregister_socket(&self, socket: RawSocket) -> Result<()>;

    /// `wait(timeout)`: blocks up to `timeout_ms` (`None` = block
    /// indefinitely) and returns every edge observed.
    fn wait(&self, timeout_ms: Option<u64>) -> Result<Vec<Notification>>;

    /// `interrupt_wait()`: wakes a thread blocked in `wait` so it can
    /// observe newly front-queued work. Safe to call from any thread.
    fn interrupt_wait(&self) -> Result<()>;
}

#[cfg(target_os = "linux")]
pub type DefaultBackend = epoll::EpollBackend;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub type DefaultBackend = kqueue::KqueueBackend;

#[cfg(windows)]
pub type DefaultBackend = iocp::IocpBackend;
