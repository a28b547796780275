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

//! `IoTask`: a [`crate::task::Task`]-like handle attached to at most one
//! socket and one subscriber, driving an I/O-specific status state machine.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::event::ReadinessEvent;
use crate::subscriber::Subscriber;
use runtime_support::cycles::INF;

/// Hooks `IoCore` installs on a task at `attach_socket` time so that
/// `IoTask::post_close`/`post_wakeup` can notify the dispatcher without
/// `iotask.rs` having to name `IoCoreShared` directly — same inversion
/// `TaskWakeHook` gives `task.rs` over `scheduler.rs`.
pub trait IoTaskDispatchHook: Send + Sync {
    /// Called once, right after `post_close` wins the close race and
    /// flips status to `CLOSING`; pushes the task somewhere the dispatcher
    /// is guaranteed to look at it.
    fn notify_closing(&self, task: &IoTask);
    /// Called by `post_wakeup` after a successful `PENDING`/`WAITING` ->
    /// `READY` transition.
    fn notify_wakeup(&self, task: &IoTask);
}

/// Raw OS socket handle. A plain file descriptor on every platform this
/// crate targets via its readiness backends; the completion-port backend
/// stores the same integer (Windows sockets are also representable as a
/// `RawSocket`/`usize`, narrowed here for a single cross-platform field).
pub type RawSocket = i32;

pub const INVALID_SOCKET: RawSocket = -1;

/// `status`: `PENDING`, `IN_FRONT_QUEUE`, `WAITING`, `READY`, `CLOSING`,
/// `CLOSED`.
///
/// `InFrontQueue` mirrors `TaskStatus::InFrontQueue` in `task.rs`: it marks a
/// task as physically linked into the intrusive front queue, so `attach`,
/// the worker's end-of-dispatch repost, and a racing `post_close` can never
/// push the same `IoTaskInner` onto the queue twice (doing so would corrupt
/// its single `next` link into a cycle). Every push site first wins a
/// `Pending`/`Ready` -> `InFrontQueue` CAS; a `post_close` that instead
/// observes the task already `InFrontQueue` flips it straight to `Closing`
/// in place and does not push again; the already-queued node carries its
/// new status to the dispatcher when it's drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoTaskStatus {
    Pending = 0,
    InFrontQueue = 1,
    Waiting = 2,
    Ready = 3,
    Closing = 4,
    Closed = 5,
}

impl IoTaskStatus {
    fn from_u8(v: u8) -> IoTaskStatus {
        match v {
            0 => IoTaskStatus::Pending,
            1 => IoTaskStatus::InFrontQueue,
            2 => IoTaskStatus::Waiting,
            3 => IoTaskStatus::Ready,
            4 => IoTaskStatus::Closing,
            5 => IoTaskStatus::Closed,
            _ => unreachable!("corrupt IoTaskStatus byte"),
        }
    }
}

/// The shared, reference-counted body of an `IoTask`. Non-atomic fields
/// (`is_closed`, `is_expired`, the two readiness events) are mutated only
/// by whichever side currently owns the task per a single-owner
/// discipline: the dispatcher while the task sits in `status`
/// `Pending`/`Waiting`, the owning worker once it is `Ready`/dequeued.
/// `status` itself is the single source of truth for queue membership.
/// We enforce the discipline with `debug_assert!` at the call sites in
/// `iocore.rs` rather than a lock, trading a stricter guarantee for a
/// faster hot path.
pub struct IoTaskInner {
    status: AtomicU8,
    socket: AtomicI32,
    subscriber: Mutex<Option<Arc<dyn Subscriber>>>,
    deadline: AtomicU64,
    close_guard: AtomicBool,
    is_closed: Cell<bool>,
    is_expired: Cell<bool>,
    /// `RefCell` rather than `Cell` so `iocore.rs` can hand the subscriber a
    /// borrowed `&ReadinessEvent` in `EventArgs` without a throwaway clone
    /// on every dispatch; the single-owner discipline is what actually
    /// keeps this race-free, same trust boundary as the `Cell` fields above.
    pub(crate) in_event: RefCell<ReadinessEvent>,
    pub(crate) out_event: RefCell<ReadinessEvent>,
    /// In-flight operation count: incremented whenever `try_recv`/
    /// `try_send`/`try_connect`/`try_accept` lock an event (the op didn't
    /// complete synchronously), decremented when the backend's next
    /// notification unlocks it. `finalize_close` in `iocore.rs` will not
    /// deregister or close the socket while this is nonzero.
    operation_count: AtomicUsize,
    pub(crate) next: std::sync::atomic::AtomicPtr<IoTaskInner>,
    dispatch_hook: Mutex<Option<Arc<dyn IoTaskDispatchHook>>>,
    id: u64,
}

// `Cell` is normally `!Sync`; the single-owner discipline documented above
// is what actually guarantees exclusive access, the same trust boundary
// `Task` places on its intrusive `next`/`heap_index` fields.
unsafe impl Sync for IoTaskInner {}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A strong handle to an IOTask; cloning shares the same underlying state
/// (same contract as [`crate::task::Task`]).
#[derive(Clone)]
pub struct IoTask {
    pub(crate) inner: Arc<IoTaskInner>,
}

impl IoTask {
    /// Creates an unattached task. `attach_socket` (see `iocore.rs`) must be
    /// called before it can participate in I/O.
    pub fn new() -> IoTask {
        use crate::event::OpKind;
        IoTask {
            inner: Arc::new(IoTaskInner {
                status: AtomicU8::new(IoTaskStatus::Pending as u8),
                socket: AtomicI32::new(INVALID_SOCKET),
                subscriber: Mutex::new(None),
                deadline: AtomicU64::new(INF),
                close_guard: AtomicBool::new(false),
                is_closed: Cell::new(false),
                is_expired: Cell::new(false),
                in_event: RefCell::new(ReadinessEvent::new(OpKind::Recv)),
                out_event: RefCell::new(ReadinessEvent::new(OpKind::Send)),
                operation_count: AtomicUsize::new(0),
                next: std::sync::atomic::AtomicPtr::new(std::ptr::null_mut()),
                dispatch_hook: Mutex::new(None),
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn socket(&self) -> RawSocket {
        self.inner.socket.load(Ordering::Acquire)
    }

    pub(crate) fn set_socket(&self, socket: RawSocket) {
        self.inner.socket.store(socket, Ordering::Release);
    }

    /// Attaches `subscriber`; legal exactly once per lifecycle. A
    /// second call is a programmer error.
    pub(crate) fn set_subscriber(&self, subscriber: Arc<dyn Subscriber>) {
        let mut slot = self.inner.subscriber.lock().unwrap();
        debug_assert!(slot.is_none(), "subscriber attached twice");
        *slot = Some(subscriber);
    }

    pub(crate) fn subscriber(&self) -> Option<Arc<dyn Subscriber>> {
        self.inner.subscriber.lock().unwrap().clone()
    }

    pub(crate) fn release_subscriber(&self) {
        self.inner.subscriber.lock().unwrap().take();
    }

    pub fn status(&self) -> IoTaskStatus {
        IoTaskStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: IoTaskStatus) {
        self.inner.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn cas_status(&self, expected: IoTaskStatus, new: IoTaskStatus) -> bool {
        self.inner
            .status
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn deadline(&self) -> u64 {
        self.inner.deadline.load(Ordering::Acquire)
    }

    /// Additive-minimum deadline update, identical contract to `Task`.
    pub fn set_deadline(&self, new_deadline: u64) {
        let mut cur = self.inner.deadline.load(Ordering::Acquire);
        loop {
            if new_deadline >= cur {
                return;
            }
            match self.inner.deadline.compare_exchange_weak(
                cur,
                new_deadline,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// `Reschedule()`: run again with no delay, i.e. deadline = 0.
    pub fn reschedule(&self) {
        self.inner.deadline.store(0, Ordering::Release);
    }

    /// Unconditionally resets the deadline to `INF`, bypassing the
    /// additive-minimum rule `set_deadline` enforces. Called once per
    /// dispatch by the event-flushing step; a subscriber that wants another
    /// timeout calls `set_deadline` again from inside `on_event`.
    pub(crate) fn reset_deadline_to_inf(&self) {
        self.inner.deadline.store(INF, Ordering::Release);
    }

    /// Installs the hook `IoCore::attach_socket` uses to route
    /// `post_close`/`post_wakeup` notifications to the dispatcher that
    /// owns this task. Legal exactly once per lifecycle, mirroring
    /// `set_subscriber`.
    pub(crate) fn set_dispatch_hook(&self, hook: Arc<dyn IoTaskDispatchHook>) {
        *self.inner.dispatch_hook.lock().unwrap() = Some(hook);
    }

    fn dispatch_hook(&self) -> Option<Arc<dyn IoTaskDispatchHook>> {
        self.inner.dispatch_hook.lock().unwrap().clone()
    }

    /// `PostWakeup`: forces `PENDING`/`WAITING` straight to `READY` via a
    /// CAS loop that tolerates a concurrent close — observing `CLOSING`,
    /// `CLOSED`, or a task already physically queued (`InFrontQueue`) is a
    /// no-op; the latter will be triaged to `Ready` promptly regardless once
    /// the front queue is drained.
    pub fn post_wakeup(&self) {
        loop {
            match self.status() {
                IoTaskStatus::Pending => {
                    if self.cas_status(IoTaskStatus::Pending, IoTaskStatus::Ready) {
                        break;
                    }
                }
                IoTaskStatus::Waiting => {
                    if self.cas_status(IoTaskStatus::Waiting, IoTaskStatus::Ready) {
                        break;
                    }
                }
                IoTaskStatus::InFrontQueue
                | IoTaskStatus::Ready
                | IoTaskStatus::Closing
                | IoTaskStatus::Closed => return,
            }
        }
        if let Some(hook) = self.dispatch_hook() {
            hook.notify_wakeup(self);
        }
    }

    /// `PostClose`: first-wins close guard. Returns `true` if this call won
    /// the race and is responsible for driving the close to completion.
    ///
    /// A task observed `InFrontQueue` is already physically linked into the
    /// intrusive front queue; the CAS here only flips its status in place to
    /// `Closing` and must NOT push it again (that would corrupt the queue's
    /// single `next` link into a cycle) — the dispatcher sees the new status
    /// when it drains the node it already has. Every other originating
    /// status is not queued anywhere, so winning the close from one of those
    /// does need `notify_closing` to push the task so the dispatcher is
    /// guaranteed to look at it.
    pub fn post_close(&self) -> bool {
        if self
            .inner
            .close_guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let already_queued = loop {
            match self.status() {
                IoTaskStatus::Closed => return false,
                IoTaskStatus::Closing => break true,
                IoTaskStatus::InFrontQueue => {
                    if self.cas_status(IoTaskStatus::InFrontQueue, IoTaskStatus::Closing) {
                        break true;
                    }
                }
                s @ (IoTaskStatus::Pending | IoTaskStatus::Waiting | IoTaskStatus::Ready) => {
                    if self.cas_status(s, IoTaskStatus::Closing) {
                        break false;
                    }
                }
            }
        };
        if !already_queued {
            if let Some(hook) = self.dispatch_hook() {
                hook.notify_closing(self);
            }
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed.get()
    }

    pub(crate) fn set_closed(&self, v: bool) {
        self.inner.is_closed.set(v);
    }

    pub fn is_expired(&self) -> bool {
        self.inner.is_expired.get()
    }

    pub(crate) fn set_expired(&self, v: bool) {
        self.inner.is_expired.set(v);
    }

    /// Increments the in-flight operation count (completion backends).
    pub(crate) fn begin_operation(&self) {
        self.inner.operation_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the in-flight operation count, returning the count after
    /// decrementing so the caller can tell whether it reached zero.
    pub(crate) fn end_operation(&self) -> usize {
        self.inner.operation_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn operation_count(&self) -> usize {
        self.inner.operation_count.load(Ordering::Acquire)
    }

    pub(crate) fn ptr_eq(a: &IoTask, b: &IoTask) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl Default for IoTask {
    fn default() -> IoTask {
        IoTask::new()
    }
}

impl fmt::Debug for IoTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoTask")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("socket", &self.socket())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_pending_and_unattached() {
        let t = IoTask::new();
        assert_eq!(t.status(), IoTaskStatus::Pending);
        assert_eq!(t.socket(), INVALID_SOCKET);
        assert_eq!(t.deadline(), INF);
    }

    #[test]
    fn post_close_is_idempotent_first_wins() {
        let t = IoTask::new();
        assert!(t.post_close());
        assert!(!t.post_close());
        assert_eq!(t.status(), IoTaskStatus::Closing);
    }

    #[test]
    fn deadline_is_additive_minimum() {
        let t = IoTask::new();
        t.set_deadline(100);
        t.set_deadline(200); // must not raise
        assert_eq!(t.deadline(), 100);
        t.set_deadline(50);
        assert_eq!(t.deadline(), 50);
    }

    #[test]
    fn operation_accounting_tracks_in_flight_count() {
        let t = IoTask::new();
        t.begin_operation();
        t.begin_operation();
        assert_eq!(t.operation_count(), 2);
        assert_eq!(t.end_operation(), 1);
        assert_eq!(t.end_operation(), 0);
    }
}
