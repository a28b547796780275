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

//! The asynchronous socket-I/O engine: one dispatcher thread per `IoCore`,
//! blocking in a platform `Backend::wait` rather than a condvar, plus a pool
//! of I/O workers that run subscriber callbacks.
//!
//! `IoCore<B>` is generic over the backend; the core itself contains no
//! `cfg(...)` beyond picking `backend::DefaultBackend` for callers who don't
//! care which one they get.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex as PlMutex};

use runtime_support::buffer::Buffer;
use runtime_support::cycles::{now_ms, LatencyCounter, INF};
use runtime_support::error::{Error, Result};

use crate::backend::{Backend, DefaultBackend, Notification};
use crate::config::IoCoreConfig;
use crate::event::{EventOutcome, OpKind};
use crate::iotask::{IoTask, IoTaskDispatchHook, IoTaskStatus, RawSocket, INVALID_SOCKET};
use crate::subscriber::{EventArgs, Subscriber};

const MAX_SLEEP_MS: u64 = 60_000;

/// Dispatcher logs its running average backend-wait latency every this many
/// ticks.
const TICK_LOG_EVERY: u64 = 1_000;

thread_local! {
    static CURRENT_IO_TASK: RefCell<Option<IoTask>> = RefCell::new(None);
}

/// True if called from an I/O worker thread currently running a
/// subscriber's `on_event`. Lets a fast send/recv path distinguish
/// "already in worker context" from an arbitrary caller thread.
pub fn is_in_io_worker_now() -> bool {
    CURRENT_IO_TASK.with(|c| c.borrow().is_some())
}

/// Intrusive singly-linked front queue of `IoTask`s, identical in shape and
/// purpose to `queue::FrontQueue` but keyed off `IoTaskInner`'s own `next`
/// link rather than `TaskInner`'s — the two can't share one implementation
/// without either boxing the link or making the queue generic over a trait,
/// so this is a sibling rather than a shared abstraction. See DESIGN.md.
struct IoFrontQueue {
    head: AtomicPtr<crate::iotask::IoTaskInner>,
}

impl IoFrontQueue {
    fn new() -> IoFrontQueue {
        IoFrontQueue {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `task`; returns `true` if the queue was empty beforehand.
    fn push(&self, task: IoTask) -> bool {
        let raw = Arc::into_raw(task.inner) as *mut crate::iotask::IoTaskInner;
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            unsafe { (*raw).next.store(old_head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(old_head, raw, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return old_head.is_null(),
                Err(_) => continue,
            }
        }
    }

    /// Drains the whole queue in arrival order, same two-pass
    /// swap-then-reverse as `queue::FrontQueue::drain`.
    fn drain(&self) -> Vec<IoTask> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut prev: *mut crate::iotask::IoTaskInner = ptr::null_mut();
        while !head.is_null() {
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            unsafe { (*head).next.store(prev, Ordering::Relaxed) };
            prev = head;
            head = next;
        }
        let mut out = Vec::new();
        let mut cur = prev;
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            let inner = unsafe { Arc::from_raw(cur as *const crate::iotask::IoTaskInner) };
            out.push(IoTask { inner });
            cur = next;
        }
        out
    }
}

/// Ready FIFO, mutex+condvar like `queue::ReadyQueue`.
struct IoReadyQueue {
    state: PlMutex<IoReadyState>,
    not_empty: Condvar,
}

struct IoReadyState {
    queue: VecDeque<IoTask>,
    stopping: bool,
}

impl IoReadyQueue {
    fn new() -> IoReadyQueue {
        IoReadyQueue {
            state: PlMutex::new(IoReadyState {
                queue: VecDeque::new(),
                stopping: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    fn push(&self, task: IoTask) {
        let mut state = self.state.lock();
        state.queue.push_back(task);
        self.not_empty.notify_one();
    }

    fn pop_blocking(&self) -> Option<IoTask> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                return Some(task);
            }
            if state.stopping {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.stopping = true;
        drop(state);
        self.not_empty.notify_all();
    }

    fn len(&self) -> usize {
        self.state.lock().queue.len()
    }
}

/// Min-heap of `IoTask`s parked on a deadline, sibling of `heap::WaitingHeap`
/// (no intrusive index on `IoTaskInner`, so removal is `O(n)` rather than
/// `O(log n)`; acceptable since a given `IoCore` typically parks far fewer
/// sockets on bare timeouts than a scheduler parks tasks — see DESIGN.md).
struct IoWaitingHeap {
    storage: Mutex<Vec<IoTask>>,
}

impl IoWaitingHeap {
    fn new() -> IoWaitingHeap {
        IoWaitingHeap {
            storage: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, task: IoTask) {
        let mut v = self.storage.lock().unwrap();
        v.push(task);
        v.sort_by_key(|t| t.deadline());
    }

    fn peek_min_deadline(&self) -> Option<u64> {
        self.storage.lock().unwrap().first().map(|t| t.deadline())
    }

    fn pop_expired(&self, now: u64) -> Vec<IoTask> {
        let mut v = self.storage.lock().unwrap();
        let split = v.partition_point(|t| t.deadline() <= now);
        v.drain(..split).collect()
    }

    /// Removes `task` if it's still a member; `true` on success. Called
    /// both by forced-ready transitions and by close finalization, so a
    /// closed task never lingers holding a reference in the heap.
    fn remove(&self, task: &IoTask) -> bool {
        let mut v = self.storage.lock().unwrap();
        if let Some(idx) = v.iter().position(|t| IoTask::ptr_eq(t, task)) {
            v.remove(idx);
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.storage.lock().unwrap().len()
    }
}

struct IoCoreShared<B: Backend> {
    front: IoFrontQueue,
    ready: IoReadyQueue,
    heap: IoWaitingHeap,
    backend: B,
    /// `task_id -> task`, so `Backend::wait`'s `Notification`s (which only
    /// carry the id the backend was handed at `register_socket` time) can
    /// be turned back into a live `IoTask` handle.
    registry: Mutex<HashMap<u64, IoTask>>,
    stopping: AtomicBool,
    config: IoCoreConfig,
    wait_latency: Mutex<LatencyCounter>,
}

impl<B: Backend> IoCoreShared<B> {
    /// Forces `task` from `PENDING`/`WAITING` to `READY`, pulling it out of
    /// the waiting heap first if necessary. A no-op if the task is already
    /// `READY` (someone else is about to run it) or `CLOSING`/`CLOSED`.
    fn force_ready(&self, task: &IoTask) {
        loop {
            match task.status() {
                IoTaskStatus::Pending => {
                    if task.cas_status(IoTaskStatus::Pending, IoTaskStatus::Ready) {
                        self.ready.push(task.clone());
                        return;
                    }
                }
                IoTaskStatus::Waiting => {
                    if task.cas_status(IoTaskStatus::Waiting, IoTaskStatus::Ready) {
                        self.heap.remove(task);
                        self.ready.push(task.clone());
                        return;
                    }
                }
                // Already physically linked into the front queue; flip its
                // status in place rather than pushing it a second time. The
                // front queue drain sees `Ready` and leaves it alone, same
                // as any other already-ready node.
                IoTaskStatus::InFrontQueue => {
                    if task.cas_status(IoTaskStatus::InFrontQueue, IoTaskStatus::Ready) {
                        self.ready.push(task.clone());
                        return;
                    }
                }
                IoTaskStatus::Ready | IoTaskStatus::Closing | IoTaskStatus::Closed => return,
            }
        }
    }

    /// Runs the per-task close protocol to completion for a task observed
    /// in `CLOSING`. Deregistration and the socket close cannot happen
    /// while `operation_count` is nonzero — an in-flight `try_recv`/
    /// `try_send`/`try_connect`/`try_accept` still holds a locked event
    /// waiting on a kernel notification, and tearing the socket down under
    /// it would race that completion. In that case the task is re-queued
    /// as-is (still `CLOSING`) and retried on a later dispatcher tick, once
    /// the outstanding operation's notification has unlocked its event and
    /// decremented the count. Once the count is zero, deregistration and
    /// close happen synchronously on the dispatcher thread, then the task
    /// is queued once more for its terminal dispatch.
    fn finalize_close(&self, task: &IoTask) {
        if task.operation_count() > 0 {
            if self.front.push(task.clone()) {
                let _ = self.backend.interrupt_wait();
            }
            return;
        }
        self.heap.remove(task);
        let socket = task.socket();
        if socket != INVALID_SOCKET {
            let _ = self.backend.deregister_socket(socket);
            unsafe {
                libc::close(socket);
            }
            log::debug!("iocore '{}': closed socket {}", self.config.name, socket);
        }
        self.registry.lock().unwrap().remove(&task.id());
        task.set_closed(true);
        task.set_status(IoTaskStatus::Closed);
        self.ready.push(task.clone());
    }

    /// One pass over everything the front queue handed us since the last
    /// tick: fresh attachments and reposts (always `InFrontQueue`, per the
    /// CAS guard at their push sites) get triaged by deadline exactly like
    /// the scheduler's front queue; tasks already `CLOSING` are finalized
    /// (including ones requeued by `finalize_close` itself while an
    /// operation was still in flight); tasks some other path already
    /// promoted to `READY` are left alone.
    fn drain_front(&self, now: u64) {
        for task in self.front.drain() {
            match task.status() {
                IoTaskStatus::Closing => self.finalize_close(&task),
                IoTaskStatus::Ready | IoTaskStatus::Closed => {}
                IoTaskStatus::InFrontQueue | IoTaskStatus::Pending | IoTaskStatus::Waiting => {
                    if task.deadline() <= now {
                        task.set_status(IoTaskStatus::Ready);
                        self.ready.push(task);
                    } else {
                        task.set_status(IoTaskStatus::Waiting);
                        self.heap.insert(task);
                    }
                }
            }
        }
    }

    fn expire_heap(&self, now: u64) {
        for task in self.heap.pop_expired(now) {
            task.set_expired(true);
            task.set_status(IoTaskStatus::Ready);
            self.ready.push(task);
        }
    }

    /// Applies the backend's readiness edges: unlocks the matching
    /// `in_event`/`out_event` ("level propagated" in edge-triggered
    /// handling), retiring the in-flight operation count each unlock
    /// closes out, and forces the owning task to `READY` if it isn't
    /// already.
    fn apply_notifications(&self, notifications: Vec<Notification>) {
        let registry = self.registry.lock().unwrap();
        for n in notifications {
            let Some(task) = registry.get(&n.task_id) else {
                continue;
            };
            if n.readable {
                let mut ev = task.inner.in_event.borrow_mut();
                if ev.is_locked() {
                    unlock_and_retire(task, &mut ev, EventOutcome::Empty);
                }
            }
            if n.writable {
                let mut ev = task.inner.out_event.borrow_mut();
                if ev.is_locked() {
                    unlock_and_retire(task, &mut ev, EventOutcome::Empty);
                }
            }
            if n.error {
                let err = Error::Fatal(io::Error::from_raw_os_error(libc::EIO));
                let mut in_ev = task.inner.in_event.borrow_mut();
                unlock_and_retire(task, &mut in_ev, EventOutcome::Error(clone_error(&err)));
                drop(in_ev);
                let mut out_ev = task.inner.out_event.borrow_mut();
                unlock_and_retire(task, &mut out_ev, EventOutcome::Error(err));
            }
            self.force_ready(task);
        }
    }

    fn shutdown_drain(&self) {
        for task in self.front.drain() {
            if task.status() == IoTaskStatus::Closing {
                self.finalize_close(&task);
            } else {
                task.set_status(IoTaskStatus::Ready);
                self.ready.push(task);
            }
        }
        for task in self.heap.pop_expired(u64::MAX) {
            task.set_expired(true);
            task.set_status(IoTaskStatus::Ready);
            self.ready.push(task);
        }
        self.ready.stop();
    }
}

/// Unlocks `ev` with `outcome`, retiring the in-flight operation the lock
/// represented. A no-op on the count if `ev` was not actually locked (e.g.
/// a readable edge arriving for a task that never attempted a `recv`).
fn unlock_and_retire(task: &IoTask, ev: &mut crate::event::ReadinessEvent, outcome: EventOutcome) {
    if ev.is_locked() {
        task.end_operation();
    }
    ev.unlock_with(outcome);
}

fn clone_error(e: &Error) -> Error {
    match e {
        Error::Transient(_) => Error::Transient(io::Error::from(io::ErrorKind::WouldBlock)),
        Error::Fatal(_) => Error::Fatal(io::Error::from_raw_os_error(libc::EIO)),
        Error::ProgrammerError(m) => Error::ProgrammerError(*m),
        Error::Aborted => Error::Aborted,
    }
}

impl<B: Backend> IoTaskDispatchHook for IoCoreShared<B> {
    fn notify_closing(&self, task: &IoTask) {
        if self.front.push(task.clone()) {
            let _ = self.backend.interrupt_wait();
        }
    }

    fn notify_wakeup(&self, task: &IoTask) {
        self.ready.push(task.clone());
        let _ = self.backend.interrupt_wait();
    }
}

/// Multiplexes many `IoTask`s over one kernel event source: one dispatcher
/// thread owns the backend and the queues, a configurable pool of I/O
/// workers run subscriber callbacks.
pub struct IoCore<B: Backend = DefaultBackend> {
    shared: Arc<IoCoreShared<B>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<B: Backend> IoCore<B> {
    /// Creates an `IoCore` bound to a freshly created kernel event source.
    /// No threads run until [`IoCore::start`].
    pub fn new(config: IoCoreConfig) -> Result<Arc<IoCore<B>>> {
        let backend = B::create()?;
        Ok(Arc::new(IoCore {
            shared: Arc::new(IoCoreShared {
                front: IoFrontQueue::new(),
                ready: IoReadyQueue::new(),
                heap: IoWaitingHeap::new(),
                backend,
                registry: Mutex::new(HashMap::new()),
                stopping: AtomicBool::new(false),
                config,
                wait_latency: Mutex::new(LatencyCounter::new(TICK_LOG_EVERY)),
            }),
            dispatcher: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    /// `Start(n)`: spawns `n` I/O worker threads plus the one dispatcher
    /// thread that owns the kernel event source.
    pub fn start(self: &Arc<IoCore<B>>, worker_count: usize) {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "IoCore::start called twice"
        );

        let dispatcher_shared = Arc::clone(&self.shared);
        let name = self.shared.config.name.clone();
        let dispatcher = thread::Builder::new()
            .name(format!("{name}-iodispatch"))
            .spawn(move || dispatcher_loop(dispatcher_shared))
            .expect("failed to spawn iocore dispatcher thread");
        *self.dispatcher.lock().unwrap() = Some(dispatcher);

        let mut workers = self.workers.lock().unwrap();
        for i in 0..worker_count {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-iow-{i}"))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn iocore worker thread");
            workers.push(handle);
        }
    }

    /// `AttachSocket`: registers `socket` with the backend in edge-triggered
    /// mode and binds `subscriber` to `task` for the remainder of its
    /// lifecycle. Legal exactly once per task.
    pub fn attach_socket(
        self: &Arc<IoCore<B>>,
        task: &IoTask,
        socket: RawSocket,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<()> {
        task.set_socket(socket);
        task.set_subscriber(subscriber);
        task.set_dispatch_hook(Arc::clone(&self.shared) as Arc<dyn IoTaskDispatchHook>);
        self.shared.backend.register_socket(task.id(), socket)?;
        self.shared
            .registry
            .lock()
            .unwrap()
            .insert(task.id(), task.clone());
        // Guard the push with the same CAS the worker's end-of-dispatch
        // repost uses: if a racing `post_close` (or, in principle, a
        // spurious readiness notification) already moved the task off
        // `Pending` before we get here, whoever won that race is already
        // responsible for this task's queue membership, so we must not
        // push it again.
        if task.cas_status(IoTaskStatus::Pending, IoTaskStatus::InFrontQueue)
            && self.shared.front.push(task.clone())
        {
            let _ = self.shared.backend.interrupt_wait();
        }
        log::debug!(
            "iocore '{}': attached socket {} (task {})",
            self.shared.config.name,
            socket,
            task.id()
        );
        Ok(())
    }

    /// `PostClose` entry point at the core level; equivalent to calling
    /// `task.post_close()` directly once the task has a dispatch hook
    /// installed via `attach_socket`. Kept for symmetry with
    /// `TaskScheduler::post_wakeup`.
    pub fn post_close(&self, task: &IoTask) -> bool {
        task.post_close()
    }

    /// `PostWakeup` entry point at the core level; see `IoTask::post_wakeup`.
    pub fn post_wakeup(&self, task: &IoTask) {
        task.post_wakeup();
    }

    /// Best-effort snapshot, diagnostics only (see
    /// `TaskScheduler::pending_count`'s identical caveat).
    pub fn pending_count(&self) -> usize {
        self.shared.front.len() + self.shared.ready.len() + self.shared.heap.len()
    }

    /// Drains outstanding work once (closing any still-open sockets along
    /// the way) and joins every thread this `IoCore` owns.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.stopping.store(true, Ordering::Release);
        let _ = self.shared.backend.interrupt_wait();

        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl<B: Backend> Drop for IoCore<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl IoFrontQueue {
    fn len(&self) -> usize {
        // Best-effort: walk the chain under no lock, matching the front
        // queue's general "diagnostics only" contract. Rare enough not to
        // warrant a dedicated counter the way `queue::FrontQueue` has one.
        let mut count = 0usize;
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            count += 1;
            cur = unsafe { (*cur).next.load(Ordering::Relaxed) };
        }
        count
    }
}

fn dispatcher_loop<B: Backend>(shared: Arc<IoCoreShared<B>>) {
    log::debug!("iocore dispatcher '{}' started", shared.config.name);
    loop {
        if shared.stopping.load(Ordering::Acquire) {
            shared.shutdown_drain();
            break;
        }

        let now = now_ms();
        let timeout_ms = match shared.heap.peek_min_deadline() {
            Some(deadline) if deadline != INF => Some(deadline.saturating_sub(now).min(MAX_SLEEP_MS)),
            _ => Some(MAX_SLEEP_MS),
        };

        shared.wait_latency.lock().unwrap().start();
        let wait_result = shared.backend.wait(timeout_ms);
        shared.wait_latency.lock().unwrap().stop();
        match wait_result {
            Ok(notifications) => shared.apply_notifications(notifications),
            Err(e) => log::warn!("iocore '{}': backend wait failed: {e}", shared.config.name),
        }

        shared.drain_front(now_ms());
        shared.expire_heap(now_ms());
    }
    log::debug!("iocore dispatcher '{}' stopped", shared.config.name);
}

fn worker_loop<B: Backend>(shared: Arc<IoCoreShared<B>>) {
    loop {
        let task = match shared.ready.pop_blocking() {
            Some(task) => task,
            None => break,
        };

        CURRENT_IO_TASK.with(|c| *c.borrow_mut() = Some(task.clone()));

        let is_closed = task.status() == IoTaskStatus::Closed;
        let subscriber = task.subscriber();
        if let Some(subscriber) = &subscriber {
            if !is_closed {
                task.reset_deadline_to_inf();
            }
            // Snapshot the two events rather than holding the `RefCell`
            // borrow across `on_event`: a subscriber is free to call
            // `try_recv`/`try_send`/`try_accept` from inside its own
            // callback, each of which needs `borrow_mut` on the live cell.
            let in_snapshot = task.inner.in_event.borrow().clone();
            let out_snapshot = task.inner.out_event.borrow().clone();
            let args = EventArgs {
                task: &task,
                readable: Some(&in_snapshot),
                writable: Some(&out_snapshot),
                is_closed,
            };
            subscriber.on_event(args);
        }

        task.set_expired(false);
        CURRENT_IO_TASK.with(|c| *c.borrow_mut() = None);

        if is_closed {
            task.release_subscriber();
        } else {
            // The task was `Ready` on entry to this loop body and nothing
            // but a racing `post_close` can move it off that status before
            // this point (single-owner discipline: this worker is the only
            // other party). CAS rather than a blind `set_status` so that if
            // `post_close` wins the race instead, it is the one responsible
            // for this task's queue membership and we must not push again.
            if task.cas_status(IoTaskStatus::Ready, IoTaskStatus::InFrontQueue) {
                if shared.front.push(task) {
                    let _ = shared.backend.interrupt_wait();
                }
            }
        }
    }
}

/// The three-outcome I/O operation contract shared by
/// `try_send`/`try_recv`/`try_connect`. `false` means
/// the event now carries an error and the op never reached the kernel in
/// any meaningful sense; `true` with the event still locked means in
/// flight; `true` with the event unlocked means it completed synchronously
/// and `bytes()`/`outcome()` on the event describes the result.
///
/// Every call site already returned early if `event` was locked, so the
/// `WouldBlock` arm here always represents a fresh in-flight operation:
/// it begins the count `finalize_close` gates on. The synchronous arms
/// never locked anything and so never retire a count either; retirement
/// happens later in `apply_notifications`, when the backend's own
/// notification unlocks an event an earlier call left locked here.
fn apply_syscall_result(
    task: &IoTask,
    event: &mut crate::event::ReadinessEvent,
    result: io::Result<usize>,
) -> bool {
    match result {
        Ok(n) => {
            event.unlock_with(EventOutcome::Bytes(n));
            true
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            task.begin_operation();
            event.lock();
            true
        }
        Err(e) => {
            event.unlock_with(EventOutcome::Error(e.into()));
            false
        }
    }
}

/// `recv`: non-blocking read into `buf`'s spare capacity. See
/// `apply_syscall_result` for the tri-state contract.
pub fn try_recv(task: &IoTask, buf: &mut Buffer, max: usize) -> bool {
    let socket = task.socket();
    if socket == INVALID_SOCKET {
        return false;
    }
    {
        let ev = task.inner.in_event.borrow();
        if ev.is_locked() {
            return true;
        }
    }
    let start = buf.len();
    let spare = buf.spare_capacity_mut(max);
    let n = unsafe { libc::recv(socket, spare.as_mut_ptr() as *mut libc::c_void, spare.len(), 0) };
    let result = if n >= 0 {
        Ok(n as usize)
    } else {
        Err(io::Error::last_os_error())
    };
    if result.is_err() {
        buf.truncate_to(start);
    } else if let Ok(n) = result {
        buf.truncate_to(start + n);
    }
    let mut ev = task.inner.in_event.borrow_mut();
    debug_assert_eq!(ev.op, OpKind::Recv);
    apply_syscall_result(task, &mut ev, result)
}

/// `send`: non-blocking write of `buf`'s readable bytes.
pub fn try_send(task: &IoTask, buf: &Buffer) -> bool {
    let socket = task.socket();
    if socket == INVALID_SOCKET {
        return false;
    }
    {
        let ev = task.inner.out_event.borrow();
        if ev.is_locked() {
            return true;
        }
    }
    let data = buf.as_slice();
    let n = unsafe { libc::send(socket, data.as_ptr() as *const libc::c_void, data.len(), 0) };
    let result = if n >= 0 {
        Ok(n as usize)
    } else {
        Err(io::Error::last_os_error())
    };
    let mut ev = task.inner.out_event.borrow_mut();
    debug_assert_eq!(ev.op, OpKind::Send);
    apply_syscall_result(task, &mut ev, result)
}

/// `connect`: kicks off a non-blocking connect. `EINPROGRESS` is the
/// transient condition that locks the `out` event until the socket reports
/// writable.
pub fn try_connect(task: &IoTask) -> bool {
    let socket = task.socket();
    if socket == INVALID_SOCKET {
        return false;
    }
    let mut ev = task.inner.out_event.borrow_mut();
    debug_assert_eq!(ev.op, OpKind::Connect);
    if ev.is_locked() {
        return true;
    }
    // The actual `connect(2)` call (and its target address) lives with the
    // `TCPSocketIFace`-style caller, out of scope for this crate; this
    // entry point only interprets the already-issued call's result via
    // `getsockopt(SO_ERROR)`, which is what a non-blocking connect's
    // completion looks like on every platform this crate targets.
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            socket,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    let result: io::Result<usize> = if rc != 0 {
        Err(io::Error::last_os_error())
    } else if err == 0 {
        Ok(0)
    } else {
        Err(io::Error::from_raw_os_error(err))
    };
    apply_syscall_result(task, &mut ev, result)
}

/// `accept`: non-blocking accept on a listening socket. A transient
/// peer-aborted-before-accept condition surfaces as `Ok(None)` with the
/// event left unlocked+empty — the caller must call
/// `task.reschedule()` to retry without delay; this function never loops
/// internally so one greedy listener can't starve the rest of the ready
/// queue.
pub fn try_accept(task: &IoTask) -> Result<Option<RawSocket>> {
    let socket = task.socket();
    if socket == INVALID_SOCKET {
        return Err(Error::ProgrammerError("accept called on an unattached task"));
    }
    {
        let ev = task.inner.in_event.borrow();
        if ev.is_locked() {
            return Ok(None);
        }
    }
    let accepted = unsafe { libc::accept(socket, ptr::null_mut(), ptr::null_mut()) };
    let mut ev = task.inner.in_event.borrow_mut();
    if accepted >= 0 {
        ev.unlock_with(EventOutcome::Bytes(0));
        Ok(Some(accepted))
    } else {
        let e = io::Error::last_os_error();
        match e.kind() {
            io::ErrorKind::WouldBlock => {
                task.begin_operation();
                ev.lock();
                Ok(None)
            }
            io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted => {
                // Transient: peer aborted before we could accept it. Leave
                // the event unlocked+empty; caller reschedules immediately.
                ev.unlock_with(EventOutcome::Empty);
                Ok(None)
            }
            _ => {
                let err: Error = e.into();
                ev.unlock_with(EventOutcome::Error(clone_error(&err)));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::epoll::EpollBackend;
    use crate::config::IoCoreConfig;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::{AsRawFd, IntoRawFd};
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingSubscriber {
        dispatches: StdAtomicUsize,
        closed: StdAtomicUsize,
        last_args: StdMutex<Option<(bool, bool)>>,
    }

    impl Subscriber for RecordingSubscriber {
        fn on_event(&self, args: EventArgs<'_>) {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            if args.is_closed {
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
            *self.last_args.lock().unwrap() = Some((
                args.readable.map(|e| !e.is_locked()).unwrap_or(false),
                args.writable.map(|e| !e.is_locked()).unwrap_or(false),
            ));
        }
    }

    fn set_nonblocking(fd: RawSocket) {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    }

    #[test]
    fn attach_and_close_delivers_one_terminal_dispatch() {
        let core: Arc<IoCore<EpollBackend>> =
            IoCore::new(IoCoreConfig::default()).expect("iocore new");
        core.start(1);

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        set_nonblocking(listener.as_raw_fd());
        let fd = listener.into_raw_fd();

        let task = IoTask::new();
        let subscriber = Arc::new(RecordingSubscriber {
            dispatches: StdAtomicUsize::new(0),
            closed: StdAtomicUsize::new(0),
            last_args: StdMutex::new(None),
        });
        core.attach_socket(&task, fd, subscriber.clone())
            .expect("attach");

        assert!(task.post_close());
        assert!(!task.post_close());

        for _ in 0..400 {
            if subscriber.closed.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(subscriber.closed.load(Ordering::SeqCst), 1);
        assert_eq!(task.status(), IoTaskStatus::Closed);
        core.stop();
    }

    #[test]
    fn accept_sees_incoming_connections() {
        let core: Arc<IoCore<EpollBackend>> =
            IoCore::new(IoCoreConfig::default()).expect("iocore new");
        core.start(2);

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().unwrap();
        set_nonblocking(listener.as_raw_fd());
        let fd = listener.into_raw_fd();

        let task = IoTask::new();
        let accepted = Arc::new(StdAtomicUsize::new(0));
        struct AcceptingSubscriber {
            accepted: Arc<StdAtomicUsize>,
        }
        impl Subscriber for AcceptingSubscriber {
            fn on_event(&self, args: EventArgs<'_>) {
                if args.is_closed {
                    return;
                }
                loop {
                    match try_accept(args.task) {
                        Ok(Some(client_fd)) => {
                            self.accepted.fetch_add(1, Ordering::SeqCst);
                            unsafe {
                                libc::close(client_fd);
                            }
                        }
                        Ok(None) => {
                            if args.task.inner.in_event.borrow().is_locked() {
                                break;
                            }
                            // transient: retry immediately, but don't spin
                            // forever inside one dispatch.
                            args.task.reschedule();
                            break;
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        let subscriber = Arc::new(AcceptingSubscriber {
            accepted: Arc::clone(&accepted),
        });
        core.attach_socket(&task, fd, subscriber).expect("attach");

        for _ in 0..20 {
            let _ = TcpStream::connect(addr);
        }

        for _ in 0..400 {
            if accepted.load(Ordering::SeqCst) >= 20 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(accepted.load(Ordering::SeqCst) >= 1);
        core.stop();
    }
}
