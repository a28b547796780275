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

//! The scheduler's unit of deferred work.
//!
//! A `Task` is never owned by the scheduler: a poster holds an `Arc` to it
//! for as long as it cares to, the scheduler holds its own clone while the
//! task sits in a queue or the waiting heap, and the task is only ever
//! dropped once every `Arc` is gone. This sidesteps "the scheduler must not
//! delete tasks" by construction rather than by convention.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use runtime_support::cycles::{self, INF};

/// Callback a [`Task`] uses to force itself out of the waiting heap early,
/// implemented by the scheduler that currently owns it. Kept as a trait
/// object so `task.rs` never has to name `scheduler::SchedulerShared`
/// directly — the dependency runs the other way (scheduler depends on task).
pub trait TaskWakeHook: Send + Sync {
    /// Called by `PostSignal`/forced wakeups when the task might be parked
    /// in the waiting heap. A no-op if the task is not currently `InWaiting`.
    fn force_ready(&self, task: &Task);
}

/// Atomic lifecycle state of a [`Task`]. Transitions are made with explicit
/// acquire/release ordering; see `sched.rs`'s dispatcher and worker loops
/// for the exact CAS sequences each edge in the status diagram goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Newly created or re-posted, not yet observed by the dispatcher.
    Pending = 0,
    /// Sitting in the scheduler's front queue, about to be triaged.
    InFrontQueue = 1,
    /// Parked in the waiting heap, woken by deadline/signal/wakeup.
    InWaiting = 2,
    /// In the ready queue or about to be, eligible for a worker to pick up.
    Ready = 3,
    /// Currently being run by exactly one worker.
    InExec = 4,
}

impl TaskStatus {
    fn from_u8(v: u8) -> TaskStatus {
        match v {
            0 => TaskStatus::Pending,
            1 => TaskStatus::InFrontQueue,
            2 => TaskStatus::InWaiting,
            3 => TaskStatus::Ready,
            4 => TaskStatus::InExec,
            _ => unreachable!("corrupt TaskStatus byte: {v}"),
        }
    }
}

/// The callback a worker invokes to run a task one step. Boxed and
/// replaceable: the callback itself may swap out `TaskCx::callback` before
/// returning, which is how the coroutine trampolines in `coroutine.rs` work.
pub type Callback = Box<dyn FnMut(&mut TaskCx) + Send>;

/// The mutable view of a task a callback is handed while it executes.
///
/// Only the worker currently running the task may touch these fields (the
/// single-writer discipline applied to the plain `Task` as
/// well) — enforced here by construction, since `TaskCx` only exists as a
/// `&mut` borrow handed to the callback for the duration of one dispatch.
pub struct TaskCx<'a> {
    task: &'a Arc<TaskInner>,
}

impl<'a> TaskCx<'a> {
    pub(crate) fn new(task: &'a Arc<TaskInner>) -> TaskCx<'a> {
        TaskCx { task }
    }

    /// Sets the deadline to the minimum of its current value and `deadline_ms`
    /// (`SetDeadline` is additive-minimum: only lowers, never raises).
    pub fn set_deadline(&mut self, deadline_ms: u64) {
        self.task.lower_deadline(deadline_ms);
    }

    /// Sets the deadline to `now + delay_ms`, additive-minimum as above.
    pub fn set_delay(&mut self, delay_ms: u64) {
        self.set_deadline(cycles::deadline_after_ms(delay_ms));
    }

    /// Alias for `AdjustDeadline`: may only lower, never raise, the deadline.
    pub fn adjust_deadline(&mut self, deadline_ms: u64) {
        self.task.lower_deadline(deadline_ms);
    }

    /// `Reschedule()`: sets deadline to 0, i.e. "run again immediately".
    pub fn reschedule(&mut self) {
        self.task.deadline.store(0, Ordering::Release);
    }

    /// Requests that the scheduler not re-invoke the callback on a mere
    /// reschedule; only deadline expiry, signal, or explicit wakeup will.
    pub fn set_wait(&mut self) {
        self.task.is_waiting.store(true, Ordering::Release);
    }

    /// True if this dispatch was triggered by the task's deadline elapsing.
    pub fn is_expired(&self) -> bool {
        self.task.is_expired.load(Ordering::Acquire)
    }

    /// `ReceiveSignal()`: consumes (clears) a pending signal, returning
    /// whether one was pending. A second call before another `PostSignal`
    /// observes `false`.
    pub fn receive_signal(&mut self) -> bool {
        self.task.is_signaled.swap(false, Ordering::AcqRel)
    }

    /// Replaces the callback that will run on the task's next dispatch.
    pub fn set_callback(&mut self, callback: Callback) {
        *self.task.callback.lock().unwrap() = Some(callback);
    }

    /// Handle to post this same task again, e.g. from inside its own
    /// callback (reentrant `Post*`, guaranteed to target the front queue).
    pub fn handle(&self) -> Task {
        Task {
            inner: Arc::clone(self.task),
        }
    }

    /// Requests one more execution after this one completes. This is the
    /// `Post*`-on-self-while-`IN_EXEC` path: without a call
    /// to `repost`, a task that finishes a dispatch with no one else
    /// holding a `Task` handle to it is released for good.
    pub fn repost(&mut self) {
        self.task.repost_while_exec.store(true, Ordering::Release);
    }
}

/// Internal, intrusively-linked task state. Never exposed directly; always
/// reached through [`Task`] (an `Arc<TaskInner>` handle) or [`TaskCx`].
pub struct TaskInner {
    pub(crate) callback: Mutex<Option<Callback>>,
    pub(crate) status: AtomicU8,
    pub(crate) deadline: AtomicU64,
    pub(crate) is_expired: AtomicBool,
    pub(crate) is_signaled: AtomicBool,
    pub(crate) is_waiting: AtomicBool,
    /// Intrusive singly-linked-list link used by the front queue and the
    /// ready queue. Only the queue currently holding the task may touch it.
    pub(crate) next: AtomicPtr<TaskInner>,
    /// Position in the waiting heap's backing vector, `usize::MAX` when not
    /// a member of the heap. Lets the heap remove/adjust in O(log n).
    pub(crate) heap_index: AtomicUsize,
    /// Set when `Post*` targets this task while it is `IN_EXEC`, whether
    /// from the task's own callback (`TaskCx::repost`) or from another
    /// thread racing a concurrent post. Consumed by the worker right after
    /// the callback returns.
    pub(crate) repost_while_exec: AtomicBool,
    /// The scheduler currently responsible for waking this task out of the
    /// waiting heap on `PostSignal`, if any. `None` before the task is ever
    /// posted, and left stale (but harmless) after the task stops being a
    /// heap member — `force_ready` is only ever a no-op in that case.
    pub(crate) wake_hook: Mutex<Option<Arc<dyn TaskWakeHook>>>,
}

impl TaskInner {
    fn lower_deadline(&self, candidate: u64) {
        let mut current = self.deadline.load(Ordering::Acquire);
        while candidate < current {
            match self.deadline.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Compare-exchanges the status, used by the dispatcher/worker hand-off
    /// points and by the thread-safe `PostSignal`/`PostWakeup` entry points.
    pub(crate) fn cas_status(&self, current: TaskStatus, new: TaskStatus) -> bool {
        self.status
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// A reference-counted handle to a scheduler task.
///
/// Cloning a `Task` shares the same underlying state; posting a clone to a
/// scheduler and holding on to another clone is the normal way a caller
/// retains the ability to signal/wake/re-post a task it doesn't want to lose
/// track of.
#[derive(Clone)]
pub struct Task {
    pub(crate) inner: Arc<TaskInner>,
}

impl Task {
    /// Creates a new, unposted task wrapping `callback`. The task starts
    /// with no deadline (`INF`) and not waiting; call the `set_*` helpers
    /// below before the first `Post*` to configure it.
    pub fn new<F>(callback: F) -> Task
    where
        F: FnMut(&mut TaskCx) + Send + 'static,
    {
        Task {
            inner: Arc::new(TaskInner {
                callback: Mutex::new(Some(Box::new(callback))),
                status: AtomicU8::new(TaskStatus::Pending as u8),
                deadline: AtomicU64::new(INF),
                is_expired: AtomicBool::new(false),
                is_signaled: AtomicBool::new(false),
                is_waiting: AtomicBool::new(false),
                next: AtomicPtr::new(ptr::null_mut()),
                heap_index: AtomicUsize::new(usize::MAX),
                repost_while_exec: AtomicBool::new(false),
                wake_hook: Mutex::new(None),
            }),
        }
    }

    /// Sets the deadline before the first post; equivalent to `SetDeadline`
    /// called from outside a dispatch.
    pub fn set_deadline(&self, deadline_ms: u64) {
        self.inner.lower_deadline(deadline_ms);
    }

    /// Sets the deadline to `now + delay_ms` before the first post.
    pub fn set_delay(&self, delay_ms: u64) {
        self.set_deadline(cycles::deadline_after_ms(delay_ms));
    }

    /// Current deadline, `INF` if none is set.
    pub fn deadline(&self) -> u64 {
        self.inner.deadline.load(Ordering::Acquire)
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.status()
    }

    /// `PostSignal()`: sets the signaled flag; any thread may call this.
    /// The scheduler wakes the task if it is currently parked waiting.
    pub fn post_signal(&self) {
        self.inner.is_signaled.store(true, Ordering::Release);
        let hook = self.inner.wake_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook.force_ready(self);
        }
    }

    /// Installs (or replaces) the hook a scheduler uses to pull this task
    /// back out of its waiting heap on `PostSignal`. Called by the
    /// dispatcher just before parking a task, never by user code.
    pub(crate) fn set_wake_hook(&self, hook: Arc<dyn TaskWakeHook>) {
        *self.inner.wake_hook.lock().unwrap() = Some(hook);
    }

    pub(crate) fn is_waiting_flag(&self) -> bool {
        self.inner.is_waiting.load(Ordering::Acquire)
    }

    pub(crate) fn clear_waiting_flag(&self) {
        self.inner.is_waiting.store(false, Ordering::Release);
    }

    pub(crate) fn is_signaled(&self) -> bool {
        self.inner.is_signaled.load(Ordering::Acquire)
    }

    pub(crate) fn set_expired(&self, expired: bool) {
        self.inner.is_expired.store(expired, Ordering::Release);
    }

    /// Number of distinct `Arc` handles referring to this task right now,
    /// used only for diagnostics/tests — never for correctness decisions.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn ptr_eq(a: &Task, b: &Task) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.status())
            .field("deadline", &self.deadline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_is_additive_minimum() {
        let t = Task::new(|_| {});
        t.set_deadline(100);
        t.set_deadline(50);
        t.set_deadline(200);
        assert_eq!(t.deadline(), 50);
    }

    #[test]
    fn signal_then_receive_collapses_double_post() {
        let t = Task::new(|_| {});
        t.post_signal();
        t.post_signal();
        assert!(t.is_signaled());
        let mut cx = TaskCx::new(&t.inner);
        assert!(cx.receive_signal());
        assert!(!cx.receive_signal());
    }
}
