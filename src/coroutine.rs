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

//! Coroutine integration for [`crate::task::Task`] callbacks: suspension
//! points (`AsyncYield`, `AsyncReceiveSignal`, the `AsyncExit*` trampolines)
//! that let a task's callback behave like a stackless coroutine body without
//! actually suspending a native stack.
//!
//! A coroutine body is modeled here as an explicit state machine driven one
//! step per dispatch by an ordinary `Task` callback, rather than an unstable
//! generator feature, so the crate compiles on stable. See DESIGN.md for the
//! rationale.
//!
//! Each suspension point is a plain function over [`TaskCx`] that configures
//! the task (deadline/wait/signal-clear) and tells the driver whether to
//! suspend or the coroutine can keep going — an awaitable whose `suspend`
//! configures the task and whose `resume` clears that configuration, just
//! expressed without `Future`/`Poll`.

use crate::task::TaskCx;
use runtime_support::cycles::INF;

/// What a coroutine step should do next.
pub enum AsyncPoll<T> {
    /// The suspension point completed without needing to wait.
    Ready(T),
    /// The task has been configured to resume on the next dispatch that
    /// satisfies the condition; the driver must stop running the
    /// coroutine's state machine for this dispatch.
    Pending,
}

/// `AsyncYield()`: suspend unconditionally, resuming on the scheduler's
/// next dispatch of this task (honoring whatever deadline/wait/signal the
/// coroutine body set before calling this).
pub fn async_yield(cx: &mut TaskCx) {
    cx.repost();
}

/// `AsyncReceiveSignal()`: suspend until `is_signaled` is set or `deadline_ms`
/// elapses. Returns `Ready(true)` on signal, `Ready(false)` on timeout,
/// `Pending` if the coroutine must suspend and resume later.
pub fn async_receive_signal(cx: &mut TaskCx, deadline_ms: u64) -> AsyncPoll<bool> {
    if cx.receive_signal() {
        return AsyncPoll::Ready(true);
    }
    if cx.is_expired() {
        return AsyncPoll::Ready(false);
    }
    cx.set_wait();
    cx.set_deadline(deadline_ms);
    cx.repost();
    AsyncPoll::Pending
}

/// `AsyncReceiveSignal()` with no deadline: suspends until signaled only.
pub fn async_receive_signal_forever(cx: &mut TaskCx) -> AsyncPoll<bool> {
    async_receive_signal(cx, INF)
}

/// `AsyncExitDelete()`: the coroutine's final step. Destroys the state
/// machine (by virtue of the caller dropping it) and releases the task —
/// the driver must not invoke the state machine again after this returns,
/// and by construction it won't, since the trampoline does not call
/// `cx.repost()`.
pub fn async_exit_delete(_cx: &mut TaskCx) {
    // Intentionally a no-op beyond not reposting: the coroutine's owning
    // state machine is dropped by its driver once this step returns, and an
    // unreposted task is released back to whoever still holds a handle.
}

/// `AsyncExitSendSignal(s)`: trampoline that signals a user-owned signal
/// object after the coroutine frame would be destroyed, then exits exactly
/// like `AsyncExitDelete`.
pub fn async_exit_send_signal<S: Signalable>(_cx: &mut TaskCx, signal: &S) {
    signal.post_signal();
}

/// A user-owned signal object, e.g. another [`crate::task::Task`] or any
/// type a coroutine wants to notify on exit.
pub trait Signalable {
    fn post_signal(&self);
}

impl Signalable for crate::task::Task {
    fn post_signal(&self) {
        crate::task::Task::post_signal(self);
    }
}

/// `AsyncExitExec(fn)`: trampoline that invokes `fn(task)` after the
/// coroutine frame would be destroyed, then exits like `AsyncExitDelete`.
pub fn async_exit_exec<F>(cx: &mut TaskCx, f: F)
where
    F: FnOnce(&mut TaskCx),
{
    f(cx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::TaskScheduler;
    use crate::task::Task;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum State {
        Yielded,
        WaitingForSignal,
        Done,
    }

    #[test]
    fn coroutine_yields_then_waits_for_signal_then_exits() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        sched.start(1);

        let state = Arc::new(std::sync::Mutex::new(State::Yielded));
        let signal_result = Arc::new(std::sync::Mutex::new(None));
        let steps = Arc::new(AtomicUsize::new(0));

        let state_clone = Arc::clone(&state);
        let signal_result_clone = Arc::clone(&signal_result);
        let steps_clone = Arc::clone(&steps);

        let task = Task::new(move |cx: &mut TaskCx| {
            steps_clone.fetch_add(1, Ordering::SeqCst);
            let mut s = state_clone.lock().unwrap();
            match *s {
                State::Yielded => {
                    *s = State::WaitingForSignal;
                    drop(s);
                    async_yield(cx);
                }
                State::WaitingForSignal => match async_receive_signal(cx, INF) {
                    AsyncPoll::Ready(got_signal) => {
                        *signal_result_clone.lock().unwrap() = Some(got_signal);
                        *s = State::Done;
                        drop(s);
                        async_exit_delete(cx);
                    }
                    AsyncPoll::Pending => {}
                },
                State::Done => unreachable!("resumed after exit"),
            }
        });
        sched.post(&task);

        thread::sleep(Duration::from_millis(20));
        task.post_signal();

        for _ in 0..400 {
            if *state.lock().unwrap() == State::Done {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(*state.lock().unwrap(), State::Done);
        assert_eq!(*signal_result.lock().unwrap(), Some(true));
        assert!(steps.load(Ordering::SeqCst) >= 3);
        sched.stop();
    }
}
