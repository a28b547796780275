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

//! The cooperative, multi-threaded task executor.
//!
//! One dispatcher thread owns the front queue, the waiting heap and the
//! timing decisions; a pool of worker threads pull ready tasks and run
//! their callbacks to completion, one at a time, per worker.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use runtime_support::cycles::{now_ms, LatencyCounter, INF};

use crate::config::SchedulerConfig;
use crate::heap::WaitingHeap;
use crate::queue::{FrontQueue, ReadyQueue};
use crate::task::{Task, TaskCx, TaskStatus, TaskWakeHook};

const MAX_SLEEP_MS: u64 = 60_000;

/// Dispatcher logs its running average tick latency every this many ticks.
const TICK_LOG_EVERY: u64 = 1_000;

thread_local! {
    static CURRENT_TASK: RefCell<Option<Task>> = RefCell::new(None);
}

/// Returns the task currently executing on this worker thread, if any.
/// Lets code that may run either inside or outside a dispatch (e.g. a fast
/// send/recv path) tell whether it's already in worker context.
pub fn current_task() -> Option<Task> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

/// `IsInWorkerNow()`: true if called from a thread currently running a
/// scheduler callback.
pub fn is_in_worker_now() -> bool {
    CURRENT_TASK.with(|c| c.borrow().is_some())
}

struct SchedulerShared {
    front: FrontQueue,
    ready: ReadyQueue,
    heap: WaitingHeap,
    dispatch_lock: Mutex<()>,
    dispatch_cv: Condvar,
    stopping: AtomicBool,
    config: SchedulerConfig,
    tick_latency: Mutex<LatencyCounter>,
}

impl SchedulerShared {
    fn wake_dispatcher(&self) {
        let _guard = self.dispatch_lock.lock().unwrap();
        self.dispatch_cv.notify_all();
    }

    fn push_front(&self, task: Task) {
        if self.front.push(task) {
            self.wake_dispatcher();
        }
    }

    /// Shared routing logic behind every `Post*` entry point: merges the
    /// deadline (additive-minimum), then moves the task towards the front
    /// queue unless it is already queued, ready, or mid-execution.
    fn post_internal(&self, task: &Task, deadline: Option<u64>) {
        if let Some(d) = deadline {
            task.set_deadline(d);
        }
        loop {
            match task.status() {
                TaskStatus::Pending => {
                    if task.inner.cas_status(TaskStatus::Pending, TaskStatus::InFrontQueue) {
                        self.push_front(task.clone());
                        return;
                    }
                }
                TaskStatus::InWaiting => {
                    if task.inner.cas_status(TaskStatus::InWaiting, TaskStatus::InFrontQueue) {
                        self.heap.remove(task);
                        self.push_front(task.clone());
                        return;
                    }
                }
                // Already queued or about to run: posting again while
                // pending is idempotent.
                TaskStatus::InFrontQueue | TaskStatus::Ready => return,
                // Reentrant post while the task's own callback (or another
                // thread) posts it again during its current run.
                TaskStatus::InExec => {
                    task.inner.repost_while_exec.store(true, Ordering::Release);
                    return;
                }
            }
        }
    }

    /// `PostWakeup`: forces `Pending`/`InWaiting` straight to `Ready`
    /// regardless of deadline or wait flag; guarantees one more run if the
    /// task is already `Ready`/`InExec`.
    fn post_wakeup(&self, task: &Task) {
        loop {
            match task.status() {
                TaskStatus::Pending => {
                    if task.inner.cas_status(TaskStatus::Pending, TaskStatus::Ready) {
                        self.ready.push(task.clone());
                        return;
                    }
                }
                TaskStatus::InWaiting => {
                    if task.inner.cas_status(TaskStatus::InWaiting, TaskStatus::Ready) {
                        self.heap.remove(task);
                        self.ready.push(task.clone());
                        return;
                    }
                }
                TaskStatus::InFrontQueue | TaskStatus::Ready => return,
                TaskStatus::InExec => {
                    task.inner.repost_while_exec.store(true, Ordering::Release);
                    return;
                }
            }
        }
    }

    /// One dispatcher tick: drain + triage the front queue, then expire due
    /// timers out of the waiting heap.
    fn tick(self: &Arc<Self>, now: u64) {
        for task in self.front.drain() {
            let run_now = task.deadline() <= now || !task.is_waiting_flag() || task.is_signaled();
            if run_now {
                task.inner.set_status(TaskStatus::Ready);
                self.ready.push(task);
            } else {
                task.set_wake_hook(Arc::clone(self) as Arc<dyn TaskWakeHook>);
                task.inner.set_status(TaskStatus::InWaiting);
                self.heap.insert(task);
            }
        }

        for task in self.heap.pop_expired(now) {
            task.set_expired(true);
            task.inner.set_status(TaskStatus::Ready);
            self.ready.push(task);
        }
    }

    /// Shutdown drain: every front-queued task and
    /// every still-parked task is forced to `Ready` exactly once, ignoring
    /// wait flags and remaining deadlines ("long waits are truncated to
    /// immediate"), then the ready queue is closed so workers drain the
    /// remainder and exit.
    fn final_drain(&self) {
        for task in self.front.drain() {
            task.inner.set_status(TaskStatus::Ready);
            self.ready.push(task);
        }
        for task in self.heap.pop_expired(u64::MAX) {
            task.set_expired(true);
            task.inner.set_status(TaskStatus::Ready);
            self.ready.push(task);
        }
        self.ready.stop();
    }
}

impl TaskWakeHook for SchedulerShared {
    fn force_ready(&self, task: &Task) {
        if task.inner.cas_status(TaskStatus::InWaiting, TaskStatus::Ready) {
            self.heap.remove(task);
            self.ready.push(task.clone());
        }
    }
}

/// A cooperative, multi-threaded task scheduler: one dispatcher thread plus
/// a configurable worker pool.
pub struct TaskScheduler {
    shared: Arc<SchedulerShared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl TaskScheduler {
    /// Creates a scheduler with the given configuration. No threads are
    /// started until [`TaskScheduler::start`] is called.
    pub fn new(config: SchedulerConfig) -> Arc<TaskScheduler> {
        Arc::new(TaskScheduler {
            shared: Arc::new(SchedulerShared {
                front: FrontQueue::new(),
                ready: ReadyQueue::new(),
                heap: WaitingHeap::new(),
                dispatch_lock: Mutex::new(()),
                dispatch_cv: Condvar::new(),
                stopping: AtomicBool::new(false),
                config,
                tick_latency: Mutex::new(LatencyCounter::new(TICK_LOG_EVERY)),
            }),
            dispatcher: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// `Start(n)`: spawns `n` worker threads plus the one dispatcher
    /// thread. Calling this more than once is a programmer error.
    pub fn start(self: &Arc<TaskScheduler>, worker_count: usize) {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "TaskScheduler::start called twice"
        );

        let dispatcher_shared = Arc::clone(&self.shared);
        let name = self.shared.config.name.clone();
        let dispatcher = thread::Builder::new()
            .name(format!("{name}-dispatch"))
            .spawn(move || dispatcher_loop(dispatcher_shared))
            .expect("failed to spawn dispatcher thread");
        *self.dispatcher.lock().unwrap() = Some(dispatcher);

        let mut workers = self.workers.lock().unwrap();
        for i in 0..worker_count {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
    }

    /// `Post(task)`: queues `task`, merging in whatever deadline it already
    /// had set via `set_deadline`/`set_delay`.
    pub fn post(&self, task: &Task) {
        self.shared.post_internal(task, None);
    }

    /// `PostDelay(task, ms)`: queues `task` with deadline `now + ms`,
    /// merged as the additive minimum with any existing deadline.
    pub fn post_delay(&self, task: &Task, delay_ms: u64) {
        self.shared
            .post_internal(task, Some(now_ms().saturating_add(delay_ms)));
    }

    /// `PostDeadline(task, t)`: queues `task` with absolute deadline `t`,
    /// merged as the additive minimum with any existing deadline.
    pub fn post_deadline(&self, task: &Task, deadline_ms: u64) {
        self.shared.post_internal(task, Some(deadline_ms));
    }

    /// `PostWait(task)`: queues `task` with the wait flag set — its
    /// callback will not run again on a mere reschedule, only via deadline,
    /// signal, or explicit wakeup.
    pub fn post_wait(&self, task: &Task) {
        task.inner.is_waiting.store(true, Ordering::Release);
        self.shared.post_internal(task, None);
    }

    /// `PostOneShot(callback)`: runs a transient, self-contained callback
    /// exactly once, then releases it. `callback` gets no `Task` handle of
    /// its own; it cannot repost itself.
    pub fn post_one_shot<F>(&self, callback: F)
    where
        F: FnOnce(&mut TaskCx) + Send + 'static,
    {
        let mut callback = Some(callback);
        let task = Task::new(move |cx: &mut TaskCx| {
            if let Some(callback) = callback.take() {
                callback(cx);
            }
        });
        self.post(&task);
    }

    /// `PostWakeup()` on `task`: forces it from `Pending`/`InWaiting`
    /// straight to `Ready`; guarantees one more execution if it is already
    /// `Ready`/`InExec`.
    pub fn post_wakeup(&self, task: &Task) {
        self.shared.post_wakeup(task);
    }

    /// Best-effort snapshot of the number of tasks currently owned by this
    /// scheduler (front queue + ready queue + waiting heap). The three
    /// counts are sampled independently and may be inconsistent with one
    /// another under concurrent activity; for diagnostics only.
    pub fn pending_count(&self) -> usize {
        self.shared.front.len() + self.shared.ready.len() + self.shared.heap.len()
    }

    /// Drains all outstanding work once and joins every thread this
    /// scheduler owns. Idempotent; safe to call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.wake_dispatcher();

        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatcher_loop(shared: Arc<SchedulerShared>) {
    log::debug!("dispatcher '{}' started", shared.config.name);
    loop {
        shared.tick_latency.lock().unwrap().start();
        shared.tick(now_ms());
        shared.tick_latency.lock().unwrap().stop();

        if shared.stopping.load(Ordering::Acquire) {
            shared.final_drain();
            break;
        }

        let now = now_ms();
        let timeout_ms = match shared.heap.peek_min_deadline() {
            Some(deadline) if deadline != INF => deadline.saturating_sub(now).min(MAX_SLEEP_MS),
            _ => MAX_SLEEP_MS,
        };
        let guard = shared.dispatch_lock.lock().unwrap();
        if shared.stopping.load(Ordering::Acquire) {
            continue;
        }
        let _ = shared
            .dispatch_cv
            .wait_timeout(guard, Duration::from_millis(timeout_ms.max(1)))
            .unwrap();
    }
    log::debug!("dispatcher '{}' stopped", shared.config.name);
}

fn worker_loop(shared: Arc<SchedulerShared>) {
    loop {
        let task = match shared.ready.pop_blocking() {
            Some(task) => task,
            None => break,
        };

        CURRENT_TASK.with(|c| *c.borrow_mut() = Some(task.clone()));
        task.inner.set_status(TaskStatus::InExec);
        task.clear_waiting_flag();

        {
            let mut cx = TaskCx::new(&task.inner);
            // Take the callback out before running it (rather than holding
            // the lock across the call) so that a callback which replaces
            // itself via `TaskCx::set_callback` doesn't deadlock on its own
            // task's callback mutex.
            let mut callback = task.inner.callback.lock().unwrap().take();
            if let Some(cb) = &mut callback {
                cb(&mut cx);
            }
            let mut slot = task.inner.callback.lock().unwrap();
            if slot.is_none() {
                // Nothing installed a replacement mid-run; put the
                // original callback back so it runs again next dispatch.
                *slot = callback;
            }
        }

        task.set_expired(false);
        CURRENT_TASK.with(|c| *c.borrow_mut() = None);

        let repost = task.inner.repost_while_exec.swap(false, Ordering::AcqRel);
        if repost {
            task.inner.set_status(TaskStatus::InFrontQueue);
            shared.push_front(task);
        } else {
            task.inner.set_status(TaskStatus::Pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Barrier;
    use std::time::Instant;

    #[test]
    fn simple_dispatch_runs_the_callback() {
        let sched = TaskScheduler::new(SchedulerConfig {
            sub_queue_size: 5,
            ..Default::default()
        });
        sched.start(1);

        let result = Arc::new(AtomicI32::new(0));
        let result_clone = Arc::clone(&result);
        let task = Task::new(move |_| {
            result_clone.store(1, Ordering::SeqCst);
        });
        sched.post(&task);

        // Give the worker a moment to run.
        for _ in 0..200 {
            if result.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(result.load(Ordering::SeqCst), 1);
        sched.stop();
    }

    #[test]
    fn three_step_chain_preserves_order_on_one_worker() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        sched.start(1);

        let counter = Arc::new(AtomicI32::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let counter_clone = Arc::clone(&counter);
        let order_clone = Arc::clone(&order);
        let task = Task::new(move |cx| {
            let n = counter_clone.fetch_add(1, Ordering::SeqCst) + 1;
            order_clone.lock().unwrap().push(n);
            if n < 3 {
                cx.repost();
            }
        });
        sched.post(&task);

        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        sched.stop();
    }

    #[test]
    fn delay_is_respected() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        sched.start(1);

        let ran_at = Arc::new(Mutex::new(None));
        let ran_at_clone = Arc::clone(&ran_at);
        let t0 = Instant::now();
        let task = Task::new(move |_| {
            *ran_at_clone.lock().unwrap() = Some(Instant::now());
        });
        task.set_delay(5);
        sched.post(&task);

        for _ in 0..400 {
            if ran_at.lock().unwrap().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let elapsed = ran_at.lock().unwrap().unwrap() - t0;
        assert!(elapsed >= Duration::from_millis(5));
        sched.stop();
    }

    #[test]
    fn signal_wakes_a_waiter() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        sched.start(1);

        let observed = Arc::new(Mutex::new(None));
        let barrier = Arc::new(Barrier::new(2));

        let observed_clone = Arc::clone(&observed);
        let barrier_clone = Arc::clone(&barrier);
        let task = Task::new(move |cx| {
            barrier_clone.wait();
            *observed_clone.lock().unwrap() = Some((cx.receive_signal(), cx.is_expired()));
        });
        task.set_deadline(INF);
        sched.post_wait(&task);

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        task.post_signal();

        for _ in 0..400 {
            if observed.lock().unwrap().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(*observed.lock().unwrap(), Some((true, false)));
        sched.stop();
    }

    #[test]
    fn wakeup_without_signal_is_observed_as_such() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        sched.start(1);

        let observed = Arc::new(Mutex::new(None));
        let observed_clone = Arc::clone(&observed);
        let task = Task::new(move |cx| {
            *observed_clone.lock().unwrap() = Some((cx.receive_signal(), cx.is_expired()));
        });
        task.set_deadline(INF);
        sched.post_wait(&task);

        thread::sleep(Duration::from_millis(20));
        sched.post_wakeup(&task);

        for _ in 0..400 {
            if observed.lock().unwrap().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(*observed.lock().unwrap(), Some((false, false)));
        sched.stop();
    }

    #[test]
    fn pending_wakeup_is_a_harmless_extra_enqueue() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        sched.start(1);
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let task = Task::new(move |_| ran_clone.store(true, Ordering::SeqCst));
        // Task was never posted: status is Pending. PostWakeup must still
        // guarantee a run.
        sched.post_wakeup(&task);
        for _ in 0..200 {
            if ran.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(ran.load(Ordering::SeqCst));
        sched.stop();
    }
}
