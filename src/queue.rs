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

//! The two task queues: a lock-free multi-producer front queue that the
//! dispatcher drains in one atomic swap, and a mutex/condvar-backed ready
//! queue that workers block on.

use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::task::{Task, TaskInner};

/// Lock-light multi-producer, single-consumer intrusive stack.
///
/// Producers (any thread, including a task's own callback re-posting
/// itself) push with a CAS loop. The dispatcher is the sole consumer and
/// drains everything with one atomic swap, then reverses the resulting
/// LIFO chain so tasks are handed to the triage step in arrival order.
pub struct FrontQueue {
    head: AtomicPtr<TaskInner>,
    len: AtomicUsize,
}

impl FrontQueue {
    pub fn new() -> FrontQueue {
        FrontQueue {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Pushes `task` onto the queue. Returns `true` if the queue was empty
    /// immediately before this push, the signal callers use to decide
    /// whether the dispatcher needs waking.
    pub fn push(&self, task: Task) -> bool {
        let raw = Arc::into_raw(task.inner) as *mut TaskInner;
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            // Safety: `raw` was just produced by `Arc::into_raw` above and is
            // not yet visible to any other thread, so writing its `next`
            // link is race-free.
            unsafe { (*raw).next.store(old_head, Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                old_head,
                raw,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return old_head.is_null();
                }
                Err(_) => continue,
            }
        }
    }

    /// Best-effort snapshot of the number of tasks currently queued; may be
    /// stale the instant it returns since producers and the dispatcher's
    /// drain both run concurrently with this read.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically takes the entire queue and returns it as a `Vec<Task>` in
    /// arrival (FIFO) order. Cheap (one swap) relative to the reversal,
    /// which is O(n) pointer-chasing with no further contention since the
    /// chain is no longer reachable from `head`.
    pub fn drain(&self) -> Vec<Task> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);

        // `head` is a LIFO chain (most recently pushed first). Reverse the
        // links in place so we can walk it oldest-first below.
        let mut prev: *mut TaskInner = ptr::null_mut();
        while !head.is_null() {
            // Safety: each node was pushed via `Arc::into_raw` and is solely
            // owned by this queue until we reconstruct the `Arc` below, so
            // no other thread accesses `next` concurrently with this drain.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            unsafe { (*head).next.store(prev, Ordering::Relaxed) };
            prev = head;
            head = next;
        }

        let mut out = Vec::new();
        let mut cur = prev;
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            // Safety: reclaims the strong reference `push` leaked via
            // `Arc::into_raw`; exactly one `from_raw` per `into_raw`.
            let inner = unsafe { Arc::from_raw(cur) };
            out.push(Task { inner });
            cur = next;
        }
        self.len.fetch_sub(out.len(), Ordering::Relaxed);
        out
    }
}

impl Default for FrontQueue {
    fn default() -> FrontQueue {
        FrontQueue::new()
    }
}

// The queue only ever exposes `Task`, which is itself `Send`/`Sync` via its
// `Arc<TaskInner>`; the raw pointer arithmetic above never aliases a live
// `&TaskInner` a caller holds elsewhere.
unsafe impl Send for FrontQueue {}
unsafe impl Sync for FrontQueue {}

/// The internal FIFO of tasks due for immediate execution by workers.
///
/// Unlike the front queue this is plain mutex+condvar: the ready queue has
/// no lock-free requirement, and a condvar is the simplest way to let idle
/// workers block cheaply. Uses `parking_lot` rather than `std::sync`; see
/// DESIGN.md.
pub struct ReadyQueue {
    state: Mutex<ReadyState>,
    not_empty: Condvar,
}

struct ReadyState {
    queue: VecDeque<Task>,
    stopping: bool,
}

impl ReadyQueue {
    pub fn new() -> ReadyQueue {
        ReadyQueue {
            state: Mutex::new(ReadyState {
                queue: VecDeque::new(),
                stopping: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Appends `task`, waking one blocked worker.
    pub fn push(&self, task: Task) {
        let mut state = self.state.lock();
        state.queue.push_back(task);
        self.not_empty.notify_one();
    }

    /// Appends every task in `tasks`, in order, waking as many workers as
    /// there are newly-ready tasks.
    pub fn push_all(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut state = self.state.lock();
        let before = state.queue.len();
        state.queue.extend(tasks);
        let added = state.queue.len() - before;
        drop(state);
        for _ in 0..added {
            self.not_empty.notify_one();
        }
    }

    /// Blocks until a task is available or the queue is stopped, in which
    /// case remaining tasks are still drained (returns `Some`) until empty,
    /// then returns `None` forever after.
    pub fn pop_blocking(&self) -> Option<Task> {
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

    /// Signals every blocked worker to wake up and observe `stopping`.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopping = true;
        drop(state);
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReadyQueue {
    fn default() -> ReadyQueue {
        ReadyQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn front_queue_preserves_fifo_order_within_a_drain() {
        let q = FrontQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..5 {
            let order = Arc::clone(&order);
            tasks.push(Task::new(move |_| order.lock().push(i)));
        }
        let was_empty_first = q.push(tasks[0].clone());
        assert!(was_empty_first);
        for t in &tasks[1..] {
            assert!(!q.push(t.clone()));
        }
        let drained = q.drain();
        let drained_order: Vec<_> = drained.iter().map(|_| ()).collect();
        assert_eq!(drained_order.len(), 5);
        // Run the callbacks in drained order and check it matches push order.
        for t in &drained {
            let mut cx = crate::task::TaskCx::new(&t.inner);
            (t.inner.callback.lock().unwrap().as_mut().unwrap())(&mut cx);
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn drain_of_empty_queue_is_empty() {
        let q = FrontQueue::new();
        assert!(q.drain().is_empty());
    }

    #[test]
    fn ready_queue_pop_blocking_returns_none_after_stop() {
        let q = Arc::new(ReadyQueue::new());
        q.stop();
        assert!(q.pop_blocking().is_none());
    }

    #[test]
    fn ready_queue_drains_before_reporting_stopped() {
        let q = ReadyQueue::new();
        q.push(Task::new(|_| {}));
        q.stop();
        assert!(q.pop_blocking().is_some());
        assert!(q.pop_blocking().is_none());
    }
}
