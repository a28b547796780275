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

//! The waiting min-heap: tasks parked on a deadline, each carrying its own
//! index so it can be pulled back out (by `PostWakeup`, `PostSignal`, or
//! expiry) in O(log n) without a side table.
//!
//! The dispatcher is normally the only thread that inserts and expires, but
//! `PostSignal`/`PostWakeup` may run on any thread and need to pull a
//! specific task back out immediately, so the backing storage is a plain
//! `Mutex<Vec<Task>>` rather than thread-local state. The mutex is
//! uncontended on the dispatcher's own hot path (insert and expire happen
//! back-to-back under one lock acquisition per tick) and only briefly
//! contested by a concurrent `PostSignal`; see DESIGN.md.

use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::task::Task;

const NOT_IN_HEAP: usize = usize::MAX;

pub struct WaitingHeap {
    storage: Mutex<Vec<Task>>,
}

impl WaitingHeap {
    pub fn new() -> WaitingHeap {
        WaitingHeap {
            storage: Mutex::new(Vec::new()),
        }
    }

    /// Inserts `task`, keyed by its current deadline.
    pub fn insert(&self, task: Task) {
        let mut v = self.storage.lock().unwrap();
        let idx = v.len();
        task.inner.heap_index.store(idx, Ordering::Release);
        v.push(task);
        sift_up(&mut v, idx);
    }

    /// The smallest deadline currently parked, if any; used by the
    /// dispatcher to compute how long to sleep.
    pub fn peek_min_deadline(&self) -> Option<u64> {
        let v = self.storage.lock().unwrap();
        v.first().map(|t| t.deadline())
    }

    /// Pops every task whose deadline has elapsed as of `now`, in
    /// nondecreasing deadline order.
    pub fn pop_expired(&self, now: u64) -> Vec<Task> {
        let mut v = self.storage.lock().unwrap();
        let mut out = Vec::new();
        while let Some(top) = v.first() {
            if top.deadline() > now {
                break;
            }
            out.push(pop_min(&mut v));
        }
        out
    }

    /// Removes `task` from the heap if it is still a member, returning
    /// `true` on success. Used by `PostWakeup`/`PostSignal` to pull a task
    /// that is currently parked straight back out without waiting for its
    /// deadline.
    pub fn remove(&self, task: &Task) -> bool {
        let mut v = self.storage.lock().unwrap();
        let idx = task.inner.heap_index.load(Ordering::Acquire);
        if idx == NOT_IN_HEAP || idx >= v.len() || !Task::ptr_eq(&v[idx], task) {
            return false;
        }
        remove_at(&mut v, idx);
        true
    }

    pub fn len(&self) -> usize {
        self.storage.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WaitingHeap {
    fn default() -> WaitingHeap {
        WaitingHeap::new()
    }
}

fn parent(i: usize) -> usize {
    (i - 1) / 2
}

fn children(i: usize) -> (usize, usize) {
    (2 * i + 1, 2 * i + 2)
}

fn set_index(v: &mut [Task], i: usize) {
    v[i].inner.heap_index.store(i, Ordering::Release);
}

fn swap(v: &mut [Task], a: usize, b: usize) {
    v.swap(a, b);
    set_index(v, a);
    set_index(v, b);
}

fn sift_up(v: &mut [Task], mut i: usize) {
    while i > 0 {
        let p = parent(i);
        if v[i].deadline() < v[p].deadline() {
            swap(v, i, p);
            i = p;
        } else {
            break;
        }
    }
}

fn sift_down(v: &mut [Task], mut i: usize) {
    let len = v.len();
    loop {
        let (l, r) = children(i);
        let mut smallest = i;
        if l < len && v[l].deadline() < v[smallest].deadline() {
            smallest = l;
        }
        if r < len && v[r].deadline() < v[smallest].deadline() {
            smallest = r;
        }
        if smallest == i {
            break;
        }
        swap(v, i, smallest);
        i = smallest;
    }
}

/// Removes and returns the minimum-deadline element.
fn pop_min(v: &mut Vec<Task>) -> Task {
    let last = v.len() - 1;
    swap(v, 0, last);
    let task = v.pop().unwrap();
    task.inner.heap_index.store(NOT_IN_HEAP, Ordering::Release);
    if !v.is_empty() {
        sift_down(v, 0);
    }
    task
}

/// Removes the element at `idx`, restoring the heap property.
fn remove_at(v: &mut Vec<Task>, idx: usize) -> Task {
    let last = v.len() - 1;
    if idx != last {
        swap(v, idx, last);
    }
    let task = v.pop().unwrap();
    task.inner.heap_index.store(NOT_IN_HEAP, Ordering::Release);
    if idx < v.len() {
        sift_down(v, idx);
        sift_up(v, idx);
    }
    task
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_expired_in_nondecreasing_deadline_order() {
        let heap = WaitingHeap::new();
        for d in [50u64, 10, 30, 20, 40] {
            let t = Task::new(|_| {});
            t.set_deadline(d);
            heap.insert(t);
        }
        let expired = heap.pop_expired(100);
        let deadlines: Vec<_> = expired.iter().map(|t| t.deadline()).collect();
        assert_eq!(deadlines, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn pop_expired_respects_now_cutoff() {
        let heap = WaitingHeap::new();
        let a = Task::new(|_| {});
        a.set_deadline(10);
        let b = Task::new(|_| {});
        b.set_deadline(1000);
        heap.insert(a);
        heap.insert(b);
        let expired = heap.pop_expired(500);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].deadline(), 10);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn remove_pulls_a_specific_task_out_early() {
        let heap = WaitingHeap::new();
        let a = Task::new(|_| {});
        a.set_deadline(10);
        let b = Task::new(|_| {});
        b.set_deadline(20);
        let c = Task::new(|_| {});
        c.set_deadline(30);
        heap.insert(a.clone());
        heap.insert(b.clone());
        heap.insert(c.clone());

        assert!(heap.remove(&b));
        assert!(!heap.remove(&b)); // already removed
        assert_eq!(heap.len(), 2);

        let expired = heap.pop_expired(u64::MAX);
        let deadlines: Vec<_> = expired.iter().map(|t| t.deadline()).collect();
        assert_eq!(deadlines, vec![10, 30]);
    }
}
