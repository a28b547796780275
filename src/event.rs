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

//! The per-operation event record. One `enum` covers the three backend
//! shapes so `IoCore` stays backend-generic: completion-port
//! (overlapped + list link), completion-ring (opcode + params + backpointer
//! + link), and readiness (byte-count-or-error + locked flag).

use runtime_support::error::Error;

/// Which operation an `IoEvent` belongs to. Shared across backends so the
/// subscriber-facing `EventArgs` can report it uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Send,
    Recv,
    Connect,
    Accept,
    /// Completion-ring only: cancellation of an in-flight op.
    Cancel,
}

/// The outcome of a readiness-backend or completion-backend operation, as
/// seen by the subscriber once an event is unlocked.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    /// No result yet; equivalent to the readiness "locked" state observed
    /// mid-dispatch, exposed here only for backend-internal bookkeeping.
    Empty,
    /// Operation completed; `bytes` transferred (0 for connect/accept).
    Bytes(usize),
    /// Operation failed; carries the originating error.
    Error(Error),
}

impl EventOutcome {
    pub fn is_empty(&self) -> bool {
        matches!(self, EventOutcome::Empty)
    }
}

/// Readiness-backend event state (epoll/kqueue): at most one of {empty,
/// byte-count, error} plus the locked flag.
#[derive(Debug, Clone)]
pub struct ReadinessEvent {
    pub op: OpKind,
    outcome: EventOutcome,
    locked: bool,
}

impl ReadinessEvent {
    pub fn new(op: OpKind) -> ReadinessEvent {
        ReadinessEvent {
            op,
            outcome: EventOutcome::Empty,
            locked: false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn outcome(&self) -> &EventOutcome {
        &self.outcome
    }

    /// Locks the event: an operation is now outstanding (`EWOULDBLOCK` was
    /// observed). Only the I/O pipeline may unlock it again.
    pub fn lock(&mut self) {
        debug_assert!(!self.locked, "double-lock of an IoEvent");
        self.locked = true;
        self.outcome = EventOutcome::Empty;
    }

    /// Unlocks the event with a completed outcome. Called only from the
    /// dispatcher's readiness-edge handling, never by the owning subscriber.
    pub fn unlock_with(&mut self, outcome: EventOutcome) {
        self.locked = false;
        self.outcome = outcome;
    }

    /// `Reset()`: returns the event to empty+unlocked.
    pub fn reset(&mut self) {
        self.locked = false;
        self.outcome = EventOutcome::Empty;
    }
}

/// Completion-ring event: an opcode, a backpointer to the owning task (kept
/// as an opaque `u64` id rather than a raw pointer so this type stays
/// `Send` without depending on `IoTask`'s definition), and a list link used
/// while queued on a task's `to_submit_events`/`pending_events` lists.
#[derive(Debug, Clone)]
pub struct RingEvent {
    pub op: OpKind,
    pub task_id: u64,
    outcome: EventOutcome,
    pub(crate) next: Option<Box<RingEvent>>,
}

impl RingEvent {
    pub fn new(op: OpKind, task_id: u64) -> RingEvent {
        RingEvent {
            op,
            task_id,
            outcome: EventOutcome::Empty,
            next: None,
        }
    }

    pub fn outcome(&self) -> &EventOutcome {
        &self.outcome
    }

    pub fn complete(&mut self, outcome: EventOutcome) {
        self.outcome = outcome;
    }

    pub fn reset(&mut self) {
        self.outcome = EventOutcome::Empty;
    }
}

/// Completion-port event: wraps the platform overlapped structure. The
/// `windows-sys` `OVERLAPPED` type isn't `Send`/`Sync` on its own since it's
/// a bag of kernel-owned bytes the OS writes into asynchronously; we assert
/// single-owner discipline the same way the rest of `IoTask` does and wrap
/// it here so the rest of the core never touches the raw structure.
#[cfg(windows)]
#[derive(Debug)]
pub struct PortEvent {
    pub op: OpKind,
    outcome: EventOutcome,
    pub(crate) overlapped: Box<crate::backend::iocp::RawOverlapped>,
}

#[cfg(windows)]
impl PortEvent {
    pub fn new(op: OpKind) -> PortEvent {
        PortEvent {
            op,
            outcome: EventOutcome::Empty,
            overlapped: Box::default(),
        }
    }

    pub fn outcome(&self) -> &EventOutcome {
        &self.outcome
    }

    pub fn complete(&mut self, outcome: EventOutcome) {
        self.outcome = outcome;
    }

    pub fn reset(&mut self) {
        self.outcome = EventOutcome::Empty;
    }
}

/// The event shape actually used by a given task, selected by whichever
/// backend attached it. Readiness backends use two (`in`/`out`)
/// [`ReadinessEvent`]s per task rather than this wrapper; this enum exists
/// for completion backends, which hand a heterogeneous batch of completed
/// operations to the dispatcher in one kernel wait.
#[derive(Debug, Clone)]
pub enum IoEvent {
    Ring(RingEvent),
    #[cfg(windows)]
    Port(PortEventHandle),
}

#[cfg(windows)]
pub type PortEventHandle = std::sync::Arc<std::sync::Mutex<PortEvent>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_event_reset_clears_lock_and_outcome() {
        let mut ev = ReadinessEvent::new(OpKind::Recv);
        ev.lock();
        assert!(ev.is_locked());
        ev.unlock_with(EventOutcome::Bytes(42));
        assert!(!ev.is_locked());
        ev.reset();
        assert!(ev.outcome().is_empty());
        assert!(!ev.is_locked());
    }

    #[test]
    fn ring_event_carries_task_id_and_opcode() {
        let mut ev = RingEvent::new(OpKind::Accept, 7);
        assert_eq!(ev.task_id, 7);
        ev.complete(EventOutcome::Bytes(0));
        assert!(matches!(ev.outcome(), EventOutcome::Bytes(0)));
    }
}
