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

//! The consumer-facing contract of `IoCore`. A subscriber is a
//! shared-refcounted object `IoCore` calls back into exactly once per
//! dispatch; TLS handshakes, HTTP framing, and DNS resolution all live on
//! the far side of this trait and are out of scope here.

use crate::event::{OpKind, ReadinessEvent};
use crate::iotask::IoTask;

/// What a subscriber is told about a single dispatch.
pub struct EventArgs<'a> {
    pub task: &'a IoTask,
    /// Readiness backends report these two directly; completion backends
    /// fold their per-op completions into the same shape so one subscriber
    /// implementation can target every backend.
    pub readable: Option<&'a ReadinessEvent>,
    pub writable: Option<&'a ReadinessEvent>,
    /// `true` on exactly the terminal dispatch after `PostClose` has
    /// finished draining.
    pub is_closed: bool,
}

impl<'a> EventArgs<'a> {
    pub fn event_for(&self, op: OpKind) -> Option<&'a ReadinessEvent> {
        match op {
            OpKind::Recv | OpKind::Accept => self.readable,
            OpKind::Send | OpKind::Connect => self.writable,
            OpKind::Cancel => None,
        }
    }
}

/// A shared-refcounted event handler attached to exactly one [`IoTask`] for
/// its lifetime. Invoked on the dispatcher's worker pool, never
/// concurrently with itself for the same task (the task's `IN_EXEC`-style
/// status excludes re-entry).
pub trait Subscriber: Send + Sync {
    /// Handles one dispatch's worth of events. Must tolerate spurious
    /// wakeups (a locked event means "not yet") and must not block on
    /// another task owned by the same `IoCore` (risk of pool exhaustion
    /// deadlock).
    fn on_event(&self, args: EventArgs<'_>);
}
