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

//! BSD/macOS readiness backend: `kqueue` with `EV_CLEAR` (edge-triggered),
//! woken early by an `EVFILT_USER` event for `interrupt_wait` (no portable
//! eventfd on this platform family, so we use kqueue's own user-event
//! filter instead, the same trick `mio` uses here).

use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::event::{kevent_ts, kqueue, EventFilter, EventFlag, FilterFlag, KEvent};
use nix::sys::time::TimeSpec;

use runtime_support::error::Result;

use super::{Backend, Notification};
use crate::iotask::RawSocket;

/// Arbitrary identifier for the user-event filter used to interrupt a
/// blocked `wait`. Socket file descriptors never collide with this since
/// kqueue keys its filters by `(ident, filter)` pairs, not `ident` alone.
const WAKEUP_IDENT: usize = 0;

pub struct KqueueBackend {
    /// Closes the kqueue descriptor on drop; no separate `Drop` impl needed.
    kq: OwnedFd,
}

impl Backend for KqueueBackend {
    fn create() -> Result<KqueueBackend> {
        let kq = kqueue()?;
        let register = KEvent::new(
            WAKEUP_IDENT,
            EventFilter::EVFILT_USER,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR,
            FilterFlag::empty(),
            0,
            0,
        );
        kevent_ts(kq.as_raw_fd(), &[register], &mut [], None)?;
        Ok(KqueueBackend { kq })
    }

    fn register_socket(&self, task_id: u64, socket: RawSocket) -> Result<()> {
        let ident = socket as usize;
        let changes = [
            KEvent::new(
                ident,
                EventFilter::EVFILT_READ,
                EventFlag::EV_ADD | EventFlag::EV_CLEAR,
                FilterFlag::empty(),
                0,
                task_id as isize,
            ),
            KEvent::new(
                ident,
                EventFilter::EVFILT_WRITE,
                EventFlag::EV_ADD | EventFlag::EV_CLEAR,
                FilterFlag::empty(),
                0,
                task_id as isize,
            ),
        ];
        kevent_ts(self.kq.as_raw_fd(), &changes, &mut [], None)?;
        Ok(())
    }

    fn deregister_socket(&self, socket: RawSocket) -> Result<()> {
        let ident = socket as usize;
        let changes = [
            KEvent::new(
                ident,
                EventFilter::EVFILT_READ,
                EventFlag::EV_DELETE,
                FilterFlag::empty(),
                0,
                0,
            ),
            KEvent::new(
                ident,
                EventFilter::EVFILT_WRITE,
                EventFlag::EV_DELETE,
                FilterFlag::empty(),
                0,
                0,
            ),
        ];
        // Either filter may already be gone if the peer reset the
        // connection; a partial failure here isn't actionable by the
        // caller, who is closing the socket right after.
        let _ = kevent_ts(self.kq.as_raw_fd(), &changes, &mut [], None);
        Ok(())
    }

    fn wait(&self, timeout_ms: Option<u64>) -> Result<Vec<Notification>> {
        let timeout = timeout_ms.map(|ms| TimeSpec::from_duration(std::time::Duration::from_millis(ms)));
        let mut events = [KEvent::new(
            0,
            EventFilter::EVFILT_READ,
            EventFlag::empty(),
            FilterFlag::empty(),
            0,
            0,
        ); 256];
        let n = kevent_ts(self.kq.as_raw_fd(), &[], &mut events, timeout)?;

        let mut out: Vec<Notification> = Vec::with_capacity(n);
        for ev in &events[..n] {
            if ev.filter() == Ok(EventFilter::EVFILT_USER) {
                continue;
            }
            let task_id = ev.udata() as u64;
            let readable = ev.filter() == Ok(EventFilter::EVFILT_READ);
            let writable = ev.filter() == Ok(EventFilter::EVFILT_WRITE);
            let error = ev.flags().contains(EventFlag::EV_ERROR) || ev.flags().contains(EventFlag::EV_EOF);

            if let Some(existing) = out.iter_mut().find(|n: &&mut Notification| n.task_id == task_id) {
                existing.readable |= readable;
                existing.writable |= writable;
                existing.error |= error;
            } else {
                out.push(Notification {
                    task_id,
                    readable,
                    writable,
                    error,
                });
            }
        }
        Ok(out)
    }

    fn interrupt_wait(&self) -> Result<()> {
        let trigger = KEvent::new(
            WAKEUP_IDENT,
            EventFilter::EVFILT_USER,
            EventFlag::empty(),
            FilterFlag::NOTE_TRIGGER,
            0,
            0,
        );
        kevent_ts(self.kq.as_raw_fd(), &[trigger], &mut [], None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_interrupt_round_trip() {
        let backend = KqueueBackend::create().expect("kqueue create");
        backend.interrupt_wait().expect("interrupt");
        let notifications = backend.wait(Some(100)).expect("wait");
        assert!(notifications.is_empty());
    }
}
