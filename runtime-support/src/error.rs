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

//! The error taxonomy shared between the scheduler and the I/O core.
//!
//! The core never throws, unwinds, or logs-and-swallows: every fallible
//! boundary call returns one of these variants, and every I/O event carries
//! at most one error value in its error slot.

use std::io;

/// Errors the runtime core can surface at one of its boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A would-block, aborted-peer-during-accept, or connect-in-progress
    /// condition. The core retries internally (`Reschedule`) or keeps the
    /// event locked; this variant should rarely escape to a subscriber.
    #[error("transient I/O condition: {0}")]
    Transient(#[source] io::Error),

    /// A non-recoverable I/O failure (bad descriptor, permission denied,
    /// address already in use, ...). Surfaced to the subscriber via an
    /// event's error slot.
    #[error("fatal I/O error: {0}")]
    Fatal(#[source] io::Error),

    /// A contract violation by the embedding program: deleting a task while
    /// it is executing, calling close before attach, double-closing past the
    /// close guard, and similar. The core does not attempt to recover from
    /// these; callers that construct this variant are expected to have
    /// already asserted or panicked at the call site.
    #[error("programmer error: {0}")]
    ProgrammerError(&'static str),

    /// The scheduler or I/O core was torn down while the operation was
    /// still outstanding; any events still locked at that point are unlocked
    /// with this value and delivered in the terminal dispatch.
    #[error("aborted by shutdown")]
    Aborted,
}

impl Error {
    /// True for the category that the I/O pipeline retries on its own
    /// without surfacing to the subscriber.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        use io::ErrorKind::*;
        match e.kind() {
            WouldBlock | Interrupted => Error::Transient(e),
            _ => Error::Fatal(e),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Error {
        Error::from(io::Error::from(e))
    }
}

/// Convenience alias used throughout the crate's public boundary calls.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_transient() {
        let e: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(e.is_transient());
    }

    #[test]
    fn permission_denied_is_fatal() {
        let e: Error = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(!e.is_transient());
        assert!(matches!(e, Error::Fatal(_)));
    }
}
