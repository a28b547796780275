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

//! An opaque byte container passed through I/O calls.
//!
//! `Buffer` deliberately knows nothing about framing, TLS records or
//! application protocols — those live in `TCPSocketIFace`/`SSLSocket`-style
//! consumers built on top of this crate, not here. It exists only so that
//! `send`/`recv` call sites and `EventArgs` have something concrete to move
//! bytes around in.

use bytes::BytesMut;

/// A growable byte buffer, opaque to the scheduler and I/O core.
#[derive(Debug, Default)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    /// Creates an empty buffer with room for `capacity` bytes before it
    /// needs to reallocate.
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    /// Returns the number of readable bytes currently in the buffer.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Borrows the buffer's contents for a `recv`-style syscall to write
    /// into; the caller is responsible for calling [`Buffer::truncate_to`]
    /// with the old length plus however many bytes were actually written.
    pub fn spare_capacity_mut(&mut self, at_least: usize) -> &mut [u8] {
        if self.inner.capacity() - self.inner.len() < at_least {
            self.inner.reserve(at_least);
        }
        let len = self.inner.len();
        unsafe {
            self.inner.set_len(len + at_least);
        }
        &mut self.inner[len..len + at_least]
    }

    /// Shrinks the buffer back down after a short read into spare capacity.
    pub fn truncate_to(&mut self, len: usize) {
        self.inner.truncate(len);
    }

    /// Returns the readable bytes as a slice, for a `send`-style syscall.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Appends bytes to the buffer, growing it as needed.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.inner.extend_from_slice(data);
    }

    /// Drops the first `count` bytes, e.g. after they were sent out.
    pub fn consume(&mut self, count: usize) {
        let _ = self.inner.split_to(count.min(self.inner.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_and_consume_round_trip() {
        let mut b = Buffer::with_capacity(16);
        b.extend_from_slice(b"hello world");
        assert_eq!(b.len(), 11);
        b.consume(6);
        assert_eq!(b.as_slice(), b"world");
    }
}
