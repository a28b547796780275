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

//! A monotonic millisecond clock shared by the scheduler and the I/O core.
//!
//! Deadlines throughout this crate are absolute monotonic milliseconds since
//! an arbitrary, process-wide epoch established the first time [`now_ms`] is
//! called. `INF` is the sentinel for "no deadline".

use std::sync::OnceLock;
use std::time::Instant;

/// Sentinel deadline meaning "never expires".
pub const INF: u64 = u64::MAX;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Returns the current time as monotonic milliseconds since process start.
///
/// Safe to call from any thread; the epoch is established lazily on first
/// use and shared by every caller for the lifetime of the process.
#[inline]
pub fn now_ms() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

/// Adds a millisecond delay to `now_ms()`, saturating at `INF` rather than
/// overflowing if the caller passes an absurdly large delay.
#[inline]
pub fn deadline_after_ms(delay_ms: u64) -> u64 {
    now_ms().saturating_add(delay_ms)
}

/// A small running-average latency counter, used by the dispatcher to flag
/// ticks or callbacks that run long enough to threaten other tasks' deadlines.
/// Measures wall-clock milliseconds via [`now_ms`] rather than raw CPU
/// cycles, since the runtime must behave identically across architectures.
pub struct LatencyCounter {
    total_ms: u64,
    start_ms: u64,
    run_count: u64,
    log_every: u64,
}

impl LatencyCounter {
    /// Creates a counter that logs its running average every `log_every`
    /// samples. `log_every == 0` disables periodic logging entirely.
    pub fn new(log_every: u64) -> LatencyCounter {
        LatencyCounter {
            total_ms: 0,
            start_ms: 0,
            run_count: 0,
            log_every,
        }
    }

    /// Marks the start of a measured interval.
    pub fn start(&mut self) {
        self.start_ms = now_ms();
    }

    /// Marks the end of a measured interval, returning its length in ms.
    pub fn stop(&mut self) -> u64 {
        let elapsed = now_ms().saturating_sub(self.start_ms);
        self.total_ms += elapsed;
        self.run_count += 1;
        if self.log_every != 0 && self.run_count == self.log_every {
            log::debug!(
                "average latency over {} samples: {} ms",
                self.run_count,
                self.total_ms / self.run_count.max(1)
            );
            self.run_count = 0;
            self.total_ms = 0;
        }
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic_nondecreasing() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn deadline_after_saturates() {
        assert_eq!(deadline_after_ms(INF), INF);
    }

    #[test]
    fn latency_counter_measures_positive_elapsed() {
        let mut c = LatencyCounter::new(0);
        c.start();
        let elapsed = c.stop();
        assert!(elapsed < 1000);
    }
}
