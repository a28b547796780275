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

//! The configuration surface recognized at construction time.
//!
//! Neither `TaskScheduler` nor `IoCore` ever reads environment variables or
//! on-disk state themselves; a host process may load one of these from TOML
//! (hence the `serde`/`toml` dependency), but that is a convenience for the
//! embedder, not a responsibility of the runtime core.

use serde::Deserialize;

/// Configuration accepted by [`crate::scheduler::TaskScheduler::new`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Debug label used to name the dispatcher/worker threads.
    pub name: String,
    /// Batch size hint used when flushing the front queue to the ready
    /// queue.
    pub sub_queue_size: usize,
    /// Worker thread count to pass to [`crate::scheduler::TaskScheduler::start`]
    /// when this config was loaded from TOML by the embedder. `start` still
    /// takes its worker count as an explicit argument rather than reading
    /// this field itself, so a caller building a scheduler from a config
    /// loaded at runtime is expected to forward `config.thread_count` on.
    pub thread_count: usize,
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            name: "task-scheduler".to_string(),
            sub_queue_size: 32,
            thread_count: 1,
        }
    }
}

/// Configuration accepted by [`crate::iocore::IoCore::new`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IoCoreConfig {
    pub name: String,
    pub sub_queue_size: usize,
    /// Worker thread count to forward to [`crate::iocore::IoCore::start`];
    /// see [`SchedulerConfig::thread_count`] for why `start` takes this as
    /// an explicit argument rather than reading the config itself.
    pub thread_count: usize,
}

impl Default for IoCoreConfig {
    fn default() -> IoCoreConfig {
        IoCoreConfig {
            name: "iocore".to_string(),
            sub_queue_size: 32,
            thread_count: 1,
        }
    }
}
