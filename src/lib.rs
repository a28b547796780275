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

//! `mg-aio`: a cooperative task scheduler (`TaskScheduler`) paired with a
//! multi-backend asynchronous socket-I/O core (`IoCore`).
//!
//! The two halves are independent: a program can use `TaskScheduler` alone
//! to run plain callbacks and coroutines off a timer wheel, `IoCore` alone
//! to multiplex sockets, or both together with `IoCore`'s subscribers
//! posting work onto a `TaskScheduler` the way a network service typically
//! wires them up. Neither owns the other.

pub mod backend;
pub mod config;
pub mod coroutine;
pub mod event;
pub mod heap;
pub mod iocore;
pub mod iotask;
pub mod queue;
pub mod scheduler;
pub mod subscriber;
pub mod task;

pub use config::{IoCoreConfig, SchedulerConfig};
pub use coroutine::{AsyncPoll, Signalable};
pub use event::{EventOutcome, OpKind, ReadinessEvent};
pub use iocore::IoCore;
pub use iotask::{IoTask, IoTaskStatus};
pub use scheduler::TaskScheduler;
pub use subscriber::{EventArgs, Subscriber};
pub use task::{Task, TaskCx, TaskStatus};

pub use runtime_support::buffer::Buffer;
pub use runtime_support::cycles::{deadline_after_ms, now_ms, LatencyCounter, INF};
pub use runtime_support::error::{Error, Result};
