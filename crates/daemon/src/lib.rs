// SPDX-License-Identifier: MIT

//! dsd-daemon: the sharded, multi-threaded event loop that accepts
//! connections across the listeners bound by `dsd-core` and dispatches
//! per-descriptor readiness to an external `Connection` collaborator.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod accept;
pub mod daemon;
pub mod emfile;
pub mod error;
pub mod notifier;
pub mod runqueue;
pub mod shard;
pub mod signal;
pub mod wake;

pub use daemon::{Daemon, DaemonConfig};
pub use error::DaemonError;
pub use runqueue::{Runqueue, TaskId};
pub use signal::HupBehavior;
