// SPDX-License-Identifier: MIT

//! dsd-adapters: concrete `Connection` and `ThreadPool` implementations
//! against the collaborator contracts defined in `dsd-core`.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod connection;
pub mod pool;

pub use connection::EchoConnection;
pub use pool::{FixedThreadPool, InlineThreadPool};
