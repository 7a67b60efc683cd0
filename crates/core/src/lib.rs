// SPDX-License-Identifier: MIT

//! dsd-core: listen-URL parsing, the listener table, and the collaborator
//! contracts (`Connection`, `ShardControl`, `ThreadPool`) the network daemon
//! in `dsd-daemon` is built against.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod collaborators;
pub mod descriptor;
pub mod error;
pub mod family;
pub mod listener;
pub mod pool;
pub mod url;

pub use collaborators::{Connection, ConnectionFlags, PeerName, ShardControl};
pub use descriptor::{capture_dtblsize, shard_for};
pub use error::ListenError;
pub use family::{AddressFamily, AddressFamilyPreference};
pub use listener::{bind_all, unlink_unix_sockets, BindOptions, Listener, ListenerAddress, DEFAULT_LISTEN_BACKLOG};
pub use pool::{Cookie, Job, ThreadPool};
pub use url::{Host, ListenUrl, Scheme};
