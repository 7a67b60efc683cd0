// SPDX-License-Identifier: MIT

//! Runtime error taxonomy (§7). Configuration errors are fatal at startup;
//! everything else is logged and the shard loop continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("listener initialization failed: {0}")]
    Listen(#[from] dsd_core::ListenError),

    #[error("shard count {0} is not a power of two")]
    NotPowerOfTwo(usize),

    #[error("notifier backend failed to initialize: {0}")]
    NotifierInit(#[source] std::io::Error),

    #[error("too many consecutive notifier errors ({0}); initiating abrupt shutdown")]
    ConsecutiveNotifierErrors(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Consecutive-notifier-error threshold before abrupt shutdown (§4.2 step 4,
/// OpenLDAP's `SLAPD_EBADF_LIMIT`).
pub const EBADF_LIMIT: u32 = 16;
