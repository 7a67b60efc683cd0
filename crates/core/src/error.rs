// SPDX-License-Identifier: MIT

//! Error types shared by the listener table, URL parser and descriptor
//! router. Daemon-loop runtime errors live in `dsd-daemon::error` instead —
//! this crate only ever fails at configuration/parse time.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while parsing a listen URL or binding a listener.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("unsupported scheme {0:?} (expected one of: ldap, ldaps, ldapi, ldap+udp)")]
    UnsupportedScheme(String),

    #[error("listen URL {0:?} could not be parsed")]
    MalformedUrl(String),

    #[error("unix-domain socket path {0:?} exceeds platform sun_path length")]
    PathTooLong(PathBuf),

    #[error("invalid x-mod permission value {0:?}")]
    InvalidMode(String),

    #[error("no address resolved for host {0:?}")]
    NoAddressResolved(String),

    #[error("bind failed for {url}: {source}")]
    BindFailed { url: String, #[source] source: std::io::Error },

    #[error("bind for {url} skipped: {reason}")]
    BindSkipped { url: String, reason: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
