// SPDX-License-Identifier: MIT

//! Address family handling for listen URLs.

/// Address family a listener is bound under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Unix,
}

/// Process-wide preference used only when a bare hostname resolves to both
/// IPv4 and IPv6 and the URL scheme did not disambiguate (mirrors the
/// original's `slap_inet4or6`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamilyPreference {
    #[default]
    Any,
    PreferInet,
    PreferInet6,
}
