// SPDX-License-Identifier: MIT

//! Listen URL parsing: `<scheme>://[<host>[:<port>]][/][?x-mod=<perm>]`.
//!
//! Schemes: `plain-ldap`, `tls-ldap`, `unix-ipc`, `udp-ldap`. `host` may be
//! empty, `*`, a literal IPv4/IPv6 address, or a resolvable name. For
//! `unix-ipc`, `host` is a percent-encoded filesystem path (so it can contain
//! `/`), e.g. `unix-ipc://%2Ftmp%2Fd.sock?x-mod=0770`.

use crate::error::ListenError;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    PlainLdap,
    TlsLdap,
    UnixIpc,
    UdpLdap,
}

impl Scheme {
    fn parse(s: &str) -> Result<Self, ListenError> {
        match s {
            "plain-ldap" => Ok(Self::PlainLdap),
            "tls-ldap" => Ok(Self::TlsLdap),
            "unix-ipc" => Ok(Self::UnixIpc),
            "udp-ldap" => Ok(Self::UdpLdap),
            other => Err(ListenError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn is_tls(self) -> bool {
        matches!(self, Self::TlsLdap)
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, Self::UdpLdap)
    }

    pub fn is_unix(self) -> bool {
        matches!(self, Self::UnixIpc)
    }
}

/// Host component of a parsed listen URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    /// Empty or `*`: wildcard, bind all interfaces.
    Wildcard,
    /// Literal or resolvable hostname/address.
    Name(String),
    /// Decoded filesystem path for `unix-ipc`.
    Path(PathBuf),
}

/// A fully parsed (but not yet resolved/bound) listen URL.
#[derive(Debug, Clone)]
pub struct ListenUrl {
    pub original: String,
    pub scheme: Scheme,
    pub host: Host,
    pub port: Option<u16>,
    pub unix_mode: Option<u32>,
    pub rcvbuf: Option<usize>,
    pub sndbuf: Option<usize>,
}

impl ListenUrl {
    pub fn parse(raw: &str) -> Result<Self, ListenError> {
        let (scheme_str, rest) =
            raw.split_once("://").ok_or_else(|| ListenError::MalformedUrl(raw.to_string()))?;
        let scheme = Scheme::parse(scheme_str)?;

        let (authority_and_path, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };
        let authority = authority_and_path.trim_end_matches('/');

        let (host_str, port) = if scheme.is_unix() {
            (authority, None)
        } else {
            split_host_port(authority)?
        };

        let host = if scheme.is_unix() {
            Host::Path(decode_path(host_str)?)
        } else if host_str.is_empty() || host_str == "*" {
            Host::Wildcard
        } else {
            Host::Name(strip_v6_brackets(host_str).to_string())
        };

        let mut unix_mode = None;
        let mut rcvbuf = None;
        let mut sndbuf = None;
        if let Some(q) = query {
            for pair in q.split('&') {
                let Some((k, v)) = pair.split_once('=') else { continue };
                match k {
                    "x-mod" => unix_mode = Some(parse_mode(v)?),
                    "x-rcvbuf" => rcvbuf = v.parse().ok(),
                    "x-sndbuf" => sndbuf = v.parse().ok(),
                    _ => {}
                }
            }
        }

        Ok(Self {
            original: raw.to_string(),
            scheme,
            host,
            port,
            unix_mode,
            rcvbuf,
            sndbuf,
        })
    }
}

fn split_host_port(authority: &str) -> Result<(&str, Option<u16>), ListenError> {
    if authority.is_empty() {
        return Ok(("", None));
    }
    if let Some(rest) = authority.strip_prefix('[') {
        // [v6addr] or [v6addr]:port
        let Some((addr, tail)) = rest.split_once(']') else {
            return Err(ListenError::MalformedUrl(authority.to_string()));
        };
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().map_err(|_| ListenError::MalformedUrl(authority.to_string()))?),
            None => None,
        };
        return Ok((addr, port));
    }
    // Bare host[:port]. A bare IPv6 literal without brackets has no port.
    match authority.rsplit_once(':') {
        Some((host, port_str)) if port_str.chars().all(|c| c.is_ascii_digit()) && !port_str.is_empty() => {
            let port = port_str.parse().map_err(|_| ListenError::MalformedUrl(authority.to_string()))?;
            Ok((host, Some(port)))
        }
        _ => Ok((authority, None)),
    }
}

fn strip_v6_brackets(s: &str) -> &str {
    s.trim_start_matches('[').trim_end_matches(']')
}

fn decode_path(encoded: &str) -> Result<PathBuf, ListenError> {
    let mut out = String::with_capacity(encoded.len());
    let mut chars = encoded.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next();
            let lo = chars.next();
            match (hi, lo) {
                (Some(h), Some(l)) => {
                    let byte = u8::from_str_radix(&format!("{h}{l}"), 16)
                        .map_err(|_| ListenError::MalformedUrl(encoded.to_string()))?;
                    out.push(byte as char);
                }
                _ => return Err(ListenError::MalformedUrl(encoded.to_string())),
            }
        } else {
            out.push(c);
        }
    }
    Ok(PathBuf::from(out))
}

fn parse_mode(v: &str) -> Result<u32, ListenError> {
    if let Some(octal) = v.strip_prefix('0') {
        if !octal.is_empty() {
            return u32::from_str_radix(octal, 8).map_err(|_| ListenError::InvalidMode(v.to_string()));
        }
    }
    u32::from_str_radix(v, 8).map_err(|_| ListenError::InvalidMode(v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_v4() {
        let u = ListenUrl::parse("plain-ldap://0.0.0.0:389").unwrap();
        assert_eq!(u.host, Host::Name("0.0.0.0".into()));
        assert_eq!(u.port, Some(389));
        assert!(!u.scheme.is_tls());
    }

    #[test]
    fn parses_empty_host_as_wildcard() {
        let u = ListenUrl::parse("plain-ldap:///").unwrap();
        assert_eq!(u.host, Host::Wildcard);
        assert_eq!(u.port, None);
    }

    #[test]
    fn parses_v6_literal_with_port() {
        let u = ListenUrl::parse("plain-ldap://[::1]:389").unwrap();
        assert_eq!(u.host, Host::Name("::1".into()));
        assert_eq!(u.port, Some(389));
    }

    #[test]
    fn parses_wildcard_v6() {
        let u = ListenUrl::parse("plain-ldap://[::]:389").unwrap();
        assert_eq!(u.host, Host::Name("::".into()));
    }

    #[test]
    fn parses_unix_path_with_mode() {
        let u = ListenUrl::parse("unix-ipc://%2Ftmp%2Fd.sock?x-mod=0770").unwrap();
        assert_eq!(u.host, Host::Path(PathBuf::from("/tmp/d.sock")));
        assert_eq!(u.unix_mode, Some(0o770));
    }

    #[test]
    fn parses_symbolic_free_octal_mode() {
        let u = ListenUrl::parse("unix-ipc://%2Ftmp%2Fd2.sock?x-mod=770").unwrap();
        assert_eq!(u.unix_mode, Some(0o770));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = ListenUrl::parse("http://example.com").unwrap_err();
        assert!(matches!(err, ListenError::UnsupportedScheme(s) if s == "http"));
    }

    #[test]
    fn rejects_missing_scheme_separator() {
        let err = ListenUrl::parse("plain-ldap:0.0.0.0:389").unwrap_err();
        assert!(matches!(err, ListenError::MalformedUrl(_)));
    }

    #[test]
    fn parses_buffer_hints() {
        let u = ListenUrl::parse("plain-ldap://*:389?x-rcvbuf=262144&x-sndbuf=131072").unwrap();
        assert_eq!(u.rcvbuf, Some(262144));
        assert_eq!(u.sndbuf, Some(131072));
    }
}
