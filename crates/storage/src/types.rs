//! Identifiers shared by every layer of the storage service.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::StorageError;

/// Security origin (scheme + host + port) that storage is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Origin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl Origin {
    pub fn new(scheme: &str, host: &str, port: Option<u16>) -> Self {
        Self { scheme: scheme.to_ascii_lowercase(), host: host.to_ascii_lowercase(), port }
    }

    /// Parse `scheme://host[:port][/path]`. Anything after the authority is ignored.
    pub fn parse(input: &str) -> Result<Self, StorageError> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| StorageError::InvalidOrigin(format!("missing scheme in {input:?}")))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
            return Err(StorageError::InvalidOrigin(format!("bad scheme in {input:?}")));
        }
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        // bracketed IPv6 literals carry their own colons
        let split = match authority.find(']') {
            Some(end) if authority.starts_with('[') => {
                let (h, tail) = authority.split_at(end + 1);
                (h, tail.strip_prefix(':'))
            }
            _ => match authority.rsplit_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (authority, None),
            },
        };
        let (host, port) = match split {
            (h, Some(p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| StorageError::InvalidOrigin(format!("bad port in {input:?}")))?;
                (h, Some(port))
            }
            (h, None) => (h, None),
        };
        if host.is_empty() {
            return Err(StorageError::InvalidOrigin(format!("missing host in {input:?}")));
        }
        Ok(Self::new(scheme, host, port))
    }

    pub fn scheme(&self) -> &str { &self.scheme }
    pub fn host(&self) -> &str { &self.host }
    pub fn port(&self) -> Option<u16> { self.port }

    /// File-system safe identifier, e.g. `https_example.com_0`. Host bytes
    /// outside `[a-z0-9._-]` are written as `%XX`.
    pub fn database_identifier(&self) -> String {
        format!("{}_{}_{}", self.scheme, escape_host(&self.host), self.port.unwrap_or(0))
    }

    /// Inverse of [`Origin::database_identifier`].
    pub fn from_database_identifier(id: &str) -> Option<Self> {
        let (scheme, rest) = id.split_once('_')?;
        let (host, port) = rest.rsplit_once('_')?;
        let port: u16 = port.parse().ok()?;
        if scheme.is_empty() || host.is_empty() {
            return None;
        }
        let port = (port != 0).then_some(port);
        Some(Self::new(scheme, &unescape_host(host)?, port))
    }
}

fn escape_host(host: &str) -> String {
    let mut out = String::with_capacity(host.len());
    for b in host.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn unescape_host(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = escaped.get(i + 1..i + 3)?;
            if !hex.bytes().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.scheme, self.host, port),
            None => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self { Self(v) }
        }
    };
}

id_type!(
    /// Identifier of a local or session namespace. The two spaces never mix.
    NamespaceId
);
id_type!(
    /// Identity of one client connection.
    ConnectionId
);
id_type!(
    /// Caller-chosen name of one client-side view onto a storage area.
    MapHandle
);

impl MapHandle {
    /// Source field carried by events that another connection caused.
    pub const NONE: MapHandle = MapHandle(0);
}

/// `(connection, map handle)`: the key every client operation is routed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Binding {
    pub connection: ConnectionId,
    pub map: MapHandle,
}

impl Binding {
    pub fn new(connection: ConnectionId, map: MapHandle) -> Self { Self { connection, map } }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.connection, self.map) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_origin_variants() {
        let o = Origin::parse("https://Example.com/path?q=1").unwrap();
        assert_eq!(o, Origin::new("https", "example.com", None));
        assert_eq!(o.to_string(), "https://example.com");

        let o = Origin::parse("http://localhost:8080").unwrap();
        assert_eq!(o.port(), Some(8080));

        assert!(Origin::parse("example.com").is_err());
        assert!(Origin::parse("https://").is_err());
        assert!(Origin::parse("https://host:notaport").is_err());
    }

    #[test]
    fn database_identifier_roundtrips() {
        let origins = [
            Origin::new("https", "example.com", None),
            Origin::new("http", "my_host.local", Some(8443)),
        ];
        for o in origins {
            let id = o.database_identifier();
            assert_eq!(Origin::from_database_identifier(&id), Some(o));
        }
        assert_eq!(Origin::from_database_identifier("garbage"), None);
        assert_eq!(Origin::from_database_identifier("https_bad%zzhost_0"), None);
    }

    #[test]
    fn database_identifier_keeps_colon_and_plus_hosts_apart() {
        let plus = Origin::new("https", "a+b.test", None);
        let colon = Origin::new("https", "a:b.test", None);
        let ipv6 = Origin::new("http", "[::1]", Some(8080));

        assert_ne!(plus.database_identifier(), colon.database_identifier());
        for o in [plus, colon, ipv6] {
            let id = o.database_identifier();
            assert!(!id.contains([':', '+', '[', ']']), "{id}");
            assert_eq!(Origin::from_database_identifier(&id), Some(o));
        }
    }
}
