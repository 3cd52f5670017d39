//! Network addresses of replica set members.
//!
//! Every member is keyed by its `host:port` pair. Hosts are normalized to
//! lowercase so that `DB1.example.com:27017` and `db1.example.com:27017`
//! refer to the same member regardless of which reply advertised them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Port used when an address omits one.
pub const DEFAULT_PORT: u16 = 27017;

/// Error returned when an address string can't be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("address is empty")]
    Empty,

    #[error("address '{0}' has an empty host")]
    EmptyHost(String),

    #[error("address '{0}' has an invalid port")]
    InvalidPort(String),

    #[error("address '{0}' has an unterminated IPv6 literal")]
    UnterminatedIpv6(String),

    #[error("address '{0}' is an IPv6 literal without brackets")]
    UnbracketedIpv6(String),
}

/// Host and port of one member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    /// Creates an address, lowercasing the host.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Parses `host`, `host:port` or `[v6]:port`.
    pub fn parse(input: &str) -> Result<Self, AddressParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AddressParseError::Empty);
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| AddressParseError::UnterminatedIpv6(input.to_string()))?;
            let host = &rest[..end];
            let port = match rest[end + 1..].strip_prefix(':') {
                Some(p) => Some(p),
                None if rest[end + 1..].is_empty() => None,
                None => return Err(AddressParseError::InvalidPort(input.to_string())),
            };
            (host, port)
        } else {
            let (host, port) = match input.rsplit_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (input, None),
            };
            if host.contains(':') {
                return Err(AddressParseError::UnbracketedIpv6(input.to_string()));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(AddressParseError::EmptyHost(input.to_string()));
        }

        let port = match port {
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(AddressParseError::InvalidPort(input.to_string())),
                Ok(p) => p,
            },
            None => DEFAULT_PORT,
        };

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for ServerAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
