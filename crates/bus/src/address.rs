//! Transport URLs: `tcp://host:port`, `ipc:///path/to/sock`,
//! `inproc://name` (§6). Addresses are plain values; a wildcard port (`*`)
//! is resolved at bind time and the concrete, resolved `Address` is what
//! gets handed back to callers and embedded in stream specs/proxies.

use crate::error::CoreError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Tcp { host: String, port: u16 },
    /// Port is `None` until resolved by `bind()`.
    TcpWildcard { host: String },
    Ipc { path: String },
    Inproc { name: String },
}

impl Address {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Address::TcpWildcard { .. })
    }

    pub fn resolved(&self, port: u16) -> Address {
        match self {
            Address::TcpWildcard { host } => Address::Tcp { host: host.clone(), port },
            other => other.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Address::TcpWildcard { host } => write!(f, "tcp://{host}:*"),
            Address::Ipc { path } => write!(f, "ipc://{path}"),
            Address::Inproc { name } => write!(f, "inproc://{name}"),
        }
    }
}

impl FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| CoreError::Protocol(format!("malformed address: {s}")))?;
        match scheme {
            "tcp" => {
                let (host, port_str) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| CoreError::Protocol(format!("tcp address missing port: {s}")))?;
                if port_str == "*" {
                    Ok(Address::TcpWildcard { host: host.to_string() })
                } else {
                    let port: u16 = port_str
                        .parse()
                        .map_err(|_| CoreError::Protocol(format!("invalid port in {s}")))?;
                    Ok(Address::Tcp { host: host.to_string(), port })
                }
            }
            "ipc" => Ok(Address::Ipc { path: rest.to_string() }),
            "inproc" => Ok(Address::Inproc { name: rest.to_string() }),
            other => Err(CoreError::Protocol(format!("unknown transport scheme: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_with_wildcard_port() {
        let addr: Address = "tcp://127.0.0.1:*".parse().unwrap();
        assert!(addr.is_wildcard());
        let resolved = addr.resolved(5555);
        assert_eq!(resolved.to_string(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn parses_ipc_and_inproc() {
        assert_eq!("ipc:///tmp/sock".parse::<Address>().unwrap().to_string(), "ipc:///tmp/sock");
        assert_eq!("inproc://worker-1".parse::<Address>().unwrap().to_string(), "inproc://worker-1");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!("http://x:1".parse::<Address>().is_err());
    }
}
