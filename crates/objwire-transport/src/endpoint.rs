//! Endpoint addressing shared by servers and clients.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TransportError};
use crate::stream::IpcStream;
use crate::tcp::TcpSocket;
#[cfg(unix)]
use crate::uds::UnixDomainSocket;

/// Where a server listens or a client connects.
///
/// Textual forms:
/// - `unix:/run/app.sock` (or any string containing a `/` and no scheme)
/// - `tcp://127.0.0.1:9000`
/// - `127.0.0.1:9000`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    /// Connect to this endpoint.
    pub fn connect(&self, timeout: Option<Duration>) -> Result<IpcStream> {
        match self {
            Endpoint::Tcp { host, port } => TcpSocket::connect(host, *port, timeout),
            #[cfg(unix)]
            Endpoint::Unix(path) => UnixDomainSocket::connect(path),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Unsupported("unix domain")),
        }
    }

    /// Bind a listener on this endpoint.
    pub fn bind(&self) -> Result<Listener> {
        match self {
            Endpoint::Tcp { host, port } => Ok(Listener::Tcp(TcpSocket::bind(host, *port)?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Listener::Unix(UnixDomainSocket::bind(path)?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Unsupported("unix domain")),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        if let Some(path) = input.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid("missing socket path"));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        let host_port = match input.strip_prefix("tcp://") {
            Some(rest) => rest,
            None if input.contains('/') => return Ok(Endpoint::Unix(PathBuf::from(input))),
            None => input,
        };

        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

/// A bound listener of either socket family.
pub enum Listener {
    Tcp(TcpSocket),
    #[cfg(unix)]
    Unix(UnixDomainSocket),
}

impl Listener {
    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<IpcStream> {
        match self {
            Listener::Tcp(socket) => socket.accept(),
            #[cfg(unix)]
            Listener::Unix(socket) => socket.accept(),
        }
    }

    /// The endpoint a client should use to reach this listener.
    ///
    /// For TCP this carries the resolved port, which differs from the
    /// requested one when binding to port 0.
    pub fn local_endpoint(&self) -> Endpoint {
        match self {
            Listener::Tcp(socket) => {
                let addr = socket.local_addr();
                Endpoint::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                }
            }
            #[cfg(unix)]
            Listener::Unix(socket) => Endpoint::Unix(socket.path().to_path_buf()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_forms() {
        let expected = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 9000,
        };
        assert_eq!("127.0.0.1:9000".parse::<Endpoint>().unwrap(), expected);
        assert_eq!("tcp://127.0.0.1:9000".parse::<Endpoint>().unwrap(), expected);
    }

    #[test]
    fn parses_bracketed_ipv6_host() {
        let endpoint: Endpoint = "tcp://[::1]:7000".parse().unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp {
                host: "::1".to_string(),
                port: 7000
            }
        );
    }

    #[test]
    fn parses_unix_forms() {
        assert_eq!(
            "unix:/tmp/a.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/a.sock"))
        );
        assert_eq!(
            "/tmp/b.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/b.sock"))
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["localhost", "unix:", ":80", "host:notaport", "host:70000"] {
            let err = input.parse::<Endpoint>().unwrap_err();
            assert!(
                matches!(err, TransportError::InvalidEndpoint { .. }),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn display_round_trips() {
        for input in ["tcp://localhost:1234", "unix:/tmp/x.sock"] {
            let endpoint: Endpoint = input.parse().unwrap();
            assert_eq!(endpoint.to_string(), input);
        }
    }

    #[test]
    fn tcp_listener_reports_resolved_port() {
        let endpoint: Endpoint = "127.0.0.1:0".parse().unwrap();
        let listener = endpoint.bind().unwrap();
        match listener.local_endpoint() {
            Endpoint::Tcp { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert_ne!(port, 0);
            }
            other => panic!("unexpected endpoint {other}"),
        }
    }
}
