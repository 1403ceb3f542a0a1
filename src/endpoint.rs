//! The `(host, port)` pair exchanged between clients and the rendezvous server.

use std::fmt;
use std::net::SocketAddr;

use serde_derive::{Deserialize, Serialize};

/// A network endpoint as reported or observed over the control-plane protocol.
///
/// Unlike `SocketAddr` this is not resolved or validated against any particular address
/// family; it is the printable string a peer was told to dial, taken verbatim from JSON.
#[derive(Clone, Debug, Serialize, Deserialize, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_when_both_fields_match() {
        let a = Endpoint::new("1.2.3.4", 5000);
        let b = Endpoint::new("1.2.3.4", 5000);
        assert_eq!(a, b);
    }

    #[test]
    fn unequal_when_host_differs() {
        let a = Endpoint::new("1.2.3.4", 5000);
        let b = Endpoint::new("9.8.7.6", 5000);
        assert_ne!(a, b);
    }

    #[test]
    fn unequal_when_port_differs() {
        let a = Endpoint::new("1.2.3.4", 5000);
        let b = Endpoint::new("1.2.3.4", 5001);
        assert_ne!(a, b);
    }

    #[test]
    fn from_socket_addr_preserves_ip_and_port() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let ep: Endpoint = addr.into();
        assert_eq!(ep, Endpoint::new("127.0.0.1", 4242));
    }
}
