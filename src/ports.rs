//! Port availability checks performed before spawning a command.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

/// Reports whether a TCP port is currently bound on this host.
pub trait PortChecker: Send + Sync {
    fn is_in_use(&self, port: u16) -> bool;
}

/// Probes a port by attempting to bind it on loopback and on all interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortChecker;

impl PortChecker for TcpPortChecker {
    fn is_in_use(&self, port: u16) -> bool {
        [Ipv4Addr::LOCALHOST, Ipv4Addr::UNSPECIFIED]
            .into_iter()
            .any(|ip| TcpListener::bind(SocketAddr::from((ip, port))).is_err())
    }
}

/// Returns the first port in `ports` that `checker` reports as bound.
pub fn first_bound_port(checker: &dyn PortChecker, ports: &[u16]) -> Option<u16> {
    ports.iter().copied().find(|port| checker.is_in_use(*port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_bound_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(TcpPortChecker.is_in_use(port));
        drop(listener);
        assert!(!TcpPortChecker.is_in_use(port));
    }

    #[test]
    fn first_bound_port_skips_free_ports() {
        struct Bound(u16);
        impl PortChecker for Bound {
            fn is_in_use(&self, port: u16) -> bool {
                port == self.0
            }
        }
        assert_eq!(first_bound_port(&Bound(5001), &[5000, 5001, 5002]), Some(5001));
        assert_eq!(first_bound_port(&Bound(9), &[5000]), None);
        assert_eq!(first_bound_port(&Bound(9), &[]), None);
    }
}
