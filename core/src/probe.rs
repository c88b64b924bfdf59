//! Bounded backend reachability check

use crate::{Error, Result};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Test TCP connectivity to a host:port, giving up after `timeout` per address
pub fn test_tcp_connection(host: &str, port: u16, timeout: Duration) -> Result<()> {
    let target = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = (target, port)
        .to_socket_addrs()
        .map_err(|e| Error::ConnectionTest {
            host: host.to_string(),
            port,
            reason: format!("DNS resolution failed: {}", e),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(Error::ConnectionTest {
            host: host.to_string(),
            port,
            reason: "No addresses resolved".to_string(),
        });
    }

    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(e) => log::debug!("Connect to {} failed: {}", addr, e),
        }
    }

    Err(Error::ConnectionTest {
        host: host.to_string(),
        port,
        reason: "Connection timed out or refused".to_string(),
    })
}
