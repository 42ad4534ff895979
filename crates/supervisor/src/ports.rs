// Local TCP port allocation for the proxy.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::debug;

use crate::error::{SupervisorError, SupervisorResult};

const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// A refused local connection means nobody listens on `port`.
///
/// A successful connect means occupied (the probe connection is dropped at once);
/// anything else, a timeout included, is also treated as occupied.
pub fn is_port_free(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
        Ok(stream) => {
            drop(stream);
            false
        }
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => true,
        Err(err) => {
            debug!(port, "port probe inconclusive: {}", err);
            false
        }
    }
}

/// `preferred` when free, else the first free port of `[range_start, range_end]`.
pub fn find_free_port(preferred: u16, range_start: u16, range_end: u16) -> SupervisorResult<u16> {
    if preferred != 0 && is_port_free(preferred) {
        return Ok(preferred);
    }
    debug!(preferred, range_start, range_end, "preferred port busy, scanning range");

    (range_start..=range_end)
        .filter(|port| *port != 0 && *port != preferred)
        .find(|port| is_port_free(*port))
        .ok_or(SupervisorError::NoPortAvailable {
            start: range_start,
            end: range_end,
        })
}
