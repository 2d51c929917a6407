//! Local port discovery for the OAuth callback server.

use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// First port probed for the OAuth callback server.
pub const DEFAULT_PORT_RANGE_START: u16 = 8484;

/// Last port probed for the OAuth callback server.
pub const DEFAULT_PORT_RANGE_END: u16 = 8584;

/// Check whether `port` can currently be bound on the loopback interface.
///
/// The listener is dropped before returning.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Find the first bindable port in `[start, end]`.
///
/// Ports are probed in increasing order; `None` means every port in the range
/// is taken.
pub fn find_available_port(start: u16, end: u16) -> Option<u16> {
    let port = (start..=end).find(|&port| is_port_available(port));
    debug!(start, end, port = ?port, "Probed callback port range");
    port
}
