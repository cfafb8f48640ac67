//! Local address discovery.
//!
//! A socket bound to `0.0.0.0` does not know which interface its traffic
//! leaves through. Connecting a throwaway UDP socket towards a route hint
//! (no packet is sent) makes the kernel pick the outgoing interface, whose
//! address is what a peer on the same LAN must dial.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Address used when no routable interface can be determined.
const FALLBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Returns the IPv4 address of the interface that routes towards `route_hint`.
///
/// Falls back to `127.0.0.1` (with a warning) when the host has no route.
pub fn local_ipv4(route_hint: SocketAddr) -> Ipv4Addr {
    // ---
    match probe_route(route_hint) {
        Ok(ip) => {
            debug!("Local interface towards {} is {}", route_hint, ip);
            ip
        }
        Err(e) => {
            warn!(
                "Cannot determine local interface towards {} ({}); using {}",
                route_hint, e, FALLBACK
            );
            FALLBACK
        }
    }
}

fn probe_route(route_hint: SocketAddr) -> std::io::Result<Ipv4Addr> {
    // ---
    let probe = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect(route_hint)?;
    match probe.local_addr()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(*addr.ip()),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("route yields {other}"),
        )),
    }
}

/// Local endpoint of `socket` as a peer on the same network would see it.
///
/// A socket bound to a concrete address reports that address unchanged; an
/// unspecified bind is resolved through [`local_ipv4`].
pub fn local_endpoint(socket: &UdpSocket, route_hint: SocketAddr) -> std::io::Result<SocketAddrV4> {
    // ---
    match socket.local_addr()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(addr),
        SocketAddr::V4(addr) => Ok(SocketAddrV4::new(local_ipv4(route_hint), addr.port())),
        SocketAddr::V6(addr) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("{addr} is not an IPv4 socket"),
        )),
    }
}
