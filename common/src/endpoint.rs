//! UDP endpoint descriptors exchanged during call setup.
//!
//! An [`EndpointPair`] is the `localIp:localPort:publicIp:publicPort`
//! 4-tuple carried by the rendezvous protocol and by call signals. The text
//! form only admits IPv4 addresses: an IPv6 address would add colons and
//! break the fixed field count.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use thiserror::Error;

/// A single UDP address/port pair.
pub type Endpoint = SocketAddr;

/// Errors produced while parsing a 4-tuple.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointParseError {
    // ---
    #[error("expected 4 colon-separated fields, got {0}")]
    FieldCount(usize),

    #[error("invalid IPv4 address: {0:?}")]
    Address(String),

    #[error("invalid port: {0:?}")]
    Port(String),
}

/// Local and public UDP endpoints of one media socket.
///
/// `local` is the address the socket is bound to on the host's LAN
/// interface; `public` is the NAT mapping learned through STUN.
///
/// # Example
///
/// ```
/// use peercall_common::EndpointPair;
///
/// let pair: EndpointPair = "192.168.1.7:50000:203.0.113.9:61000".parse().unwrap();
/// assert_eq!(pair.public.port(), 61000);
/// assert_eq!(pair.to_string(), "192.168.1.7:50000:203.0.113.9:61000");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointPair {
    // ---
    /// Address on the host's own interface
    pub local: SocketAddrV4,

    /// Address as observed from outside the NAT
    pub public: SocketAddrV4,
}

impl EndpointPair {
    // ---
    pub fn new(local: SocketAddrV4, public: SocketAddrV4) -> Self {
        // ---
        Self { local, public }
    }

    /// Returns the addresses a probe should be sent to.
    ///
    /// The public endpoint always comes first; the local endpoint is only
    /// included when it differs (peers on the same LAN reach each other
    /// through it).
    pub fn probe_targets(&self) -> Vec<SocketAddr> {
        // ---
        let mut targets = vec![SocketAddr::V4(self.public)];
        if self.local != self.public {
            targets.push(SocketAddr::V4(self.local));
        }
        targets
    }
}

impl fmt::Display for EndpointPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(
            f,
            "{}:{}:{}:{}",
            self.local.ip(),
            self.local.port(),
            self.public.ip(),
            self.public.port()
        )
    }
}

impl FromStr for EndpointPair {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        let fields: Vec<&str> = s.trim_end_matches(['\r', '\n']).split(':').collect();
        if fields.len() != 4 {
            return Err(EndpointParseError::FieldCount(fields.len()));
        }

        let local = SocketAddrV4::new(parse_ip(fields[0])?, parse_port(fields[1])?);
        let public = SocketAddrV4::new(parse_ip(fields[2])?, parse_port(fields[3])?);

        Ok(Self { local, public })
    }
}

impl TryFrom<String> for EndpointPair {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EndpointPair> for String {
    fn from(pair: EndpointPair) -> Self {
        pair.to_string()
    }
}

fn parse_ip(field: &str) -> Result<Ipv4Addr, EndpointParseError> {
    field
        .parse()
        .map_err(|_| EndpointParseError::Address(field.to_string()))
}

fn parse_port(field: &str) -> Result<u16, EndpointParseError> {
    field
        .parse()
        .map_err(|_| EndpointParseError::Port(field.to_string()))
}
