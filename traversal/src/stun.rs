//! STUN Binding client (RFC 5389 subset).
//!
//! Only the Binding method is implemented: a 20-byte request with no
//! attributes goes out over the caller's socket, and the mapped address is
//! read back from MAPPED-ADDRESS or XOR-MAPPED-ADDRESS in the success
//! response.
//!
//! # Wire Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Magic Cookie (0x2112A442)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                Transaction ID (96 bits)                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Attribute Type              |   Attribute Length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Value (padded to 4 bytes) ...                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use peercall_common::{MetricsContext, StunConfig};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::StunError;

/// STUN magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN message types
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;

/// STUN attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Address families inside (XOR-)MAPPED-ADDRESS
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

const HEADER_LEN: usize = 20;

/// 96-bit STUN transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    // ---
    /// Fresh random identifier.
    pub fn random() -> Self {
        // ---
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        // ---
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        // ---
        &self.0
    }
}

/// One outstanding Binding Request.
#[derive(Debug, Clone)]
pub struct StunTransaction {
    // ---
    pub id: TransactionId,
    pub sent_at: Instant,
}

impl StunTransaction {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            id: TransactionId::random(),
            sent_at: Instant::now(),
        }
    }
}

impl Default for StunTransaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Which attribute a response carries the mapped address in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressAttribute {
    /// Legacy RFC 3489 attribute, address in the clear
    Mapped,

    /// RFC 5389 attribute, address XORed with cookie (and transaction id)
    XorMapped,
}

/// Builds the 20-byte Binding Request header.
pub fn encode_binding_request(id: &TransactionId) -> [u8; HEADER_LEN] {
    // ---
    let mut request = [0u8; HEADER_LEN];
    request[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Bytes 2-3: message length stays 0, no attributes
    request[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    request[8..20].copy_from_slice(id.as_bytes());
    request
}

/// Builds a Binding Success response carrying `mapped`.
///
/// This is the server half of the exchange. The client never needs it, but
/// a loopback responder built on it lets call setup run without Internet
/// access (LAN testing, integration tests).
pub fn encode_binding_response(
    id: &TransactionId,
    mapped: SocketAddr,
    attribute: AddressAttribute,
) -> Vec<u8> {
    // ---
    let (family, raw_ip): (u8, Vec<u8>) = match mapped.ip() {
        IpAddr::V4(ip) => (FAMILY_IPV4, ip.octets().to_vec()),
        IpAddr::V6(ip) => (FAMILY_IPV6, ip.octets().to_vec()),
    };

    let mut value = vec![0u8, family];
    match attribute {
        AddressAttribute::Mapped => {
            value.extend_from_slice(&mapped.port().to_be_bytes());
            value.extend_from_slice(&raw_ip);
        }
        AddressAttribute::XorMapped => {
            let port = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
            value.extend_from_slice(&port.to_be_bytes());
            let key = xor_key(id);
            value.extend(raw_ip.iter().zip(key.iter()).map(|(b, k)| b ^ k));
        }
    }

    let attr_type = match attribute {
        AddressAttribute::Mapped => ATTR_MAPPED_ADDRESS,
        AddressAttribute::XorMapped => ATTR_XOR_MAPPED_ADDRESS,
    };

    let body_len = 4 + value.len();
    let mut response = Vec::with_capacity(HEADER_LEN + body_len);
    response.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    response.extend_from_slice(&(body_len as u16).to_be_bytes());
    response.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    response.extend_from_slice(id.as_bytes());
    response.extend_from_slice(&attr_type.to_be_bytes());
    response.extend_from_slice(&(value.len() as u16).to_be_bytes());
    response.extend_from_slice(&value);
    response
}

/// Answers a Binding Request with the address it was observed from.
///
/// Returns `None` when `request` is not a well-formed Binding Request.
pub fn binding_success_for(request: &[u8], observed: SocketAddr) -> Option<Vec<u8>> {
    // ---
    if request.len() < HEADER_LEN {
        return None;
    }
    let msg_type = u16::from_be_bytes([request[0], request[1]]);
    let cookie = u32::from_be_bytes([request[4], request[5], request[6], request[7]]);
    if msg_type != BINDING_REQUEST || cookie != MAGIC_COOKIE {
        return None;
    }

    let mut id = [0u8; 12];
    id.copy_from_slice(&request[8..20]);
    Some(encode_binding_response(
        &TransactionId::from_bytes(id),
        observed,
        AddressAttribute::XorMapped,
    ))
}

/// Parses a Binding Success response sent for transaction `expected`.
///
/// # Errors
///
/// Returns [`StunError::MalformedResponse`] if:
/// - the datagram is shorter than the header or its declared length
/// - the message type is not Binding Success
/// - the magic cookie or transaction id differ from what was sent
/// - no address attribute is present, or it is truncated
pub fn parse_binding_response(
    data: &[u8],
    expected: &TransactionId,
) -> Result<SocketAddr, StunError> {
    // ---
    if data.len() < HEADER_LEN {
        return Err(malformed(format!("{} bytes is shorter than the header", data.len())));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(malformed(format!("unexpected message type 0x{msg_type:04x}")));
    }

    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(malformed(format!("bad magic cookie 0x{cookie:08x}")));
    }

    if &data[8..20] != expected.as_bytes() {
        return Err(malformed("transaction id mismatch".to_string()));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < HEADER_LEN + msg_len {
        return Err(malformed(format!(
            "declared length {msg_len} exceeds {} body bytes",
            data.len() - HEADER_LEN
        )));
    }

    let body = &data[HEADER_LEN..HEADER_LEN + msg_len];
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > body.len() {
            return Err(malformed(format!(
                "attribute 0x{attr_type:04x} overruns the message"
            )));
        }
        let value = &body[value_start..value_end];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return decode_address(value, Some(expected)),
            ATTR_MAPPED_ADDRESS => return decode_address(value, None),
            other => debug!("Skipping STUN attribute 0x{:04x} ({} bytes)", other, attr_len),
        }

        // Attributes are padded to 4-byte boundaries
        offset = value_start + attr_len.div_ceil(4) * 4;
    }

    Err(malformed(
        "no MAPPED-ADDRESS or XOR-MAPPED-ADDRESS attribute".to_string(),
    ))
}

/// Decodes a (XOR-)MAPPED-ADDRESS value; `xor` carries the transaction id
/// for the XOR variant.
fn decode_address(value: &[u8], xor: Option<&TransactionId>) -> Result<SocketAddr, StunError> {
    // ---
    if value.len() < 4 {
        return Err(malformed("address attribute too short".to_string()));
    }

    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        FAMILY_IPV4 => {
            if value.len() < 8 {
                return Err(malformed("IPv4 address truncated".to_string()));
            }
            let mut raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            if xor.is_some() {
                raw ^= MAGIC_COOKIE;
            }
            IpAddr::V4(Ipv4Addr::from(raw))
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                return Err(malformed("IPv6 address truncated".to_string()));
            }
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&value[4..20]);
            if let Some(id) = xor {
                for (b, k) in raw.iter_mut().zip(xor_key(id).iter()) {
                    *b ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(raw))
        }
        other => return Err(malformed(format!("unknown address family {other}"))),
    };

    Ok(SocketAddr::new(ip, port))
}

/// Cookie followed by transaction id; IPv4 uses the first 4 bytes.
fn xor_key(id: &TransactionId) -> [u8; 16] {
    // ---
    let mut key = [0u8; 16];
    key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..16].copy_from_slice(id.as_bytes());
    key
}

fn malformed(reason: String) -> StunError {
    StunError::MalformedResponse(reason)
}

/// STUN client bound to one configured server.
///
/// The client does not own a socket: every discovery runs on the socket the
/// caller supplies, so the learned mapping is the one media will use.
///
/// # Example
///
/// ```no_run
/// use peercall_common::{MetricsContext, StunConfig};
/// use traversal::StunClient;
///
/// # async fn demo() -> anyhow::Result<()> {
/// let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
/// let client = StunClient::new(StunConfig::default(), MetricsContext::new("demo")?);
/// let public = client.discover_public_endpoint(&socket).await?;
/// println!("reachable at {public}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StunClient {
    // ---
    config: StunConfig,
    metrics: MetricsContext,
}

impl StunClient {
    // ---
    pub fn new(config: StunConfig, metrics: MetricsContext) -> Self {
        // ---
        Self { config, metrics }
    }

    /// Resolves the configured server, preferring the socket's address family.
    pub async fn resolve_server(&self, want_ipv4: bool) -> Result<SocketAddr, StunError> {
        // ---
        let server = self.config.server.as_str();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(server)
            .await
            .map_err(|source| StunError::Resolve {
                server: server.to_string(),
                source,
            })?
            .collect();

        addrs
            .iter()
            .find(|a| a.is_ipv4() == want_ipv4)
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| StunError::Resolve {
                server: server.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            })
    }

    /// Learns the externally mapped endpoint of `socket`.
    ///
    /// Sends one Binding Request and waits up to the configured timeout.
    /// Datagrams from other sources are ignored; the first datagram from the
    /// server decides the outcome.
    ///
    /// # Errors
    ///
    /// - [`StunError::Timeout`] if the server stays silent
    /// - [`StunError::MalformedResponse`] if its answer fails validation
    pub async fn discover_public_endpoint(
        &self,
        socket: &UdpSocket,
    ) -> Result<SocketAddr, StunError> {
        // ---
        self.metrics.stun_requests_total.inc();
        let result = self.transact(socket).await;
        if let Err(e) = &result {
            self.metrics.stun_failures_total.inc();
            warn!("STUN discovery via {} failed: {}", self.config.server, e);
        }
        result
    }

    async fn transact(&self, socket: &UdpSocket) -> Result<SocketAddr, StunError> {
        // ---
        let want_ipv4 = socket.local_addr()?.is_ipv4();
        let server = self.resolve_server(want_ipv4).await?;

        let transaction = StunTransaction::new();
        let request = encode_binding_request(&transaction.id);
        socket.send_to(&request, server).await?;
        debug!("Sent STUN Binding Request to {}", server);

        let deadline = tokio::time::Instant::from_std(transaction.sent_at + self.config.timeout());
        let mut buf = vec![0u8; 1024];

        loop {
            let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| StunError::Timeout(self.config.timeout()))??;

            if from != server {
                debug!("Ignoring {} byte datagram from {} during STUN", len, from);
                continue;
            }

            let mapped = parse_binding_response(&buf[..len], &transaction.id)?;
            let rtt = transaction.sent_at.elapsed();
            self.metrics
                .stun_round_trip_seconds
                .observe(rtt.as_secs_f64());
            info!(
                "STUN mapped {} -> {} ({:.1}ms)",
                socket.local_addr()?,
                mapped,
                rtt.as_secs_f64() * 1000.0
            );
            return Ok(mapped);
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn fixture_id() -> TransactionId {
        TransactionId::from_bytes([0xB7, 0xE7, 0xA7, 0x01, 0xBC, 0x34, 0xD6, 0x86, 0xFA, 0x87, 0xDF, 0xAE])
    }

    #[test]
    fn test_binding_request_layout() {
        // ---
        let id = fixture_id();
        let request = encode_binding_request(&id);

        assert_eq!(request.len(), 20);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&request[8..20], id.as_bytes());
    }

    #[test]
    fn test_xor_mapped_known_vector() {
        // ---
        // RFC 5769 section 2.2: 192.0.2.1:32853 encodes as port 0xA147,
        // address 0xE112A643.
        let id = fixture_id();
        let mut response = vec![0x01, 0x01, 0x00, 0x0C, 0x21, 0x12, 0xA4, 0x42];
        response.extend_from_slice(id.as_bytes());
        response.extend_from_slice(&[0x00, 0x20, 0x00, 0x08]);
        response.extend_from_slice(&[0x00, 0x01, 0xA1, 0x47, 0xE1, 0x12, 0xA6, 0x43]);

        let mapped = parse_binding_response(&response, &id).expect("valid response");
        assert_eq!(mapped, "192.0.2.1:32853".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_mapped_address_in_clear() {
        // ---
        let id = fixture_id();
        let addr: SocketAddr = "203.0.113.5:61000".parse().unwrap();
        let response = encode_binding_response(&id, addr, AddressAttribute::Mapped);

        assert_eq!(parse_binding_response(&response, &id).unwrap(), addr);
    }

    #[test]
    fn test_xor_mapped_ipv6() {
        // ---
        let id = fixture_id();
        let addr: SocketAddr = "[2001:db8:1234:5678:11:2233:4455:6677]:32853".parse().unwrap();
        let response = encode_binding_response(&id, addr, AddressAttribute::XorMapped);

        assert_eq!(parse_binding_response(&response, &id).unwrap(), addr);
    }

    #[test]
    fn test_unknown_attributes_skipped_with_padding() {
        // ---
        let id = fixture_id();
        let addr: SocketAddr = "198.51.100.20:4000".parse().unwrap();
        let full = encode_binding_response(&id, addr, AddressAttribute::XorMapped);

        // SOFTWARE attribute with a 5-byte value (3 bytes of padding) first
        let mut body = vec![0x80, 0x22, 0x00, 0x05, b'p', b'e', b'e', b'r', b'c', 0, 0, 0];
        body.extend_from_slice(&full[20..]);

        let mut response = full[..20].to_vec();
        response[2..4].copy_from_slice(&(body.len() as u16).to_be_bytes());
        response.extend_from_slice(&body);

        assert_eq!(parse_binding_response(&response, &id).unwrap(), addr);
    }

    #[test]
    fn test_first_address_attribute_wins() {
        // ---
        let id = fixture_id();
        let first: SocketAddr = "198.51.100.1:1111".parse().unwrap();
        let second: SocketAddr = "198.51.100.2:2222".parse().unwrap();
        let a = encode_binding_response(&id, first, AddressAttribute::Mapped);
        let b = encode_binding_response(&id, second, AddressAttribute::XorMapped);

        let mut response = a;
        response.extend_from_slice(&b[20..]);
        let body_len = (response.len() - 20) as u16;
        response[2..4].copy_from_slice(&body_len.to_be_bytes());

        assert_eq!(parse_binding_response(&response, &id).unwrap(), first);
    }

    #[test]
    fn test_transaction_id_mismatch_rejected() {
        // ---
        let addr: SocketAddr = "203.0.113.5:61000".parse().unwrap();
        let response = encode_binding_response(&fixture_id(), addr, AddressAttribute::XorMapped);

        let other = TransactionId::from_bytes([0u8; 12]);
        assert!(matches!(
            parse_binding_response(&response, &other),
            Err(StunError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_wrong_type_and_cookie_rejected() {
        // ---
        let id = fixture_id();
        let addr: SocketAddr = "203.0.113.5:61000".parse().unwrap();
        let good = encode_binding_response(&id, addr, AddressAttribute::XorMapped);

        let mut error_response = good.clone();
        error_response[0..2].copy_from_slice(&0x0111u16.to_be_bytes());
        assert!(parse_binding_response(&error_response, &id).is_err());

        let mut bad_cookie = good;
        bad_cookie[4] ^= 0xFF;
        assert!(parse_binding_response(&bad_cookie, &id).is_err());
    }

    #[test]
    fn test_truncated_and_empty_responses_rejected() {
        // ---
        let id = fixture_id();
        assert!(parse_binding_response(&[0x01, 0x01, 0x00], &id).is_err());

        // Header only: valid framing, but no address attribute
        let addr: SocketAddr = "203.0.113.5:61000".parse().unwrap();
        let full = encode_binding_response(&id, addr, AddressAttribute::XorMapped);
        let mut header_only = full[..20].to_vec();
        header_only[2..4].copy_from_slice(&[0, 0]);
        assert!(parse_binding_response(&header_only, &id).is_err());

        // Declared length longer than the datagram
        let mut truncated = full.clone();
        truncated.truncate(full.len() - 2);
        assert!(parse_binding_response(&truncated, &id).is_err());
    }

    #[test]
    fn test_responder_echoes_observed_address() {
        // ---
        let id = fixture_id();
        let observed: SocketAddr = "192.0.2.44:50123".parse().unwrap();
        let request = encode_binding_request(&id);

        let response = binding_success_for(&request, observed).expect("request accepted");
        assert_eq!(parse_binding_response(&response, &id).unwrap(), observed);

        assert!(binding_success_for(&response, observed).is_none());
    }
}
